#![forbid(unsafe_code)]

mod common;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use wl_apply::{
    ApplyError, ApplyOutcome, ApplyRequest, AutoConfirm, Confirm, FlagInputs, Pipeline, TailOptions, WaitOptions,
    WaitOutcome,
};
use wl_core::SourcePublisher;
use wl_core::{Identity, WatchEvent, SERVICE_CLAIMS_ANNOTATION};

struct NeverAsk;

impl Confirm for NeverAsk {
    fn confirm(&mut self, prompt: &str) -> bool {
        panic!("unexpected confirmation prompt: {}", prompt)
    }
}

fn request(flags: FlagInputs) -> ApplyRequest {
    ApplyRequest {
        flags: flags.into_layer().unwrap(),
        default_namespace: "default".into(),
        assume_yes: true,
        ..Default::default()
    }
}

fn named(f: impl FnOnce(&mut FlagInputs)) -> FlagInputs {
    let mut flags = FlagInputs { name: Some("my-workload".into()), ..Default::default() };
    f(&mut flags);
    flags
}

async fn run(client: &Arc<FakeClient>, req: &ApplyRequest) -> (Result<wl_apply::PipelineReport, ApplyError>, String) {
    let mut out = Vec::new();
    let res = Pipeline::new(client.clone()).run(req, &mut NeverAsk, &mut out).await;
    (res, String::from_utf8(out).unwrap())
}

#[tokio::test]
async fn create_from_git_flags() {
    let client = Arc::new(FakeClient::new());
    let req = request(named(|f| {
        f.git_repo = Some("https://github.com/spring-projects/spring-petclinic.git".into());
        f.git_branch = Some("main".into());
    }));
    let (res, out) = run(&client, &req).await;
    let report = res.unwrap();
    assert!(matches!(report.outcome, ApplyOutcome::Created(_)));
    assert_eq!(client.calls(), vec![Call::Get, Call::Create]);

    let mut lines = out.lines();
    assert_eq!(lines.next(), Some("Create workload:"));
    let diff: Vec<&str> = lines.by_ref().take_while(|l| !l.is_empty()).collect();
    assert_eq!(diff[0], "      1 + |---");
    assert!(diff.iter().all(|l| l.contains(" + |")), "{}", out);
    assert!(diff.contains(&"     11 + |        branch: main"), "{}", out);
    assert_eq!(lines.next(), Some("Created workload \"my-workload\""));
    report.into_result().unwrap();
}

#[tokio::test]
async fn unchanged_workload_is_a_noop() {
    let client = Arc::new(FakeClient::new().with_object(existing_image()));
    let mut req = request(named(|_| {}));
    req.assume_yes = false;
    let (res, out) = run(&client, &req).await;
    assert_eq!(res.unwrap().outcome, ApplyOutcome::NoOp);
    assert_eq!(client.writes(), 0);
    assert_eq!(out, "Workload is unchanged, skipping update\n");
}

#[tokio::test]
async fn update_shows_collapsed_diff() {
    let client = Arc::new(FakeClient::new().with_object(existing_image()));
    let req = request(named(|f| f.debug = true));
    let (res, out) = run(&client, &req).await;
    let report = res.unwrap();
    assert!(matches!(report.outcome, ApplyOutcome::Updated(_)));
    assert_eq!(
        out,
        "\
Update workload:
...
  5,  5   |  name: my-workload
  6,  6   |  namespace: default
  7,  7   |spec:
  8,  8   |  image: ubuntu:bionic
      9 + |  params:
     10 + |  - name: debug
     11 + |    value: 'true'

Updated workload \"my-workload\"
"
    );
    let stored = client.stored(&id()).unwrap();
    assert_eq!(stored.metadata.resource_version.as_deref(), Some("1000"));
    assert_eq!(stored.spec.params.len(), 1);
}

#[tokio::test]
async fn update_conflict_is_reported_not_retried() {
    let client = Arc::new(FakeClient::new().with_object(existing_image()).fail_update(Failure::Conflict));
    let req = request(named(|f| f.debug = true));
    let (res, out) = run(&client, &req).await;
    let report = res.unwrap();
    assert!(matches!(report.outcome, ApplyOutcome::Conflict(_)));
    assert_eq!(client.writes(), 1);
    assert!(!out.contains("Updated workload"), "{}", out);
    assert_eq!(
        report.into_result().unwrap_err().to_string(),
        "conflict updating workload, the object was modified by another user; please run the update command again"
    );
}

#[tokio::test]
async fn create_failure_is_surfaced_verbatim() {
    let client = Arc::new(FakeClient::new().fail_create(Failure::Other("admission webhook denied the request".into())));
    let req = request(named(|f| f.image = Some("ubuntu:bionic".into())));
    let (res, _) = run(&client, &req).await;
    let err = res.unwrap().into_result().unwrap_err();
    assert!(matches!(err, ApplyError::Failed(ref m) if m.contains("admission webhook denied")), "{}", err);
    assert_eq!(client.writes(), 1);
}

#[tokio::test]
async fn declined_confirmation_aborts_without_writes() {
    let client = Arc::new(FakeClient::new().with_object(existing_image()));
    let mut req = request(named(|f| f.debug = true));
    req.assume_yes = false;
    let mut out = Vec::new();
    let res = Pipeline::new(client.clone()).run(&req, &mut AutoConfirm(false), &mut out).await;
    assert!(matches!(res, Err(ApplyError::AbortedByUser(ref id)) if *id == common::id()));
    assert_eq!(client.writes(), 0);
}

#[tokio::test]
async fn dry_run_prints_target_and_skips_write() {
    let client = Arc::new(FakeClient::new().with_object(existing_image()));
    let mut req = request(named(|f| f.debug = true));
    req.dry_run = true;
    req.wait = Some(WaitOptions::default());
    let (res, out) = run(&client, &req).await;
    let report = res.unwrap();
    assert!(matches!(report.outcome, ApplyOutcome::DryRun { .. }));
    assert!(report.wait.is_none());
    assert_eq!(client.calls(), vec![Call::Get]);
    assert!(out.starts_with("---\napiVersion: carto.run/v1alpha1\n"), "{}", out);
    assert!(out.contains("resourceVersion: '999'"), "{}", out);
}

#[tokio::test]
async fn missing_name_fails_before_any_call() {
    let client = Arc::new(FakeClient::new());
    let req = request(FlagInputs { image: Some("nginx".into()), ..Default::default() });
    let (res, _) = run(&client, &req).await;
    assert!(matches!(res, Err(ApplyError::Validation(_))));
    assert!(client.calls().is_empty());
}

#[tokio::test]
async fn file_and_flags_merge_with_flags_winning() {
    let client = Arc::new(FakeClient::new());
    let file = wl_apply::parse_manifest(
        "apiVersion: carto.run/v1alpha1\nkind: Workload\nmetadata:\n  name: my-workload\n  namespace: team-a\n  labels:\n    tier: file\nspec:\n  image: nginx:1\n",
    )
    .unwrap();
    let mut req = request(FlagInputs { labels: vec!["tier=flags".into()], ..Default::default() });
    req.file = Some(wl_apply::PartialWorkload::from_manifest(&file));
    let (res, _) = run(&client, &req).await;
    let report = res.unwrap();
    let created = client.stored(&Identity::new("team-a", "my-workload")).unwrap();
    assert_eq!(report.id, Identity::new("team-a", "my-workload"));
    assert_eq!(created.metadata.labels.get("tier").map(String::as_str), Some("flags"));
    assert_eq!(created.spec.image.as_deref(), Some("nginx:1"));
}

#[tokio::test]
async fn cross_namespace_claim_warns_before_diff() {
    let client = Arc::new(FakeClient::new().with_object(existing_image()));
    let req = request(named(|f| {
        f.service_refs = vec!["database=services.tanzu.vmware.com/v1alpha1:PostgreSQL:my-prod-ns:my-prod-db".into()];
    }));
    let (res, out) = run(&client, &req).await;
    res.unwrap().into_result().unwrap();
    assert!(
        out.starts_with("WARNING: Cross namespace service claims are deprecated. Please use `tanzu service claim create` instead.\nUpdate workload:\n"),
        "{}",
        out
    );
    assert!(client.stored(&id()).unwrap().metadata.annotations.contains_key(SERVICE_CLAIMS_ANNOTATION));
}

#[tokio::test]
async fn wait_reports_not_ready() {
    let client = Arc::new(FakeClient::new().with_object(existing_image()).with_events(vec![ready_event("False")], true));
    let mut req = request(named(|f| f.debug = true));
    req.wait = Some(WaitOptions { timeout: Duration::from_secs(30), tail: None });
    let (res, out) = run(&client, &req).await;
    let report = res.unwrap();
    match &report.wait {
        Some(WaitOutcome::NotReady { reason, .. }) => assert_eq!(reason, "OopsieDoodle"),
        other => panic!("unexpected wait outcome {:?}", other),
    }
    assert!(out.ends_with("Updated workload \"my-workload\"\nWaiting for workload \"my-workload\" to become ready...\n"), "{}", out);
    assert_eq!(
        report.into_result().unwrap_err().to_string(),
        "Failed to become ready: a hopefully informative message about what went wrong"
    );
}

#[tokio::test]
async fn wait_reports_ready() {
    let client = Arc::new(
        FakeClient::new()
            .with_object(existing_image())
            .with_events(vec![Ok(WatchEvent::modified(existing_image())), ready_event("True")], true),
    );
    let mut req = request(named(|f| f.debug = true));
    req.wait = Some(WaitOptions { timeout: Duration::from_secs(30), tail: None });
    let (res, out) = run(&client, &req).await;
    let report = res.unwrap();
    assert_eq!(report.wait, Some(WaitOutcome::Ready));
    assert!(out.ends_with("to become ready...\nWorkload \"my-workload\" is ready\n"), "{}", out);
    assert_eq!(client.calls(), vec![Call::Get, Call::Update, Call::Watch]);
}

#[tokio::test]
async fn wait_times_out_even_with_event_pending() {
    let client = Arc::new(FakeClient::new().with_object(existing_image()).with_events(vec![ready_event("True")], true));
    let mut req = request(named(|f| f.debug = true));
    req.wait = Some(WaitOptions { timeout: Duration::from_nanos(1), tail: None });
    let (res, _) = run(&client, &req).await;
    let report = res.unwrap();
    assert_eq!(report.wait, Some(WaitOutcome::TimedOut(Duration::from_nanos(1))));
    assert_eq!(
        report.into_result().unwrap_err().to_string(),
        "timeout after 1ns waiting for \"my-workload\" to become ready\nTo view status run: wlctl workload get my-workload --namespace default"
    );
}

#[tokio::test]
async fn noop_never_waits() {
    let client = Arc::new(FakeClient::new().with_object(existing_image()));
    let mut req = request(named(|_| {}));
    req.wait = Some(WaitOptions::default());
    let (res, _) = run(&client, &req).await;
    assert!(res.unwrap().wait.is_none());
    assert!(!client.calls().contains(&Call::Watch));
}

#[tokio::test]
async fn failing_tail_does_not_change_outcome() {
    let client = Arc::new(FakeClient::new().with_object(existing_image()).with_events(vec![ready_event("True")], true));
    let tailer = Arc::new(FakeTailer { fail: true, ..Default::default() });
    let mut req = request(named(|f| f.debug = true));
    req.wait = Some(WaitOptions { timeout: Duration::from_secs(30), tail: Some(TailOptions::default()) });
    let pipeline = Pipeline::new(client.clone()).with_tailer(tailer);
    let mut out = Vec::new();
    let report = pipeline.run(&req, &mut NeverAsk, &mut out).await.unwrap();
    assert_eq!(report.wait, Some(WaitOutcome::Ready));
    report.into_result().unwrap();
}

fn local_source_request(dry_run: bool) -> ApplyRequest {
    let flags = named(|f| {
        f.local_path = Some("testdata/local-source".into());
        f.source_image = Some("registry.example.com/team/app-source".into());
    });
    let local_source = flags.local_source().unwrap();
    ApplyRequest { local_source, dry_run, ..request(flags) }
}

#[tokio::test]
async fn local_path_is_published_and_pinned_by_digest() {
    let client = Arc::new(FakeClient::new());
    let publisher = Arc::new(FakePublisher::default());
    let dyn_publisher: Arc<dyn SourcePublisher> = publisher.clone();
    let req = local_source_request(false);
    let mut out = Vec::new();
    let report = Pipeline::new(client.clone())
        .with_publisher(dyn_publisher)
        .run(&req, &mut NeverAsk, &mut out)
        .await
        .unwrap();
    let out = String::from_utf8(out).unwrap();

    assert_eq!(
        publisher.pushed.lock().unwrap().clone(),
        vec![(PathBuf::from("testdata/local-source"), "registry.example.com/team/app-source".to_string())]
    );
    assert!(out.starts_with(
        "Publishing source in \"testdata/local-source\" to \"registry.example.com/team/app-source\"...\nPublished source\n"
    ), "{}", out);
    let pinned = format!("registry.example.com/team/app-source@{}", SOURCE_DIGEST);
    match report.outcome {
        ApplyOutcome::Created(w) => assert_eq!(w.spec.source.unwrap().image.as_deref(), Some(pinned.as_str())),
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[tokio::test]
async fn dry_run_does_not_publish() {
    let client = Arc::new(FakeClient::new());
    let publisher = Arc::new(FakePublisher::default());
    let dyn_publisher: Arc<dyn SourcePublisher> = publisher.clone();
    let req = local_source_request(true);
    let mut out = Vec::new();
    let report = Pipeline::new(client.clone())
        .with_publisher(dyn_publisher)
        .run(&req, &mut NeverAsk, &mut out)
        .await
        .unwrap();
    assert!(matches!(report.outcome, ApplyOutcome::DryRun { .. }));
    assert!(publisher.pushed.lock().unwrap().is_empty());
    assert!(String::from_utf8(out).unwrap().contains("image: registry.example.com/team/app-source\n"));
    assert_eq!(client.writes(), 0);
}

#[tokio::test]
async fn failed_publish_stops_before_any_cluster_call() {
    let client = Arc::new(FakeClient::new());
    let publisher: Arc<dyn SourcePublisher> = Arc::new(FakePublisher { fail: true, ..Default::default() });
    let req = local_source_request(false);
    let mut out = Vec::new();
    let err = Pipeline::new(client.clone()).with_publisher(publisher).run(&req, &mut NeverAsk, &mut out).await.unwrap_err();
    assert!(matches!(err, ApplyError::Publish { ref image, .. } if image == "registry.example.com/team/app-source"));
    assert!(err.to_string().contains("UNAUTHORIZED"), "{}", err);
    assert!(client.calls().is_empty());
}

#[tokio::test]
async fn local_path_without_publisher_is_rejected() {
    let client = Arc::new(FakeClient::new());
    let (res, _) = run(&client, &local_source_request(false)).await;
    assert!(matches!(res, Err(ApplyError::Validation(ref m)) if m.contains("--local-path")));
    assert!(client.calls().is_empty());
}
