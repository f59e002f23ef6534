//! Line diff between canonical workload serializations.
//!
//! The record keeps every line; only `render` collapses unchanged runs.

use std::fmt::Write as _;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use similar::{Algorithm, ChangeTag, TextDiff};
use wl_core::Workload;

/// Unchanged lines shown on each side of a change.
pub const CONTEXT_LINES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LineOp {
    Context,
    Added,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffLine {
    pub op: LineOp,
    /// 1-based; absent for added lines.
    pub before: Option<usize>,
    /// 1-based; absent for removed lines.
    pub after: Option<usize>,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub removes: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffRecord {
    pub lines: Vec<DiffLine>,
}

impl DiffRecord {
    /// No added or removed lines: nothing to submit.
    pub fn is_empty(&self) -> bool {
        self.lines.iter().all(|l| l.op == LineOp::Context)
    }

    pub fn summary(&self) -> DiffSummary {
        let mut s = DiffSummary::default();
        for l in &self.lines {
            match l.op {
                LineOp::Added => s.adds += 1,
                LineOp::Removed => s.removes += 1,
                LineOp::Context => {}
            }
        }
        s
    }

    /// Context + added lines, newline-terminated.
    pub fn after_text(&self) -> String {
        join(self.lines.iter().filter(|l| l.op != LineOp::Removed))
    }

    /// Context + removed lines, newline-terminated.
    pub fn before_text(&self) -> String {
        join(self.lines.iter().filter(|l| l.op != LineOp::Added))
    }

    /// Display form: numbered lines with `+`/`-` markers, unchanged runs
    /// further than `CONTEXT_LINES` from a change collapsed into `...`.
    pub fn render(&self) -> String {
        let changed: Vec<usize> = self
            .lines
            .iter()
            .enumerate()
            .filter(|(_, l)| l.op != LineOp::Context)
            .map(|(i, _)| i)
            .collect();
        let mut visible = vec![false; self.lines.len()];
        for &i in &changed {
            let lo = i.saturating_sub(CONTEXT_LINES);
            let hi = (i + CONTEXT_LINES).min(self.lines.len() - 1);
            visible[lo..=hi].iter_mut().for_each(|v| *v = true);
        }

        let mut out = String::new();
        let mut in_gap = false;
        for (line, shown) in self.lines.iter().zip(visible) {
            if !shown {
                if !in_gap {
                    out.push_str("...\n");
                    in_gap = true;
                }
                continue;
            }
            in_gap = false;
            let marker = match line.op {
                LineOp::Context => ' ',
                LineOp::Added => '+',
                LineOp::Removed => '-',
            };
            let sep = if line.before.is_some() && line.after.is_some() { ',' } else { ' ' };
            let _ = writeln!(out, "{}{}{} {} |{}", num(line.before), sep, num(line.after), marker, line.text);
        }
        out
    }
}

fn num(n: Option<usize>) -> String {
    match n {
        Some(n) => format!("{:>3}", n),
        None => "   ".to_string(),
    }
}

fn join<'a>(lines: impl Iterator<Item = &'a DiffLine>) -> String {
    let mut out = String::new();
    for l in lines {
        out.push_str(&l.text);
        out.push('\n');
    }
    out
}

/// Diff two workloads by their canonical serialization. `None` diffs against
/// nothing, so every line is an addition.
pub fn diff(before: Option<&Workload>, after: &Workload) -> Result<DiffRecord> {
    let before = match before {
        Some(w) => w.canonical_yaml()?,
        None => String::new(),
    };
    Ok(diff_text(&before, &after.canonical_yaml()?))
}

fn diff_timeout() -> Duration {
    let ms = std::env::var("WLCTL_DIFF_TIMEOUT_MS").ok().and_then(|s| s.parse().ok()).unwrap_or(500);
    Duration::from_millis(ms)
}

fn strip_eol(line: &str) -> &str {
    let line = line.strip_suffix('\n').unwrap_or(line);
    line.strip_suffix('\r').unwrap_or(line)
}

/// Myers line alignment. Equal inputs give an empty record; otherwise removals
/// precede additions within a replaced region. Past the deadline the
/// alignment degrades to coarser hunks but both sides stay reconstructible.
pub fn diff_text(before: &str, after: &str) -> DiffRecord {
    if before == after {
        return DiffRecord::default();
    }
    let text_diff = TextDiff::configure().algorithm(Algorithm::Myers).timeout(diff_timeout()).diff_lines(before, after);
    let lines = text_diff
        .iter_all_changes()
        .map(|change| {
            let op = match change.tag() {
                ChangeTag::Equal => LineOp::Context,
                ChangeTag::Delete => LineOp::Removed,
                ChangeTag::Insert => LineOp::Added,
            };
            DiffLine {
                op,
                before: change.old_index().filter(|_| op != LineOp::Added).map(|i| i + 1),
                after: change.new_index().filter(|_| op != LineOp::Removed).map(|i| i + 1),
                text: strip_eol(change.value()).to_string(),
            }
        })
        .collect();
    DiffRecord { lines }
}
