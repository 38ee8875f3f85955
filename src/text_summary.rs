//! Text summary builder for CLI output.
//!
//! This module formats the steps taken and the final range as human-readable lines.

use crate::model::{AppInfo, Verdict};
use crate::orchestrator::Outcome;

/// One evaluated (or abandoned) step as seen by the CLI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRecord {
    pub index: u32,
    pub key: String,
    pub verdict: Option<Verdict>,
}

/// Pre-formatted lines for text output.
pub struct TextSummary {
    pub lines: Vec<String>,
}

fn push_app_info(lines: &mut Vec<String>, info: Option<&AppInfo>) {
    let Some(info) = info else { return };
    for (k, v) in info.iter().filter(|(k, _)| k.as_str() != "build_key") {
        lines.push(format!("    {k}: {v}"));
    }
}

/// Build a text summary from the run outcome and the steps recorded along the way.
///
/// `outcome` is `None` when the run was stopped before it reached a terminal code.
pub fn build_text_summary(outcome: Option<&Outcome>, steps: &[StepRecord]) -> TextSummary {
    let mut lines = Vec::new();

    if !steps.is_empty() {
        lines.push(format!("Steps: {}", steps.len()));
        for step in steps {
            let verdict = step.verdict.map(|v| v.as_str()).unwrap_or("-");
            lines.push(format!("  #{:<3} {} {}", step.index, step.key, verdict));
        }
    }

    let Some(outcome) = outcome else {
        lines.push("The bisection was stopped.".to_string());
        return TextSummary { lines };
    };
    lines.push(outcome.message());

    if let Some(summary) = outcome.summary() {
        let (first_label, last_label) = if summary.find_fix {
            ("Last bad build", "First good build")
        } else {
            ("Last good build", "First bad build")
        };
        lines.push(format!("{first_label}: {}", summary.first));
        push_app_info(&mut lines, summary.first_app_info.as_ref());
        lines.push(format!("{last_label}: {}", summary.last));
        push_app_info(&mut lines, summary.last_app_info.as_ref());
    }

    TextSummary { lines }
}
