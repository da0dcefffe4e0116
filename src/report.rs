//! Console reporting and exit-code policy for a bootstrap run.

use std::fmt;

use clap::ValueEnum;
use serde::Serialize;

use crate::models::{ApplyResult, Outcome};

/// Every object is in its declared state.
pub const EXIT_OK: u8 = 0;
/// At least one conflict or failure.
pub const EXIT_INCOMPLETE: u8 = 1;
/// Nothing was applied: bad manifest or no connection.
pub const EXIT_FATAL: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ReportFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub created: usize,
    pub already_exists: usize,
    pub conflict: usize,
    pub failed: usize,
}

impl Summary {
    pub fn from_results(results: &[ApplyResult]) -> Self {
        let mut summary = Self::default();
        for result in results {
            match result.outcome {
                Outcome::Created => summary.created += 1,
                Outcome::AlreadyExists => summary.already_exists += 1,
                Outcome::Conflict => summary.conflict += 1,
                Outcome::Failed(_) => summary.failed += 1,
            }
        }
        summary
    }

    pub fn is_clean(&self) -> bool {
        self.conflict == 0 && self.failed == 0
    }

    pub fn exit_code(&self) -> u8 {
        if self.is_clean() {
            EXIT_OK
        } else {
            EXIT_INCOMPLETE
        }
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} created, {} already-exists, {} conflict, {} failed",
            self.created, self.already_exists, self.conflict, self.failed
        )
    }
}

fn marker(outcome: Outcome) -> &'static str {
    match outcome {
        Outcome::Created => "✅",
        Outcome::AlreadyExists => "ℹ️ ",
        Outcome::Conflict => "⚠️ ",
        Outcome::Failed(_) => "❌",
    }
}

/// One console line per object.
pub fn render_line(result: &ApplyResult) -> String {
    let mut line = format!(
        "{} {:<10} {:<16} {}",
        marker(result.outcome),
        result.kind.to_string(),
        result.outcome.to_string(),
        result.name
    );
    if let Some(detail) = &result.detail {
        line.push_str(&format!(" ({detail})"));
    }
    line
}

#[derive(Serialize)]
struct JsonReport<'a> {
    results: &'a [ApplyResult],
    summary: Summary,
}

/// Print the per-object lines and the summary to stdout.
pub fn print_report(results: &[ApplyResult], format: ReportFormat) -> serde_json::Result<Summary> {
    let summary = Summary::from_results(results);
    match format {
        ReportFormat::Text => {
            for result in results {
                println!("{}", render_line(result));
            }
            println!("📊 Summary: {summary}");
        }
        ReportFormat::Json => {
            let report = JsonReport { results, summary };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FailureKind, ObjectKind};

    fn results() -> Vec<ApplyResult> {
        vec![
            ApplyResult::new(ObjectKind::User, "svc@admin", Outcome::Created),
            ApplyResult::new(ObjectKind::Collection, "app_db.events", Outcome::AlreadyExists),
            ApplyResult::new(ObjectKind::Index, "app_db.events.x", Outcome::Conflict)
                .with_detail("key pattern differs"),
            ApplyResult::new(
                ObjectKind::Index,
                "app_db.events.y",
                Outcome::Failed(FailureKind::Timeout),
            ),
        ]
    }

    #[test]
    fn test_summary_counts_and_exit_code() {
        let summary = Summary::from_results(&results());
        assert_eq!(
            summary,
            Summary {
                created: 1,
                already_exists: 1,
                conflict: 1,
                failed: 1
            }
        );
        assert_eq!(summary.exit_code(), EXIT_INCOMPLETE);
        assert_eq!(
            summary.to_string(),
            "1 created, 1 already-exists, 1 conflict, 1 failed"
        );

        let clean = Summary::from_results(&results()[..2]);
        assert_eq!(clean.exit_code(), EXIT_OK);
        assert_eq!(Summary::from_results(&[]).exit_code(), EXIT_OK);
    }

    #[test]
    fn test_render_line_includes_detail() {
        let line = render_line(&results()[2]);
        assert!(line.contains("conflict"));
        assert!(line.contains("app_db.events.x"));
        assert!(line.ends_with("(key pattern differs)"));
    }

    #[test]
    fn test_json_report_shape() {
        let rendered = serde_json::to_value(JsonReport {
            results: &results(),
            summary: Summary::from_results(&results()),
        })
        .unwrap();
        assert_eq!(rendered["results"][0]["outcome"], "created");
        assert_eq!(rendered["results"][3]["outcome"]["failed"], "timeout");
        assert_eq!(rendered["summary"]["conflict"], 1);
    }
}
