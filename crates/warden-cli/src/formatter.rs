//! Output formatting for query results and save outcomes.

use clap::ValueEnum;
use serde_json::json;
use warden_core::SaveOutcome;

/// Output format for results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Indented JSON
    Pretty,
    /// Compact JSON
    Json,
    /// One compact JSON row per line
    Lines,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Pretty => write!(f, "pretty"),
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::Lines => write!(f, "lines"),
        }
    }
}

/// Format serialized rows, with the total row count when the query was
/// paged.
pub fn format_rows(rows: &serde_json::Value, total: Option<usize>, format: OutputFormat) -> String {
    match format {
        OutputFormat::Lines => rows
            .as_array()
            .map(|rows| rows.iter().map(|row| row.to_string()).collect::<Vec<_>>().join("\n"))
            .unwrap_or_else(|| rows.to_string()),
        _ => {
            let body = match total {
                Some(total) => json!({"rows": rows, "total": total}),
                None => rows.clone(),
            };
            format_value(&body, format)
        }
    }
}

/// Format a save outcome along with the saved root entities.
pub fn format_save(outcome: &SaveOutcome, roots: &serde_json::Value, format: OutputFormat) -> String {
    let body = json!({
        "inserted": outcome.inserted,
        "updated": outcome.updated,
        "deleted": outcome.deleted,
        "drained": outcome.drained,
        "failures": outcome.failures,
        "entities": roots,
    });
    format_value(&body, format)
}

fn format_value(value: &serde_json::Value, format: OutputFormat) -> String {
    match format {
        OutputFormat::Pretty => serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string()),
        OutputFormat::Json | OutputFormat::Lines => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_format() {
        let rows = json!([{"Id": 1}, {"Id": 2}]);
        assert_eq!(format_rows(&rows, None, OutputFormat::Lines), "{\"Id\":1}\n{\"Id\":2}");
    }

    #[test]
    fn test_total_wraps_rows() {
        let rows = json!([{"Id": 1}]);
        assert_eq!(
            format_rows(&rows, Some(4), OutputFormat::Json),
            "{\"rows\":[{\"Id\":1}],\"total\":4}"
        );
    }

    #[test]
    fn test_save_summary() {
        let outcome = SaveOutcome {
            inserted: 2,
            ..Default::default()
        };
        let text = format_save(&outcome, &json!([]), OutputFormat::Json);
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["inserted"], json!(2));
        assert_eq!(parsed["deleted"], json!(0));
        assert_eq!(parsed["failures"], json!([]));
    }
}
