//! Context assembler — deterministic rendering of evidence into one block
//!
//! Rows become one line each (`column=value` pairs, columns in sorted
//! order), search hits become one line each, and the whole sequence is
//! bounded by the configured token budget. An empty result set yields the
//! explicit no-records marker instead of an empty block.

use tally_core::{ContextSource, RetrievedContext, SearchHit, NO_RECORDS_MARKER};

use super::executor::ResultSet;

/// Render one JSON row as a single `column=value` line. Column order is
/// the map's sorted key order, so identical rows always render identically.
fn render_row(row: &serde_json::Value) -> String {
    match row.as_object() {
        Some(fields) => fields
            .iter()
            .map(|(column, value)| match value {
                serde_json::Value::String(s) => format!("{column}={s}"),
                serde_json::Value::Null => format!("{column}="),
                other => format!("{column}={other}"),
            })
            .collect::<Vec<_>>()
            .join(" "),
        None => row.to_string(),
    }
}

/// Build database context from an executed result set.
pub fn assemble_database_context(rows: &ResultSet) -> RetrievedContext {
    let mut context = RetrievedContext::default();

    if rows.is_empty() {
        context.push(ContextSource::Database, NO_RECORDS_MARKER);
        return context;
    }

    for row in &rows.rows {
        context.push(ContextSource::Database, render_row(row));
    }

    context
}

/// Append web-search hits, tagged `web` so they never blend in with
/// database evidence.
pub fn append_web_context(context: &mut RetrievedContext, hits: &[SearchHit]) {
    for hit in hits {
        let title = hit.title.as_deref().unwrap_or(&hit.url);
        let snippet = hit.snippet.as_deref().unwrap_or("");
        context.push(
            ContextSource::Web,
            format!("{title}: {snippet} ({})", hit.url),
        );
    }
}

/// Apply the token budget. Trailing (least relevant) fragments go first.
pub fn enforce_budget(context: &mut RetrievedContext, max_tokens: u32) {
    let dropped = context.truncate_to_budget(max_tokens as usize);
    if dropped > 0 {
        tracing::warn!(
            dropped,
            max_tokens,
            "Context exceeded token budget; trailing fragments dropped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(values: Vec<serde_json::Value>) -> ResultSet {
        ResultSet { rows: values }
    }

    #[test]
    fn test_rows_render_one_line_each_with_labels() {
        let set = rows(vec![
            serde_json::json!({"merchant": "Bean There", "amount": 4.5}),
            serde_json::json!({"merchant": "Grind House", "amount": 6.0}),
        ]);

        let context = assemble_database_context(&set);
        let block = context.render();

        assert_eq!(context.len(), 2);
        assert!(block.contains("[database] amount=4.5 merchant=Bean There"));
        assert!(block.contains("[database] amount=6.0 merchant=Grind House"));
    }

    #[test]
    fn test_empty_result_set_yields_marker_not_empty_string() {
        let context = assemble_database_context(&rows(vec![]));
        assert_eq!(context.len(), 1);
        assert!(context.is_no_records());
        assert_eq!(context.render(), format!("[database] {NO_RECORDS_MARKER}"));
    }

    #[test]
    fn test_null_column_renders_empty_value() {
        let set = rows(vec![serde_json::json!({"merchant": null, "amount": 2})]);
        let context = assemble_database_context(&set);
        assert_eq!(context.render(), "[database] amount=2 merchant=");
    }

    #[test]
    fn test_web_hits_are_tagged_web() {
        let mut context = assemble_database_context(&rows(vec![]));
        append_web_context(
            &mut context,
            &[SearchHit {
                url: "https://wx.example".to_string(),
                title: Some("Forecast".to_string()),
                snippet: Some("Sunny, 24C".to_string()),
            }],
        );

        let block = context.render();
        assert!(block.contains("[web] Forecast: Sunny, 24C (https://wx.example)"));
    }

    #[test]
    fn test_assembly_is_deterministic_for_identical_input() {
        let set = rows(vec![serde_json::json!({"b": 1, "a": 2, "c": "x"})]);
        let first = assemble_database_context(&set).render();
        let second = assemble_database_context(&set).render();
        assert_eq!(first, second);
        assert_eq!(first, "[database] a=2 b=1 c=x");
    }

    #[test]
    fn test_budget_drops_trailing_rows() {
        let many: Vec<_> = (0..50)
            .map(|i| serde_json::json!({"merchant": format!("shop {i}"), "note": "x".repeat(100)}))
            .collect();
        let mut context = assemble_database_context(&rows(many));

        enforce_budget(&mut context, 100);
        assert!(context.len() < 50);
        assert!(context.render().contains("shop 0"));
    }
}
