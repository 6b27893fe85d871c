use serde::{Deserialize, Serialize};

/// Marker emitted instead of an empty block so the synthesizer can tell
/// "nothing found" apart from "context omitted".
pub const NO_RECORDS_MARKER: &str = "no matching expense records found";

/// Rough chars-per-token ratio used for the context budget.
const CHARS_PER_TOKEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextSource {
    Database,
    Web,
}

impl ContextSource {
    pub fn tag(&self) -> &'static str {
        match self {
            ContextSource::Database => "database",
            ContextSource::Web => "web",
        }
    }
}

/// One evidence fragment, tagged with where it came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextFragment {
    pub source: ContextSource,
    pub text: String,
}

/// Ordered evidence fragments, most relevant first. Bounded by a token
/// budget; trailing (least relevant) fragments are dropped first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievedContext {
    pub fragments: Vec<ContextFragment>,
}

impl RetrievedContext {
    pub fn push(&mut self, source: ContextSource, text: impl Into<String>) {
        self.fragments.push(ContextFragment {
            source,
            text: text.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    /// True when the database contributed nothing but the marker.
    pub fn is_no_records(&self) -> bool {
        self.fragments
            .iter()
            .filter(|f| f.source == ContextSource::Database)
            .all(|f| f.text == NO_RECORDS_MARKER)
    }

    pub fn has_web_evidence(&self) -> bool {
        self.fragments
            .iter()
            .any(|f| f.source == ContextSource::Web)
    }

    /// Approximate token count of the rendered block.
    pub fn approx_tokens(&self) -> usize {
        self.fragments
            .iter()
            .map(|f| (f.text.len() + f.source.tag().len() + 3).div_ceil(CHARS_PER_TOKEN))
            .sum()
    }

    /// Drop trailing fragments until the block fits the budget. Returns how
    /// many fragments were dropped. Always keeps at least one fragment.
    pub fn truncate_to_budget(&mut self, max_tokens: usize) -> usize {
        let mut dropped = 0;
        while self.fragments.len() > 1 && self.approx_tokens() > max_tokens {
            self.fragments.pop();
            dropped += 1;
        }
        dropped
    }

    /// Render to the single labeled text block handed to the synthesizer
    /// and to the judges. Deterministic for a given fragment sequence.
    pub fn render(&self) -> String {
        self.fragments
            .iter()
            .map(|f| format!("[{}] {}", f.source.tag(), f.text))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_tags_each_fragment_with_its_source() {
        let mut ctx = RetrievedContext::default();
        ctx.push(ContextSource::Database, "merchant=Bean There amount=4.50");
        ctx.push(ContextSource::Web, "Espresso prices rose 4% this year");

        let block = ctx.render();
        assert_eq!(
            block,
            "[database] merchant=Bean There amount=4.50\n[web] Espresso prices rose 4% this year"
        );
    }

    #[test]
    fn test_render_is_deterministic() {
        let mut ctx = RetrievedContext::default();
        ctx.push(ContextSource::Database, "row one");
        ctx.push(ContextSource::Database, "row two");
        assert_eq!(ctx.render(), ctx.render());
    }

    #[test]
    fn test_no_records_detection() {
        let mut ctx = RetrievedContext::default();
        ctx.push(ContextSource::Database, NO_RECORDS_MARKER);
        assert!(ctx.is_no_records());

        ctx.push(ContextSource::Web, "something external");
        assert!(ctx.is_no_records(), "web fragments do not count as records");

        let mut with_rows = RetrievedContext::default();
        with_rows.push(ContextSource::Database, "merchant=Cafe amount=3.00");
        assert!(!with_rows.is_no_records());
    }

    #[test]
    fn test_truncation_drops_trailing_fragments_first() {
        let mut ctx = RetrievedContext::default();
        for i in 0..10 {
            ctx.push(ContextSource::Database, format!("row {i} {}", "x".repeat(80)));
        }

        let dropped = ctx.truncate_to_budget(60);
        assert!(dropped > 0);
        // The head of the sequence survives; the tail is gone
        assert!(ctx.fragments[0].text.starts_with("row 0"));
        assert!(ctx.approx_tokens() <= 60 || ctx.len() == 1);
    }

    #[test]
    fn test_truncation_never_empties_the_context() {
        let mut ctx = RetrievedContext::default();
        ctx.push(ContextSource::Database, "x".repeat(10_000));
        let dropped = ctx.truncate_to_budget(1);
        assert_eq!(dropped, 0);
        assert_eq!(ctx.len(), 1);
    }
}
