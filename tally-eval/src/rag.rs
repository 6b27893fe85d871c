//! RAG metric family — faithfulness, answer relevance, context precision,
//! context recall
//!
//! Every metric is judge-based and independently computable: a failed judge
//! call nulls that one metric and flags the row, the others still score.
//! Conventions (documented policy, not model whim):
//! - context recall is not-applicable without a reference answer, never 0
//! - when retrieval produced the no-records marker, context precision is
//!   0.0 (no evidence) and context recall is 0.0 against an existing
//!   reference, not-applicable otherwise
//! - every parsed score is clamped to [0,1]

use std::sync::Arc;

use tally_core::{GenerativeBackend, RagScores, RetrievedContext, TallyError};

const DECOMPOSE_SYSTEM: &str = "\
You decompose text into atomic factual statements. \
Respond with ONLY a JSON array of strings, nothing else.";

const DECOMPOSE_USER: &str = "\
Break the following answer into its atomic factual statements:

{text}";

const SUPPORT_SYSTEM: &str = "\
You verify statements against evidence. For each numbered statement decide \
whether the evidence supports it. Respond with ONLY a JSON array of booleans, \
one per statement, in order, nothing else.";

const SUPPORT_USER: &str = "\
Evidence:
{context}

Statements:
{statements}";

const RELEVANCE_SYSTEM: &str = "\
You rate how directly an answer addresses a question, ignoring whether the \
answer is factually correct. Respond with ONLY a number between 0.0 and 1.0, \
nothing else.";

const RELEVANCE_USER: &str = "\
Question: {question}

Answer: {answer}";

const PRECISION_SYSTEM: &str = "\
You rate retrieved evidence. For each numbered fragment decide whether it is \
relevant to answering the question. Respond with ONLY a JSON array of \
booleans, one per fragment, in order, nothing else.";

const PRECISION_USER: &str = "\
Question: {question}

Fragments:
{fragments}";

/// Scores one answered question with the four RAGAS-style metrics.
pub struct RagEvaluator {
    judge: Arc<dyn GenerativeBackend>,
}

impl RagEvaluator {
    pub fn new(judge: Arc<dyn GenerativeBackend>) -> Self {
        Self { judge }
    }

    /// Compute all four metrics. Per-metric failures are collected, not
    /// propagated: the returned error list is non-empty iff any metric
    /// failed to score.
    pub async fn score_answer(
        &self,
        question: &str,
        answer: &str,
        context: &RetrievedContext,
        reference_answer: Option<&str>,
    ) -> (RagScores, Vec<String>) {
        let mut scores = RagScores::default();
        let mut errors = Vec::new();

        match self.faithfulness(answer, context).await {
            Ok(value) => scores.faithfulness = value,
            Err(e) => errors.push(e.to_string()),
        }

        match self.answer_relevance(question, answer).await {
            Ok(value) => scores.answer_relevance = value,
            Err(e) => errors.push(e.to_string()),
        }

        match self.context_precision(question, context).await {
            Ok(value) => scores.context_precision = value,
            Err(e) => errors.push(e.to_string()),
        }

        match self.context_recall(reference_answer, context).await {
            Ok(value) => scores.context_recall = value,
            Err(e) => errors.push(e.to_string()),
        }

        (scores, errors)
    }

    /// Fraction of the answer's atomic statements supported by the context.
    pub async fn faithfulness(
        &self,
        answer: &str,
        context: &RetrievedContext,
    ) -> Result<Option<f64>, TallyError> {
        if answer.trim().is_empty() {
            return Ok(None);
        }

        let statements = self.decompose("faithfulness", answer).await?;
        if statements.is_empty() {
            return Ok(None);
        }

        let verdicts = self
            .support_verdicts("faithfulness", &statements, &context.render())
            .await?;

        Ok(Some(supported_fraction(&verdicts, statements.len())))
    }

    /// Semantic correspondence between answer and question.
    pub async fn answer_relevance(
        &self,
        question: &str,
        answer: &str,
    ) -> Result<Option<f64>, TallyError> {
        let user = RELEVANCE_USER
            .replace("{question}", question)
            .replace("{answer}", answer);

        let generation = self
            .judge
            .generate(RELEVANCE_SYSTEM, &user)
            .await
            .map_err(|e| scoring_error("answer_relevance", &e.to_string()))?;

        parse_unit_score(&generation.text)
            .map(Some)
            .map_err(|reason| scoring_error("answer_relevance", &reason))
    }

    /// Fraction of retrieved fragments relevant to the question.
    pub async fn context_precision(
        &self,
        question: &str,
        context: &RetrievedContext,
    ) -> Result<Option<f64>, TallyError> {
        // No evidence retrieved: precision is "no evidence", not an error
        if context.is_empty() || (context.is_no_records() && !context.has_web_evidence()) {
            return Ok(Some(0.0));
        }

        let fragments: Vec<String> = context
            .fragments
            .iter()
            .map(|f| f.text.clone())
            .collect();

        let user = PRECISION_USER
            .replace("{question}", question)
            .replace("{fragments}", &numbered(&fragments));

        let generation = self
            .judge
            .generate(PRECISION_SYSTEM, &user)
            .await
            .map_err(|e| scoring_error("context_precision", &e.to_string()))?;

        let verdicts = parse_bool_array(&generation.text)
            .map_err(|reason| scoring_error("context_precision", &reason))?;

        Ok(Some(supported_fraction(&verdicts, fragments.len())))
    }

    /// Fraction of the reference answer's statements present in the context.
    /// Not applicable without a reference.
    pub async fn context_recall(
        &self,
        reference_answer: Option<&str>,
        context: &RetrievedContext,
    ) -> Result<Option<f64>, TallyError> {
        let reference = match reference_answer {
            Some(r) if !r.trim().is_empty() => r,
            _ => return Ok(None),
        };

        if context.is_empty() || (context.is_no_records() && !context.has_web_evidence()) {
            return Ok(Some(0.0));
        }

        let statements = self.decompose("context_recall", reference).await?;
        if statements.is_empty() {
            return Ok(None);
        }

        let verdicts = self
            .support_verdicts("context_recall", &statements, &context.render())
            .await?;

        Ok(Some(supported_fraction(&verdicts, statements.len())))
    }

    async fn decompose(&self, metric: &str, text: &str) -> Result<Vec<String>, TallyError> {
        let user = DECOMPOSE_USER.replace("{text}", text);

        let generation = self
            .judge
            .generate(DECOMPOSE_SYSTEM, &user)
            .await
            .map_err(|e| scoring_error(metric, &e.to_string()))?;

        parse_string_array(&generation.text).map_err(|reason| scoring_error(metric, &reason))
    }

    async fn support_verdicts(
        &self,
        metric: &str,
        statements: &[String],
        context_block: &str,
    ) -> Result<Vec<bool>, TallyError> {
        let user = SUPPORT_USER
            .replace("{context}", context_block)
            .replace("{statements}", &numbered(statements));

        let generation = self
            .judge
            .generate(SUPPORT_SYSTEM, &user)
            .await
            .map_err(|e| scoring_error(metric, &e.to_string()))?;

        parse_bool_array(&generation.text).map_err(|reason| scoring_error(metric, &reason))
    }
}

fn scoring_error(metric: &str, reason: &str) -> TallyError {
    TallyError::Scoring {
        metric: metric.to_string(),
        reason: reason.to_string(),
    }
}

fn numbered(lines: &[String]) -> String {
    lines
        .iter()
        .enumerate()
        .map(|(i, line)| format!("{}. {}", i + 1, line))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Fraction of true verdicts over `expected` items. A short verdict list
/// counts the missing tail as unsupported.
fn supported_fraction(verdicts: &[bool], expected: usize) -> f64 {
    if expected == 0 {
        return 0.0;
    }
    let supported = verdicts.iter().take(expected).filter(|v| **v).count();
    supported as f64 / expected as f64
}

// ============================================================================
// Judge-reply parsing
// ============================================================================

fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let trimmed = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    trimmed.strip_suffix("```").unwrap_or(trimmed).trim()
}

/// Parse a bare number reply and clamp it into [0,1].
pub(crate) fn parse_unit_score(text: &str) -> Result<f64, String> {
    let cleaned = strip_code_fences(text);
    let value: f64 = cleaned
        .parse()
        .map_err(|_| format!("judge reply is not a number: '{cleaned}'"))?;
    if !value.is_finite() {
        return Err(format!("judge reply is not finite: '{cleaned}'"));
    }
    Ok(value.clamp(0.0, 1.0))
}

pub(crate) fn parse_bool_array(text: &str) -> Result<Vec<bool>, String> {
    serde_json::from_str(strip_code_fences(text))
        .map_err(|e| format!("judge reply is not a boolean array: {e}"))
}

pub(crate) fn parse_string_array(text: &str) -> Result<Vec<String>, String> {
    serde_json::from_str(strip_code_fences(text))
        .map_err(|e| format!("judge reply is not a string array: {e}"))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::{ContextSource, ScriptedBackend, NO_RECORDS_MARKER};

    fn evaluator(script: Vec<&str>) -> RagEvaluator {
        RagEvaluator::new(Arc::new(ScriptedBackend::new(script)))
    }

    fn db_context(lines: &[&str]) -> RetrievedContext {
        let mut ctx = RetrievedContext::default();
        for line in lines {
            ctx.push(ContextSource::Database, *line);
        }
        ctx
    }

    fn no_records_context() -> RetrievedContext {
        db_context(&[NO_RECORDS_MARKER])
    }

    #[tokio::test]
    async fn test_faithfulness_is_supported_fraction() {
        let eval = evaluator(vec![
            r#"["You spent 12.50", "The merchant was Bean There", "It was raining"]"#,
            r#"[true, true, false]"#,
        ]);

        let score = eval
            .faithfulness(
                "You spent 12.50 at Bean There. It was raining.",
                &db_context(&["merchant=Bean There amount=12.50"]),
            )
            .await
            .unwrap();

        assert_eq!(score, Some(2.0 / 3.0));
    }

    #[tokio::test]
    async fn test_faithfulness_of_empty_answer_is_not_applicable() {
        let eval = evaluator(vec![]);
        let score = eval
            .faithfulness("", &db_context(&["row"]))
            .await
            .unwrap();
        assert_eq!(score, None);
    }

    #[tokio::test]
    async fn test_answer_relevance_clamps_out_of_range_scores() {
        let eval = evaluator(vec!["1.7"]);
        let score = eval.answer_relevance("q", "a").await.unwrap();
        assert_eq!(score, Some(1.0));

        let eval = evaluator(vec!["-0.3"]);
        let score = eval.answer_relevance("q", "a").await.unwrap();
        assert_eq!(score, Some(0.0));
    }

    #[tokio::test]
    async fn test_answer_relevance_garbage_reply_is_scoring_error() {
        let eval = evaluator(vec!["somewhat relevant, I think"]);
        let err = eval.answer_relevance("q", "a").await.unwrap_err();
        assert_eq!(err.kind(), "scoring_error");
    }

    #[tokio::test]
    async fn test_context_precision_over_fragments() {
        let eval = evaluator(vec![r#"[true, false]"#]);
        let score = eval
            .context_precision("coffee spend?", &db_context(&["coffee row", "travel row"]))
            .await
            .unwrap();
        assert_eq!(score, Some(0.5));
    }

    #[tokio::test]
    async fn test_no_records_context_scores_precision_zero_without_judge() {
        let eval = evaluator(vec![]);
        let score = eval
            .context_precision("anything", &no_records_context())
            .await
            .unwrap();
        assert_eq!(score, Some(0.0), "no evidence, not an error");
    }

    #[tokio::test]
    async fn test_context_recall_without_reference_is_not_applicable() {
        let eval = evaluator(vec![]);
        let score = eval
            .context_recall(None, &db_context(&["row"]))
            .await
            .unwrap();
        assert_eq!(score, None, "never silently scored 0");

        let score = eval
            .context_recall(Some("  "), &db_context(&["row"]))
            .await
            .unwrap();
        assert_eq!(score, None);
    }

    #[tokio::test]
    async fn test_context_recall_against_reference() {
        let eval = evaluator(vec![
            r#"["Total was 14.00", "Three purchases were made"]"#,
            r#"[true, false]"#,
        ]);
        let score = eval
            .context_recall(
                Some("The total was 14.00 across three purchases."),
                &db_context(&["amount=14.00"]),
            )
            .await
            .unwrap();
        assert_eq!(score, Some(0.5));
    }

    #[tokio::test]
    async fn test_score_answer_isolates_metric_failures() {
        // decompose (faithfulness) fails on garbage; remaining three score
        let eval = evaluator(vec![
            "not json at all",   // faithfulness: decompose
            "0.8",               // answer_relevance
            r#"[true]"#,         // context_precision
            r#"["stmt"]"#,       // context_recall: decompose
            r#"[true]"#,         // context_recall: verdicts
        ]);

        let (scores, errors) = eval
            .score_answer("q", "answer", &db_context(&["row"]), Some("reference"))
            .await;

        assert_eq!(scores.faithfulness, None);
        assert_eq!(scores.answer_relevance, Some(0.8));
        assert_eq!(scores.context_precision, Some(1.0));
        assert_eq!(scores.context_recall, Some(1.0));
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("faithfulness"));
    }

    #[tokio::test]
    async fn test_all_scores_stay_in_unit_interval() {
        let eval = evaluator(vec![
            r#"["a", "b"]"#,
            r#"[true, true, true, true, true]"#, // verdict list longer than statements
            "2.5",
            r#"[true, false, true]"#,
            r#"["x"]"#,
            r#"[true]"#,
        ]);

        let (scores, _) = eval
            .score_answer("q", "answer", &db_context(&["r1", "r2", "r3"]), Some("ref"))
            .await;

        for (name, value) in scores.metric_values() {
            if let Some(v) = value {
                assert!((0.0..=1.0).contains(&v), "{name} out of bounds: {v}");
            }
        }
    }

    #[test]
    fn test_parse_helpers_strip_markdown_fences() {
        assert_eq!(parse_unit_score("```\n0.75\n```").unwrap(), 0.75);
        assert_eq!(
            parse_bool_array("```json\n[true, false]\n```").unwrap(),
            vec![true, false]
        );
        assert_eq!(
            parse_string_array("```json\n[\"a\"]\n```").unwrap(),
            vec!["a".to_string()]
        );
    }
}
