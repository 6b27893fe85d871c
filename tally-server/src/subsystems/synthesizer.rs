//! Answer synthesizer — grounded natural-language answer from context
//!
//! The system contract forbids fabrication: when the supplied context is
//! insufficient the model must say so. Faithfulness scoring downstream is
//! the enforcement backstop for that contract.

use std::time::Instant;

use tally_core::{Answer, GenerativeBackend, RetrievedContext, TallyError};

const SYNTHESIZER_SYSTEM_PROMPT: &str = "\
You are a helpful assistant that answers questions about a user's expenses.
Answer STRICTLY from the evidence supplied below; every claim must be \
traceable to it. Evidence lines are tagged [database] (the user's own \
expense records) or [web] (external search results) — when you rely on web \
evidence, say so. If the evidence is insufficient to answer, reply exactly \
that you do not have enough information, and do not guess.";

const SYNTHESIZER_USER_PROMPT: &str = "\
Question: {question}

Evidence:
{context}

Answer:";

pub async fn synthesize_answer(
    backend: &dyn GenerativeBackend,
    question: &str,
    context: RetrievedContext,
) -> Result<Answer, TallyError> {
    let user = SYNTHESIZER_USER_PROMPT
        .replace("{question}", question)
        .replace("{context}", &context.render());

    let started = Instant::now();

    let generation = backend
        .generate(SYNTHESIZER_SYSTEM_PROMPT, &user)
        .await
        .map_err(|e| TallyError::Synthesis(e.to_string()))?;

    let latency_ms = started.elapsed().as_millis() as u64;

    let text = generation.text.trim().to_string();
    if text.is_empty() {
        return Err(TallyError::Synthesis("model returned an empty answer".to_string()));
    }

    tracing::info!(
        latency_ms,
        prompt_tokens = generation.prompt_tokens,
        completion_tokens = generation.completion_tokens,
        "Answer synthesized"
    );

    Ok(Answer {
        text,
        context,
        latency_ms,
        prompt_tokens: generation.prompt_tokens,
        completion_tokens: generation.completion_tokens,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::{ContextSource, ScriptedBackend};

    fn context_with(text: &str) -> RetrievedContext {
        let mut ctx = RetrievedContext::default();
        ctx.push(ContextSource::Database, text);
        ctx
    }

    #[tokio::test]
    async fn test_synthesize_returns_answer_with_context_attached() {
        let backend = ScriptedBackend::new(vec!["You spent 10.50 at Bean There."]);
        let answer = synthesize_answer(
            &backend,
            "what did I spend at Bean There?",
            context_with("merchant=Bean There amount=10.50"),
        )
        .await
        .unwrap();

        assert_eq!(answer.text, "You spent 10.50 at Bean There.");
        assert_eq!(answer.context.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_model_reply_is_synthesis_error() {
        let backend = ScriptedBackend::new(vec!["   "]);
        let err = synthesize_answer(&backend, "q", context_with("row"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "synthesis_error");
    }

    #[tokio::test]
    async fn test_backend_failure_maps_to_synthesis_error() {
        let backend = ScriptedBackend::new(vec![]);
        let err = synthesize_answer(&backend, "q", context_with("row"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "synthesis_error");
    }
}
