use crate::config::EngineConfig;
use crate::error::{EngineError, LlmError};
use crate::knowledge::{Chunk, KnowledgeBase, SamplingStrategy, UniformSampler};
use crate::llm::{complete_with_retry, LanguageModel, RetryPolicy};
use crate::testset::{TestCase, Testset};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SYNTHESIS_SYSTEM_PROMPT: &str = r#"You generate evaluation questions for a chatbot from reference material. Given an excerpt of source text, produce one question a user of the described chatbot might plausibly ask, answerable from the excerpt alone, together with the reference answer.

Respond with JSON only:
{
  "question": "<the question>",
  "reference_answer": "<the answer, derived strictly from the excerpt>"
}

Do not ask about the excerpt itself (no "according to this text" phrasing). Do not invent facts absent from the excerpt."#;

/// Options governing one generation run.
#[derive(Debug, Clone)]
pub struct GeneratorOptions {
    /// Fresh-sample retries per item after the first attempt
    pub max_retries_per_item: u32,
    /// Adjacent chunks included per sampled cluster (1 = single-chunk)
    pub hop_span: usize,
    /// Minimum content-word overlap for the grounding check
    pub grounding_overlap_threshold: f64,
    /// Ceiling on simultaneous outstanding model calls
    pub concurrency_limit: usize,
    /// Seed for reproducible sampling
    pub seed: Option<u64>,
    pub retry: RetryPolicy,
}

impl Default for GeneratorOptions {
    fn default() -> Self {
        Self {
            max_retries_per_item: 3,
            hop_span: 1,
            grounding_overlap_threshold: 0.3,
            concurrency_limit: 4,
            seed: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl GeneratorOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_retries_per_item: config.max_retries_per_item,
            hop_span: config.hop_span,
            grounding_overlap_threshold: config.grounding_overlap_threshold,
            concurrency_limit: config.concurrency_limit,
            seed: config.seed,
            retry: RetryPolicy {
                max_attempts: config.max_attempts,
                backoff_base_ms: config.backoff_base_ms,
            },
        }
    }
}

/// Expected structure of the synthesis model output.
#[derive(Debug, Deserialize)]
struct DraftCase {
    question: String,
    reference_answer: String,
}

enum ItemOutcome {
    Case(TestCase),
    Skipped,
    Aborted(LlmError),
}

/// Synthesizes grounded question/reference-answer testsets from a
/// knowledge base.
pub struct TestsetGenerator {
    model: Arc<dyn LanguageModel>,
    options: GeneratorOptions,
    sampler: Option<Mutex<Box<dyn SamplingStrategy + Send>>>,
}

impl TestsetGenerator {
    pub fn new(model: Arc<dyn LanguageModel>, options: GeneratorOptions) -> Self {
        Self {
            model,
            options,
            sampler: None,
        }
    }

    /// Replace the default uniform sampler with a custom strategy
    /// (stratified, weighted). The strategy keeps its state across items
    /// and across runs of this generator.
    pub fn with_sampler(mut self, sampler: Box<dyn SamplingStrategy + Send>) -> Self {
        self.sampler = Some(Mutex::new(sampler));
        self
    }

    /// Generate up to `num_questions` test cases.
    ///
    /// Per-item failures (malformed or ungrounded model output after
    /// exhausting retries) are skipped and counted; only systemic model failures
    /// abort the whole call. The returned testset always satisfies
    /// `len + skipped_count == num_questions`.
    pub async fn generate(
        &self,
        kb: &KnowledgeBase,
        num_questions: usize,
        agent_description: &str,
        cancel: CancellationToken,
    ) -> Result<Testset, EngineError> {
        if kb.is_empty() && num_questions > 0 {
            return Err(EngineError::InsufficientData {
                requested: 1,
                available: 0,
            });
        }
        info!(num_questions, "starting testset generation");

        let gate = Semaphore::new(self.options.concurrency_limit);
        let default_sampler: Mutex<Box<dyn SamplingStrategy + Send>> =
            Mutex::new(Box::new(UniformSampler::new(self.options.seed)));
        let sampler = self.sampler.as_ref().unwrap_or(&default_sampler);
        // Child token: a systemic failure in one item stops the rest
        // without requiring the caller to cancel.
        let abort = cancel.child_token();

        let items = (0..num_questions).map(|index| {
            self.generate_item(index, kb, agent_description, &sampler, &gate, &abort)
        });
        let outcomes = futures::future::join_all(items).await;

        let mut test_cases = Vec::new();
        let mut skipped_count = 0;
        let mut systemic: Option<LlmError> = None;
        for outcome in outcomes {
            match outcome {
                ItemOutcome::Case(case) => test_cases.push(case),
                ItemOutcome::Skipped => skipped_count += 1,
                ItemOutcome::Aborted(err) => {
                    systemic.get_or_insert(err);
                }
            }
        }
        if let Some(err) = systemic {
            return Err(EngineError::GenerationAborted(err));
        }

        info!(
            generated = test_cases.len(),
            skipped = skipped_count,
            "testset generation finished"
        );
        Ok(Testset {
            test_cases,
            agent_description: agent_description.to_string(),
            target_count: num_questions,
            skipped_count,
        })
    }

    async fn generate_item(
        &self,
        index: usize,
        kb: &KnowledgeBase,
        agent_description: &str,
        sampler: &Mutex<Box<dyn SamplingStrategy + Send>>,
        gate: &Semaphore,
        abort: &CancellationToken,
    ) -> ItemOutcome {
        for attempt in 0..=self.options.max_retries_per_item {
            if abort.is_cancelled() {
                return ItemOutcome::Skipped;
            }
            let cluster = {
                let mut sampler = match sampler.lock() {
                    Ok(guard) => guard,
                    Err(_) => return ItemOutcome::Skipped,
                };
                match self.sample_cluster(kb, &mut **sampler) {
                    Ok(cluster) => cluster,
                    Err(_) => return ItemOutcome::Skipped,
                }
            };
            let prompt = self.synthesis_prompt(agent_description, &cluster);

            // Admission gate: bounds simultaneous outstanding model calls.
            let response = {
                let _permit = tokio::select! {
                    _ = abort.cancelled() => return ItemOutcome::Skipped,
                    permit = gate.acquire() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return ItemOutcome::Skipped,
                    },
                };
                complete_with_retry(
                    self.model.as_ref(),
                    self.options.retry,
                    SYNTHESIS_SYSTEM_PROMPT,
                    &prompt,
                )
                .await
            };

            let text = match response {
                Ok(text) => text,
                Err(err) if err.is_systemic() => {
                    warn!(%err, "systemic model failure, aborting generation");
                    abort.cancel();
                    return ItemOutcome::Aborted(err);
                }
                Err(err) => {
                    warn!(index, attempt, %err, "synthesis call failed");
                    continue;
                }
            };

            match self.validate_draft(&text, &cluster) {
                Ok(draft) => {
                    debug!(index, attempt, "item synthesized");
                    return ItemOutcome::Case(TestCase {
                        id: format!("tc-{}", index),
                        question: draft.question,
                        reference_answer: draft.reference_answer,
                        source_chunk_ids: cluster.iter().map(|c| c.id.clone()).collect(),
                        metadata: HashMap::new(),
                    });
                }
                Err(reason) => {
                    warn!(index, attempt, reason, "draft rejected, resampling");
                }
            }
        }
        warn!(index, "item skipped after exhausting retries");
        ItemOutcome::Skipped
    }

    fn sample_cluster<'a>(
        &self,
        kb: &'a KnowledgeBase,
        sampler: &mut dyn SamplingStrategy,
    ) -> Result<Vec<&'a Chunk>, EngineError> {
        let anchor = sampler.sample(kb, 1)?;
        if self.options.hop_span <= 1 {
            return Ok(anchor);
        }
        kb.neighborhood(&anchor[0].id, self.options.hop_span)
    }

    fn synthesis_prompt(&self, agent_description: &str, cluster: &[&Chunk]) -> String {
        let excerpt = cluster
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        format!(
            "CHATBOT UNDER TEST: {}\n\nSOURCE EXCERPT:\n{}",
            agent_description, excerpt
        )
    }

    /// Parse and validate one synthesis response against the source cluster.
    fn validate_draft(&self, text: &str, cluster: &[&Chunk]) -> Result<DraftCase, &'static str> {
        let draft: DraftCase =
            serde_json::from_str(extract_json(text)).map_err(|_| "unparseable JSON")?;
        if draft.question.trim().is_empty() {
            return Err("empty question");
        }
        if draft.reference_answer.trim().is_empty() {
            return Err("empty reference answer");
        }
        let source: String = cluster
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let overlap = lexical_overlap(&draft.reference_answer, &source);
        if overlap < self.options.grounding_overlap_threshold {
            return Err("reference answer not grounded in source");
        }
        Ok(draft)
    }
}

/// Fraction of the answer's content words that occur in the source text.
///
/// Cheap grounding check at synthesis time; the judge handles the semantic
/// check at evaluation time. Answers too short to carry content words fall
/// back to a substring test.
fn lexical_overlap(answer: &str, source: &str) -> f64 {
    let source_lower = source.to_lowercase();
    let content_words: Vec<String> = answer
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= 3)
        .map(|w| w.to_string())
        .collect();
    if content_words.is_empty() {
        let needle = answer.trim().to_lowercase();
        return if !needle.is_empty() && source_lower.contains(&needle) {
            1.0
        } else {
            0.0
        };
    }
    let hits = content_words
        .iter()
        .filter(|w| source_lower.contains(w.as_str()))
        .count();
    hits as f64 / content_words.len() as f64
}

/// Strip markdown code fences some models wrap around JSON output.
pub(crate) fn extract_json(response: &str) -> &str {
    let trimmed = response.trim();
    if let Some(start) = trimmed.find("```") {
        let after_start = &trimmed[start + 3..];
        let json_start = if after_start.starts_with("json") {
            after_start.find('\n').map(|i| i + 1).unwrap_or(0)
        } else if after_start.starts_with('\n') {
            1
        } else {
            0
        };
        let content = &after_start[json_start..];
        if let Some(end) = content.find("```") {
            return content[..end].trim();
        }
    }
    trimmed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::Chunk;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn chunk(id: &str, text: &str) -> Chunk {
        Chunk {
            id: id.to_string(),
            text: text.to_string(),
            sequence_index: 0,
            metadata: HashMap::new(),
        }
    }

    fn causes_kb() -> KnowledgeBase {
        KnowledgeBase::load(vec![
            chunk("c0", "A causes B."),
            chunk("c1", "B causes C."),
            chunk("c2", "C causes D."),
        ])
        .unwrap()
    }

    fn fast_options() -> GeneratorOptions {
        GeneratorOptions {
            seed: Some(1),
            retry: RetryPolicy {
                max_attempts: 1,
                backoff_base_ms: 1,
            },
            ..GeneratorOptions::default()
        }
    }

    /// Deterministically answers "What does X cause?" for a chunk
    /// "X causes Y.".
    struct CausesModel;

    #[async_trait]
    impl LanguageModel for CausesModel {
        async fn complete(&self, _system: &str, user: &str) -> Result<String, LlmError> {
            let excerpt = user
                .split("SOURCE EXCERPT:\n")
                .nth(1)
                .unwrap_or("")
                .trim();
            let mut words = excerpt.split_whitespace();
            let x = words.next().unwrap_or("?");
            let y = words.nth(1).unwrap_or("?").trim_end_matches('.');
            Ok(format!(
                r#"{{"question": "What does {x} cause?", "reference_answer": "{y}"}}"#
            ))
        }
    }

    /// Always returns unparseable output.
    struct GarbageModel;

    #[async_trait]
    impl LanguageModel for GarbageModel {
        async fn complete(&self, _system: &str, _user: &str) -> Result<String, LlmError> {
            Ok("not json at all".to_string())
        }
    }

    /// Fails with an auth error on every call.
    struct AuthFailModel;

    #[async_trait]
    impl LanguageModel for AuthFailModel {
        async fn complete(&self, _system: &str, _user: &str) -> Result<String, LlmError> {
            Err(LlmError::Auth("key revoked".to_string()))
        }
    }

    /// Endpoint is down: every call fails at the connection level.
    struct UnreachableModel;

    #[async_trait]
    impl LanguageModel for UnreachableModel {
        async fn complete(&self, _system: &str, _user: &str) -> Result<String, LlmError> {
            Err(LlmError::Unreachable(
                "tcp connect error: connection refused".to_string(),
            ))
        }
    }

    /// Counts concurrent entries to observe the admission gate.
    struct InstrumentedModel {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl LanguageModel for InstrumentedModel {
        async fn complete(&self, _system: &str, user: &str) -> Result<String, LlmError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            CausesModel.complete("", user).await
        }
    }

    #[tokio::test]
    async fn test_generate_two_grounded_cases_without_skips() {
        let generator = TestsetGenerator::new(Arc::new(CausesModel), fast_options());
        let kb = causes_kb();

        let testset = generator
            .generate(&kb, 2, "A chatbot about causal chains", CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(testset.len(), 2);
        assert_eq!(testset.skipped_count, 0);
        assert_eq!(testset.target_count, 2);
        for case in &testset.test_cases {
            assert_eq!(case.source_chunk_ids.len(), 1);
            assert!(case.question.starts_with("What does"));
        }
        testset.check_integrity(&kb).unwrap();
    }

    #[tokio::test]
    async fn test_count_conservation_with_malformed_output() {
        let mut options = fast_options();
        options.max_retries_per_item = 1;
        let generator = TestsetGenerator::new(Arc::new(GarbageModel), options);
        let kb = causes_kb();

        let testset = generator
            .generate(&kb, 3, "desc", CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(testset.len(), 0);
        assert_eq!(testset.skipped_count, 3);
        assert_eq!(testset.len() + testset.skipped_count, 3);
    }

    #[tokio::test]
    async fn test_auth_failure_aborts_whole_run() {
        let generator = TestsetGenerator::new(Arc::new(AuthFailModel), fast_options());
        let kb = causes_kb();

        let result = generator
            .generate(&kb, 3, "desc", CancellationToken::new())
            .await;

        assert!(matches!(result, Err(EngineError::GenerationAborted(_))));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_aborts_whole_run() {
        let generator = TestsetGenerator::new(Arc::new(UnreachableModel), fast_options());
        let kb = causes_kb();

        let result = generator
            .generate(&kb, 3, "desc", CancellationToken::new())
            .await;

        // A dead endpoint must not masquerade as N skipped items.
        match result {
            Err(EngineError::GenerationAborted(err)) => assert!(err.is_systemic()),
            other => panic!("expected GenerationAborted, got {:?}", other.map(|t| t.len())),
        }
    }

    #[tokio::test]
    async fn test_empty_knowledge_base_is_insufficient() {
        let generator = TestsetGenerator::new(Arc::new(CausesModel), fast_options());
        let kb = KnowledgeBase::load(Vec::<Chunk>::new()).unwrap();

        let result = generator
            .generate(&kb, 1, "desc", CancellationToken::new())
            .await;

        assert!(matches!(result, Err(EngineError::InsufficientData { .. })));
    }

    #[tokio::test]
    async fn test_admission_gate_bounds_concurrent_calls() {
        let model = Arc::new(InstrumentedModel {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let mut options = fast_options();
        options.concurrency_limit = 2;
        let generator = TestsetGenerator::new(model.clone(), options);
        let kb = KnowledgeBase::load(
            (0..12)
                .map(|i| chunk(&format!("c{i}"), &format!("T{i} causes U{i}.")))
                .collect::<Vec<_>>(),
        )
        .unwrap();

        generator
            .generate(&kb, 12, "desc", CancellationToken::new())
            .await
            .unwrap();

        assert!(model.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_cancelled_run_returns_partial_testset() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let generator = TestsetGenerator::new(Arc::new(CausesModel), fast_options());
        let kb = causes_kb();

        let testset = generator.generate(&kb, 3, "desc", cancel).await.unwrap();

        assert_eq!(testset.len() + testset.skipped_count, 3);
        assert_eq!(testset.len(), 0);
    }

    /// Always returns the first chunks in sequence order.
    struct HeadSampler;

    impl SamplingStrategy for HeadSampler {
        fn sample<'a>(
            &mut self,
            kb: &'a KnowledgeBase,
            n: usize,
        ) -> Result<Vec<&'a Chunk>, EngineError> {
            if n > kb.len() {
                return Err(EngineError::InsufficientData {
                    requested: n,
                    available: kb.len(),
                });
            }
            Ok(kb.iter().take(n).collect())
        }
    }

    #[tokio::test]
    async fn test_custom_sampling_strategy_is_honored() {
        let generator = TestsetGenerator::new(Arc::new(CausesModel), fast_options())
            .with_sampler(Box::new(HeadSampler));
        let kb = causes_kb();

        let testset = generator
            .generate(&kb, 2, "desc", CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(testset.len(), 2);
        for case in &testset.test_cases {
            assert_eq!(case.source_chunk_ids, vec!["c0".to_string()]);
        }
    }

    #[tokio::test]
    async fn test_multi_hop_cluster_records_all_source_ids() {
        let mut options = fast_options();
        options.hop_span = 2;
        // Looser threshold: the cluster excerpt still starts with the anchor.
        options.grounding_overlap_threshold = 0.0;
        let generator = TestsetGenerator::new(Arc::new(CausesModel), options);
        let kb = causes_kb();

        let testset = generator
            .generate(&kb, 1, "desc", CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(testset.len(), 1);
        assert!(!testset.test_cases[0].source_chunk_ids.is_empty());
        testset.check_integrity(&kb).unwrap();
    }

    #[test]
    fn test_extract_json_strips_fences() {
        let input = "```json\n{\"question\": \"q\", \"reference_answer\": \"a\"}\n```";
        assert!(extract_json(input).starts_with('{'));
        assert!(extract_json(input).ends_with('}'));
    }

    #[test]
    fn test_lexical_overlap_grounded() {
        let overlap = lexical_overlap(
            "Global temperatures rise under every scenario",
            "The report projects that global temperatures will rise under every emissions scenario considered.",
        );
        assert!(overlap > 0.9);
    }

    #[test]
    fn test_lexical_overlap_hallucinated() {
        let overlap = lexical_overlap(
            "Penguins thrive in tropical rainforests",
            "The report projects that global temperatures will rise.",
        );
        assert!(overlap < 0.3);
    }

    #[test]
    fn test_lexical_overlap_short_answer_falls_back_to_substring() {
        assert_eq!(lexical_overlap("B", "A causes B."), 1.0);
        assert_eq!(lexical_overlap("Z", "A causes B."), 0.0);
    }
}
