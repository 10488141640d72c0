use crate::agent::AnsweringAgent;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::generator::extract_json;
use crate::knowledge::KnowledgeBase;
use crate::llm::{complete_with_retry, LanguageModel, RetryPolicy};
use crate::report::{EvaluationReport, RecordStatus, ScoredRecord};
use crate::testset::{TestCase, Testset};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Identifies the judging rubric. Scores from different rubric versions
/// are not comparable; bump this whenever the prompt or scale changes.
pub const RUBRIC_VERSION: &str = "groundedness-v1";

const JUDGE_SYSTEM_PROMPT: &str = r#"You judge answers produced by a chatbot under evaluation. You are given the question, the chatbot's answer, the reference answer, and the source text the reference answer was derived from.

Score two dimensions from 0.0 to 1.0:
- correctness: does the chatbot's answer match the reference answer semantically? 1.0 means fully equivalent, 0.0 means contradictory or unrelated.
- groundedness: is every claim in the chatbot's answer supported by the source text? Penalize unsupported claims even when they happen to be true.

Respond with JSON only:
{
  "correctness": <0.0-1.0>,
  "groundedness": <0.0-1.0>,
  "rationale": "one or two sentences explaining both scores"
}

Be strict. An empty or evasive answer scores 0.0 on correctness."#;

/// Options governing one evaluation run.
#[derive(Debug, Clone)]
pub struct EvaluatorOptions {
    /// Ceiling on simultaneous outstanding judge calls
    pub concurrency_limit: usize,
    /// Re-asks of the judge when its output fails to parse
    pub judge_parse_retries: u32,
    pub retry: RetryPolicy,
}

impl Default for EvaluatorOptions {
    fn default() -> Self {
        Self {
            concurrency_limit: 4,
            judge_parse_retries: 2,
            retry: RetryPolicy::default(),
        }
    }
}

impl EvaluatorOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            concurrency_limit: config.concurrency_limit,
            judge_parse_retries: 2,
            retry: RetryPolicy {
                max_attempts: config.max_attempts,
                backoff_base_ms: config.backoff_base_ms,
            },
        }
    }
}

/// Structured judge verdict.
#[derive(Debug, Deserialize)]
struct RawVerdict {
    correctness: f64,
    groundedness: f64,
    #[serde(default)]
    rationale: String,
}

/// Scores a candidate agent's answers against a testset and its grounding
/// material.
pub struct Evaluator {
    judge: Arc<dyn LanguageModel>,
    options: EvaluatorOptions,
}

impl Evaluator {
    pub fn new(judge: Arc<dyn LanguageModel>, options: EvaluatorOptions) -> Self {
        Self { judge, options }
    }

    /// Evaluate every test case independently and aggregate the results.
    ///
    /// Per-case failures (agent error, judge output that never parses) are
    /// recorded as `Errored` and never block other cases. The report is
    /// deterministic given a deterministic agent and judge.
    pub async fn evaluate(
        &self,
        agent: &dyn AnsweringAgent,
        testset: &Testset,
        kb: &KnowledgeBase,
        cancel: CancellationToken,
    ) -> Result<EvaluationReport, EngineError> {
        info!(cases = testset.len(), "starting evaluation");
        let gate = Semaphore::new(self.options.concurrency_limit);

        let items = testset
            .test_cases
            .iter()
            .map(|case| self.evaluate_case(case, agent, kb, &gate, &cancel));
        // join_all keeps testset order regardless of completion order.
        let records = futures::future::join_all(items).await;

        let report = EvaluationReport::new(records, RUBRIC_VERSION);
        info!(
            ok = report.summary.ok_count,
            errored = report.summary.errored_count,
            error_rate = report.summary.error_rate,
            "evaluation finished"
        );
        Ok(report)
    }

    async fn evaluate_case(
        &self,
        case: &TestCase,
        agent: &dyn AnsweringAgent,
        kb: &KnowledgeBase,
        gate: &Semaphore,
        cancel: &CancellationToken,
    ) -> ScoredRecord {
        if cancel.is_cancelled() {
            return skipped_record(case);
        }

        let source_text = match resolve_sources(case, kb) {
            Ok(text) => text,
            Err(err) => return errored_record(case, None, 0, err.to_string()),
        };

        let started = Instant::now();
        let answer = agent.answer(&case.question, &[]).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let answer = match answer {
            Ok(answer) => answer,
            Err(err) => {
                warn!(case = %case.id, %err, "agent failed");
                return errored_record(case, None, latency_ms, err.to_string());
            }
        };

        match self
            .judge_answer(case, &answer, &source_text, gate, cancel)
            .await
        {
            Ok(verdict) => {
                debug!(case = %case.id, correctness = verdict.correctness, "case judged");
                ScoredRecord {
                    test_case_id: case.id.clone(),
                    question: case.question.clone(),
                    candidate_answer: Some(answer),
                    correctness: verdict.correctness.clamp(0.0, 1.0),
                    groundedness: verdict.groundedness.clamp(0.0, 1.0),
                    judge_rationale: verdict.rationale,
                    status: RecordStatus::Ok,
                    error: None,
                    latency_ms,
                }
            }
            Err(JudgeFailure::Cancelled) => skipped_record(case),
            Err(JudgeFailure::Terminal(note)) => {
                warn!(case = %case.id, %note, "judge failed");
                errored_record(case, Some(answer), latency_ms, note)
            }
        }
    }

    async fn judge_answer(
        &self,
        case: &TestCase,
        answer: &str,
        source_text: &str,
        gate: &Semaphore,
        cancel: &CancellationToken,
    ) -> Result<RawVerdict, JudgeFailure> {
        let prompt = format!(
            "QUESTION: {}\n\nCHATBOT ANSWER: {}\n\nREFERENCE ANSWER: {}\n\nSOURCE TEXT:\n{}",
            case.question, answer, case.reference_answer, source_text
        );

        let mut last_note = String::new();
        for attempt in 0..=self.options.judge_parse_retries {
            let response = {
                let _permit = tokio::select! {
                    _ = cancel.cancelled() => return Err(JudgeFailure::Cancelled),
                    permit = gate.acquire() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return Err(JudgeFailure::Cancelled),
                    },
                };
                complete_with_retry(
                    self.judge.as_ref(),
                    self.options.retry,
                    JUDGE_SYSTEM_PROMPT,
                    &prompt,
                )
                .await
            };

            let text = match response {
                Ok(text) => text,
                Err(err) => return Err(JudgeFailure::Terminal(format!("judge call failed: {}", err))),
            };
            match serde_json::from_str::<RawVerdict>(extract_json(&text)) {
                Ok(verdict) => return Ok(verdict),
                Err(err) => {
                    last_note = format!("malformed judge output: {}", err);
                    warn!(case = %case.id, attempt, "judge output failed to parse");
                }
            }
        }
        Err(JudgeFailure::Terminal(last_note))
    }
}

enum JudgeFailure {
    Terminal(String),
    Cancelled,
}

fn resolve_sources(case: &TestCase, kb: &KnowledgeBase) -> Result<String, EngineError> {
    let mut texts = Vec::new();
    for id in &case.source_chunk_ids {
        texts.push(kb.get(id)?.text.clone());
    }
    Ok(texts.join("\n\n"))
}

fn errored_record(
    case: &TestCase,
    candidate_answer: Option<String>,
    latency_ms: u64,
    note: String,
) -> ScoredRecord {
    ScoredRecord {
        test_case_id: case.id.clone(),
        question: case.question.clone(),
        candidate_answer,
        correctness: 0.0,
        groundedness: 0.0,
        judge_rationale: String::new(),
        status: RecordStatus::Errored,
        error: Some(note),
        latency_ms,
    }
}

fn skipped_record(case: &TestCase) -> ScoredRecord {
    ScoredRecord {
        test_case_id: case.id.clone(),
        question: case.question.clone(),
        candidate_answer: None,
        correctness: 0.0,
        groundedness: 0.0,
        judge_rationale: String::new(),
        status: RecordStatus::Skipped,
        error: None,
        latency_ms: 0,
    }
}
