//! Testset synthesis and evaluation engine for RAG chatbots.
//!
//! The pipeline: load a pre-chunked corpus into a [`knowledge::KnowledgeBase`],
//! synthesize a grounded question/reference-answer [`testset::Testset`] with a
//! language model, drive a candidate [`agent::AnsweringAgent`] over it, and
//! judge its answers for correctness and groundedness into a
//! [`report::EvaluationReport`].

pub mod agent;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod generator;
pub mod knowledge;
pub mod llm;
pub mod report;
pub mod testset;

pub use agent::{AnsweringAgent, ChatMessage, HttpAgent, Role};
pub use config::EngineConfig;
pub use error::{AgentError, EngineError, LlmError};
pub use evaluator::{Evaluator, EvaluatorOptions, RUBRIC_VERSION};
pub use generator::{GeneratorOptions, TestsetGenerator};
pub use knowledge::{Chunk, KnowledgeBase, SamplingStrategy, UniformSampler};
pub use llm::{LanguageModel, OpenAiModel, RetryPolicy};
pub use report::{EvaluationReport, RecordStatus, ReportSummary, ScoredRecord};
pub use testset::{TestCase, Testset};
