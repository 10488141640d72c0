use crate::error::EngineError;
use crate::knowledge::KnowledgeBase;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

/// A synthetic question/reference-answer pair grounded in source chunks.
///
/// Immutable after generation; evaluation annotations live in the report,
/// never here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,
    pub question: String,
    pub reference_answer: String,
    /// Chunk ids this case was synthesized from, in sampling order
    pub source_chunk_ids: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// An ordered testset plus generation metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Testset {
    pub test_cases: Vec<TestCase>,
    /// Description of the agent the questions target
    pub agent_description: String,
    /// Number of questions that were requested
    pub target_count: usize,
    /// Items dropped after exhausting per-item retries
    pub skipped_count: usize,
}

impl Testset {
    pub fn len(&self) -> usize {
        self.test_cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.test_cases.is_empty()
    }

    /// Verify that every source chunk id resolves in `kb`.
    pub fn check_integrity(&self, kb: &KnowledgeBase) -> Result<(), EngineError> {
        for case in &self.test_cases {
            for id in &case.source_chunk_ids {
                kb.get(id)?;
            }
        }
        Ok(())
    }

    /// Save as JSONL, one record per test case, in order. Generation
    /// metadata rides along in a header record.
    pub fn save(&self, path: &Path) -> Result<(), EngineError> {
        let mut file = std::fs::File::create(path)?;
        let header = TestsetHeader {
            agent_description: self.agent_description.clone(),
            target_count: self.target_count,
            skipped_count: self.skipped_count,
        };
        let line = serde_json::to_string(&Record::Header(header))
            .map_err(|e| EngineError::Persist(e.to_string()))?;
        writeln!(file, "{}", line)?;
        for case in &self.test_cases {
            let line = serde_json::to_string(&Record::Case(case.clone()))
                .map_err(|e| EngineError::Persist(e.to_string()))?;
            writeln!(file, "{}", line)?;
        }
        Ok(())
    }

    /// Load a testset saved by [`Testset::save`], preserving record order.
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let file = std::fs::File::open(path)?;
        let reader = BufReader::new(file);
        let mut header: Option<TestsetHeader> = None;
        let mut test_cases = Vec::new();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: Record = serde_json::from_str(&line).map_err(|e| {
                EngineError::Persist(format!("line {}: {}", lineno + 1, e))
            })?;
            match record {
                Record::Header(h) => header = Some(h),
                Record::Case(c) => test_cases.push(c),
            }
        }
        let header = header
            .ok_or_else(|| EngineError::Persist("missing testset header record".to_string()))?;
        Ok(Self {
            test_cases,
            agent_description: header.agent_description,
            target_count: header.target_count,
            skipped_count: header.skipped_count,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TestsetHeader {
    agent_description: String,
    target_count: usize,
    skipped_count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Record {
    Header(TestsetHeader),
    Case(TestCase),
}
