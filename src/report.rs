use serde::{Deserialize, Serialize};

/// Terminal state of one evaluated test case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// Answered and judged
    Ok,
    /// Agent or judge failed; cause recorded in `error`
    Errored,
    /// Run was cancelled before this case completed
    Skipped,
}

/// Judged outcome for one test case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredRecord {
    pub test_case_id: String,
    pub question: String,
    /// Candidate answer, absent when the agent failed
    pub candidate_answer: Option<String>,
    /// Semantic match against the reference answer, 0.0 to 1.0
    pub correctness: f64,
    /// Support by the source chunks, 0.0 to 1.0; unsupported claims score low
    pub groundedness: f64,
    pub judge_rationale: String,
    pub status: RecordStatus,
    /// Diagnostic cause for errored records
    pub error: Option<String>,
    /// Agent answer latency in milliseconds
    pub latency_ms: u64,
}

/// Aggregate statistics over one evaluation run.
///
/// Means and medians cover `Ok` records only; the error rate covers all
/// records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub total: usize,
    pub ok_count: usize,
    pub errored_count: usize,
    pub skipped_count: usize,
    pub mean_correctness: f64,
    pub median_correctness: f64,
    pub mean_groundedness: f64,
    pub median_groundedness: f64,
    pub error_rate: f64,
    /// Rubric the judge scores were produced under; comparisons across
    /// reports are only meaningful within one version
    pub rubric_version: String,
}

/// Complete evaluation output: per-case records plus aggregates.
/// Read-only once returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub records: Vec<ScoredRecord>,
    pub summary: ReportSummary,
}

impl EvaluationReport {
    pub fn new(records: Vec<ScoredRecord>, rubric_version: &str) -> Self {
        let summary = summarize(&records, rubric_version);
        Self { records, summary }
    }

    /// Serialize the full report as pretty JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

fn summarize(records: &[ScoredRecord], rubric_version: &str) -> ReportSummary {
    let ok: Vec<&ScoredRecord> = records
        .iter()
        .filter(|r| r.status == RecordStatus::Ok)
        .collect();
    let errored_count = records
        .iter()
        .filter(|r| r.status == RecordStatus::Errored)
        .count();
    let skipped_count = records
        .iter()
        .filter(|r| r.status == RecordStatus::Skipped)
        .count();

    let correctness: Vec<f64> = ok.iter().map(|r| r.correctness).collect();
    let groundedness: Vec<f64> = ok.iter().map(|r| r.groundedness).collect();
    let error_rate = if records.is_empty() {
        0.0
    } else {
        errored_count as f64 / records.len() as f64
    };

    ReportSummary {
        total: records.len(),
        ok_count: ok.len(),
        errored_count,
        skipped_count,
        mean_correctness: mean(&correctness),
        median_correctness: median(&correctness),
        mean_groundedness: mean(&groundedness),
        median_groundedness: median(&groundedness),
        error_rate,
        rubric_version: rubric_version.to_string(),
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Print a report in plain text.
pub fn print_plain(report: &EvaluationReport) {
    let s = &report.summary;
    println!("=== Evaluation Report (rubric {}) ===", s.rubric_version);
    println!();
    println!(
        "Records: {} total, {} ok, {} errored, {} skipped",
        s.total, s.ok_count, s.errored_count, s.skipped_count
    );
    println!(
        "{:<15} {:<8} {:<8}",
        "Metric", "Mean", "Median"
    );
    println!("{}", "-".repeat(31));
    println!(
        "{:<15} {:<8.3} {:<8.3}",
        "correctness", s.mean_correctness, s.median_correctness
    );
    println!(
        "{:<15} {:<8.3} {:<8.3}",
        "groundedness", s.mean_groundedness, s.median_groundedness
    );
    println!("Error rate: {:.3}", s.error_rate);
    println!();
    for record in &report.records {
        println!(
            "[{:?}] {} correctness={:.2} groundedness={:.2} ({} ms)",
            record.status, record.test_case_id, record.correctness, record.groundedness,
            record.latency_ms
        );
        println!("  Q: {}", record.question);
        if let Some(answer) = &record.candidate_answer {
            println!("  A: {}", answer);
        }
        if !record.judge_rationale.is_empty() {
            println!("  Rationale: {}", record.judge_rationale);
        }
        if let Some(error) = &record.error {
            println!("  Error: {}", error);
        }
    }
}

/// Print a report as JSON.
pub fn print_json(report: &EvaluationReport) {
    match report.to_json() {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Error serializing report to JSON: {}", e),
    }
}
