use thiserror::Error;

/// Errors raised by the language model client.
///
/// The variants matter: `Auth` is systemic and aborts a whole run, while
/// `RateLimit` and `Timeout` are retried with backoff before escalating to
/// an item-level failure.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Authentication or authorization failure. Never retried.
    #[error("authentication failed: {0}")]
    Auth(String),
    /// Endpoint unreachable (connection refused, DNS failure). Systemic
    /// like auth failure; aborts the whole run.
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),
    /// Provider signalled a rate limit. Retried with backoff.
    #[error("rate limited: {0}")]
    RateLimit(String),
    /// Request exceeded the configured timeout. Retried with backoff.
    #[error("request timed out after {0} seconds")]
    Timeout(u64),
    /// Response could not be parsed into the expected structure.
    #[error("malformed model output: {0}")]
    MalformedOutput(String),
    /// Any other provider error.
    #[error("api error: {0}")]
    Api(String),
}

impl LlmError {
    /// Transient errors are worth another attempt; everything else is not.
    pub fn is_transient(&self) -> bool {
        matches!(self, LlmError::RateLimit(_) | LlmError::Timeout(_))
    }

    /// Systemic errors abort the entire run rather than a single item.
    pub fn is_systemic(&self) -> bool {
        matches!(self, LlmError::Auth(_) | LlmError::Unreachable(_))
    }
}

/// Failure from the black-box answering agent. The engine makes no
/// assumptions about the agent's internals, so the cause is an opaque string.
#[derive(Debug, Clone, Error)]
#[error("agent error: {0}")]
pub struct AgentError(pub String);

/// Engine-level error taxonomy.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("chunk not found: {0}")]
    ChunkNotFound(String),

    #[error("insufficient data: requested {requested} chunks, only {available} available")]
    InsufficientData { requested: usize, available: usize },

    /// Systemic failure during testset synthesis (auth, persistent
    /// connectivity loss). Per-item failures are skipped, not raised.
    #[error("generation aborted: {0}")]
    GenerationAborted(#[source] LlmError),

    #[error("duplicate chunk id: {0}")]
    DuplicateChunkId(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("persistence error: {0}")]
    Persist(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
