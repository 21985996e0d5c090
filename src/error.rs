use thiserror::Error;

/// Error taxonomy for one agent run.
///
/// Empty retrieval results and orphan citation markers are deliberately
/// absent: both are degraded-but-normal paths (empty source set, dropped
/// marker) and never travel as errors.
#[derive(Error, Debug)]
pub enum AgentError {
    /// Planner output had no parsable structure, even after the stricter
    /// retry. The planner falls back rather than propagating this.
    #[error("planner output malformed: {0}")]
    PlanningMalformed(String),

    /// Network, timeout, rate-limit or server failure on a completion
    /// call. Retryable.
    #[error("completion failed: {0}")]
    CompletionTransient(String),

    /// Completion succeeded but the text did not carry the structure the
    /// caller asked for.
    #[error("completion output malformed: {0}")]
    CompletionMalformed(String),

    /// Retrieval port failure. Treated by both loops exactly like an
    /// empty result set.
    #[error("retrieval failed: {0}")]
    Retrieval(String),

    /// No way to make forward progress: no plan at all, no reachable
    /// completion port, or the run was cancelled. Aborts the run.
    #[error("run failed: {0}")]
    RunFatal(String),
}

impl AgentError {
    pub fn is_transient(&self) -> bool {
        matches!(self, AgentError::CompletionTransient(_))
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        AgentError::CompletionTransient(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        AgentError::RunFatal(msg.into())
    }
}

pub type AgentResult<T> = Result<T, AgentError>;
