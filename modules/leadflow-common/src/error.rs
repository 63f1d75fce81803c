use thiserror::Error;

/// Typed errors for the engine surface.
///
/// Input and ordering mistakes are returned synchronously and never
/// persisted; blocking failures go through the ledger instead.
#[derive(Debug, Error)]
pub enum LeadFlowError {
    /// Caller mistake: malformed or incomplete signal.
    #[error("invalid signal: {0}")]
    InvalidSignal(String),

    /// Stage name not present in the configured waterfall.
    #[error("unknown stage: {0}")]
    UnknownStage(String),

    /// The stage is not in a state that admits the requested transition.
    #[error("illegal transition for stage {stage}: {reason}")]
    IllegalTransition { stage: String, reason: String },

    /// A context that does not match the one the stage is running under, or
    /// a restart reusing the context it is meant to replace.
    #[error("context mismatch for stage {stage}: {reason}")]
    ContextMismatch { stage: String, reason: String },

    /// The active blocker mandates a brand-new context.
    #[error("retry not allowed for stage {stage} in the current context")]
    RetryNotAllowed { stage: String },

    /// A store call exceeded its configured deadline. Retryable.
    #[error("store call {operation} timed out after {timeout_ms}ms")]
    StoreTimeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}
