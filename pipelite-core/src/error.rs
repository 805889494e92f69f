// pipelite-core/src/error.rs
// Error types shared across the whole engine

use thiserror::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, PipeLiteError>;

/// All user-visible failures produced by the engine.
///
/// Every variant maps to a stable numeric code via [`PipeLiteError::code`].
/// The codes are part of the public contract: callers match on them to
/// distinguish failure classes, so their meaning must never change
/// between versions.
#[derive(Debug, Error)]
pub enum PipeLiteError {
    /// Malformed stage specification detected at parse time
    #[error("Invalid pipeline: {0}")]
    InvalidPipeline(String),

    /// A stage name not present in the stage registry
    #[error("Unrecognized pipeline stage name: '{0}'")]
    UnknownStage(String),

    /// Malformed match filter or match operator argument
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// A match operator name not present in the operator set
    #[error("Unknown operator: {0}")]
    UnknownOperator(String),

    /// An accumulator name not present in the accumulator registry
    #[error("Unknown group operator: '{0}'")]
    UnknownAccumulator(String),

    /// Malformed value expression ($group _id, computed projection, $redact)
    #[error("Invalid expression: {0}")]
    InvalidExpression(String),

    /// Conflicting or mixed projection specification
    #[error("Invalid projection: {0}")]
    InvalidProjection(String),

    /// Type mismatch or invalid operation discovered while processing a document
    #[error("Evaluation error: {0}")]
    Evaluation(String),

    /// A memory budget was exceeded and spilling was not permitted
    #[error("Exceeded memory limit: {0}")]
    MemoryLimitExceeded(String),

    /// View resolution walked more than the maximum number of hops
    #[error("View depth limit exceeded while resolving '{0}'")]
    ViewDepthExceeded(String),

    /// The accumulated view pipeline grew past the serialized-size ceiling
    #[error("View pipeline exceeds maximum size while resolving '{0}'")]
    ViewPipelineTooLarge(String),

    /// Inserting a view definition would create a dependency cycle
    #[error("View cycle detected: {0}")]
    ViewCycle(String),

    /// Views in one resolution chain carry conflicting default collations
    #[error("View collation mismatch: {0}")]
    ViewCollationMismatch(String),

    /// Hard cooperative cancellation
    #[error("Operation was interrupted")]
    Interrupted,

    /// Soft deadline reached; same propagation path as Interrupted
    #[error("Operation exceeded time limit")]
    ExceededTimeLimit,

    /// I/O failure while writing or reading a spill file
    #[error("Spill I/O error: {0}")]
    SpillIo(#[from] std::io::Error),

    /// Encode/decode failure at a serde boundary
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl PipeLiteError {
    /// Stable numeric code for this failure condition.
    pub fn code(&self) -> i32 {
        match self {
            PipeLiteError::InvalidPipeline(_) => 10,
            PipeLiteError::UnknownStage(_) => 11,
            PipeLiteError::InvalidQuery(_) => 12,
            PipeLiteError::UnknownOperator(_) => 13,
            PipeLiteError::UnknownAccumulator(_) => 14,
            PipeLiteError::InvalidExpression(_) => 15,
            PipeLiteError::InvalidProjection(_) => 16,
            PipeLiteError::Evaluation(_) => 20,
            PipeLiteError::MemoryLimitExceeded(_) => 30,
            PipeLiteError::ViewDepthExceeded(_) => 31,
            PipeLiteError::ViewPipelineTooLarge(_) => 32,
            PipeLiteError::ViewCycle(_) => 33,
            PipeLiteError::ViewCollationMismatch(_) => 34,
            PipeLiteError::Interrupted => 40,
            PipeLiteError::ExceededTimeLimit => 41,
            PipeLiteError::SpillIo(_) => 50,
            PipeLiteError::Serialization(_) => 51,
        }
    }

    /// True for the two cancellation variants, which unwind the whole
    /// pipeline without further progress.
    pub fn is_interruption(&self) -> bool {
        matches!(
            self,
            PipeLiteError::Interrupted | PipeLiteError::ExceededTimeLimit
        )
    }
}

impl From<serde_json::Error> for PipeLiteError {
    fn from(e: serde_json::Error) -> Self {
        PipeLiteError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(PipeLiteError::UnknownStage("$frobnicate".into()).code(), 11);
        assert_eq!(
            PipeLiteError::UnknownAccumulator("$median".into()).code(),
            14
        );
        assert_eq!(PipeLiteError::Interrupted.code(), 40);
        assert_eq!(PipeLiteError::ExceededTimeLimit.code(), 41);
    }

    #[test]
    fn test_interruption_classification() {
        assert!(PipeLiteError::Interrupted.is_interruption());
        assert!(PipeLiteError::ExceededTimeLimit.is_interruption());
        assert!(!PipeLiteError::InvalidQuery("x".into()).is_interruption());
    }

    #[test]
    fn test_display_messages() {
        let err = PipeLiteError::UnknownStage("$bogus".to_string());
        assert!(err.to_string().contains("$bogus"));

        let err = PipeLiteError::UnknownAccumulator("$bogus".to_string());
        assert!(err.to_string().contains("Unknown group operator"));
    }
}
