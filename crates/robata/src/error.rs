//! Error types for robata.

use thiserror::Error;

/// Result type alias for robata operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for robata.
#[derive(Error, Debug)]
pub enum Error {
    /// A required tokenizer or engine artifact is missing or unusable.
    ///
    /// Raised at construction time; callers should abort startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A degenerate call, such as filtering to an empty id list.
    ///
    /// Retrying with the same input will fail the same way.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Malformed sampling or stopping configuration for a request.
    #[error("invalid generation policy: {0}")]
    Policy(String),

    /// Tokenizer collaborator failure.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// Inference engine failure or malformed engine output.
    #[error("inference engine error: {0}")]
    Engine(String),

    /// Buffer operation failure.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}
