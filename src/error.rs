//! Error types for OpenQuery

use thiserror::Error;

/// Result type alias using OpenQuery's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Ways the generation engine can fail to produce a usable answer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GenerationFailure {
    /// The engine did not answer within the configured timeout
    #[error("generation timed out")]
    Timeout,

    /// The provider rejected the request after exhausting its retry policy
    #[error("generation rate limited: {0}")]
    RateLimited(String),

    /// The engine answered with no content
    #[error("generation returned an empty response")]
    EmptyResponse,

    /// The engine answered but no structured query could be isolated
    #[error("generation returned malformed output: {0}")]
    Malformed(String),

    /// Any other provider-side error
    #[error("generation provider error: {0}")]
    Provider(String),
}

/// Main error type for OpenQuery
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generation engine error
    #[error("Generation failed: {0}")]
    Generation(#[from] GenerationFailure),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Embedding model error
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// A store collection was opened with a different embedding model than the one it was built with
    #[error("Embedding space mismatch for '{collection}': store holds {expected}, got {actual}")]
    EmbeddingSpaceMismatch {
        /// Collection name
        collection: String,
        /// Model identity recorded by the store
        expected: String,
        /// Model identity offered by the caller
        actual: String,
    },

    /// Similarity store error
    #[error("Similarity store error: {0}")]
    Store(String),

    /// Session does not exist
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// HTTP request error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Message suitable for showing to the person who asked the question.
    ///
    /// Generation failures get an actionable hint instead of the raw internal error.
    pub fn user_message(&self) -> String {
        match self {
            Error::Generation(GenerationFailure::Timeout) => {
                "The query generator took too long to respond. Please try again in a moment."
                    .to_string()
            }
            Error::Generation(GenerationFailure::RateLimited(_)) => {
                "The query generator is busy right now. Please wait a few seconds and retry."
                    .to_string()
            }
            Error::Generation(_) => {
                "I couldn't produce a query for that question. Please retry or rephrase it, \
                 for example by naming the tables or columns you are interested in."
                    .to_string()
            }
            Error::InvalidInput(msg) | Error::Config(msg) => msg.clone(),
            Error::NotFound(what) => format!("{} no longer exists. Please ask again.", what),
            _ => "Something went wrong while answering. Please try again.".to_string(),
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_failures_have_actionable_messages() {
        let timeout = Error::from(GenerationFailure::Timeout);
        assert!(timeout.user_message().contains("try again"));

        let malformed = Error::from(GenerationFailure::Malformed("prose only".into()));
        let message = malformed.user_message();
        assert!(message.contains("rephrase"));
        assert!(!message.contains("prose only"));
    }

    #[test]
    fn test_input_errors_are_shown_verbatim() {
        let err = Error::InvalidInput("question must not be empty".into());
        assert_eq!(err.user_message(), "question must not be empty");
        assert!(Error::Store("disk full".into()).user_message().contains("try again"));
    }
}
