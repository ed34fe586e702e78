//! Errors raised while loading the threat knowledge base.

use thiserror::Error;

/// The knowledge base could not be constructed. Scans must not start.
#[derive(Debug, Error)]
pub enum KnowledgeBaseError {
    #[error("threat data file not found: {0}")]
    FileNotFound(String),

    #[error("failed to read threat data file {file}: {msg}")]
    Io { file: String, msg: String },

    #[error("malformed threat data in {file}: {msg}")]
    Parse { file: String, msg: String },

    #[error("invalid process pattern '{pattern}' in {file}: {msg}")]
    InvalidPattern {
        file: String,
        pattern: String,
        msg: String,
    },
}

pub type KnowledgeBaseResult<T> = Result<T, KnowledgeBaseError>;
