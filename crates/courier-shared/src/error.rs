use thiserror::Error;

use crate::types::MessageId;

/// Per-frame failures. None of them closes the connection; each is reported
/// to the sender as a tip.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Conflict(String),

    #[error("message {0} has already been withdrawn")]
    AlreadyWithdrawn(MessageId),

    #[error("upstream unavailable: {0}")]
    Upstream(String),
}

/// Coarse classification of [`ChatError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Forbidden,
    Conflict,
    Upstream,
}

impl ChatError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::Upstream(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ChatError::Validation(_) => ErrorKind::Validation,
            ChatError::NotFound(_) => ErrorKind::NotFound,
            ChatError::Forbidden(_) => ErrorKind::Forbidden,
            ChatError::Conflict(_) | ChatError::AlreadyWithdrawn(_) => ErrorKind::Conflict,
            ChatError::Upstream(_) => ErrorKind::Upstream,
        }
    }

    /// Text shown to the user. Upstream details stay in the logs.
    pub fn user_message(&self) -> String {
        match self {
            ChatError::Upstream(_) => "service temporarily unavailable, try again".to_string(),
            other => other.to_string(),
        }
    }
}

pub type ChatResult<T> = std::result::Result<T, ChatError>;
