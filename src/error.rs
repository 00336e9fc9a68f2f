use std::path::PathBuf;

use thiserror::Error;

use crate::models::Id;

/// Raised when the engine cannot be brought up. A failed init leaves the
/// engine closed.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("cannot open store at {location}: {source}")]
    Open {
        location: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("cannot read schema from {}: {source}", path.display())]
    SchemaSource {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot apply schema: {0}")]
    Schema(#[source] rusqlite::Error),

    #[error("cannot configure connection: {0}")]
    Pragma(#[source] rusqlite::Error),
}

/// Domain invariant violated while building an entity, before any store access.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConstructionError {
    #[error("a chat needs at least one member")]
    NoMembers,

    #[error("a personal chat needs exactly two members, got {0}")]
    PersonalMemberCount(usize),

    #[error("a personal chat cannot have a name")]
    PersonalChatNamed,

    #[error("a group chat needs a non-empty name")]
    GroupChatUnnamed,

    #[error("message text cannot be empty")]
    EmptyMessageText,

    #[error("member {0} could not be saved as a user")]
    UnresolvedMember(String),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("engine is closed")]
    Closed,

    #[error("engine mutex poisoned")]
    Poisoned,

    #[error("statement timed out")]
    TimedOut,

    #[error("statement expects {expected} parameters, {given} given")]
    ParameterCount { expected: usize, given: usize },

    #[error("column {index}: {message}")]
    Column { index: usize, message: String },

    #[error("member {0} is not a known user")]
    UnknownMember(Id),

    #[error("chat {0} does not exist")]
    UnknownChat(Id),

    /// The entity handed to the store breaks a domain rule.
    #[error(transparent)]
    Rejected(#[from] ConstructionError),

    #[error(transparent)]
    Sqlite(rusqlite::Error),
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(rusqlite::ErrorCode::OperationInterrupted) => StorageError::TimedOut,
            _ => StorageError::Sqlite(err),
        }
    }
}

impl StorageError {
    /// True for UNIQUE / FOREIGN KEY / NOT NULL rejections by the store.
    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            StorageError::Sqlite(err)
                if err.sqlite_error_code() == Some(rusqlite::ErrorCode::ConstraintViolation)
        )
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
