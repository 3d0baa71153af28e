//! Error types shared by the consensus node, the block store and the synchronizer.
//!
//! The enum is serialisable so a failure raised on one node reaches the caller on
//! another node unchanged.

use serde_derive::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

use crate::metadata::FileMetadata;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Error {
    /// The caller's term is behind the receiver's.
    #[error("stale term, receiver is at term {term}")]
    StaleTerm { term: u64 },

    /// The receiver has no entry matching prevLogIndex/prevLogTerm.
    #[error("log mismatch at term {term}, retry from index {conflict_index}")]
    LogMismatch { term: u64, conflict_index: u64 },

    /// The receiver's log is more up-to-date than the sender's.
    #[error("receiver log is ahead (last index {last_log_index}, last term {last_log_term})")]
    StaleLog {
        term: u64,
        last_log_index: u64,
        last_log_term: u64,
    },

    #[error("version conflict, current version is {}", .0.version)]
    VersionConflict(Box<FileMetadata>),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("missing block {0}")]
    MissingBlock(String),

    #[error("node is not the leader")]
    NotLeader,

    #[error("io error: {0}")]
    Io(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    /// Errors after which the caller may simply try again later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Unavailable(_) | Error::NotLeader)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Unavailable("rpc timed out".to_string())
    }
}
