// src/error.rs

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors produced by the image transport layer.
///
/// `NotFound` is a distinguished, recoverable outcome on the read path:
/// callers are expected to branch on it (see [`TransportError::is_not_found`])
/// rather than treat it as a failure. Every other variant is fatal to the
/// attempted operation and is never retried internally.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("socket error at {path:?}: {source}")]
    Socket {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("transport error: {context}")]
    Transport {
        context: String,
        #[source]
        source: Option<io::Error>,
    },

    #[error("image '{name}' not found")]
    NotFound { name: String },

    #[error("open of image '{name}' failed with code {code}")]
    OpenFailed { name: String, code: u32 },

    #[error("stream desynchronized: {context}")]
    Desync { context: String },

    #[error("codec error: {context}")]
    Codec { context: String },

    #[error("snapshot id '{id}' not present in the hierarchy")]
    SnapshotNotFound { id: String },

    #[error("snapshot index {index} out of range (hierarchy has {len} entries)")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("invalid snapshot id: {context}")]
    InvalidSnapshotId { context: String },

    #[error("shared lock error: {context}")]
    Lock { context: String },
}

pub type Result<T> = std::result::Result<T, TransportError>;

// Convenience constructors
impl TransportError {
    pub fn socket(path: impl AsRef<Path>, source: io::Error) -> Self {
        Self::Socket {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn transport(context: impl Into<String>, source: io::Error) -> Self {
        Self::Transport {
            context: context.into(),
            source: Some(source),
        }
    }

    pub fn transport_msg(context: impl Into<String>) -> Self {
        Self::Transport {
            context: context.into(),
            source: None,
        }
    }

    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound { name: name.into() }
    }

    pub fn open_failed(name: impl Into<String>, code: u32) -> Self {
        Self::OpenFailed {
            name: name.into(),
            code,
        }
    }

    pub fn desync(context: impl Into<String>) -> Self {
        Self::Desync {
            context: context.into(),
        }
    }

    pub fn codec(context: impl Into<String>) -> Self {
        Self::Codec {
            context: context.into(),
        }
    }

    pub fn snapshot_not_found(id: impl Into<String>) -> Self {
        Self::SnapshotNotFound { id: id.into() }
    }

    pub fn index_out_of_range(index: usize, len: usize) -> Self {
        Self::IndexOutOfRange { index, len }
    }

    pub fn invalid_snapshot_id(context: impl Into<String>) -> Self {
        Self::InvalidSnapshotId {
            context: context.into(),
        }
    }

    pub fn lock(context: impl Into<String>) -> Self {
        Self::Lock {
            context: context.into(),
        }
    }

    /// Whether this error is the recoverable "image absent" outcome.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
