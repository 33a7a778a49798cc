//! Failure taxonomy for a single transfer.
//!
//! Workers classify every failure into one of these variants before turning
//! it into a terminal `Error` event. Nothing here ever crosses the worker
//! pool boundary as a `Result`.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failure reported by the HTTP transport layer itself (no status code).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("transport error: {0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum TransferError {
    /// Timeouts, dropped connections, broken response streams.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Body stream broke after the response headers arrived.
    #[error("response stream interrupted: {0}")]
    Stream(#[source] io::Error),

    /// 403 from a pre-signed URL.
    #[error("pre-signed URL rejected (HTTP 403)")]
    AuthorizationExpired,

    /// 409 from the remote side.
    #[error("remote object already exists (HTTP 409)")]
    RemoteConflict,

    /// Any other non-2xx answer.
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("{op} {}: {source}", .path.display())]
    LocalIo {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Re-resolving the current location of a remote file failed.
    #[error("could not refresh download location: {0}")]
    Resolve(String),

    #[error("{0}")]
    Unclassified(String),
}

impl TransferError {
    pub fn local_io(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        TransferError::LocalIo {
            op,
            path: path.into(),
            source,
        }
    }

    /// Classify a non-2xx status code.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            403 => TransferError::AuthorizationExpired,
            409 => TransferError::RemoteConflict,
            _ => TransferError::Status { status, body },
        }
    }

    /// Whether a fresh attempt of the same request could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            TransferError::Transport(_) | TransferError::Stream(_) => true,
            TransferError::AuthorizationExpired => true,
            TransferError::Status { status, .. } => *status >= 500 || *status == 429,
            TransferError::RemoteConflict
            | TransferError::LocalIo { .. }
            | TransferError::Resolve(_)
            | TransferError::Unclassified(_) => false,
        }
    }

    /// Short stable label used in structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            TransferError::Transport(_) | TransferError::Stream(_) => "transient_transport",
            TransferError::Status { status, .. } if *status >= 500 => "transient_transport",
            TransferError::AuthorizationExpired => "authorization_expired",
            TransferError::RemoteConflict => "remote_conflict",
            TransferError::LocalIo { .. } => "local_io",
            TransferError::Status { .. } | TransferError::Resolve(_) | TransferError::Unclassified(_) => {
                "unclassified"
            }
        }
    }
}
