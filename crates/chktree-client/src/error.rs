use chktree_core::{BlockError, IoContextError, SinkError, WireError};
use thiserror::Error;

use crate::connection::TransportError;

/// Client operation error
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Block tree error: {0}")]
    Block(#[from] BlockError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Storage error: {0}")]
    Storage(#[from] IoContextError),
    #[error("Daemon error: {0}")]
    Sink(#[from] SinkError),
    #[error("Wire error: {0}")]
    Wire(#[from] WireError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Local file does not match {0}")]
    Mismatch(String),
    #[error("Download aborted")]
    Aborted,
}

impl ClientError {
    /// Content failed verification; a bug or a malicious peer
    pub fn is_corruption(&self) -> bool {
        matches!(self, ClientError::Block(e) if e.is_corruption())
    }
}
