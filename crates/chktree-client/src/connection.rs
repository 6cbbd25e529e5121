//! Daemon connection abstraction
//!
//! The request manager talks to the daemon through [`DaemonConnection`], so
//! the same scheduling logic runs against a real TCP connection or an
//! in-memory [`crate::LoopbackDaemon`].

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use chktree_config::DaemonConfig;
use chktree_core::wire::{
    decode_daemon_message, encode_client_message, parse_header, HEADER_SIZE,
};
use chktree_core::{ClientMessage, DaemonMessage, WireError};

/// Errors from daemon transport operations
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),
    /// The daemon sent something we cannot interpret; the stream is out of sync
    #[error("Protocol error: {0}")]
    Protocol(#[from] WireError),
    #[error("Disconnected")]
    Disconnected,
    #[error("Not connected")]
    NotConnected,
}

/// Bidirectional message stream to the storage daemon
#[async_trait]
pub trait DaemonConnection: Send + Sync {
    /// Send one message
    async fn send(&self, msg: &ClientMessage) -> Result<(), TransportError>;

    /// Receive the next message (blocking)
    async fn recv(&self) -> Result<DaemonMessage, TransportError>;

    /// Drop the current stream and connect again
    async fn reset(&self) -> Result<(), TransportError>;

    /// Close the connection; pending and later calls fail
    async fn close(&self);
}

/// Plain TCP connection to the daemon
pub struct TcpConnection {
    address: String,
    reconnect_delay: Duration,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
}

impl TcpConnection {
    pub async fn connect(address: &str) -> Result<Self, TransportError> {
        let conn = Self {
            address: address.to_string(),
            reconnect_delay: Duration::from_secs(1),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
        };
        conn.open().await?;
        Ok(conn)
    }

    /// Connect to the daemon named in the `[daemon]` section
    pub async fn from_config(config: &DaemonConfig) -> Result<Self, TransportError> {
        let conn = Self::connect(&config.address).await?;
        Ok(conn.with_reconnect_delay(Duration::from_millis(config.reconnect_delay_ms)))
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn open(&self) -> Result<(), TransportError> {
        let stream = TcpStream::connect(&self.address)
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", self.address, e)))?;
        stream.set_nodelay(true).ok();
        let (read, write) = stream.into_split();
        *self.reader.lock().await = Some(read);
        *self.writer.lock().await = Some(write);
        debug!("Connected to daemon at {}", self.address);
        Ok(())
    }
}

#[async_trait]
impl DaemonConnection for TcpConnection {
    async fn send(&self, msg: &ClientMessage) -> Result<(), TransportError> {
        let frame = encode_client_message(msg)?;
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::NotConnected)?;
        writer
            .write_all(&frame)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn recv(&self) -> Result<DaemonMessage, TransportError> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(TransportError::NotConnected)?;

        let mut frame = vec![0u8; HEADER_SIZE];
        reader.read_exact(&mut frame).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => TransportError::Disconnected,
            _ => TransportError::ReceiveFailed(e.to_string()),
        })?;
        let (size, _) = parse_header(&frame)?;
        frame.resize(size, 0);
        reader
            .read_exact(&mut frame[HEADER_SIZE..])
            .await
            .map_err(|e| TransportError::ReceiveFailed(e.to_string()))?;
        Ok(decode_daemon_message(&frame)?)
    }

    async fn reset(&self) -> Result<(), TransportError> {
        warn!("Resetting daemon connection to {}", self.address);
        self.close().await;
        tokio::time::sleep(self.reconnect_delay).await;
        self.open().await
    }

    async fn close(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.reader.lock().await.take();
    }
}
