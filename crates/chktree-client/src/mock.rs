//! In-memory daemon for testing
//!
//! [`LoopbackDaemon`] stores inserted blocks and answers queries from them,
//! so an insert followed by a download round-trips without a network. It can
//! duplicate or corrupt its replies and inject protocol errors to exercise
//! the request manager's error paths.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::debug;

use chktree_core::{
    hash, BlockSink, ClientMessage, ContentBlock, ContentIndex, DaemonMessage, Hash, SinkError,
    WireError,
};

use crate::connection::{DaemonConnection, TransportError};
use crate::requests::RETURN_OK;

const RETURN_ERROR: i32 = -1;

/// Reply behavior of a [`LoopbackDaemon`]
#[derive(Debug, Default, Clone, Copy)]
pub struct LoopbackOptions {
    /// Send every reply twice
    pub duplicate_replies: bool,
    /// Flip a byte in every reply
    pub corrupt_replies: bool,
    /// Acknowledge queries but never answer them
    pub silent: bool,
}

#[derive(Default)]
struct Storage {
    blocks: HashMap<Hash, Box<ContentBlock>>,
    indexed: HashMap<Hash, ContentIndex>,
    supers: HashSet<Hash>,
}

struct Shared {
    options: LoopbackOptions,
    storage: Mutex<Storage>,
    tx: mpsc::UnboundedSender<Result<DaemonMessage, TransportError>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<DaemonMessage, TransportError>>>,
    closed: AtomicBool,
    queries: AtomicUsize,
    resets: AtomicUsize,
}

/// Daemon double that is both a [`BlockSink`] and a [`DaemonConnection`]
///
/// Clones share the same storage and reply queue.
#[derive(Clone)]
pub struct LoopbackDaemon {
    shared: Arc<Shared>,
}

impl Default for LoopbackDaemon {
    fn default() -> Self {
        Self::new(LoopbackOptions::default())
    }
}

impl LoopbackDaemon {
    pub fn new(options: LoopbackOptions) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                options,
                storage: Mutex::new(Storage::default()),
                tx,
                rx: tokio::sync::Mutex::new(rx),
                closed: AtomicBool::new(false),
                queries: AtomicUsize::new(0),
                resets: AtomicUsize::new(0),
            }),
        }
    }

    fn storage(&self) -> MutexGuard<'_, Storage> {
        self.shared
            .storage
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn block_count(&self) -> usize {
        self.storage().blocks.len()
    }

    pub fn index_count(&self) -> usize {
        self.storage().indexed.len()
    }

    pub fn has_block(&self, query: &Hash) -> bool {
        self.storage().blocks.contains_key(query)
    }

    /// Queries received over the connection
    pub fn queries(&self) -> usize {
        self.shared.queries.load(Ordering::Relaxed)
    }

    pub fn resets(&self) -> usize {
        self.shared.resets.load(Ordering::Relaxed)
    }

    /// Queue a receive error, as if the stream delivered garbage
    pub fn inject_error(&self, error: WireError) {
        let _ = self.shared.tx.send(Err(TransportError::Protocol(error)));
    }

    /// Queue an arbitrary message for the client
    pub fn inject(&self, msg: DaemonMessage) {
        let _ = self.shared.tx.send(Ok(msg));
    }

    /// Apply a store-side message; returns the daemon's return value
    fn apply(&self, msg: &ClientMessage) -> i32 {
        let mut storage = self.storage();
        let ok = match msg {
            ClientMessage::InsertChk { block, .. } => {
                storage.blocks.insert(hash(&block[..]), block.clone());
                true
            }
            ClientMessage::DeleteChk { block, .. } => {
                storage.blocks.remove(&hash(&block[..])).is_some()
            }
            ClientMessage::IndexBlock(index) => {
                storage.indexed.insert(index.hash, *index);
                true
            }
            ClientMessage::UnindexBlock(index) => storage.indexed.remove(&index.hash).is_some(),
            ClientMessage::IndexSuper { super_hash, .. } => {
                storage.supers.insert(*super_hash);
                true
            }
            ClientMessage::UnindexSuper { super_hash, .. } => storage.supers.remove(super_hash),
            ClientMessage::Query(_) | ClientMessage::GetAveragePriority => true,
        };
        if ok {
            RETURN_OK
        } else {
            RETURN_ERROR
        }
    }

    fn answer(&self, queries: &[Hash]) {
        let options = self.shared.options;
        let replies: Vec<Box<ContentBlock>> = {
            let storage = self.storage();
            queries
                .iter()
                .filter_map(|q| storage.blocks.get(q).cloned())
                .collect()
        };
        for mut block in replies {
            if options.corrupt_replies {
                block[0] ^= 0xFF;
            }
            let copies = if options.duplicate_replies { 2 } else { 1 };
            for _ in 0..copies {
                let _ = self.shared.tx.send(Ok(DaemonMessage::ResultChk(block.clone())));
            }
        }
    }
}

impl BlockSink for LoopbackDaemon {
    fn submit(&mut self, msg: ClientMessage) -> Result<(), SinkError> {
        if self.shared.closed.load(Ordering::Relaxed) {
            return Err(SinkError::Unreachable("loopback closed".into()));
        }
        if self.apply(&msg) == RETURN_OK {
            Ok(())
        } else {
            Err(SinkError::Refused)
        }
    }
}

#[async_trait]
impl DaemonConnection for LoopbackDaemon {
    async fn send(&self, msg: &ClientMessage) -> Result<(), TransportError> {
        if self.shared.closed.load(Ordering::Relaxed) {
            return Err(TransportError::NotConnected);
        }
        let value = match msg {
            ClientMessage::GetAveragePriority => 0,
            other => self.apply(other),
        };
        let _ = self.shared.tx.send(Ok(DaemonMessage::ReturnValue(value)));
        if let ClientMessage::Query(query) = msg {
            self.shared.queries.fetch_add(1, Ordering::Relaxed);
            debug!("Loopback query with {} hashes", query.queries.len());
            if !self.shared.options.silent {
                self.answer(&query.queries);
            }
        }
        Ok(())
    }

    async fn recv(&self) -> Result<DaemonMessage, TransportError> {
        if self.shared.closed.load(Ordering::Relaxed) {
            return Err(TransportError::NotConnected);
        }
        let mut rx = self.shared.rx.lock().await;
        match rx.recv().await {
            Some(msg) => msg,
            None => Err(TransportError::Disconnected),
        }
    }

    async fn reset(&self) -> Result<(), TransportError> {
        self.shared.resets.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn close(&self) {
        self.shared.closed.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chktree_core::{QueryMessage, CONTENT_SIZE};

    fn block(fill: u8) -> Box<ContentBlock> {
        Box::new([fill; CONTENT_SIZE])
    }

    #[tokio::test]
    async fn test_insert_then_query() {
        let mut daemon = LoopbackDaemon::default();
        daemon
            .submit(ClientMessage::InsertChk {
                priority: 0,
                block: block(1),
            })
            .unwrap();
        let query = hash(&block(1)[..]);
        assert!(daemon.has_block(&query));

        daemon
            .send(&ClientMessage::Query(QueryMessage::single(query)))
            .await
            .unwrap();
        assert_eq!(daemon.recv().await.unwrap(), DaemonMessage::ReturnValue(RETURN_OK));
        assert_eq!(daemon.recv().await.unwrap(), DaemonMessage::ResultChk(block(1)));
        assert_eq!(daemon.queries(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_and_corrupt_options() {
        let mut daemon = LoopbackDaemon::new(LoopbackOptions {
            duplicate_replies: true,
            corrupt_replies: true,
            silent: false,
        });
        daemon
            .submit(ClientMessage::InsertChk {
                priority: 0,
                block: block(2),
            })
            .unwrap();
        let query = hash(&block(2)[..]);
        daemon
            .send(&ClientMessage::Query(QueryMessage::single(query)))
            .await
            .unwrap();

        daemon.recv().await.unwrap();
        for _ in 0..2 {
            let DaemonMessage::ResultChk(reply) = daemon.recv().await.unwrap() else {
                panic!("expected a result");
            };
            assert_eq!(reply[0], 2 ^ 0xFF);
            assert_ne!(hash(&reply[..]), query);
        }
    }

    #[test]
    fn test_delete_missing_is_refused() {
        let mut daemon = LoopbackDaemon::default();
        let err = daemon
            .submit(ClientMessage::DeleteChk {
                priority: 0,
                block: block(3),
            })
            .unwrap_err();
        assert_eq!(err, SinkError::Refused);
    }

    #[tokio::test]
    async fn test_closed_daemon_rejects() {
        let mut daemon = LoopbackDaemon::default();
        daemon.close().await;
        assert!(daemon.send(&ClientMessage::GetAveragePriority).await.is_err());
        assert!(daemon.submit(ClientMessage::GetAveragePriority).is_err());
    }
}
