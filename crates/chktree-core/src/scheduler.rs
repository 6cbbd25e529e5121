//! Interfaces between the block tree and the outside world
//!
//! The tree issues queries through a [`QueryScheduler`] and pushes insert,
//! index and delete requests through a [`BlockSink`]. Both are implemented by
//! the client crate; the no-op versions here are used for offline work.

use crate::block::NodeId;
use crate::wire::{ClientMessage, QueryMessage};

/// Which handler a reply to an outstanding query is routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyHandler {
    /// The reply is the node's own block
    Own,
    /// The reply is one of the node's children, answering its super-query
    Children,
}

/// Tracks outstanding queries, at most one per node
pub trait QueryScheduler {
    /// Queue a new query for `node`
    fn request(&mut self, node: NodeId, handler: ReplyHandler, query: QueryMessage);

    /// Replace the query of `node`, or drop it with `None`
    ///
    /// Does nothing if no query is outstanding for `node`.
    fn update(&mut self, node: NodeId, query: Option<QueryMessage>);

    /// Halve the TTL of every outstanding query
    fn endgame(&mut self);

    /// Called when `node` is freed; no query may stay outstanding for it
    fn release(&mut self, node: NodeId);
}

/// Scheduler for operations without a network
#[derive(Debug, Default, Clone, Copy)]
pub struct Offline;

impl QueryScheduler for Offline {
    fn request(&mut self, _node: NodeId, _handler: ReplyHandler, _query: QueryMessage) {}

    fn update(&mut self, _node: NodeId, _query: Option<QueryMessage>) {}

    fn endgame(&mut self) {}

    fn release(&mut self, _node: NodeId) {}
}

/// Error submitting a request to the daemon
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("Daemon unreachable: {0}")]
    Unreachable(String),
    #[error("Daemon refused request")]
    Refused,
}

/// Synchronous request channel to the storage daemon
pub trait BlockSink {
    /// Send `msg` and wait for the daemon's verdict
    fn submit(&mut self, msg: ClientMessage) -> Result<(), SinkError>;
}

/// Sink that discards everything; computes hashes without network I/O
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRun;

impl BlockSink for DryRun {
    fn submit(&mut self, _msg: ClientMessage) -> Result<(), SinkError> {
        Ok(())
    }
}
