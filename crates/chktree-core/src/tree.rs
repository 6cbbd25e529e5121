//! Block tree engine
//!
//! Nodes live in an arena keyed by [`NodeId`]. An inner node refers to its
//! children by id and every child keeps its parent's id. Freeing a node with
//! [`BlockTree::done`] frees its subtree, removes it from its parent and, if
//! that was the parent's last live child, frees the parent too unless the
//! parent is `Persistent`.
//!
//! The same tree drives three operations:
//! - insert/delete walk bottom-up, reading leaves from level 0 and sending
//!   every block (or its index entry) through a [`BlockSink`];
//! - download walks top-down, checking local presence first and asking a
//!   [`QueryScheduler`] for everything that is missing. Replies come back
//!   through [`BlockTree::receive`].

use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::block::{coverage, tree_depth, Block, BlockKind, BlockStatus, InnerBlockData, NodeId};
use crate::crypto::{decrypt_block, encrypt_block, CryptoError};
use crate::hash::{crc32, crc32_chain, hash};
use crate::ioc::{IoContext, IoContextError};
use crate::progress::{ProgressModel, ProgressStats};
use crate::scheduler::{BlockSink, DryRun, Offline, QueryScheduler, ReplyHandler, SinkError};
use crate::types::{empty_block, to_hex, ChkHashes, ContentBlock, FileIdentifier, Hash};
use crate::wire::{ClientMessage, ContentIndex, QueryMessage, LOOKUP_TYPE_CHKS};

/// Tree operation error
#[derive(Debug, thiserror::Error)]
pub enum BlockError {
    #[error("Storage error: {0}")]
    Storage(#[from] IoContextError),
    #[error("Short read at level {level}, position {position}: {read} of {expected} bytes")]
    ShortRead {
        level: u32,
        position: u64,
        read: usize,
        expected: usize,
    },
    #[error("Short write at level {level}, position {position}: {written} of {expected} bytes")]
    ShortWrite {
        level: u32,
        position: u64,
        written: usize,
        expected: usize,
    },
    #[error("Network error: {0}")]
    Network(#[from] SinkError),
    #[error("Corrupted block at level {level}, position {position}: {reason}")]
    Corruption {
        level: u32,
        position: u64,
        reason: &'static str,
    },
    #[error("Encryption error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Unknown node {0}")]
    UnknownNode(NodeId),
}

impl BlockError {
    /// Content failed hash or CRC verification
    pub fn is_corruption(&self) -> bool {
        matches!(self, BlockError::Corruption { .. })
    }

    /// Local disk failure
    pub fn is_local_io(&self) -> bool {
        matches!(
            self,
            BlockError::Storage(_) | BlockError::ShortRead { .. } | BlockError::ShortWrite { .. }
        )
    }
}

/// Per-operation state shared by all nodes of a tree
pub struct NodeContext {
    pub ioc: Arc<IoContext>,
    /// Priority for insert and delete requests
    pub priority: u32,
    /// Index of the shared file for indexed insertion; 0 stores the content itself
    pub index: u16,
    pub stats: ProgressStats,
    /// CRC the root's plaintext must have; checked during download
    pub top_crc32: Option<u32>,
    model: Option<Box<dyn ProgressModel>>,
}

impl NodeContext {
    pub fn new(ioc: Arc<IoContext>) -> Self {
        let file_size = ioc.file_size();
        Self {
            ioc,
            priority: 0,
            index: 0,
            stats: ProgressStats::new(file_size),
            top_crc32: None,
            model: None,
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_index(mut self, index: u16) -> Self {
        self.index = index;
        self
    }

    pub fn with_top_crc32(mut self, crc: u32) -> Self {
        self.top_crc32 = Some(crc);
        self
    }

    pub fn with_progress_model(mut self, model: impl ProgressModel + 'static) -> Self {
        self.model = Some(Box::new(model));
        self
    }

    /// Account for `bytes` more bytes; returns progress before and after
    fn add_progress(&mut self, bytes: usize) -> (u64, u64) {
        let before = self.stats.progress;
        self.stats.progress += bytes as u64;
        if let Some(model) = self.model.as_mut() {
            model.update(&self.stats);
        }
        (before, self.stats.progress)
    }
}

/// Direction of a bottom-up walk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StoreOp {
    Insert,
    Delete,
}

impl StoreOp {
    fn block_message(self, priority: u32, block: Box<ContentBlock>) -> ClientMessage {
        match self {
            StoreOp::Insert => ClientMessage::InsertChk { priority, block },
            StoreOp::Delete => ClientMessage::DeleteChk { priority, block },
        }
    }

    fn index_message(self, index: ContentIndex) -> ClientMessage {
        match self {
            StoreOp::Insert => ClientMessage::IndexBlock(index),
            StoreOp::Delete => ClientMessage::UnindexBlock(index),
        }
    }

    fn super_message(self, priority: u32, super_hash: Hash) -> ClientMessage {
        match self {
            StoreOp::Insert => ClientMessage::IndexSuper {
                priority,
                super_hash,
            },
            StoreOp::Delete => ClientMessage::UnindexSuper {
                priority,
                super_hash,
            },
        }
    }
}

/// Progress fractions (per 10000) that trigger an endgame
fn crosses_endgame_threshold(before: u64, after: u64, file_size: u64) -> bool {
    (0..10).any(|i| {
        let threshold = file_size as u128 * (10_000 - (1024u128 >> i));
        after as u128 * 10_000 > threshold && before as u128 * 10_000 <= threshold
    })
}

fn read_block(
    ctx: &NodeContext,
    level: u32,
    position: u64,
    len: usize,
) -> Result<Box<ContentBlock>, BlockError> {
    let mut data = empty_block();
    let read = ctx.ioc.read(level, position, &mut data[..len])?;
    if read != len {
        return Err(BlockError::ShortRead {
            level,
            position,
            read,
            expected: len,
        });
    }
    Ok(data)
}

/// Hash and encrypt the node's plaintext, filling in its chk
fn seal(block: &mut Block) -> Result<Box<ContentBlock>, BlockError> {
    let data = block.data.get_or_insert_with(empty_block);
    let key = hash(&data[..block.len]);
    let encrypted = encrypt_block(&**data, &key)?;
    block.chk = ChkHashes::new(key, hash(&encrypted));
    Ok(Box::new(encrypted))
}

/// Arena of tree nodes for one file
pub struct BlockTree {
    nodes: HashMap<NodeId, Block>,
    next_id: u64,
    root: Option<NodeId>,
    file_size: u64,
}

impl BlockTree {
    /// Tree for a file of `file_size` bytes; only the root is created
    pub fn new(file_size: u64) -> Self {
        let mut tree = Self {
            nodes: HashMap::new(),
            next_id: 0,
            root: None,
            file_size,
        };
        let depth = tree_depth(file_size);
        let root = if depth == 0 {
            Block::leaf(file_size, 0, None)
        } else {
            Block::inner(file_size, 0, depth, None)
        };
        tree.root = Some(tree.alloc(root));
        tree
    }

    /// Tree whose root carries the hashes of an inserted file
    pub fn for_download(fid: &FileIdentifier) -> Self {
        let mut tree = Self::new(fid.file_length);
        if let Some(root) = tree.root.and_then(|id| tree.nodes.get_mut(&id)) {
            root.chk = fid.chk;
        }
        tree
    }

    /// The root, until it is freed
    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn get(&self, id: NodeId) -> Option<&Block> {
        self.nodes.get(&id)
    }

    /// Number of nodes currently materialized
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Block)> {
        self.nodes.iter().map(|(id, block)| (*id, block))
    }

    fn alloc(&mut self, block: Block) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        self.nodes.insert(id, block);
        id
    }

    fn node(&self, id: NodeId) -> Result<&Block, BlockError> {
        self.nodes.get(&id).ok_or(BlockError::UnknownNode(id))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Block, BlockError> {
        self.nodes.get_mut(&id).ok_or(BlockError::UnknownNode(id))
    }

    /// Create the children of an inner node if they do not exist yet
    ///
    /// Returns the live children in slot order. Children get their chk from
    /// the node's table when it is known.
    pub fn allocate_children(&mut self, id: NodeId) -> Result<Vec<NodeId>, BlockError> {
        let block = self.node(id)?;
        let BlockKind::Inner(inner) = &block.kind else {
            return Ok(Vec::new());
        };
        if let Some(children) = &inner.children {
            return Ok(children.iter().flatten().copied().collect());
        }

        let (file_size, position, depth, count) =
            (block.file_size, block.position, inner.depth, inner.child_count);
        let chks: Vec<ChkHashes> = inner
            .table
            .as_ref()
            .map(|t| t.chks.clone())
            .unwrap_or_default();
        let cover = coverage(depth - 1);

        let mut ids = Vec::with_capacity(count);
        for i in 0..count {
            let child_pos = position + i as u64 * cover;
            let mut child = if depth > 1 {
                Block::inner(file_size, child_pos, depth - 1, Some(id))
            } else {
                Block::leaf(file_size, child_pos, Some(id))
            };
            if let Some(chk) = chks.get(i) {
                child.chk = *chk;
            }
            ids.push(self.alloc(child));
        }

        if let Some(inner) = self.node_mut(id)?.inner_mut() {
            inner.children = Some(ids.iter().map(|&c| Some(c)).collect());
            inner.live = ids.len();
        }
        Ok(ids)
    }

    // ============ INSERT / DELETE ============

    /// Insert the subtree rooted at `id`
    ///
    /// Without a sink only the hashes are computed.
    pub fn insert(
        &mut self,
        id: NodeId,
        ctx: &mut NodeContext,
        sink: Option<&mut dyn BlockSink>,
    ) -> Result<(), BlockError> {
        match sink {
            Some(sink) => self.store_node(id, ctx, sink, StoreOp::Insert),
            None => self.store_node(id, ctx, &mut DryRun, StoreOp::Insert),
        }
    }

    /// Delete or unindex the subtree rooted at `id`
    pub fn delete(
        &mut self,
        id: NodeId,
        ctx: &mut NodeContext,
        sink: &mut dyn BlockSink,
    ) -> Result<(), BlockError> {
        self.store_node(id, ctx, sink, StoreOp::Delete)
    }

    fn store_node(
        &mut self,
        id: NodeId,
        ctx: &mut NodeContext,
        sink: &mut dyn BlockSink,
        op: StoreOp,
    ) -> Result<(), BlockError> {
        if self.node(id)?.is_inner() {
            self.store_inner(id, ctx, sink, op)
        } else {
            self.store_leaf(id, ctx, sink, op)
        }
    }

    fn store_leaf(
        &mut self,
        id: NodeId,
        ctx: &mut NodeContext,
        sink: &mut dyn BlockSink,
        op: StoreOp,
    ) -> Result<(), BlockError> {
        let (position, len) = {
            let block = self.node(id)?;
            (block.position, block.len)
        };
        let data = read_block(ctx, 0, position, len)?;
        ctx.add_progress(len);

        let block = self.node_mut(id)?;
        block.data = Some(data);
        let encrypted = seal(block)?;

        let msg = if ctx.index != 0 {
            op.index_message(ContentIndex {
                hash: block.chk.query,
                priority: ctx.priority,
                lookup_type: LOOKUP_TYPE_CHKS,
                file_index: ctx.index,
                offset: position,
            })
        } else {
            op.block_message(ctx.priority, encrypted)
        };
        sink.submit(msg)?;
        Ok(())
    }

    fn store_inner(
        &mut self,
        id: NodeId,
        ctx: &mut NodeContext,
        sink: &mut dyn BlockSink,
        op: StoreOp,
    ) -> Result<(), BlockError> {
        self.node_mut(id)?.status = BlockStatus::Persistent;
        let children = self.allocate_children(id)?;

        let mut crcs = Vec::with_capacity(children.len());
        let mut chks = Vec::with_capacity(children.len());
        for child in children {
            self.store_node(child, ctx, sink, op)?;
            let block = self.node(child)?;
            crcs.push(crc32(block.payload().unwrap_or_default()));
            chks.push(block.chk);
            self.done(child, &mut Offline);
        }

        let table = InnerBlockData::new(chks, crc32_chain(&crcs));
        if ctx.index != 0 {
            match sink.submit(op.super_message(ctx.priority, table.super_hash)) {
                Ok(()) => {}
                Err(SinkError::Refused) if op == StoreOp::Delete => {
                    debug!("Super block {} was already unindexed", to_hex(&table.super_hash));
                }
                Err(e) => return Err(e.into()),
            }
        }

        let block = self.node_mut(id)?;
        block.data = Some(table.encode());
        if let Some(inner) = block.inner_mut() {
            inner.crc32 = table.crc32;
            inner.table = Some(table);
        }
        let encrypted = seal(block)?;
        sink.submit(op.block_message(ctx.priority, encrypted))?;
        Ok(())
    }

    // ============ DOWNLOAD ============

    /// Check whether the node's own block is already stored locally
    ///
    /// Reads the node's level file and compares the hash with the node's key.
    /// Inner nodes also pick up their chk table and CRC.
    pub fn is_present(&mut self, id: NodeId, ctx: &mut NodeContext) -> bool {
        let Some(block) = self.nodes.get_mut(&id) else {
            return false;
        };
        let len = block.len;
        let data = match read_block(ctx, block.depth(), block.position, len) {
            Ok(data) => data,
            Err(_) => {
                block.status = BlockStatus::NotPresent;
                return false;
            }
        };
        if hash(&data[..len]) != block.chk.key {
            block.status = BlockStatus::NotPresent;
            return false;
        }

        match &mut block.kind {
            BlockKind::Data => {
                block.data = Some(data);
                block.status = BlockStatus::Present;
                ctx.add_progress(len);
            }
            BlockKind::Inner(inner) => {
                let table = InnerBlockData::decode(&data, inner.child_count);
                inner.crc32 = table.crc32;
                inner.table = Some(table);
                block.data = Some(data);
            }
        }
        true
    }

    /// Rebuild an inner node from level-0 data without touching the network
    fn present_by_recomputation(&mut self, id: NodeId, ctx: &NodeContext) -> Result<bool, BlockError> {
        let (file_size, position, depth, expected) = {
            let block = self.node(id)?;
            (block.file_size, block.position, block.depth(), block.chk)
        };
        let copy = self.alloc(Block::inner(file_size, position, depth, None));
        let mut offline = NodeContext::new(ctx.ioc.clone());

        let matched = match self.store_node(copy, &mut offline, &mut DryRun, StoreOp::Insert) {
            Ok(()) => self.node(copy)?.chk == expected,
            Err(e) => {
                debug!("Block {} not recoverable from local data: {}", id, e);
                false
            }
        };

        if matched {
            let (data, table) = {
                let block = self.node_mut(copy)?;
                let data = block.data.take();
                (data, block.inner_mut().and_then(|inner| inner.table.take()))
            };
            let block = self.node_mut(id)?;
            block.data = data;
            if let Some(inner) = block.inner_mut() {
                if let Some(table) = &table {
                    inner.crc32 = table.crc32;
                }
                inner.table = table;
            }
        }
        self.done(copy, &mut Offline);
        Ok(matched)
    }

    /// Start downloading the subtree rooted at `id`
    ///
    /// Blocks found locally complete immediately. A missing root queries for
    /// itself; missing children are queried by their parent's super-query.
    pub fn download(
        &mut self,
        id: NodeId,
        ctx: &mut NodeContext,
        sched: &mut dyn QueryScheduler,
    ) -> Result<(), BlockError> {
        let is_inner = self.node(id)?.is_inner();
        let present =
            self.is_present(id, ctx) || (is_inner && self.present_by_recomputation(id, ctx)?);
        if present {
            return self.on_present(id, ctx, sched);
        }

        let block = self.node_mut(id)?;
        block.status = BlockStatus::Pending;
        if block.parent.is_none() {
            let query = QueryMessage::single(block.chk.query);
            sched.request(id, ReplyHandler::Own, query);
        }
        Ok(())
    }

    /// Handle a reply routed to `id` by the scheduler
    ///
    /// Fails with a corruption error if the reply does not decrypt to the
    /// expected content; nothing is written in that case.
    pub fn receive(
        &mut self,
        id: NodeId,
        handler: ReplyHandler,
        query: &Hash,
        reply: &ContentBlock,
        ctx: &mut NodeContext,
        sched: &mut dyn QueryScheduler,
    ) -> Result<(), BlockError> {
        let target = match handler {
            ReplyHandler::Own => Some(id),
            ReplyHandler::Children => self.pending_child(id, query),
        };
        match target {
            Some(target) => self.receive_own(target, reply, ctx, sched),
            None => {
                debug!("Reply {} matches no pending child of {}", to_hex(query), id);
                Ok(())
            }
        }
    }

    fn pending_child(&self, id: NodeId, query: &Hash) -> Option<NodeId> {
        let block = self.nodes.get(&id)?;
        if block.status != BlockStatus::SuperqueryPending {
            return None;
        }
        block.children()?.iter().flatten().copied().find(|c| {
            self.nodes
                .get(c)
                .is_some_and(|b| b.status == BlockStatus::Pending && b.chk.query == *query)
        })
    }

    fn receive_own(
        &mut self,
        id: NodeId,
        reply: &ContentBlock,
        ctx: &mut NodeContext,
        sched: &mut dyn QueryScheduler,
    ) -> Result<(), BlockError> {
        let Some(block) = self.nodes.get(&id) else {
            debug!("Ignoring reply for released node {}", id);
            return Ok(());
        };
        if block.status != BlockStatus::Pending {
            debug!("Ignoring reply for {} in state {:?}", id, block.status);
            return Ok(());
        }
        let (level, position, len, key) = (block.depth(), block.position, block.len, block.chk.key);

        let data = decrypt_block(reply, &key)?;
        if hash(&data[..len]) != key {
            return Err(BlockError::Corruption {
                level,
                position,
                reason: "content hash mismatch",
            });
        }
        let written = ctx.ioc.write(level, position, &data[..len])?;
        if written != len {
            return Err(BlockError::ShortWrite {
                level,
                position,
                written,
                expected: len,
            });
        }

        let block = self.node_mut(id)?;
        let table = block
            .is_inner()
            .then(|| InnerBlockData::decode(&data, block.child_count()));
        block.data = Some(Box::new(data));
        match (block.inner_mut(), table) {
            (Some(inner), Some(table)) => {
                inner.crc32 = table.crc32;
                inner.table = Some(table);
            }
            _ => {
                let (before, after) = ctx.add_progress(len);
                if crosses_endgame_threshold(before, after, ctx.stats.file_size) {
                    debug!("Progress {} of {}: endgame", after, ctx.stats.file_size);
                    sched.endgame();
                }
            }
        }
        self.on_present(id, ctx, sched)
    }

    /// The node's block is verified and held in memory
    fn on_present(
        &mut self,
        id: NodeId,
        ctx: &mut NodeContext,
        sched: &mut dyn QueryScheduler,
    ) -> Result<(), BlockError> {
        self.check_top_crc(id, ctx)?;
        let (parent, is_inner) = {
            let block = self.node_mut(id)?;
            block.status = BlockStatus::Present;
            (block.parent, block.is_inner())
        };
        match parent {
            Some(parent) => {
                self.record_child(parent, id)?;
                self.refresh_superquery(parent, sched);
            }
            None => sched.update(id, None),
        }

        if is_inner {
            self.expand(id, ctx, sched)
        } else {
            self.node_mut(id)?.status = BlockStatus::Done;
            self.done(id, sched);
            Ok(())
        }
    }

    fn check_top_crc(&self, id: NodeId, ctx: &NodeContext) -> Result<(), BlockError> {
        if self.root != Some(id) {
            return Ok(());
        }
        let Some(expected) = ctx.top_crc32 else {
            return Ok(());
        };
        let block = self.node(id)?;
        if crc32(block.payload().unwrap_or_default()) != expected {
            return Err(BlockError::Corruption {
                level: block.depth(),
                position: block.position,
                reason: "root does not match file CRC",
            });
        }
        Ok(())
    }

    /// Record a present child's CRC; verify the parent once all are known
    fn record_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), BlockError> {
        let (crc, position) = {
            let block = self.node(child)?;
            (crc32(block.payload().unwrap_or_default()), block.position)
        };
        let block = self.node_mut(parent)?;
        let Some(slot) = block.slot_of(position) else {
            return Ok(());
        };
        let (level, parent_pos) = (block.depth(), block.position);
        let Some(inner) = block.inner_mut() else {
            return Ok(());
        };

        inner.child_crcs[slot].get_or_insert(crc);
        if inner.child_crcs.iter().any(Option::is_none) {
            return Ok(());
        }
        let crcs: Vec<u32> = inner.child_crcs.iter().flatten().copied().collect();
        if crc32_chain(&crcs) != inner.crc32 {
            return Err(BlockError::Corruption {
                level,
                position: parent_pos,
                reason: "children do not match stored CRC",
            });
        }
        // chk table stays decoded; the raw block is no longer needed
        block.data = None;
        Ok(())
    }

    /// Download the children of a present inner node
    fn expand(
        &mut self,
        id: NodeId,
        ctx: &mut NodeContext,
        sched: &mut dyn QueryScheduler,
    ) -> Result<(), BlockError> {
        self.node_mut(id)?.status = BlockStatus::Persistent;
        let children = self.allocate_children(id)?;
        for child in children {
            if self.nodes.contains_key(&child) {
                self.download(child, ctx, sched)?;
            }
        }
        self.node_mut(id)?.status = BlockStatus::ChildrenPresent;
        self.refresh_superquery(id, sched);
        self.finish_if_complete(id, sched);
        Ok(())
    }

    /// Issue, replace or cancel the super-query for the node's pending children
    fn refresh_superquery(&mut self, id: NodeId, sched: &mut dyn QueryScheduler) {
        let Some(block) = self.nodes.get(&id) else {
            return;
        };
        let BlockKind::Inner(inner) = &block.kind else {
            return;
        };
        // mid-expansion; the node refreshes once all children are started
        if block.status == BlockStatus::Persistent {
            return;
        }

        let pending: Vec<Hash> = inner
            .children
            .iter()
            .flatten()
            .flatten()
            .filter_map(|c| self.nodes.get(c))
            .filter(|c| c.status == BlockStatus::Pending)
            .map(|c| c.chk.query)
            .collect();
        let super_hash = inner.table.as_ref().map(|t| t.super_hash).unwrap_or_default();
        let was_pending = block.status == BlockStatus::SuperqueryPending;

        let Some(block) = self.nodes.get_mut(&id) else {
            return;
        };
        if pending.is_empty() {
            block.status = BlockStatus::ChildrenPresent;
            if was_pending {
                sched.update(id, None);
            }
            return;
        }

        let mut queries = Vec::with_capacity(pending.len() + 1);
        queries.push(super_hash);
        queries.extend(pending);
        let query = QueryMessage::new(queries);
        if was_pending {
            sched.update(id, Some(query));
        } else {
            block.status = BlockStatus::SuperqueryPending;
            sched.request(id, ReplyHandler::Children, query);
        }
    }

    fn finish_if_complete(&mut self, id: NodeId, sched: &mut dyn QueryScheduler) {
        let complete = self.nodes.get(&id).is_some_and(|b| {
            b.status != BlockStatus::Persistent
                && matches!(&b.kind, BlockKind::Inner(inner) if inner.live == 0)
        });
        if complete {
            if let Some(block) = self.nodes.get_mut(&id) {
                block.status = BlockStatus::Done;
            }
            self.done(id, sched);
        }
    }

    // ============ LIFECYCLE ============

    /// Free `id` and its subtree
    ///
    /// If `id` was its parent's last live child and the parent is not
    /// `Persistent`, the parent is freed as well.
    pub fn done(&mut self, id: NodeId, sched: &mut dyn QueryScheduler) {
        let Some(block) = self.nodes.remove(&id) else {
            return;
        };
        sched.release(id);
        let (parent, position) = (block.parent, block.position);

        if let BlockKind::Inner(inner) = block.kind {
            for child in inner.children.into_iter().flatten().flatten() {
                self.done(child, sched);
            }
        }
        if self.root == Some(id) {
            self.root = None;
        }
        if let Some(parent) = parent {
            self.unlink(parent, position, sched);
        }
    }

    fn unlink(&mut self, parent: NodeId, position: u64, sched: &mut dyn QueryScheduler) {
        let Some(block) = self.nodes.get_mut(&parent) else {
            return;
        };
        let Some(slot) = block.slot_of(position) else {
            return;
        };
        let persistent = block.status == BlockStatus::Persistent;
        let Some(inner) = block.inner_mut() else {
            return;
        };
        let Some(children) = inner.children.as_mut() else {
            return;
        };
        if children[slot].take().is_some() {
            inner.live -= 1;
        }
        if inner.live == 0 && !persistent {
            self.done(parent, sched);
        }
    }

    /// Log the subtree rooted at `id`
    pub fn print(&self, id: NodeId, indent: usize) {
        let Some(block) = self.nodes.get(&id) else {
            return;
        };
        debug!(
            "{:indent$}{} {} pos={} len={} depth={} status={:?} query={}",
            "",
            if block.is_inner() { "IBlock" } else { "DBlock" },
            id,
            block.position,
            block.len,
            block.depth(),
            block.status,
            to_hex(&block.chk.query),
        );
        if let Some(children) = block.children() {
            for child in children.iter().flatten() {
                self.print(*child, indent + 2);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CONTENT_SIZE;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorder {
        sent: Vec<ClientMessage>,
    }

    impl BlockSink for Recorder {
        fn submit(&mut self, msg: ClientMessage) -> Result<(), SinkError> {
            self.sent.push(msg);
            Ok(())
        }
    }

    fn write_file(dir: &TempDir, name: &str, len: usize) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let data: Vec<u8> = (0..len).map(|i| (i % 253) as u8).collect();
        std::fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn test_endgame_thresholds() {
        // 10000 - 1024 = 8976 per 10000
        assert!(crosses_endgame_threshold(8900, 9000, 10_000));
        assert!(!crosses_endgame_threshold(9000, 9100, 10_000));
        assert!(crosses_endgame_threshold(9990, 10_000, 10_000));
        assert!(!crosses_endgame_threshold(0, 100, 10_000));
    }

    #[test]
    fn test_single_block_tree() {
        let tree = BlockTree::new(700);
        let root = tree.get(tree.root().unwrap()).unwrap();
        assert!(!root.is_inner());
        assert_eq!(root.len(), 700);
        assert_eq!(root.depth(), 0);
    }

    #[test]
    fn test_insert_two_block_file() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "f", 2000);
        let ioc = Arc::new(IoContext::open(2000, &path, true).unwrap());
        let mut ctx = NodeContext::new(ioc);
        let mut tree = BlockTree::new(2000);
        let root = tree.root().unwrap();
        let mut sink = Recorder::default();

        tree.insert(root, &mut ctx, Some(&mut sink)).unwrap();

        let block = tree.get(root).unwrap();
        assert_eq!(block.depth(), 1);
        assert_eq!(block.child_count(), 2);
        assert_eq!(block.len(), 24 + 2 * 40);
        assert_eq!(ctx.stats.progress, 2000);
        // two leaves and the root
        assert_eq!(sink.sent.len(), 3);
        assert!(sink
            .sent
            .iter()
            .all(|m| matches!(m, ClientMessage::InsertChk { .. })));
        // children were released after hashing
        assert_eq!(tree.node_count(), 1);
    }

    #[test]
    fn test_insert_is_deterministic() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "f", 5000);
        let mut chks = Vec::new();
        for _ in 0..2 {
            let ioc = Arc::new(IoContext::open(5000, &path, true).unwrap());
            let mut ctx = NodeContext::new(ioc);
            let mut tree = BlockTree::new(5000);
            let root = tree.root().unwrap();
            tree.insert(root, &mut ctx, None).unwrap();
            chks.push(*tree.get(root).unwrap().chk());
        }
        assert_eq!(chks[0], chks[1]);
    }

    #[test]
    fn test_indexed_insert_sends_index_requests() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "f", 3000);
        let ioc = Arc::new(IoContext::open(3000, &path, true).unwrap());
        let mut ctx = NodeContext::new(ioc).with_index(3).with_priority(9);
        let mut tree = BlockTree::new(3000);
        let root = tree.root().unwrap();
        let mut sink = Recorder::default();

        tree.insert(root, &mut ctx, Some(&mut sink)).unwrap();

        let offsets: Vec<u64> = sink
            .sent
            .iter()
            .filter_map(|m| match m {
                ClientMessage::IndexBlock(idx) => Some(idx.offset),
                _ => None,
            })
            .collect();
        assert_eq!(offsets, vec![0, 1024, 2048]);
        assert!(matches!(sink.sent[3], ClientMessage::IndexSuper { priority: 9, .. }));
        assert!(matches!(sink.sent[4], ClientMessage::InsertChk { .. }));
    }

    #[test]
    fn test_insert_short_file_fails() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "f", 1500);
        let ioc = Arc::new(IoContext::open(2000, &path, true).unwrap());
        let mut ctx = NodeContext::new(ioc);
        let mut tree = BlockTree::new(2000);
        let root = tree.root().unwrap();

        let err = tree.insert(root, &mut ctx, None).unwrap_err();
        assert!(err.is_local_io());
    }

    #[test]
    fn test_leaf_chk_is_content_addressed() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "f", 100);
        let ioc = Arc::new(IoContext::open(100, &path, true).unwrap());
        let mut ctx = NodeContext::new(ioc);
        let mut tree = BlockTree::new(100);
        let root = tree.root().unwrap();
        tree.insert(root, &mut ctx, None).unwrap();

        let content = std::fs::read(&path).unwrap();
        let mut padded = [0u8; CONTENT_SIZE];
        padded[..100].copy_from_slice(&content);
        let key = hash(&content);
        let encrypted = encrypt_block(&padded, &key).unwrap();

        let chk = tree.get(root).unwrap().chk();
        assert_eq!(chk.key, key);
        assert_eq!(chk.query, hash(&encrypted));
    }

    #[test]
    fn test_done_cascades_to_parent() {
        let mut tree = BlockTree::new(2000);
        let root = tree.root().unwrap();
        let children = tree.allocate_children(root).unwrap();
        assert_eq!(tree.node_count(), 3);

        tree.done(children[0], &mut Offline);
        assert_eq!(tree.node_count(), 2);
        assert_eq!(tree.get(root).unwrap().children().unwrap()[0], None);

        tree.done(children[1], &mut Offline);
        assert_eq!(tree.node_count(), 0);
        assert_eq!(tree.root(), None);
    }

    #[test]
    fn test_persistent_parent_survives_children() {
        let mut tree = BlockTree::new(2000);
        let root = tree.root().unwrap();
        let children = tree.allocate_children(root).unwrap();
        tree.nodes.get_mut(&root).unwrap().status = BlockStatus::Persistent;

        for child in children {
            tree.done(child, &mut Offline);
        }
        assert_eq!(tree.node_count(), 1);
        assert_eq!(tree.root(), Some(root));
    }

    #[test]
    fn test_children_cover_file_without_gaps() {
        let file_size = 70_000u64;
        let mut tree = BlockTree::new(file_size);
        let mut frontier = vec![tree.root().unwrap()];
        let mut leaves = Vec::new();
        while let Some(id) = frontier.pop() {
            if tree.get(id).unwrap().is_inner() {
                frontier.extend(tree.allocate_children(id).unwrap());
            } else {
                let b = tree.get(id).unwrap();
                leaves.push((b.position(), b.len() as u64));
            }
        }
        leaves.sort();
        let mut next = 0;
        for (pos, len) in leaves {
            assert_eq!(pos, next);
            next += len;
        }
        assert_eq!(next, file_size);
    }
}
