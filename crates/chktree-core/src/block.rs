//! Tree nodes, tree shape and the inner block layout
//!
//! A file of `n` bytes is covered by a tree of depth `d`, the smallest `d`
//! with `CONTENT_SIZE * 25^d >= n`. Leaves (data blocks) hold up to
//! `CONTENT_SIZE` bytes of the file, inner blocks hold the hashes of up to
//! `CHK_PER_INODE` children.

use bytes::{Buf, BufMut};
use std::fmt;

use crate::hash::hash;
use crate::types::{empty_block, ChkHashes, ContentBlock, Hash, CHK_PER_INODE, CONTENT_SIZE, HASH_SIZE};

/// Bytes before the chk table in an inner block: super hash and crc32
pub const INNER_HEADER_SIZE: usize = HASH_SIZE + 4;

/// Identity of a node inside a [`crate::BlockTree`]; never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Node state during insert, delete and download
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    Created,
    Present,
    NotPresent,
    Pending,
    ChildrenPresent,
    SuperqueryPending,
    Done,
    /// Not freed when the last child goes away
    Persistent,
}

/// Depth of the tree needed for `file_size` bytes
pub fn tree_depth(file_size: u64) -> u32 {
    let mut depth = 0;
    let mut covered = CONTENT_SIZE as u64;
    while covered < file_size {
        depth += 1;
        covered = covered.saturating_mul(CHK_PER_INODE as u64);
    }
    depth
}

/// Bytes covered by one node at `depth`
pub fn coverage(depth: u32) -> u64 {
    (CHK_PER_INODE as u64)
        .checked_pow(depth)
        .and_then(|n| n.checked_mul(CONTENT_SIZE as u64))
        .unwrap_or(u64::MAX)
}

/// Payload length of the leaf at `position`
pub fn leaf_len(file_size: u64, position: u64) -> usize {
    file_size.saturating_sub(position).min(CONTENT_SIZE as u64) as usize
}

/// Number of children of the inner node at `position` and `depth`
pub fn inner_child_count(file_size: u64, position: u64, depth: u32) -> usize {
    let child = coverage(depth - 1);
    let mine = file_size
        .saturating_sub(position)
        .min(child.saturating_mul(CHK_PER_INODE as u64));
    mine.div_ceil(child) as usize
}

/// Serialized length of an inner node with `child_count` children
pub fn inner_len(child_count: usize) -> usize {
    INNER_HEADER_SIZE + child_count * ChkHashes::SIZE
}

/// Plaintext of an inner block: `{super_hash, crc32, chks[..]}`, zero padded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InnerBlockData {
    pub super_hash: Hash,
    pub crc32: u32,
    pub chks: Vec<ChkHashes>,
}

impl InnerBlockData {
    /// Build from the children's hashes, computing the super hash
    pub fn new(chks: Vec<ChkHashes>, crc32: u32) -> Self {
        Self {
            super_hash: Self::super_hash_of(&chks),
            crc32,
            chks,
        }
    }

    /// Hash over the serialized chk table
    pub fn super_hash_of(chks: &[ChkHashes]) -> Hash {
        let mut buf = Vec::with_capacity(chks.len() * ChkHashes::SIZE);
        for chk in chks {
            chk.write_to(&mut buf);
        }
        hash(&buf)
    }

    pub fn encode(&self) -> Box<ContentBlock> {
        let mut block = empty_block();
        let mut buf = &mut block[..];
        buf.put_slice(&self.super_hash);
        buf.put_u32(self.crc32);
        for chk in self.chks.iter().take(CHK_PER_INODE) {
            chk.write_to(&mut buf);
        }
        block
    }

    pub fn decode(block: &ContentBlock, child_count: usize) -> Self {
        let mut buf = &block[..];
        let mut super_hash = [0u8; HASH_SIZE];
        buf.copy_to_slice(&mut super_hash);
        let crc32 = buf.get_u32();
        let chks = (0..child_count.min(CHK_PER_INODE))
            .map(|_| ChkHashes::read_from(&mut buf))
            .collect();
        Self {
            super_hash,
            crc32,
            chks,
        }
    }
}

/// Inner node bookkeeping
#[derive(Debug)]
pub(crate) struct Inner {
    pub(crate) depth: u32,
    pub(crate) child_count: usize,
    /// `None` until the children are allocated
    pub(crate) children: Option<Vec<Option<NodeId>>>,
    /// Number of `Some` slots in `children`
    pub(crate) live: usize,
    pub(crate) crc32: u32,
    pub(crate) table: Option<InnerBlockData>,
    /// Plaintext CRC of each child, recorded as children become present
    pub(crate) child_crcs: Vec<Option<u32>>,
}

#[derive(Debug)]
pub(crate) enum BlockKind {
    Data,
    Inner(Inner),
}

/// One node of the tree
#[derive(Debug)]
pub struct Block {
    pub(crate) file_size: u64,
    pub(crate) position: u64,
    pub(crate) chk: ChkHashes,
    pub(crate) len: usize,
    pub(crate) data: Option<Box<ContentBlock>>,
    pub(crate) parent: Option<NodeId>,
    pub(crate) status: BlockStatus,
    pub(crate) kind: BlockKind,
}

impl Block {
    pub(crate) fn leaf(file_size: u64, position: u64, parent: Option<NodeId>) -> Self {
        Self {
            file_size,
            position,
            chk: ChkHashes::default(),
            len: leaf_len(file_size, position),
            data: None,
            parent,
            status: BlockStatus::Created,
            kind: BlockKind::Data,
        }
    }

    pub(crate) fn inner(file_size: u64, position: u64, depth: u32, parent: Option<NodeId>) -> Self {
        let child_count = inner_child_count(file_size, position, depth);
        Self {
            file_size,
            position,
            chk: ChkHashes::default(),
            len: inner_len(child_count),
            data: None,
            parent,
            status: BlockStatus::Created,
            kind: BlockKind::Inner(Inner {
                depth,
                child_count,
                children: None,
                live: 0,
                crc32: 0,
                table: None,
                child_crcs: vec![None; child_count],
            }),
        }
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// First byte of the file this node covers
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn chk(&self) -> &ChkHashes {
        &self.chk
    }

    /// Valid bytes of the serialized block
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn status(&self) -> BlockStatus {
        self.status
    }

    pub fn is_inner(&self) -> bool {
        matches!(self.kind, BlockKind::Inner(_))
    }

    /// Tree level; 0 for leaves
    pub fn depth(&self) -> u32 {
        match &self.kind {
            BlockKind::Data => 0,
            BlockKind::Inner(inner) => inner.depth,
        }
    }

    pub fn child_count(&self) -> usize {
        match &self.kind {
            BlockKind::Data => 0,
            BlockKind::Inner(inner) => inner.child_count,
        }
    }

    /// Child slots, if allocated
    pub fn children(&self) -> Option<&[Option<NodeId>]> {
        match &self.kind {
            BlockKind::Inner(inner) => inner.children.as_deref(),
            BlockKind::Data => None,
        }
    }

    /// Stored CRC over the children's CRCs (inner nodes only)
    pub fn crc32(&self) -> Option<u32> {
        match &self.kind {
            BlockKind::Inner(inner) => Some(inner.crc32),
            BlockKind::Data => None,
        }
    }

    /// Decoded chk table (inner nodes, once known)
    pub fn table(&self) -> Option<&InnerBlockData> {
        match &self.kind {
            BlockKind::Inner(inner) => inner.table.as_ref(),
            BlockKind::Data => None,
        }
    }

    /// Plaintext payload while it is held in memory
    pub fn payload(&self) -> Option<&[u8]> {
        self.data.as_ref().map(|d| &d[..self.len])
    }

    pub(crate) fn inner_mut(&mut self) -> Option<&mut Inner> {
        match &mut self.kind {
            BlockKind::Inner(inner) => Some(inner),
            BlockKind::Data => None,
        }
    }

    /// Child slot index of a descendant starting at `position`
    pub(crate) fn slot_of(&self, position: u64) -> Option<usize> {
        let depth = self.depth();
        if depth == 0 || position < self.position {
            return None;
        }
        let slot = ((position - self.position) / coverage(depth - 1)) as usize;
        (slot < self.child_count()).then_some(slot)
    }
}
