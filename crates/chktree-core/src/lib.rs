//! chktree - content-hash-key block trees
//!
//! A file is split into 1024-byte blocks arranged in a Merkle tree with up to
//! 25 children per inner node. Every block is encrypted under a key derived
//! from the hash of its own plaintext (CHK), so identical content always
//! produces identical ciphertext and the network only ever sees hashes of
//! ciphertext.
//!
//! # Core Concepts
//!
//! - **DBlock**: leaf holding up to 1024 bytes of the file
//! - **IBlock**: inner node holding a super hash, a CRC32 over its children and
//!   the `(key, query)` pairs of up to 25 children
//! - **FileIdentifier**: root hashes, root CRC and file length; everything
//!   needed to fetch the file again
//! - **IoContext**: one local file per tree level, so downloads can resume
//!
//! # Example
//!
//! ```rust,no_run
//! use chktree_core::{BlockTree, IoContext, NodeContext};
//! use std::sync::Arc;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let size = std::fs::metadata("data.bin")?.len();
//!     let ioc = Arc::new(IoContext::open(size, "data.bin", true)?);
//!     let mut ctx = NodeContext::new(ioc);
//!
//!     // Compute the root hashes without talking to a daemon
//!     let mut tree = BlockTree::new(size);
//!     let root = tree.root().ok_or("tree has no root")?;
//!     tree.insert(root, &mut ctx, None)?;
//!     println!("{:?}", tree.get(root).map(|b| b.chk()));
//!     Ok(())
//! }
//! ```

pub mod block;
pub mod crypto;
pub mod hash;
pub mod ioc;
pub mod progress;
pub mod scheduler;
pub mod tree;
pub mod types;
pub mod wire;

pub use block::{tree_depth, Block, BlockStatus, InnerBlockData, NodeId};
pub use crypto::{decrypt_block, encrypt_block, CryptoError};
pub use hash::{crc32, hash, verify};
pub use ioc::{IoContext, IoContextError};
pub use progress::{ProgressModel, ProgressStats};
pub use scheduler::{BlockSink, DryRun, Offline, QueryScheduler, ReplyHandler, SinkError};
pub use tree::{BlockError, BlockTree, NodeContext};
pub use types::{
    from_hex, to_hex, ChkHashes, ContentBlock, FileIdentifier, Hash, CHK_PER_INODE, CONTENT_SIZE,
    HASH_SIZE,
};
pub use wire::{ClientMessage, ContentIndex, DaemonMessage, QueryMessage, WireError};
