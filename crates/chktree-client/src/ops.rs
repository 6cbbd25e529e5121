//! File-level operations: insert, download, delete

use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use chktree_config::{AnonymityConfig, ContentConfig};
use chktree_core::{
    crc32, to_hex, BlockError, BlockSink, BlockTree, FileIdentifier, IoContext, NodeContext, Offline,
    ProgressStats, CONTENT_SIZE,
};

use crate::config::RequestManagerConfig;
use crate::connection::DaemonConnection;
use crate::error::ClientError;
use crate::manager::{DownloadControl, RequestManager};
use crate::policy::{PriorityTracker, TrafficPolicy};
use crate::requests::RequestTable;

/// Parameters for inserting or deleting a file
#[derive(Debug, Clone, Copy, Default)]
pub struct InsertOptions {
    pub priority: u32,
    /// Index of the file in the daemon's list of shared files; 0 uploads
    /// the content instead of indexing it
    pub index: u16,
}

impl InsertOptions {
    /// Options from the `[content]` section; `file_index` applies only when
    /// indexing is enabled there
    pub fn from_config(config: &ContentConfig, file_index: u16) -> Self {
        Self {
            priority: config.priority,
            index: if config.index { file_index } else { 0 },
        }
    }
}

/// Parameters for downloading a file
#[derive(Debug, Clone, Default)]
pub struct DownloadOptions {
    pub config: RequestManagerConfig,
    pub send_policy: i32,
    /// Positive values hold queries back until enough traffic was recorded
    /// through [`FileDownload::control`]
    pub receive_policy: i32,
    /// Average priority reported by the daemon when the download starts;
    /// later reports go through [`FileDownload::control`]
    pub average_priority: u32,
}

impl DownloadOptions {
    pub fn new(config: RequestManagerConfig, anonymity: &AnonymityConfig) -> Self {
        Self {
            config,
            send_policy: anonymity.send_policy,
            receive_policy: anonymity.receive_policy,
            average_priority: 0,
        }
    }

    pub fn with_average_priority(mut self, average: u32) -> Self {
        self.average_priority = average;
        self
    }

    fn table(&self) -> RequestTable {
        let table = RequestTable::new(self.config.clone())
            .with_priorities(PriorityTracker::new(self.average_priority));
        if self.send_policy <= 0 && self.receive_policy <= 0 {
            table
        } else {
            table.with_policy(TrafficPolicy::new(self.send_policy, self.receive_policy))
        }
    }
}

fn open_for_insert(
    path: &Path,
    opts: &InsertOptions,
) -> Result<(BlockTree, NodeContext), ClientError> {
    let file_size = std::fs::metadata(path)?.len();
    let ioc = Arc::new(IoContext::open(file_size, path, true)?);
    // Single-block files are always uploaded
    let index = if file_size <= CONTENT_SIZE as u64 {
        0
    } else {
        opts.index
    };
    let ctx = NodeContext::new(ioc)
        .with_priority(opts.priority)
        .with_index(index);
    Ok((BlockTree::new(file_size), ctx))
}

/// Insert (or index) the file at `path`; returns the handle to download it
pub fn insert_file(
    path: impl AsRef<Path>,
    sink: &mut dyn BlockSink,
    opts: &InsertOptions,
) -> Result<FileIdentifier, ClientError> {
    let path = path.as_ref();
    let (mut tree, mut ctx) = open_for_insert(path, opts)?;
    let fid = build(&mut tree, &mut ctx, Some(sink))?;
    info!("Inserted {}: {}", path.display(), fid);
    Ok(fid)
}

/// Compute the identifier of the file at `path` without contacting a daemon
pub fn identify_file(
    path: impl AsRef<Path>,
    opts: &InsertOptions,
) -> Result<FileIdentifier, ClientError> {
    let (mut tree, mut ctx) = open_for_insert(path.as_ref(), opts)?;
    build(&mut tree, &mut ctx, None)
}

fn build(
    tree: &mut BlockTree,
    ctx: &mut NodeContext,
    sink: Option<&mut dyn BlockSink>,
) -> Result<FileIdentifier, ClientError> {
    let Some(root) = tree.root() else {
        return Err(ClientError::Aborted);
    };
    let result = tree.insert(root, ctx, sink);
    let fid = result.and_then(|()| {
        let block = tree.get(root).ok_or(BlockError::UnknownNode(root))?;
        let crc = crc32(block.payload().unwrap_or_default());
        Ok(FileIdentifier::new(*block.chk(), crc, ctx.stats.file_size))
    });
    tree.done(root, &mut Offline);
    fid.map_err(ClientError::from)
}

/// Remove the file at `path` from the daemon
///
/// With `expected` set, the local file is hashed first and nothing is
/// deleted unless it still matches that identifier.
pub fn delete_file(
    path: impl AsRef<Path>,
    sink: &mut dyn BlockSink,
    opts: &InsertOptions,
    expected: Option<&FileIdentifier>,
) -> Result<(), ClientError> {
    let path = path.as_ref();
    if let Some(expected) = expected {
        let actual = identify_file(path, opts)?;
        if actual != *expected {
            warn!("{} hashes to {}", path.display(), actual);
            return Err(ClientError::Mismatch(expected.to_string()));
        }
    }

    let (mut tree, mut ctx) = open_for_insert(path, opts)?;
    let Some(root) = tree.root() else {
        return Err(ClientError::Aborted);
    };
    let result = tree.delete(root, &mut ctx, sink);
    tree.done(root, &mut Offline);
    result?;
    info!("Deleted {}", path.display());
    Ok(())
}

/// A download in progress
///
/// Dropping the handle cancels the download like [`FileDownload::destroy`],
/// without waiting for the teardown.
pub struct FileDownload {
    manager: RequestManager,
    ioc: Arc<IoContext>,
}

impl FileDownload {
    pub fn progress(&self) -> watch::Receiver<ProgressStats> {
        self.manager.progress()
    }

    /// Handle for feeding the daemon's traffic reports to the download
    pub fn control(&self) -> DownloadControl {
        self.manager.control()
    }

    /// Wait for completion
    ///
    /// On success the auxiliary level files are removed; on failure they are
    /// kept so that a later download can resume from them.
    pub async fn wait(self) -> Result<ProgressStats, ClientError> {
        let result = self.manager.wait().await;
        close(self.ioc, result.is_ok());
        result
    }

    /// Stop the download, keeping what was fetched so far on disk
    pub async fn destroy(self) -> Result<ProgressStats, ClientError> {
        let result = self.manager.destroy().await;
        close(self.ioc, false);
        result
    }
}

fn close(ioc: Arc<IoContext>, unlink: bool) {
    match Arc::try_unwrap(ioc) {
        Ok(ioc) => ioc.close(unlink),
        Err(_) => debug!("Storage still in use, leaving level files in place"),
    }
}

/// Start downloading `fid` into `path` over `conn`
///
/// Must be called from within a tokio runtime.
pub fn start_download(
    fid: &FileIdentifier,
    path: impl AsRef<Path>,
    conn: Arc<dyn DaemonConnection>,
    opts: &DownloadOptions,
) -> Result<FileDownload, ClientError> {
    let path = path.as_ref();
    let ioc = Arc::new(IoContext::open(fid.file_length, path, false)?);
    let ctx = NodeContext::new(ioc.clone()).with_top_crc32(fid.crc);
    let tree = BlockTree::for_download(fid);
    debug!(
        "Downloading {} bytes with root query {} to {}",
        fid.file_length,
        to_hex(&fid.chk.query),
        path.display()
    );
    let manager = RequestManager::spawn(conn, tree, ctx, opts.table(), opts.config.send_queue);
    Ok(FileDownload { manager, ioc })
}

/// Download `fid` into `path` and wait for completion
pub async fn download_file(
    fid: &FileIdentifier,
    path: impl AsRef<Path>,
    conn: Arc<dyn DaemonConnection>,
    opts: &DownloadOptions,
) -> Result<ProgressStats, ClientError> {
    start_download(fid, path, conn, opts)?.wait().await
}
