//! chktree-client - talking to the block daemon
//!
//! Inserting and deleting is synchronous: [`insert_file`] and [`delete_file`]
//! walk the block tree and hand every block to a [`chktree_core::BlockSink`],
//! usually a [`DaemonSink`].
//!
//! Downloading is asynchronous. [`start_download`] spawns a
//! [`RequestManager`] that keeps one query outstanding per missing block,
//! retransmits with growing TTLs and paces itself with a congestion window.
//!
//! # Example
//!
//! ```rust,no_run
//! use chktree_client::{download_file, insert_file, DaemonSink, DownloadOptions, InsertOptions, TcpConnection};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut sink = DaemonSink::connect("127.0.0.1:2087")?;
//!     let fid = insert_file("data.bin", &mut sink, &InsertOptions::default())?;
//!
//!     let conn = Arc::new(TcpConnection::connect("127.0.0.1:2087").await?);
//!     let stats = download_file(&fid, "copy.bin", conn, &DownloadOptions::default()).await?;
//!     println!("{} of {} bytes", stats.progress, stats.file_size);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod manager;
pub mod mock;
pub mod ops;
pub mod policy;
pub mod requests;
pub mod sink;

pub use config::RequestManagerConfig;
pub use connection::{DaemonConnection, TcpConnection, TransportError};
pub use error::ClientError;
pub use manager::{DownloadControl, RequestManager};
pub use mock::{LoopbackDaemon, LoopbackOptions};
pub use ops::{
    delete_file, download_file, identify_file, insert_file, start_download, DownloadOptions,
    FileDownload, InsertOptions,
};
pub use policy::{AnonymityPolicy, NoPolicy, PriorityTracker, TrafficKind, TrafficPolicy};
pub use requests::{QuerySender, RequestStats, RequestTable, Schedule, RETURN_OK};
pub use sink::DaemonSink;
