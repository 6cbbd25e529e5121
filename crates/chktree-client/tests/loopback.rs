//! End-to-end tests against the in-memory daemon
//!
//! Files are inserted through the synchronous sink path and fetched back
//! through the async request manager.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chktree_client::{
    delete_file, download_file, identify_file, insert_file, start_download, ClientError,
    DownloadOptions, InsertOptions, LoopbackDaemon, LoopbackOptions, RequestManagerConfig,
};
use chktree_core::{FileIdentifier, WireError};
use tempfile::TempDir;

/// Log to stderr when RUST_LOG is set
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn sample_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 253) as u8).collect()
}

fn write_source(dir: &TempDir, len: usize) -> (PathBuf, Vec<u8>) {
    let path = dir.path().join("source");
    let data = sample_data(len);
    std::fs::write(&path, &data).unwrap();
    (path, data)
}

fn fast_options() -> DownloadOptions {
    DownloadOptions {
        config: RequestManagerConfig {
            min_sleep_ms: 5,
            max_sleep_ms: 50,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn insert(path: &Path, daemon: &LoopbackDaemon) -> FileIdentifier {
    let mut sink = daemon.clone();
    insert_file(path, &mut sink, &InsertOptions::default()).unwrap()
}

async fn fetch(
    fid: &FileIdentifier,
    target: &Path,
    daemon: &LoopbackDaemon,
) -> Result<chktree_core::ProgressStats, ClientError> {
    init_logging();
    let conn = Arc::new(daemon.clone());
    tokio::time::timeout(
        Duration::from_secs(20),
        download_file(fid, target, conn, &fast_options()),
    )
    .await
    .expect("download timed out")
}

// ============ ROUNDTRIP TESTS ============

mod roundtrip {
    use super::*;

    #[tokio::test]
    async fn test_two_block_file() {
        let dir = TempDir::new().unwrap();
        let (source, data) = write_source(&dir, 2000);
        let daemon = LoopbackDaemon::default();
        let fid = insert(&source, &daemon);
        assert_eq!(fid.file_length, 2000);
        assert_eq!(daemon.block_count(), 3);

        let target = dir.path().join("target");
        let stats = fetch(&fid, &target, &daemon).await.unwrap();

        assert_eq!(stats.progress, 2000);
        assert_eq!(std::fs::read(&target).unwrap(), data);
        assert!(daemon.queries() >= 2);
    }

    #[tokio::test]
    async fn test_single_block_file() {
        let dir = TempDir::new().unwrap();
        let (source, data) = write_source(&dir, 100);
        let daemon = LoopbackDaemon::default();
        let fid = insert(&source, &daemon);
        assert_eq!(daemon.block_count(), 1);

        let target = dir.path().join("target");
        let stats = fetch(&fid, &target, &daemon).await.unwrap();
        assert_eq!(stats.progress, 100);
        assert_eq!(std::fs::read(&target).unwrap(), data);
    }

    #[tokio::test]
    async fn test_three_level_file() {
        let dir = TempDir::new().unwrap();
        let (source, data) = write_source(&dir, 30_000);
        let daemon = LoopbackDaemon::default();
        let fid = insert(&source, &daemon);

        let target = dir.path().join("target");
        let stats = fetch(&fid, &target, &daemon).await.unwrap();
        assert_eq!(stats.progress, 30_000);
        assert_eq!(std::fs::read(&target).unwrap(), data);
        // upper level files are removed once the download is complete
        assert!(!dir.path().join("target.A").exists());
    }

    #[tokio::test]
    async fn test_progress_watch_sees_completion() {
        let dir = TempDir::new().unwrap();
        let (source, _) = write_source(&dir, 5000);
        let daemon = LoopbackDaemon::default();
        let fid = insert(&source, &daemon);

        let target = dir.path().join("target");
        let download =
            start_download(&fid, &target, Arc::new(daemon.clone()), &fast_options()).unwrap();
        let progress = download.progress();
        download.wait().await.unwrap();

        let last = *progress.borrow();
        assert_eq!(last.progress, 5000);
        assert_eq!(last.file_size, 5000);
        assert!(last.requests_sent > 0);
    }

    #[tokio::test]
    async fn test_present_file_needs_no_queries() {
        let dir = TempDir::new().unwrap();
        let (source, data) = write_source(&dir, 2000);
        let daemon = LoopbackDaemon::default();
        let fid = insert(&source, &daemon);

        let target = dir.path().join("target");
        std::fs::write(&target, &data).unwrap();
        let stats = fetch(&fid, &target, &daemon).await.unwrap();

        assert_eq!(stats.progress, 2000);
        assert_eq!(daemon.queries(), 0);
    }
}

// ============ FAULT TESTS ============

mod faults {
    use super::*;

    #[tokio::test]
    async fn test_duplicate_replies_are_counted() {
        let dir = TempDir::new().unwrap();
        let (source, data) = write_source(&dir, 2000);
        let daemon = LoopbackDaemon::new(LoopbackOptions {
            duplicate_replies: true,
            ..Default::default()
        });
        let fid = insert(&source, &daemon);

        let target = dir.path().join("target");
        let stats = fetch(&fid, &target, &daemon).await.unwrap();

        assert!(stats.duplication_estimate > 0);
        assert_eq!(std::fs::read(&target).unwrap(), data);
    }

    #[tokio::test]
    async fn test_wrong_key_is_corruption() {
        let dir = TempDir::new().unwrap();
        let (source, _) = write_source(&dir, 2000);
        let daemon = LoopbackDaemon::default();
        let mut fid = insert(&source, &daemon);
        fid.chk.key[0] ^= 1;

        let target = dir.path().join("target");
        let err = fetch(&fid, &target, &daemon).await.unwrap_err();
        assert!(err.is_corruption(), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn test_wrong_crc_is_corruption() {
        let dir = TempDir::new().unwrap();
        let (source, _) = write_source(&dir, 2000);
        let daemon = LoopbackDaemon::default();
        let mut fid = insert(&source, &daemon);
        fid.crc ^= 0xFFFF;

        let target = dir.path().join("target");
        let err = fetch(&fid, &target, &daemon).await.unwrap_err();
        assert!(err.is_corruption(), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn test_corrupt_replies_stall_until_destroyed() {
        let dir = TempDir::new().unwrap();
        let (source, _) = write_source(&dir, 2000);
        let daemon = LoopbackDaemon::new(LoopbackOptions {
            corrupt_replies: true,
            ..Default::default()
        });
        let fid = insert(&source, &daemon);

        let target = dir.path().join("target");
        let download =
            start_download(&fid, &target, Arc::new(daemon.clone()), &fast_options()).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let stats = download.destroy().await.unwrap();

        assert_eq!(stats.progress, 0);
        assert!(stats.duplication_estimate > 0);
        assert!(daemon.queries() >= 1);
    }

    #[tokio::test]
    async fn test_protocol_error_resets_connection() {
        let dir = TempDir::new().unwrap();
        let (source, data) = write_source(&dir, 2000);
        let daemon = LoopbackDaemon::default();
        let fid = insert(&source, &daemon);
        daemon.inject_error(WireError::UnknownType(99));

        let target = dir.path().join("target");
        fetch(&fid, &target, &daemon).await.unwrap();

        assert_eq!(daemon.resets(), 1);
        assert_eq!(std::fs::read(&target).unwrap(), data);
    }

    #[tokio::test]
    async fn test_receive_policy_waits_for_cover_traffic() {
        init_logging();
        let dir = TempDir::new().unwrap();
        let (source, data) = write_source(&dir, 2000);
        let daemon = LoopbackDaemon::default();
        let fid = insert(&source, &daemon);

        let mut opts = fast_options();
        opts.config.ttl_decrement_ms = 20;
        opts.receive_policy = 1;
        let target = dir.path().join("target");
        let download = start_download(&fid, &target, Arc::new(daemon.clone()), &opts).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(daemon.queries(), 0);

        download.control().record_traffic(None, 1 << 20, 1);
        let stats = tokio::time::timeout(Duration::from_secs(20), download.wait())
            .await
            .expect("download timed out")
            .unwrap();

        assert_eq!(stats.progress, 2000);
        assert_eq!(std::fs::read(&target).unwrap(), data);
        assert!(daemon.queries() >= 2);
    }

    #[tokio::test]
    async fn test_silent_daemon_keeps_retrying() {
        let dir = TempDir::new().unwrap();
        let (source, _) = write_source(&dir, 100);
        let daemon = LoopbackDaemon::new(LoopbackOptions {
            silent: true,
            ..Default::default()
        });
        let fid = insert(&source, &daemon);

        let target = dir.path().join("target");
        let download =
            start_download(&fid, &target, Arc::new(daemon.clone()), &fast_options()).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let stats = download.destroy().await.unwrap();

        assert_eq!(stats.progress, 0);
        assert_eq!(stats.duplication_estimate, 0);
        assert!(daemon.queries() >= 1);
    }
}

// ============ STORE TESTS ============

mod store {
    use super::*;

    #[test]
    fn test_identify_matches_insert() {
        let dir = TempDir::new().unwrap();
        let (source, _) = write_source(&dir, 7000);
        let daemon = LoopbackDaemon::default();
        let fid = insert(&source, &daemon);
        let identified = identify_file(&source, &InsertOptions::default()).unwrap();
        assert_eq!(fid, identified);
    }

    #[test]
    fn test_delete_removes_blocks() {
        let dir = TempDir::new().unwrap();
        let (source, _) = write_source(&dir, 2000);
        let daemon = LoopbackDaemon::default();
        let fid = insert(&source, &daemon);
        assert_eq!(daemon.block_count(), 3);

        let mut sink = daemon.clone();
        delete_file(&source, &mut sink, &InsertOptions::default(), Some(&fid)).unwrap();
        assert_eq!(daemon.block_count(), 0);
    }

    #[test]
    fn test_delete_refuses_changed_file() {
        let dir = TempDir::new().unwrap();
        let (source, _) = write_source(&dir, 2000);
        let daemon = LoopbackDaemon::default();
        let fid = insert(&source, &daemon);
        std::fs::write(&source, sample_data(1999)).unwrap();

        let mut sink = daemon.clone();
        let err =
            delete_file(&source, &mut sink, &InsertOptions::default(), Some(&fid)).unwrap_err();
        assert!(matches!(err, ClientError::Mismatch(_)));
        assert_eq!(daemon.block_count(), 3);
    }

    #[test]
    fn test_indexed_insert_skips_leaves() {
        let dir = TempDir::new().unwrap();
        let (source, _) = write_source(&dir, 5000);
        let daemon = LoopbackDaemon::default();
        let mut sink = daemon.clone();
        let opts = InsertOptions {
            priority: 7,
            index: 3,
        };
        let fid = insert_file(&source, &mut sink, &opts).unwrap();

        assert_eq!(daemon.index_count(), 5);
        assert_eq!(daemon.block_count(), 1);
        assert_eq!(fid, identify_file(&source, &opts).unwrap());
    }

    #[test]
    fn test_small_file_is_never_indexed() {
        let dir = TempDir::new().unwrap();
        let (source, _) = write_source(&dir, 500);
        let daemon = LoopbackDaemon::default();
        let mut sink = daemon.clone();
        let opts = InsertOptions {
            priority: 7,
            index: 3,
        };
        insert_file(&source, &mut sink, &opts).unwrap();

        assert_eq!(daemon.index_count(), 0);
        assert_eq!(daemon.block_count(), 1);
    }
}
