//! Leveled block storage on local disk
//!
//! Level 0 is the real file. Every tree level above it gets its own cache
//! file holding that level's inner blocks, so an interrupted download can
//! resume without fetching the upper levels again.
//!
//! Naming: `<base>` for level 0, then `<base>.A`, `<base>.B`, ... for levels
//! 1, 2, ...

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::block::tree_depth;
use crate::types::CHK_PER_INODE;

/// Block storage error
#[derive(Debug, thiserror::Error)]
pub enum IoContextError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Level {0} is not available")]
    LevelUnavailable(u32),
    #[error("Lock for level {0} poisoned")]
    Poisoned(u32),
}

/// One file handle per tree level, each behind its own lock
pub struct IoContext {
    path: PathBuf,
    file_size: u64,
    depth: u32,
    levels: Vec<Mutex<Option<File>>>,
}

impl IoContext {
    /// Open the level files for a tree covering `file_size` bytes
    ///
    /// In read-only mode missing upper level files are tolerated, reads from
    /// them fail with `LevelUnavailable`. In write mode every level file is
    /// created and an oversized level-0 file is truncated to `file_size`.
    pub fn open(
        file_size: u64,
        path: impl AsRef<Path>,
        read_only: bool,
    ) -> Result<Self, IoContextError> {
        let path = path.as_ref().to_path_buf();
        let depth = tree_depth(file_size);

        let base = if read_only {
            OpenOptions::new().read(true).open(&path)
        } else {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
        }
        .map_err(|source| IoContextError::Open {
            path: path.clone(),
            source,
        })?;

        if !read_only && base.metadata()?.len() > file_size {
            debug!("Truncating {} to {} bytes", path.display(), file_size);
            base.set_len(file_size)?;
        }

        let mut levels = Vec::with_capacity(depth as usize + 1);
        levels.push(Mutex::new(Some(base)));

        for level in 1..=depth {
            let level_path = Self::level_path(&path, level);
            let handle = if read_only {
                match File::open(&level_path) {
                    Ok(f) => Some(f),
                    Err(e) => {
                        debug!("No cache for level {} at {}: {}", level, level_path.display(), e);
                        None
                    }
                }
            } else {
                let f = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&level_path)
                    .map_err(|source| IoContextError::Open {
                        path: level_path.clone(),
                        source,
                    })?;
                Some(f)
            };
            levels.push(Mutex::new(handle));
        }

        Ok(Self {
            path,
            file_size,
            depth,
            levels,
        })
    }

    /// File name of a level's backing file
    pub fn level_path(base: &Path, level: u32) -> PathBuf {
        if level == 0 {
            return base.to_path_buf();
        }
        let mut name = base.as_os_str().to_os_string();
        let letter = char::from(b'A' + (level - 1) as u8);
        name.push(format!(".{}", letter));
        PathBuf::from(name)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Depth of the tree this context stores
    pub fn depth(&self) -> u32 {
        self.depth
    }

    fn level_offset(level: u32, position: u64) -> u64 {
        position / (CHK_PER_INODE as u64).pow(level)
    }

    fn handle(&self, level: u32) -> Result<&Mutex<Option<File>>, IoContextError> {
        self.levels
            .get(level as usize)
            .ok_or(IoContextError::LevelUnavailable(level))
    }

    /// Read up to `buf.len()` bytes for the block at `position` on `level`
    ///
    /// Returns the number of bytes read, which is short at end of file.
    pub fn read(&self, level: u32, position: u64, buf: &mut [u8]) -> Result<usize, IoContextError> {
        let mut guard = self
            .handle(level)?
            .lock()
            .map_err(|_| IoContextError::Poisoned(level))?;
        let file = guard.as_mut().ok_or(IoContextError::LevelUnavailable(level))?;

        file.seek(SeekFrom::Start(Self::level_offset(level, position)))?;
        let mut total = 0;
        while total < buf.len() {
            let n = file.read(&mut buf[total..])?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    /// Write the block at `position` on `level`
    ///
    /// Returns the number of bytes written; a short write is logged and
    /// reported to the caller, not retried.
    pub fn write(&self, level: u32, position: u64, buf: &[u8]) -> Result<usize, IoContextError> {
        let mut guard = self
            .handle(level)?
            .lock()
            .map_err(|_| IoContextError::Poisoned(level))?;
        let file = guard.as_mut().ok_or(IoContextError::LevelUnavailable(level))?;

        let offset = Self::level_offset(level, position);
        file.seek(SeekFrom::Start(offset))?;
        let n = file.write(buf)?;
        if n != buf.len() {
            warn!(
                "Short write at level {} offset {}: {} of {} bytes",
                level,
                offset,
                n,
                buf.len()
            );
        }
        Ok(n)
    }

    /// Close all levels, optionally deleting the upper level caches
    pub fn close(self, unlink: bool) {
        let Self {
            path,
            depth,
            levels,
            ..
        } = self;
        drop(levels);

        if !unlink {
            return;
        }
        for level in 1..=depth {
            let level_path = Self::level_path(&path, level);
            if let Err(e) = std::fs::remove_file(&level_path) {
                debug!("Could not remove {}: {}", level_path.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_level_path_naming() {
        let base = Path::new("/tmp/file.bin");
        assert_eq!(IoContext::level_path(base, 0), PathBuf::from("/tmp/file.bin"));
        assert_eq!(IoContext::level_path(base, 1), PathBuf::from("/tmp/file.bin.A"));
        assert_eq!(IoContext::level_path(base, 2), PathBuf::from("/tmp/file.bin.B"));
    }

    #[test]
    fn test_open_creates_levels_and_close_unlinks() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data");

        let ioc = IoContext::open(30_000, &path, false).unwrap();
        assert_eq!(ioc.depth(), 2);
        assert!(IoContext::level_path(&path, 1).exists());
        assert!(IoContext::level_path(&path, 2).exists());

        ioc.close(true);
        assert!(path.exists());
        assert!(!IoContext::level_path(&path, 1).exists());
        assert!(!IoContext::level_path(&path, 2).exists());
    }

    #[test]
    fn test_write_mode_truncates_oversized_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, vec![1u8; 5000]).unwrap();

        let ioc = IoContext::open(3000, &path, false).unwrap();
        ioc.close(true);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 3000);
    }

    #[test]
    fn test_read_only_tolerates_missing_levels() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, vec![7u8; 2000]).unwrap();

        let ioc = IoContext::open(2000, &path, true).unwrap();
        let mut buf = [0u8; 64];
        assert!(matches!(
            ioc.read(1, 0, &mut buf),
            Err(IoContextError::LevelUnavailable(1))
        ));
        assert_eq!(ioc.read(0, 1024, &mut buf).unwrap(), 64);
        assert_eq!(buf, [7u8; 64]);
    }

    #[test]
    fn test_read_only_missing_base_fails() {
        let dir = TempDir::new().unwrap();
        let result = IoContext::open(10, dir.path().join("missing"), true);
        assert!(matches!(result, Err(IoContextError::Open { .. })));
    }

    #[test]
    fn test_level_offsets() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data");
        let ioc = IoContext::open(100_000, &path, false).unwrap();

        // Second child of the root on level 1 starts at byte 25 * 1024
        ioc.write(1, 25 * 1024, b"inner").unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(ioc.read(1, 25 * 1024, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"inner");

        let raw = std::fs::read(IoContext::level_path(&path, 1)).unwrap();
        assert_eq!(&raw[1024..1029], b"inner");
    }

    #[test]
    fn test_short_read_at_eof() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, vec![1u8; 100]).unwrap();

        let ioc = IoContext::open(100, &path, true).unwrap();
        let mut buf = [0u8; 1024];
        assert_eq!(ioc.read(0, 0, &mut buf).unwrap(), 100);
    }
}
