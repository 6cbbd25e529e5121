//! Download and insertion progress

use serde::{Deserialize, Serialize};

/// Progress and request statistics of one operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressStats {
    /// Bytes of the file processed so far
    pub progress: u64,
    pub file_size: u64,
    pub requests_sent: u32,
    pub requests_pending: u32,
    /// Retransmissions of still outstanding requests
    pub current_retries: u32,
    pub total_retries: u32,
    /// TTL of the most recent query, in milliseconds
    pub current_ttl: u32,
    /// Replies that matched no outstanding query
    pub duplication_estimate: u32,
}

impl ProgressStats {
    pub fn new(file_size: u64) -> Self {
        Self {
            file_size,
            ..Default::default()
        }
    }

    pub fn is_complete(&self) -> bool {
        self.progress >= self.file_size
    }
}

/// Receives progress updates
pub trait ProgressModel: Send {
    fn update(&mut self, stats: &ProgressStats);
}

impl<F> ProgressModel for F
where
    F: FnMut(&ProgressStats) + Send,
{
    fn update(&mut self, stats: &ProgressStats) {
        self(stats)
    }
}
