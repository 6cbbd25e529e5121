//! Anonymity policy and priority tracking
//!
//! Both are owned by the request table. While a download runs, traffic and
//! priority reports from the daemon reach them through
//! [`crate::DownloadControl`].

use tracing::debug;

/// Kinds of peer traffic the anonymity policy can demand as cover
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrafficKind {
    Query,
    ChkResult,
    HashResult,
}

/// Decides whether a message may be sent right now
pub trait AnonymityPolicy: Send {
    fn permits(&mut self, kind: TrafficKind, size: usize) -> bool;

    /// Account for received traffic; `kind` is `None` for unrelated messages
    fn record(&mut self, _kind: Option<TrafficKind>, _bytes: u64, _peers: u32) {}
}

/// Permits everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPolicy;

impl AnonymityPolicy for NoPolicy {
    fn permits(&mut self, _kind: TrafficKind, _size: usize) -> bool {
        true
    }
}

/// Received traffic available as cover
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TrafficCounters {
    pub total_bytes: u64,
    pub query_bytes: u64,
    pub chk_bytes: u64,
    pub hash_bytes: u64,
    pub query_peers: u32,
    pub chk_peers: u32,
    pub hash_peers: u32,
}

/// Requires enough received cover traffic before we send
///
/// A policy value `v <= 0` disables the check. `v >= 1000` asks for
/// `v / 1000` bytes of traffic of the same kind per byte sent and at least
/// `v % 1000` distinct peers for that kind. Smaller values ask for `v`
/// bytes of any traffic per byte sent.
#[derive(Debug, Default, Clone)]
pub struct TrafficPolicy {
    send_policy: i32,
    receive_policy: i32,
    counters: TrafficCounters,
}

impl TrafficPolicy {
    pub fn new(send_policy: i32, receive_policy: i32) -> Self {
        Self {
            send_policy,
            receive_policy,
            counters: TrafficCounters::default(),
        }
    }

    pub fn counters(&self) -> &TrafficCounters {
        &self.counters
    }

    fn peers(&self, kind: TrafficKind) -> u32 {
        match kind {
            TrafficKind::Query => self.counters.query_peers,
            TrafficKind::ChkResult => self.counters.chk_peers,
            TrafficKind::HashResult => self.counters.hash_peers,
        }
    }

    /// Take `cost` bytes of cover, all or nothing
    fn consume(&mut self, kind: TrafficKind, cost: u64, strict: bool) -> bool {
        let c = &mut self.counters;
        let pool = if !strict {
            &mut c.total_bytes
        } else {
            match kind {
                TrafficKind::Query => &mut c.query_bytes,
                TrafficKind::ChkResult => &mut c.chk_bytes,
                TrafficKind::HashResult => &mut c.hash_bytes,
            }
        };
        if *pool < cost {
            return false;
        }
        *pool -= cost;
        true
    }

    fn check(&mut self, value: i32, kind: TrafficKind, size: usize) -> bool {
        if value <= 0 {
            return true;
        }
        let value = value as u32;
        let strict = value >= 1000;
        let (byte_ratio, peer_count) = if strict {
            (value / 1000, value % 1000)
        } else {
            (value, 0)
        };
        if peer_count > 0 && self.peers(kind) < peer_count {
            debug!("Anonymity policy: {:?} needs {} peers", kind, peer_count);
            return false;
        }
        if byte_ratio > 0 && !self.consume(kind, byte_ratio as u64 * size as u64, strict) {
            debug!("Anonymity policy: not enough cover for {} bytes", size);
            return false;
        }
        true
    }
}

impl AnonymityPolicy for TrafficPolicy {
    fn permits(&mut self, kind: TrafficKind, size: usize) -> bool {
        let value = match kind {
            TrafficKind::Query => self.receive_policy,
            TrafficKind::ChkResult | TrafficKind::HashResult => self.send_policy,
        };
        self.check(value, kind, size)
    }

    fn record(&mut self, kind: Option<TrafficKind>, bytes: u64, peers: u32) {
        let c = &mut self.counters;
        c.total_bytes = c.total_bytes.saturating_add(bytes);
        match kind {
            Some(TrafficKind::Query) => {
                c.query_bytes = c.query_bytes.saturating_add(bytes);
                c.query_peers = c.query_peers.saturating_add(peers);
            }
            Some(TrafficKind::ChkResult) => {
                c.chk_bytes = c.chk_bytes.saturating_add(bytes);
                c.chk_peers = c.chk_peers.saturating_add(peers);
            }
            Some(TrafficKind::HashResult) => {
                c.hash_bytes = c.hash_bytes.saturating_add(bytes);
                c.hash_peers = c.hash_peers.saturating_add(peers);
            }
            None => {}
        }
    }
}

/// Tracks the average priority the daemon sees on the network
#[derive(Debug, Default, Clone, Copy)]
pub struct PriorityTracker {
    average: u32,
}

impl PriorityTracker {
    pub fn new(average: u32) -> Self {
        Self { average }
    }

    /// Record the daemon's latest average priority report
    pub fn observe(&mut self, average: u32) {
        self.average = average;
    }

    pub fn average(&self) -> u32 {
        self.average
    }

    /// Highest priority worth attaching to a single query
    pub fn max_priority(&self) -> u32 {
        self.average.saturating_add(2).saturating_mul(2)
    }
}
