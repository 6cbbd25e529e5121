//! Outstanding query table with retransmission and congestion control
//!
//! [`RequestTable`] is the synchronous state of a request manager: one entry
//! per tree node with an outstanding query, the queue of send continuations
//! and the congestion window. The async driver in [`crate::manager`] owns it
//! and feeds it the clock, daemon replies and send results.
//!
//! Retransmission follows RFC 2001 loosely:
//! - the TTL grows exponentially until it passes the running estimate of the
//!   initial TTL, then by small random steps, and is capped at `max_ttl`;
//! - a due entry is only resent when the number of requests in flight is at
//!   or below the congestion window, with a cubic fall-off above it;
//! - duplicate replies and acknowledged retransmissions halve the window,
//!   fresh replies grow it.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use chktree_core::{
    hash, to_hex, ClientMessage, ContentBlock, Hash, NodeId, ProgressStats, QueryMessage,
    QueryScheduler, ReplyHandler,
};

use crate::config::RequestManagerConfig;
use crate::connection::TransportError;
use crate::policy::{AnonymityPolicy, NoPolicy, PriorityTracker, TrafficKind};

/// Return value the daemon sends for an accepted message
pub const RETURN_OK: i32 = 1;

/// Highest priority carried over from a previous send
const PRIORITY_BOUND: u32 = 0xFF_FFFF;

/// Non-blocking outbound path for queries
pub trait QuerySender {
    fn send_query(&mut self, query: QueryMessage) -> Result<(), TransportError>;
}

impl QuerySender for mpsc::Sender<ClientMessage> {
    fn send_query(&mut self, query: QueryMessage) -> Result<(), TransportError> {
        mpsc::Sender::try_send(self, ClientMessage::Query(query)).map_err(|e| match e {
            TrySendError::Full(_) => TransportError::SendFailed("send queue full".into()),
            TrySendError::Closed(_) => TransportError::Disconnected,
        })
    }
}

impl QuerySender for Vec<QueryMessage> {
    fn send_query(&mut self, query: QueryMessage) -> Result<(), TransportError> {
        self.push(query);
        Ok(())
    }
}

/// Request counters reported alongside download progress
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RequestStats {
    pub requests_sent: u32,
    pub requests_pending: u32,
    pub current_retries: u32,
    pub total_retries: u32,
    pub current_ttl: u32,
    pub duplication_estimate: u32,
}

impl RequestStats {
    /// Copy the request counters into `stats`
    pub fn apply_to(&self, stats: &mut ProgressStats) {
        stats.requests_sent = self.requests_sent;
        stats.requests_pending = self.requests_pending;
        stats.current_retries = self.current_retries;
        stats.total_retries = self.total_retries;
        stats.current_ttl = self.current_ttl;
        stats.duplication_estimate = self.duplication_estimate;
    }
}

#[derive(Debug)]
struct RequestEntry {
    node: NodeId,
    handler: ReplyHandler,
    message: QueryMessage,
    /// Earliest time the entry counts as sent; `None` until the first send
    last_send: Option<i64>,
    tries: u32,
    /// Replies since the last retransmission
    successful_replies: u32,
}

impl RequestEntry {
    fn expires(&self) -> Option<i64> {
        self.last_send.map(|last| last + self.message.ttl as i64)
    }
}

/// State needed to undo a send the daemon never accepted
#[derive(Debug)]
struct SendContinuation {
    /// `None` once the entry is gone
    node: Option<NodeId>,
    prev_ttl: i32,
    prev_priority: u32,
    prev_last_send: Option<i64>,
}

/// Result of one scheduling pass
#[derive(Debug, Default)]
pub struct Schedule {
    /// When to run again; `None` if nothing is outstanding
    pub next: Option<Duration>,
    /// Nodes whose queries have gone unanswered for very long
    pub unavailable: Vec<NodeId>,
}

/// Outstanding queries of one download
pub struct RequestTable {
    config: RequestManagerConfig,
    entries: Vec<RequestEntry>,
    continuations: VecDeque<SendContinuation>,
    congestion_window: u32,
    ssthresh: u32,
    /// Running estimate of the TTL a query needs, in milliseconds
    initial_ttl: u64,
    last_congestion: Option<i64>,
    stats: RequestStats,
    origin: Instant,
    /// Milliseconds since `origin`
    now: i64,
    wake: bool,
    rng: StdRng,
    policy: Box<dyn AnonymityPolicy>,
    priorities: PriorityTracker,
}

impl RequestTable {
    pub fn new(config: RequestManagerConfig) -> Self {
        Self {
            congestion_window: config.initial_congestion_window,
            ssthresh: config.initial_ssthresh,
            initial_ttl: config.initial_ttl_ms,
            config,
            entries: Vec::new(),
            continuations: VecDeque::new(),
            last_congestion: None,
            stats: RequestStats::default(),
            origin: Instant::now(),
            now: 0,
            wake: false,
            rng: StdRng::from_entropy(),
            policy: Box::new(NoPolicy),
            priorities: PriorityTracker::default(),
        }
    }

    pub fn with_policy(mut self, policy: impl AnonymityPolicy + 'static) -> Self {
        self.policy = Box::new(policy);
        self
    }

    /// Starting point for the priority bound; a running download updates it
    /// through [`RequestTable::observe_average_priority`]
    pub fn with_priorities(mut self, priorities: PriorityTracker) -> Self {
        self.priorities = priorities;
        self
    }

    /// Use a deterministic random source
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Read the clock; call before every operation
    pub fn tick(&mut self) {
        self.now = self.origin.elapsed().as_millis() as i64;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a query is outstanding for `node`
    pub fn contains(&self, node: NodeId) -> bool {
        self.entries.iter().any(|e| e.node == node)
    }

    pub fn congestion_window(&self) -> u32 {
        self.congestion_window
    }

    pub fn ssthresh(&self) -> u32 {
        self.ssthresh
    }

    pub fn initial_ttl_ms(&self) -> u64 {
        self.initial_ttl
    }

    pub fn stats(&self) -> &RequestStats {
        &self.stats
    }

    pub fn priorities_mut(&mut self) -> &mut PriorityTracker {
        &mut self.priorities
    }

    /// Feed traffic seen by the daemon to the anonymity policy
    pub fn record_traffic(&mut self, kind: Option<TrafficKind>, bytes: u64, peers: u32) {
        self.policy.record(kind, bytes, peers);
    }

    /// Bound later query priorities by the daemon's latest average
    pub fn observe_average_priority(&mut self, average: u32) {
        self.priorities.observe(average);
    }

    /// Sends waiting for the daemon's verdict
    pub fn unresolved_sends(&self) -> usize {
        self.continuations.len()
    }

    /// True once after a new request was queued
    pub fn take_wake(&mut self) -> bool {
        std::mem::take(&mut self.wake)
    }

    fn position(&self, node: NodeId) -> Option<usize> {
        self.entries.iter().position(|e| e.node == node)
    }

    fn random_below(&mut self, bound: i64) -> i64 {
        if bound <= 0 {
            0
        } else {
            self.rng.gen_range(0..bound)
        }
    }

    // ============ SCHEDULING ============

    /// (Re)issue every due query the congestion window admits
    pub fn run_schedule(&mut self, out: &mut dyn QuerySender) -> Schedule {
        self.wake = false;
        if self.entries.is_empty() {
            return Schedule::default();
        }
        let now = self.now;
        let decrement = self.config.ttl_decrement_ms as i64;
        let count = self.entries.len() as i64;

        let mut pending = self
            .entries
            .iter()
            .filter(|e| e.expires().is_some_and(|t| t >= now))
            .count() as i64;
        let mut min_sleep = self.config.max_sleep_ms as i64;
        let mut unavailable = Vec::new();

        let mut order: Vec<usize> = (0..self.entries.len()).collect();
        order.shuffle(&mut self.rng);
        for j in order {
            let entry = &self.entries[j];
            let due = entry.expires().map_or(true, |t| t <= now - decrement);
            let delay = if due {
                let ttl = entry.message.ttl as i64;
                let mut over = pending - self.congestion_window as i64;
                if over <= 0 {
                    over = -1;
                }
                let cubed = over.saturating_mul(over).saturating_mul(over);
                let scaled = cubed.saturating_mul(count);
                // cubic fall-off above the window, with an occasional override
                if cubed <= 0 || scaled <= 0 || self.random_below(scaled) == 0 {
                    if self.issue(j, out) {
                        unavailable.push(self.entries[j].node);
                    }
                    pending += 1;
                    ttl + 10
                } else {
                    debug!(
                        "Congestion control: {} pending, window {}, initial TTL {}",
                        pending, self.congestion_window, self.initial_ttl
                    );
                    0
                }
            } else {
                entry.expires().map_or(0, |t| t + decrement - now)
            };
            min_sleep = min_sleep.min(delay);
        }

        let min_sleep = min_sleep.max(self.config.min_sleep_ms as i64);
        Schedule {
            next: Some(Duration::from_millis(min_sleep as u64)),
            unavailable,
        }
    }

    /// Send entry `j`; returns true if its content seems unavailable
    fn issue(&mut self, j: usize, out: &mut dyn QuerySender) -> bool {
        let now = self.now;
        let decrement = self.config.ttl_decrement_ms as i64;
        let initial = self.initial_ttl as i64;
        let max_ttl = self.config.max_ttl_ms() as i64;

        let (prev_ttl, last_send, tries) = {
            let entry = &self.entries[j];
            (entry.message.ttl, entry.last_send, entry.tries as i64)
        };
        let current = prev_ttl as i64;
        let mut ttl = if last_send.is_none() {
            initial
        } else if current > max_ttl {
            self.entries[j].message.ttl = max_ttl as i32;
            max_ttl + self.random_below(2 * decrement)
        } else if current > initial {
            // slow back-off
            let rd = if initial == 0 { current } else { current / initial };
            let rd = (decrement / rd.max(1)).max(1);
            current + self.random_below(50 + rd)
        } else {
            current + self.random_below(current + 2 * decrement)
        };

        let mut next_send = now + 2 * decrement;
        if self.random_below(1 + tries) > 1 {
            // linear extra back-off against repeated collisions
            next_send += self.random_below(decrement * (1 + tries));
        }
        self.entries[j].last_send = Some(next_send);

        let size = self.entries[j].message.wire_size();
        if !self.policy.permits(TrafficKind::Query, size) {
            debug!("Not sending query for {} due to anonymity policy", self.entries[j].node);
            return false;
        }

        let mut prev_priority = self.entries[j].message.priority;
        if prev_priority > PRIORITY_BOUND {
            prev_priority = self.random_below(PRIORITY_BOUND as i64) as u32;
        }
        self.entries[j].tries += 1;
        let tries = self.entries[j].tries;

        if self.entries[j].successful_replies > 0 {
            // wait out the current TTL once per reply received
            ttl = self.entries[j].message.ttl as i64;
            self.entries[j].successful_replies /= 2;
        } else {
            ttl = ttl.min((prev_priority as i64 + 8) * decrement);
            let mut priority = prev_priority as i64 + self.random_below(tries as i64);
            let mut count = self.entries[j].message.queries.len() as i64;
            if count >= 2 {
                // the super hash is not a block of its own
                count -= 1;
            }
            let max_priority = self.priorities.max_priority() as i64 * count;
            if priority > max_priority {
                priority = max_priority / 2 + self.random_below(1 + max_priority / 2);
            }
            let entry = &mut self.entries[j];
            entry.message.ttl = ttl.clamp(0, i32::MAX as i64) as i32;
            entry.message.priority = priority.clamp(0, u32::MAX as i64) as u32;
        }

        let entries = self.entries.len() as u32;
        self.stats.requests_pending = entries;
        self.stats.requests_sent = entries;
        self.stats.current_ttl = ttl.clamp(0, u32::MAX as i64) as u32;

        let entry = &self.entries[j];
        debug!(
            "Sending query {} for {} (try {}, ttl {}, priority {})",
            to_hex(&entry.message.queries[0]),
            entry.node,
            tries,
            entry.message.ttl,
            entry.message.priority
        );
        let unavailable = tries % (self.config.max_tries.max(1) * 50) == 0;
        if unavailable {
            warn!(
                "Content {} seems to be not available on the network",
                to_hex(&entry.message.queries[0])
            );
        }

        let node = entry.node;
        let message = entry.message.clone();
        self.continuations.push_back(SendContinuation {
            node: Some(node),
            prev_ttl,
            prev_priority,
            prev_last_send: last_send,
        });
        if let Err(e) = out.send_query(message) {
            warn!("Could not send request to daemon: {}", e);
            if let Some(con) = self.continuations.pop_back() {
                self.run_continuation(con, false);
            }
        }
        unavailable
    }

    // ============ SEND RESULTS ============

    /// The daemon acknowledged (or refused) the oldest unresolved send
    pub fn on_return_value(&mut self, value: i32) {
        match self.continuations.pop_front() {
            Some(con) => self.run_continuation(con, value == RETURN_OK),
            None => warn!("Return value {} without an outstanding send", value),
        }
    }

    /// The oldest unresolved send never reached the daemon
    pub fn on_send_failed(&mut self) {
        if let Some(con) = self.continuations.pop_front() {
            self.run_continuation(con, false);
        }
    }

    fn run_continuation(&mut self, con: SendContinuation, ok: bool) {
        let Some(j) = con.node.and_then(|node| self.position(node)) else {
            return;
        };
        let entry = &mut self.entries[j];
        if !ok {
            debug!("Sending for {} canceled, reverting", entry.node);
            entry.message.ttl = con.prev_ttl;
            entry.message.priority = con.prev_priority;
            entry.last_send = con.prev_last_send;
            entry.tries = entry.tries.saturating_sub(1);
            return;
        }
        if entry.tries > 1 {
            // retransmission: treat as congestion
            self.congestion_signal();
            self.stats.total_retries += 1;
            self.stats.current_retries += 1;
        }
    }

    /// Halve the window, at most once per initial TTL
    fn congestion_signal(&mut self) {
        if let Some(last) = self.last_congestion {
            if self.now - last < self.initial_ttl as i64 {
                return;
            }
        }
        let halved = (self.congestion_window / 2).max(2);
        debug!(
            "Congestion: window {} -> {}, threshold {} -> {}",
            self.congestion_window, halved, self.ssthresh, halved
        );
        self.congestion_window = halved;
        self.ssthresh = halved;
        self.last_congestion = Some(self.now);
    }

    // ============ REPLIES ============

    /// Find the entry a reply answers
    ///
    /// Returns the node, its handler and the matched query hash. A reply
    /// that matches nothing counts as a duplicate.
    pub fn match_reply(&mut self, reply: &ContentBlock) -> Option<(NodeId, ReplyHandler, Hash)> {
        let query = hash(reply);
        let Some(j) = self.entries.iter().rposition(|e| e.message.contains(&query)) else {
            self.stats.duplication_estimate += 1;
            self.congestion_signal();
            debug!(
                "Received useless data matching {} ({} duplicates, initial TTL {} ms)",
                to_hex(&query),
                self.stats.duplication_estimate,
                self.initial_ttl
            );
            return None;
        };

        let now = self.now;
        let entry = &self.entries[j];
        let (node, handler) = (entry.node, entry.handler);
        if let Some(last) = entry.last_send.filter(|&last| last < now) {
            let decrement = self.config.ttl_decrement_ms as i64;
            let initial = self.initial_ttl as i64;
            let ettl = (entry.message.ttl as i64 - decrement).max(0);
            // a slow reply that still arrived in time says little about the TTL
            let weight = if ettl > 4 * initial && now - last < initial {
                self.config.ttl_weight_fast as i64
            } else {
                self.config.ttl_weight as i64
            };
            self.initial_ttl = ((initial * weight + ettl) / (weight + 1)) as u64;

            if self.congestion_window < self.ssthresh {
                self.congestion_window += 2;
            } else {
                self.congestion_window += 1;
            }
        }
        debug!("Reply {} for {}", to_hex(&query), node);
        Some((node, handler, query))
    }

    // ============ TEARDOWN ============

    /// Drop every entry after a fatal error; late return values stay matched
    pub fn abort_all(&mut self) {
        for con in self.continuations.iter_mut() {
            con.node = None;
        }
        self.entries.clear();
        self.wake = false;
    }

    /// Forget everything
    pub fn clear(&mut self) {
        self.entries.clear();
        self.continuations.clear();
        self.wake = false;
    }

    fn remove(&mut self, j: usize) {
        let entry = self.entries.swap_remove(j);
        if entry.tries > 1 {
            self.stats.current_retries = self.stats.current_retries.saturating_sub(entry.tries - 1);
        }
        for con in self.continuations.iter_mut() {
            if con.node == Some(entry.node) {
                con.node = None;
            }
        }
    }

    /// Log the table
    pub fn print(&self) {
        debug!(
            "RM TTL {} duplicates {} window {}",
            self.initial_ttl, self.stats.duplication_estimate, self.congestion_window
        );
        for (i, entry) in self.entries.iter().enumerate() {
            debug!(
                "{:4}: {} for node {} ({} tries)",
                i,
                to_hex(&entry.message.queries[0]),
                entry.node,
                entry.tries
            );
        }
    }
}

impl QueryScheduler for RequestTable {
    fn request(&mut self, node: NodeId, handler: ReplyHandler, query: QueryMessage) {
        self.entries.push(RequestEntry {
            node,
            handler,
            message: query,
            last_send: None,
            tries: 0,
            successful_replies: 0,
        });
        self.wake = true;
    }

    fn update(&mut self, node: NodeId, query: Option<QueryMessage>) {
        let Some(j) = self.position(node) else {
            return;
        };
        match query {
            Some(mut query) => {
                let grace = self.now + 2 * self.config.ttl_decrement_ms as i64;
                let entry = &mut self.entries[j];
                query.priority = entry.message.priority;
                query.ttl = entry.message.ttl;
                entry.message = query;
                entry.successful_replies += 1;
                entry.last_send = Some(grace);
            }
            None => self.remove(j),
        }
    }

    fn endgame(&mut self) {
        for entry in &mut self.entries {
            entry.message.ttl /= 2;
        }
    }

    fn release(&mut self, node: NodeId) {
        if let Some(j) = self.position(node) {
            warn!("Query for {} still outstanding when freed", node);
            self.remove(j);
        }
    }
}
