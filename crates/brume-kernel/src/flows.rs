//! FlowBus pub/sub for cache and pool state changes.
//!
//! Subscribers use NATS-style subject patterns to filter events:
//! - `*` matches exactly one token: `cache.*` matches `cache.updated`
//! - `>` matches one or more tokens (only at end): `pool.>` matches `pool.circuits.changed`
//! - Exact match: `cache.deleted` only matches `cache.deleted`
//!
//! Cache keys contain dots and slashes, so they travel in the payload, not
//! in the subject; subscribers interested in one key filter on it.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::broadcast;

use crate::cache::RawState;

// ============================================================================
// Pattern Matching
// ============================================================================

/// Check if a subject matches a pattern.
pub fn matches_pattern(pattern: &str, subject: &str) -> bool {
    let pattern_tokens: Vec<&str> = pattern.split('.').collect();
    let subject_tokens: Vec<&str> = subject.split('.').collect();

    let mut pi = 0;
    let mut si = 0;

    while pi < pattern_tokens.len() && si < subject_tokens.len() {
        match pattern_tokens[pi] {
            // `>` must be last and swallows the remaining tokens
            ">" => return pi == pattern_tokens.len() - 1,
            "*" => {
                pi += 1;
                si += 1;
            }
            token => {
                if token != subject_tokens[si] {
                    return false;
                }
                pi += 1;
                si += 1;
            }
        }
    }

    pi == pattern_tokens.len() && si == subject_tokens.len()
}

// ============================================================================
// Flow Message Types
// ============================================================================

/// Payloads that know their subject.
pub trait HasSubject {
    fn subject(&self) -> String;
}

/// A message published to the flow bus.
#[derive(Clone, Debug)]
pub struct FlowMessage<T> {
    pub subject: String,
    pub payload: T,
    pub timestamp: Instant,
}

impl<T: HasSubject> FlowMessage<T> {
    pub fn new(payload: T) -> Self {
        Self { subject: payload.subject(), payload, timestamp: Instant::now() }
    }
}

// ============================================================================
// Cache Flow Events
// ============================================================================

/// Raw cache state changes.
#[derive(Clone, Debug, PartialEq)]
pub enum CacheFlow {
    /// A key was written (or re-published). `None` records a known absence.
    Updated { key: String, state: Option<RawState> },
    /// A key was removed from the cache.
    Deleted { key: String },
}

impl CacheFlow {
    pub fn key(&self) -> &str {
        match self {
            CacheFlow::Updated { key, .. } | CacheFlow::Deleted { key } => key,
        }
    }
}

impl HasSubject for CacheFlow {
    fn subject(&self) -> String {
        match self {
            CacheFlow::Updated { .. } => "cache.updated".to_string(),
            CacheFlow::Deleted { .. } => "cache.deleted".to_string(),
        }
    }
}

// ============================================================================
// Pool Flow Events
// ============================================================================

/// Pool occupancy changes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolFlow {
    pub pool: String,
    pub size: usize,
    pub capacity: usize,
}

impl HasSubject for PoolFlow {
    fn subject(&self) -> String {
        format!("pool.{}.changed", self.pool)
    }
}

// ============================================================================
// FlowBus
// ============================================================================

/// Typed broadcast bus with subject filtering on the receiving side.
pub struct FlowBus<T: Clone + Send + 'static> {
    tx: broadcast::Sender<FlowMessage<T>>,
    capacity: usize,
}

impl<T: Clone + Send + 'static> FlowBus<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<T: Clone + Send + HasSubject + 'static> FlowBus<T> {
    /// Publish a payload. Returns the number of subscribers that received it.
    pub fn publish(&self, payload: T) -> usize {
        self.tx.send(FlowMessage::new(payload)).unwrap_or(0)
    }

    /// Subscribe to messages matching a pattern.
    pub fn subscribe(&self, pattern: &str) -> Subscription<T> {
        Subscription { pattern: pattern.to_string(), rx: self.tx.subscribe() }
    }
}

impl<T: Clone + Send + 'static> Clone for FlowBus<T> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone(), capacity: self.capacity }
    }
}

// ============================================================================
// Subscription
// ============================================================================

/// A subscription to a FlowBus with pattern filtering.
pub struct Subscription<T: Clone> {
    pattern: String,
    rx: broadcast::Receiver<FlowMessage<T>>,
}

impl<T: Clone> Subscription<T> {
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Receive the next matching message. Returns None once the bus is gone.
    pub async fn recv(&mut self) -> Option<FlowMessage<T>> {
        loop {
            match self.rx.recv().await {
                Ok(msg) => {
                    if matches_pattern(&self.pattern, &msg.subject) {
                        return Some(msg);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(pattern = %self.pattern, lagged = n, "Flow subscription lagged behind");
                }
            }
        }
    }

    /// Receive the next matching message without waiting.
    pub fn try_recv(&mut self) -> Option<FlowMessage<T>> {
        loop {
            match self.rx.try_recv() {
                Ok(msg) => {
                    if matches_pattern(&self.pattern, &msg.subject) {
                        return Some(msg);
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Closed) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    tracing::warn!(pattern = %self.pattern, lagged = n, "Flow subscription lagged behind");
                }
            }
        }
    }
}

impl<T: Clone> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("pattern", &self.pattern).finish_non_exhaustive()
    }
}

// ============================================================================
// Shared FlowBus Handles
// ============================================================================

pub type SharedCacheFlowBus = Arc<FlowBus<CacheFlow>>;
pub type SharedPoolFlowBus = Arc<FlowBus<PoolFlow>>;

pub fn shared_cache_flow_bus(capacity: usize) -> SharedCacheFlowBus {
    Arc::new(FlowBus::new(capacity))
}

pub fn shared_pool_flow_bus(capacity: usize) -> SharedPoolFlowBus {
    Arc::new(FlowBus::new(capacity))
}
