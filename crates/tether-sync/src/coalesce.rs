//! Bounded-window event coalescing.
//!
//! High-frequency events (status ticks, streaming part updates) are
//! collapsed per logical update slot before delivery: within one flush
//! window the latest payload for a key supersedes earlier ones. Superseded
//! entries are nulled in place rather than removed so queued indices stay
//! stable. Events without a derivable key are never coalesced, and
//! ordering across distinct keys is preserved.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use tether_types::EventPayload;

use crate::store::ScopeKey;

/// Identifies "the same logical update slot" across raw events.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CoalesceKey {
    SessionStatus {
        scope: ScopeKey,
        session_id: String,
    },
    LspStatus {
        scope: ScopeKey,
    },
    Part {
        scope: ScopeKey,
        message_id: String,
        part_id: String,
    },
}

impl CoalesceKey {
    /// Derives the coalescing key for an event, if it has one.
    pub fn derive(scope: &ScopeKey, payload: &EventPayload) -> Option<Self> {
        match payload {
            EventPayload::SessionStatusChanged { session_id, .. } => {
                Some(CoalesceKey::SessionStatus {
                    scope: scope.clone(),
                    session_id: session_id.clone(),
                })
            }
            EventPayload::LspUpdated {} => Some(CoalesceKey::LspStatus {
                scope: scope.clone(),
            }),
            EventPayload::PartUpdated { part } => Some(CoalesceKey::Part {
                scope: scope.clone(),
                message_id: part.message_id.clone(),
                part_id: part.id.clone(),
            }),
            _ => None,
        }
    }
}

/// One queued event tagged with its destination scope.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedEvent {
    pub scope: ScopeKey,
    pub payload: EventPayload,
}

/// Coalescing queue with a fixed flush cadence measured from the
/// previous flush.
pub struct Coalescer {
    queue: Vec<Option<QueuedEvent>>,
    index: HashMap<CoalesceKey, usize>,
    flush_interval: Duration,
    last_flush: Instant,
}

impl Coalescer {
    pub fn new(flush_interval: Duration) -> Self {
        Self {
            queue: Vec::new(),
            index: HashMap::new(),
            flush_interval,
            last_flush: Instant::now(),
        }
    }

    /// Queues an event, superseding an unflushed entry with the same key.
    pub fn push(&mut self, scope: ScopeKey, payload: EventPayload) {
        if let Some(key) = CoalesceKey::derive(&scope, &payload) {
            if let Some(&slot) = self.index.get(&key) {
                self.queue[slot] = None;
            }
            self.index.insert(key, self.queue.len());
        }
        self.queue.push(Some(QueuedEvent { scope, payload }));
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Time until the next flush is due, clamped to zero.
    pub fn next_flush_delay(&self) -> Duration {
        self.flush_interval.saturating_sub(self.last_flush.elapsed())
    }

    /// Takes the surviving entries as one atomic batch and resets the
    /// queue, key index, and flush clock.
    pub fn take(&mut self) -> Vec<QueuedEvent> {
        self.last_flush = Instant::now();
        self.index.clear();
        self.queue.drain(..).flatten().collect()
    }
}
