//! Offline queue for subscription intents.
//!
//! While no connection is available, subscribe and unsubscribe intents are
//! buffered here in issue order. On reconnect the session replays them from
//! the front, marking each one done once the transport accepts it. An intent
//! is queued at most once per subscription and kind, so repeated calls while
//! offline never cause duplicate submissions.
//!
//! With a path configured the queue is durable: intents survive a restart
//! and are replayed by the next session.

mod log;

use crate::error::Result;
use crate::transport::{RemovalIntent, SubscriptionIntent};
use crate::types::{SubscriptionId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;

use self::log::QueueLog;

/// A buffered operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Intent {
    Subscribe(SubscriptionIntent),
    Unsubscribe(RemovalIntent),
}

impl Intent {
    pub fn subscription(&self) -> SubscriptionId {
        match self {
            Intent::Subscribe(i) => i.id,
            Intent::Unsubscribe(i) => i.id,
        }
    }

    fn same_kind(&self, other: &Intent) -> bool {
        matches!(
            (self, other),
            (Intent::Subscribe(_), Intent::Subscribe(_))
                | (Intent::Unsubscribe(_), Intent::Unsubscribe(_))
        )
    }
}

/// An intent with its position in the queue.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedIntent {
    pub seq: u64,
    pub intent: Intent,
    pub queued_at: Timestamp,
}

pub struct OfflineQueue {
    entries: VecDeque<QueuedIntent>,
    next_seq: u64,
    log: Option<QueueLog>,
}

impl OfflineQueue {
    /// A queue that lives only as long as the session.
    pub fn in_memory() -> Self {
        Self {
            entries: VecDeque::new(),
            next_seq: 1,
            log: None,
        }
    }

    /// Open a durable queue at `path`, restoring anything still pending.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (log, pending) = QueueLog::open(path)?;
        let next_seq = pending.iter().map(|e| e.seq).max().unwrap_or(0) + 1;
        Ok(Self {
            entries: pending.into(),
            next_seq,
            log: Some(log),
        })
    }

    pub fn is_durable(&self) -> bool {
        self.log.is_some()
    }

    /// Append an intent. If the same kind of intent for the same subscription
    /// is already queued, nothing is added and its sequence is returned.
    pub fn enqueue(&mut self, intent: Intent) -> Result<u64> {
        if let Some(existing) = self.entries.iter().find(|e| {
            e.intent.subscription() == intent.subscription() && e.intent.same_kind(&intent)
        }) {
            return Ok(existing.seq);
        }

        let queued = QueuedIntent {
            seq: self.next_seq,
            intent,
            queued_at: Timestamp::now(),
        };
        if let Some(log) = self.log.as_mut() {
            log.append(&queued)?;
        }
        self.next_seq += 1;
        let seq = queued.seq;
        self.entries.push_back(queued);
        Ok(seq)
    }

    /// Oldest pending intent.
    pub fn front(&self) -> Option<&QueuedIntent> {
        self.entries.front()
    }

    /// Mark `seq` as handled. Returns false if it was not queued.
    pub fn complete(&mut self, seq: u64) -> Result<bool> {
        let Some(pos) = self.entries.iter().position(|e| e.seq == seq) else {
            return Ok(false);
        };
        self.entries.remove(pos);
        if let Some(log) = self.log.as_mut() {
            log.mark_done(seq)?;
            if self.entries.is_empty() || log.needs_compaction() {
                let pending: Vec<_> = self.entries.iter().cloned().collect();
                log.compact(&pending)?;
            }
        }
        Ok(true)
    }

    /// Drop a queued subscribe for `id` that was never sent. Returns whether
    /// one was found.
    pub fn cancel_subscribe(&mut self, id: SubscriptionId) -> Result<bool> {
        let seq = self
            .entries
            .iter()
            .find(|e| matches!(&e.intent, Intent::Subscribe(i) if i.id == id))
            .map(|e| e.seq);
        match seq {
            Some(seq) => self.complete(seq),
            None => Ok(false),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedIntent> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
