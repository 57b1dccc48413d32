//! Fan-out of board events to every member of a project group.
//!
//! A publish encodes the frame once, snapshots the group's outboxes and
//! `try_send`s a shared `Arc<str>` into each. Nothing on this path awaits:
//! a member whose queue is full loses that frame (counted as dropped) and
//! the rest of the group is unaffected.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;

use crate::membership::{GroupKey, MembershipRegistry};
use crate::protocol::{Outbound, ProtocolError};

/// Statistics for monitoring fan-out health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelStats {
    /// Frames published, regardless of audience size
    pub published: u64,
    /// Frames queued to a member
    pub delivered: u64,
    /// Frames a lagging member did not get
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct AtomicChannelStats {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

/// Per-project broadcast over the membership registry.
#[derive(Debug)]
pub struct ProjectChannel {
    registry: Arc<MembershipRegistry>,
    stats: AtomicChannelStats,
}

impl ProjectChannel {
    pub fn new(registry: Arc<MembershipRegistry>) -> Self {
        Self {
            registry,
            stats: AtomicChannelStats::default(),
        }
    }

    pub fn registry(&self) -> &Arc<MembershipRegistry> {
        &self.registry
    }

    /// Deliver a message to every current member of `key`, sender included.
    ///
    /// Returns how many members had it queued.
    pub fn publish(
        &self,
        key: GroupKey,
        message: impl Into<Outbound>,
    ) -> Result<usize, ProtocolError> {
        let message = message.into();
        let encoded: Arc<str> = Arc::from(message.encode()?);
        let delivered = self.publish_raw(key, encoded);
        log::debug!(
            "Published {} to {key} ({delivered} members)",
            message.action().unwrap_or("<untagged>")
        );
        Ok(delivered)
    }

    /// Fan out an already-encoded frame.
    pub fn publish_raw(&self, key: GroupKey, encoded: Arc<str>) -> usize {
        let mut delivered = 0usize;
        let mut dropped = 0u64;

        for (id, outbox) in self.registry.outboxes(key) {
            match outbox.try_send(Arc::clone(&encoded)) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    dropped += 1;
                    log::warn!("Connection {id} in {key} is lagging; frame dropped");
                }
                Err(TrySendError::Closed(_)) => {
                    // Connection is shutting down and will leave shortly
                    log::trace!("Connection {id} in {key} already closed");
                }
            }
        }

        self.stats.published.fetch_add(1, Ordering::Relaxed);
        self.stats
            .delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        self.stats.dropped.fetch_add(dropped, Ordering::Relaxed);
        delivered
    }

    /// Lock-free snapshot of the counters.
    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            published: self.stats.published.load(Ordering::Relaxed),
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
        }
    }
}
