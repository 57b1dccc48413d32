//! Which live connections belong to which project group.
//!
//! The registry is the only structure shared by every connection task.
//! It maps a [`GroupKey`] to the members' outbound queues:
//!
//! ```text
//! project_7 ──┬── conn a ─► mpsc ─► socket a
//!             └── conn b ─► mpsc ─► socket b
//! project_8 ───── conn c ─► mpsc ─► socket c
//! ```
//!
//! Backed by a sharded `DashMap`, so joins and leaves from different
//! projects do not contend, and every operation is synchronous. That lets
//! [`Membership`] deregister from `Drop`, whatever path the connection
//! task took to exit.

use dashmap::DashMap;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::model::ProjectId;

/// Opaque identifier of one live connection.
pub type ConnectionId = Uuid;

/// Outbound queue of one member. Frames are pre-encoded and shared.
pub type Outbox = mpsc::Sender<Arc<str>>;

/// Broadcast group of a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKey(ProjectId);

impl GroupKey {
    pub fn project(id: ProjectId) -> Self {
        Self(id)
    }

    pub fn project_id(&self) -> ProjectId {
        self.0
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "project_{}", self.0)
    }
}

/// Connections per project group, each with its outbound queue.
#[derive(Debug, Default)]
pub struct MembershipRegistry {
    groups: DashMap<GroupKey, HashMap<ConnectionId, Outbox>>,
}

impl MembershipRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to a group, creating the group on first join.
    ///
    /// Joining again with the same id keeps the original outbox and
    /// returns `false`.
    pub fn join(&self, key: GroupKey, id: ConnectionId, outbox: Outbox) -> bool {
        let mut members = self.groups.entry(key).or_default();
        match members.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(outbox);
                true
            }
        }
    }

    /// Join and get a guard that leaves when dropped.
    pub fn join_scoped(self: &Arc<Self>, key: GroupKey, id: ConnectionId, outbox: Outbox) -> Membership {
        self.join(key, id, outbox);
        Membership {
            registry: Arc::clone(self),
            key,
            id,
        }
    }

    /// Remove a connection from a group. Leaving a group the connection is
    /// not in is a no-op. Empty groups are discarded.
    pub fn leave(&self, key: GroupKey, id: ConnectionId) -> bool {
        let removed = match self.groups.get_mut(&key) {
            Some(mut members) => members.remove(&id).is_some(),
            None => false,
        };
        // A join racing in between keeps the group alive: the emptiness
        // check runs under the shard lock.
        self.groups.remove_if(&key, |_, members| members.is_empty());
        removed
    }

    pub fn members_of(&self, key: GroupKey) -> HashSet<ConnectionId> {
        self.groups
            .get(&key)
            .map(|members| members.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_member(&self, key: GroupKey, id: ConnectionId) -> bool {
        self.groups
            .get(&key)
            .is_some_and(|members| members.contains_key(&id))
    }

    /// Snapshot of the outboxes of a group at this instant.
    pub(crate) fn outboxes(&self, key: GroupKey) -> Vec<(ConnectionId, Outbox)> {
        self.groups
            .get(&key)
            .map(|members| {
                members
                    .iter()
                    .map(|(id, outbox)| (*id, outbox.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of non-empty groups.
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Number of registered connections across all groups.
    pub fn connection_count(&self) -> usize {
        self.groups.iter().map(|group| group.len()).sum()
    }
}

/// Registration of one connection in one group, released on drop.
#[derive(Debug)]
pub struct Membership {
    registry: Arc<MembershipRegistry>,
    key: GroupKey,
    id: ConnectionId,
}

impl Membership {
    pub fn key(&self) -> GroupKey {
        self.key
    }
}

impl Drop for Membership {
    fn drop(&mut self) {
        self.registry.leave(self.key, self.id);
        log::debug!("Connection {} left {}", self.id, self.key);
    }
}
