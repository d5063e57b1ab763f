//! Queue of placements deferred for lack of a free slot.
//!
//! Entries are never deleted; resolution only moves them to `Processed` or
//! `Failed`.

use super::store::PositionStore;
use super::MatrixError;
use crate::domain::{
    Leg, MatrixPosition, MemberId, OverflowEntry, OverflowId, OverflowStatus, PositionId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Result of a single resolution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum ResolveOutcome {
    Placed { position: MatrixPosition },
    StillDeferred,
}

/// Summary of a sweep over every pending entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub placed: Vec<OverflowId>,
    pub still_deferred: Vec<OverflowId>,
    pub failed: Vec<OverflowId>,
}

#[derive(Debug, Clone, Default)]
pub struct OverflowQueue {
    entries: BTreeMap<OverflowId, OverflowEntry>,
    next_id: u64,
}

impl OverflowQueue {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub fn restore(entries: Vec<OverflowEntry>) -> Self {
        let mut queue = Self::new();
        for entry in entries {
            queue.next_id = queue.next_id.max(entry.id.as_u64() + 1);
            queue.entries.insert(entry.id, entry);
        }
        queue
    }

    pub fn enqueue(
        &mut self,
        member_id: MemberId,
        intended_parent_id: PositionId,
        leg: Leg,
        level: u32,
        now: DateTime<Utc>,
    ) -> OverflowEntry {
        let id = OverflowId::new(self.next_id);
        self.next_id += 1;
        let entry = OverflowEntry {
            id,
            member_id,
            intended_parent_id,
            leg,
            level,
            status: OverflowStatus::Pending,
            attempts: 0,
            placed_position_id: None,
            created_at: now,
            updated_at: now,
        };
        self.entries.insert(id, entry.clone());
        entry
    }

    pub fn get(&self, id: OverflowId) -> Result<&OverflowEntry, MatrixError> {
        self.entries
            .get(&id)
            .ok_or(MatrixError::OverflowNotFound(id))
    }

    /// Pending entry already queued for `member`, if any.
    pub fn pending_for(&self, member: &MemberId) -> Option<&OverflowEntry> {
        self.entries
            .values()
            .find(|e| e.is_pending() && &e.member_id == member)
    }

    /// Pending entries in creation order.
    pub fn pending_ids(&self) -> Vec<OverflowId> {
        self.entries
            .values()
            .filter(|e| e.is_pending())
            .map(|e| e.id)
            .collect()
    }

    /// Pending entries whose intended parent lies in the subtree of `root`.
    pub fn pending_under(&self, store: &PositionStore, root: PositionId) -> Vec<OverflowEntry> {
        self.entries
            .values()
            .filter(|e| e.is_pending())
            .filter(|e| store.depth_below(root, e.intended_parent_id).is_some())
            .cloned()
            .collect()
    }

    pub fn all(&self) -> impl Iterator<Item = &OverflowEntry> {
        self.entries.values()
    }

    pub fn mark_processed(
        &mut self,
        id: OverflowId,
        position: PositionId,
        now: DateTime<Utc>,
    ) -> Result<OverflowEntry, MatrixError> {
        self.update(id, now, |entry| {
            entry.status = OverflowStatus::Processed;
            entry.placed_position_id = Some(position);
        })
    }

    pub fn mark_failed(
        &mut self,
        id: OverflowId,
        now: DateTime<Utc>,
    ) -> Result<OverflowEntry, MatrixError> {
        self.update(id, now, |entry| entry.status = OverflowStatus::Failed)
    }

    pub fn mark_attempted(
        &mut self,
        id: OverflowId,
        now: DateTime<Utc>,
    ) -> Result<OverflowEntry, MatrixError> {
        self.update(id, now, |_| {})
    }

    fn update(
        &mut self,
        id: OverflowId,
        now: DateTime<Utc>,
        apply: impl FnOnce(&mut OverflowEntry),
    ) -> Result<OverflowEntry, MatrixError> {
        let entry = self
            .entries
            .get_mut(&id)
            .ok_or(MatrixError::OverflowNotFound(id))?;
        if !entry.is_pending() {
            return Err(MatrixError::OverflowNotPending(id));
        }
        entry.attempts += 1;
        entry.updated_at = now;
        apply(entry);
        Ok(entry.clone())
    }
}
