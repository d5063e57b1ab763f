//! Rebalance planning: find the most lopsided pivot below a member and the
//! subtree move that shrinks its leg differential.

use super::ledger::VolumeLedger;
use super::placement::{find_free_slot, volume_then_count, LegOrder, SearchBounds};
use super::store::PositionStore;
use super::MatrixError;
use crate::domain::{Leg, MemberId, Money, PositionId, RebalanceRecord};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebalanceSettings {
    /// Differentials at or below this are left alone.
    pub threshold: Money,
    pub max_moves: u32,
    pub bounds: SearchBounds,
}

/// A planned move. Versions are captured so a commit can detect that the
/// tree changed underneath it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MovePlan {
    pub pivot: PositionId,
    pub subtree_root: PositionId,
    pub new_parent: PositionId,
    pub leg: Leg,
    pub differential: Money,
    pub moved_volume: Money,
    pub versions: Vec<(PositionId, u64)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum RebalanceOutcome {
    Moved { moves: Vec<RebalanceRecord> },
    NothingToRebalance,
}

struct Candidate {
    pivot: PositionId,
    level: u32,
    order: usize,
    differential: Money,
    light: Leg,
    subtree_root: PositionId,
    moved_volume: Money,
}

pub struct Rebalancer<'a> {
    store: &'a PositionStore,
    ledger: &'a VolumeLedger,
    settings: RebalanceSettings,
}

impl<'a> Rebalancer<'a> {
    pub fn new(
        store: &'a PositionStore,
        ledger: &'a VolumeLedger,
        settings: RebalanceSettings,
    ) -> Self {
        Self {
            store,
            ledger,
            settings,
        }
    }

    /// Plan the next move under `member`, or `None` when no pivot exceeds
    /// the threshold with a movable subtree and a free destination.
    pub fn plan(&self, member: &MemberId) -> Result<Option<MovePlan>, MatrixError> {
        let root = self.store.get_position(member)?.id;

        let mut candidates: Vec<Candidate> = self
            .store
            .subtree(root)
            .enumerate()
            .filter_map(|(order, node)| self.candidate_at(node.id, node.level, order))
            .collect();
        // Largest differential, then shallowest, then earliest in pre-order.
        candidates.sort_by(|a, b| {
            b.differential
                .cmp(&a.differential)
                .then(a.level.cmp(&b.level))
                .then(a.order.cmp(&b.order))
        });

        for candidate in candidates {
            if let Some((new_parent, leg)) = self.destination(&candidate)? {
                let mut versions = Vec::new();
                for id in [candidate.subtree_root, new_parent] {
                    versions.push((id, self.store.get(id)?.version));
                }
                if let Some(old_parent) = self.store.get(candidate.subtree_root)?.parent_id {
                    versions.push((old_parent, self.store.get(old_parent)?.version));
                }
                return Ok(Some(MovePlan {
                    pivot: candidate.pivot,
                    subtree_root: candidate.subtree_root,
                    new_parent,
                    leg,
                    differential: candidate.differential,
                    moved_volume: candidate.moved_volume,
                    versions,
                }));
            }
        }
        Ok(None)
    }

    fn candidate_at(&self, pivot: PositionId, level: u32, order: usize) -> Option<Candidate> {
        let aggregate = self.ledger.aggregate(pivot);
        let differential = aggregate.differential();
        if differential.is_zero() || differential <= self.settings.threshold {
            return None;
        }
        let heavy = if aggregate.left_volume > aggregate.right_volume {
            Leg::Left
        } else {
            Leg::Right
        };
        let heavy_top = self.store.get(pivot).ok()?.child(heavy)?;

        // Moving volume c shrinks the differential iff 0 < c < differential.
        let mut movable: Vec<(Money, u64, Leg, PositionId)> = self
            .store
            .get(heavy_top)
            .ok()?
            .children()
            .map(|(leg, id)| {
                let (volume, count) = volume_then_count(self.ledger, id);
                (volume, count, leg, id)
            })
            .filter(|(volume, ..)| volume.is_positive() && *volume < differential)
            .collect();
        movable.sort();
        let (moved_volume, _, _, subtree_root) = movable.into_iter().next()?;

        Some(Candidate {
            pivot,
            level,
            order,
            differential,
            light: heavy.opposite(),
            subtree_root,
            moved_volume,
        })
    }

    /// Shallowest free slot on the light side of the pivot that can hold the
    /// whole moved subtree within the depth limit.
    fn destination(&self, candidate: &Candidate) -> Result<Option<(PositionId, Leg)>, MatrixError> {
        let pivot = self.store.get(candidate.pivot)?;
        let height = self.store.subtree_height(candidate.subtree_root);
        let bounds = SearchBounds {
            max_depth: self.settings.bounds.max_depth,
            depth_limit: self
                .settings
                .bounds
                .depth_limit
                .map(|limit| limit.saturating_sub(height)),
        };
        if let Some(limit) = bounds.depth_limit {
            if pivot.level + 1 > limit {
                return Ok(None);
            }
        }

        match pivot.child(candidate.light) {
            None if bounds.max_depth >= 1 => Ok(Some((candidate.pivot, candidate.light))),
            None => Ok(None),
            Some(light_top) => find_free_slot(
                self.store,
                self.ledger,
                light_top,
                1,
                LegOrder::WeakerFirst,
                bounds,
            ),
        }
    }
}

/// Human-readable provenance stored with each move.
pub(crate) fn describe_move(plan: &MovePlan, pivot_member: &MemberId) -> String {
    format!(
        "leg differential {} at member {}; moved subtree volume {}",
        plan.differential, pivot_member, plan.moved_volume
    )
}
