//! Placement of new members below a chosen upline.
//!
//! The spillover policy is a plain tagged enum consumed by [`Placement::plan`].
//! Planning only reads the tree; committing the plan is done by
//! [`super::MatrixState`], which re-validates the slot at insertion time.

use super::ledger::VolumeLedger;
use super::store::PositionStore;
use super::MatrixError;
use crate::domain::{Leg, MatrixPosition, MemberId, Money, OverflowId, PositionId};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

/// Where a new member attaches when the upline's own slots are taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SpilloverPolicy {
    /// Shallowest free slot; at each node the leg with less volume (then
    /// fewer members, then Left) is tried first.
    AutoBalance,
    /// Exhaust the left leg breadth-first before touching the right.
    LeftPriority,
    /// Exhaust the right leg breadth-first before touching the left.
    RightPriority,
    /// The caller names the leg at every level; only validated here.
    Manual,
}

impl SpilloverPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpilloverPolicy::AutoBalance => "auto",
            SpilloverPolicy::LeftPriority => "left",
            SpilloverPolicy::RightPriority => "right",
            SpilloverPolicy::Manual => "manual",
        }
    }
}

impl fmt::Display for SpilloverPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SpilloverPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" | "autobalance" | "auto_balance" => Ok(SpilloverPolicy::AutoBalance),
            "left" | "leftpriority" | "left_priority" => Ok(SpilloverPolicy::LeftPriority),
            "right" | "rightpriority" | "right_priority" => Ok(SpilloverPolicy::RightPriority),
            "manual" => Ok(SpilloverPolicy::Manual),
            other => Err(format!(
                "must be auto, left, right, or manual, got {}",
                other
            )),
        }
    }
}

/// Bounds applied to every slot search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchBounds {
    /// Levels below the search start that may receive the new position.
    pub max_depth: u32,
    /// Absolute level cap for any position.
    pub depth_limit: Option<u32>,
}

impl SearchBounds {
    fn admits_level(&self, level: u32) -> bool {
        self.depth_limit.map_or(true, |limit| level <= limit)
    }
}

/// Order in which the two legs of a visited node are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegOrder {
    Fixed(Leg),
    WeakerFirst,
}

impl LegOrder {
    fn legs(&self, ledger: &VolumeLedger, id: PositionId) -> [Leg; 2] {
        let first = match self {
            LegOrder::Fixed(leg) => *leg,
            LegOrder::WeakerFirst => lighter_leg(ledger, id),
        };
        [first, first.opposite()]
    }
}

/// Leg with less volume, then fewer members; Left on a full tie.
pub fn lighter_leg(ledger: &VolumeLedger, id: PositionId) -> Leg {
    let aggregate = ledger.aggregate(id);
    let left = (aggregate.left_volume, aggregate.left_count);
    let right = (aggregate.right_volume, aggregate.right_count);
    if right < left {
        Leg::Right
    } else {
        Leg::Left
    }
}

/// Breadth-first search for the first free slot below `start`.
///
/// `start_depth` is how far `start` already sits below the position the
/// bounds are measured from.
pub fn find_free_slot(
    store: &PositionStore,
    ledger: &VolumeLedger,
    start: PositionId,
    start_depth: u32,
    order: LegOrder,
    bounds: SearchBounds,
) -> Result<Option<(PositionId, Leg)>, MatrixError> {
    store.get(start)?;
    let mut queue = VecDeque::from([(start, start_depth)]);

    while let Some((id, depth)) = queue.pop_front() {
        let node = store.get(id)?;
        // Levels only grow along a BFS, so the first node past a bound ends it.
        if depth + 1 > bounds.max_depth || !bounds.admits_level(node.level + 1) {
            break;
        }
        let legs = order.legs(ledger, id);
        for leg in legs {
            if node.child(leg).is_none() {
                return Ok(Some((id, leg)));
            }
        }
        for leg in legs {
            if let Some(child) = node.child(leg) {
                queue.push_back((child, depth + 1));
            }
        }
    }
    Ok(None)
}

/// A request to enrol `member_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacementRequest {
    pub member_id: MemberId,
    /// `None` only when placing the root of an empty matrix.
    pub upline: Option<MemberId>,
    /// Explicit legs from the upline downwards; used by the Manual policy.
    #[serde(default)]
    pub path: Vec<Leg>,
}

impl PlacementRequest {
    pub fn root(member_id: MemberId) -> Self {
        Self {
            member_id,
            upline: None,
            path: Vec::new(),
        }
    }

    pub fn under(member_id: MemberId, upline: MemberId) -> Self {
        Self {
            member_id,
            upline: Some(upline),
            path: Vec::new(),
        }
    }

    pub fn with_path(mut self, path: Vec<Leg>) -> Self {
        self.path = path;
        self
    }
}

/// Decision reached by reading the tree; not yet applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementPlan {
    Root,
    Slot {
        upline: PositionId,
        parent: PositionId,
        leg: Leg,
        parent_version: u64,
    },
    Overflow {
        upline: PositionId,
        leg: Leg,
    },
}

/// Terminal result of a placement. `Deferred` is a valid outcome, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum PlacementOutcome {
    Placed { position: MatrixPosition },
    Deferred {
        #[serde(rename = "overflowId")]
        overflow_id: OverflowId,
    },
}

impl PlacementOutcome {
    pub fn position(&self) -> Option<&MatrixPosition> {
        match self {
            PlacementOutcome::Placed { position } => Some(position),
            PlacementOutcome::Deferred { .. } => None,
        }
    }
}

/// Read-only planner over a tree snapshot.
pub struct Placement<'a> {
    store: &'a PositionStore,
    ledger: &'a VolumeLedger,
    policy: SpilloverPolicy,
    bounds: SearchBounds,
}

impl<'a> Placement<'a> {
    pub fn new(
        store: &'a PositionStore,
        ledger: &'a VolumeLedger,
        policy: SpilloverPolicy,
        bounds: SearchBounds,
    ) -> Self {
        Self {
            store,
            ledger,
            policy,
            bounds,
        }
    }

    pub fn plan(&self, request: &PlacementRequest) -> Result<PlacementPlan, MatrixError> {
        if self.store.position_id_of(&request.member_id).is_some() {
            return Err(MatrixError::AlreadyEnrolled(request.member_id));
        }

        let upline_member = match request.upline {
            Some(upline) => upline,
            None => {
                return match self.store.root() {
                    Some(root) => Err(MatrixError::RootExists(root)),
                    None => Ok(PlacementPlan::Root),
                }
            }
        };
        let upline = self
            .store
            .position_id_of(&upline_member)
            .ok_or(MatrixError::InvalidUpline(upline_member))?;

        if self.policy == SpilloverPolicy::Manual {
            return self.plan_manual(upline_member, upline, &request.path);
        }

        match self.search(upline, self.policy)? {
            Some((parent, leg)) => Ok(PlacementPlan::Slot {
                upline,
                parent,
                leg,
                parent_version: self.store.get(parent)?.version,
            }),
            None => Ok(PlacementPlan::Overflow {
                upline,
                leg: self.preferred_leg(upline, self.policy),
            }),
        }
    }

    /// First free slot below `upline` under `policy`. Manual is searched as
    /// AutoBalance.
    pub fn search(
        &self,
        upline: PositionId,
        policy: SpilloverPolicy,
    ) -> Result<Option<(PositionId, Leg)>, MatrixError> {
        match policy {
            SpilloverPolicy::AutoBalance | SpilloverPolicy::Manual => find_free_slot(
                self.store,
                self.ledger,
                upline,
                0,
                LegOrder::WeakerFirst,
                self.bounds,
            ),
            SpilloverPolicy::LeftPriority => self.search_leg_first(upline, Leg::Left),
            SpilloverPolicy::RightPriority => self.search_leg_first(upline, Leg::Right),
        }
    }

    fn search_leg_first(
        &self,
        upline: PositionId,
        primary: Leg,
    ) -> Result<Option<(PositionId, Leg)>, MatrixError> {
        let node = self.store.get(upline)?;
        if self.bounds.max_depth == 0 || !self.bounds.admits_level(node.level + 1) {
            return Ok(None);
        }
        for leg in [primary, primary.opposite()] {
            match node.child(leg) {
                None => return Ok(Some((upline, leg))),
                Some(child) => {
                    let found = find_free_slot(
                        self.store,
                        self.ledger,
                        child,
                        1,
                        LegOrder::Fixed(primary),
                        self.bounds,
                    )?;
                    if found.is_some() {
                        return Ok(found);
                    }
                }
            }
        }
        Ok(None)
    }

    /// Leg the policy would try first directly under `upline`.
    pub fn preferred_leg(&self, upline: PositionId, policy: SpilloverPolicy) -> Leg {
        match policy {
            SpilloverPolicy::LeftPriority => Leg::Left,
            SpilloverPolicy::RightPriority => Leg::Right,
            SpilloverPolicy::AutoBalance | SpilloverPolicy::Manual => {
                lighter_leg(self.ledger, upline)
            }
        }
    }

    fn plan_manual(
        &self,
        upline_member: MemberId,
        upline: PositionId,
        path: &[Leg],
    ) -> Result<PlacementPlan, MatrixError> {
        let (last, steps) = path.split_last().ok_or_else(|| MatrixError::InvalidPath {
            upline: upline_member,
            reason: "manual placement requires at least one leg".to_string(),
        })?;

        let mut parent = upline;
        for (i, leg) in steps.iter().enumerate() {
            parent = self
                .store
                .get(parent)?
                .child(*leg)
                .ok_or_else(|| MatrixError::InvalidPath {
                    upline: upline_member,
                    reason: format!("no position on the {} leg at step {}", leg, i + 1),
                })?;
        }

        let node = self.store.get(parent)?;
        if node.child(*last).is_some() {
            return Err(MatrixError::SlotOccupied {
                parent,
                leg: *last,
            });
        }
        if let Some(limit) = self.bounds.depth_limit {
            if node.level + 1 > limit {
                return Err(MatrixError::DepthLimitExceeded {
                    level: node.level + 1,
                    limit,
                });
            }
        }

        Ok(PlacementPlan::Slot {
            upline,
            parent,
            leg: *last,
            parent_version: node.version,
        })
    }
}

/// Shared volume-weighted comparison used by the rebalancer as well.
pub(crate) fn volume_then_count(ledger: &VolumeLedger, id: PositionId) -> (Money, u64) {
    let aggregate = ledger.aggregate(id);
    (aggregate.total_volume(), aggregate.total_count())
}
