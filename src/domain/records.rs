//! Append-only audit records: commissions, overflow queue entries, rebalance
//! moves and volume events.

use crate::domain::{Leg, MemberId, Money, OverflowId, PositionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Source of a commission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum CommissionKind {
    /// Weaker-leg matching bonus.
    Matching,
    /// Unilevel bonus on volume arriving from a descendant `depth` levels down.
    Level {
        depth: u32,
        #[serde(rename = "sourceMemberId")]
        source_member_id: MemberId,
    },
}

/// One qualifying commission event. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommissionRecord {
    pub id: u64,
    pub member_id: MemberId,
    pub kind: CommissionKind,
    pub amount: Money,
    /// Volume the rate was applied to.
    pub basis: Money,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle of an overflow entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowStatus {
    Pending,
    Processed,
    /// Terminal: the intended parent no longer exists.
    Failed,
}

impl OverflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverflowStatus::Pending => "pending",
            OverflowStatus::Processed => "processed",
            OverflowStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OverflowStatus::Pending),
            "processed" => Some(OverflowStatus::Processed),
            "failed" => Some(OverflowStatus::Failed),
            _ => None,
        }
    }
}

/// A placement that found no free slot within the search bound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverflowEntry {
    pub id: OverflowId,
    pub member_id: MemberId,
    pub intended_parent_id: PositionId,
    /// Leg the placement policy preferred at the intended parent.
    pub leg: Leg,
    /// Level the member would have taken directly under the intended parent.
    pub level: u32,
    pub status: OverflowStatus,
    pub attempts: u32,
    /// Set once the entry is processed.
    pub placed_position_id: Option<PositionId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OverflowEntry {
    pub fn is_pending(&self) -> bool {
        self.status == OverflowStatus::Pending
    }
}

/// Audit entry for a single subtree move performed by the rebalancer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebalanceRecord {
    pub id: u64,
    /// Member at the root of the moved subtree.
    pub member_id: MemberId,
    /// Member whose leg imbalance triggered the move.
    pub pivot_member_id: MemberId,
    pub old_parent_id: PositionId,
    pub new_parent_id: PositionId,
    pub old_leg: Leg,
    pub leg: Leg,
    /// New level of the moved subtree root.
    pub level: u32,
    pub moved_volume: Money,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

/// One recorded volume event at a member's own position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeEntry {
    pub id: u64,
    pub member_id: MemberId,
    pub amount: Money,
    pub created_at: DateTime<Utc>,
}
