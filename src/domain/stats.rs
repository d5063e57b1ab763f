//! Per-member leg statistics and subtree performance rollups.

use crate::domain::{Leg, Money};
use serde::{Deserialize, Serialize};

/// Leg volumes and counts below a member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegStats {
    pub left_volume: Money,
    pub right_volume: Money,
    pub left_count: u64,
    pub right_count: u64,
    pub own_volume: Money,
    /// Leg with the smaller volume; `Left` on a tie.
    pub weaker_leg: Leg,
    /// `own + left + right`.
    pub total_volume: Money,
}

impl LegStats {
    pub fn weaker_volume(&self) -> Money {
        match self.weaker_leg {
            Leg::Left => self.left_volume,
            Leg::Right => self.right_volume,
        }
    }

    pub fn stronger_volume(&self) -> Money {
        match self.weaker_leg {
            Leg::Left => self.right_volume,
            Leg::Right => self.left_volume,
        }
    }
}

/// Weaker leg by volume. Ties resolve to `Left`.
pub fn weaker_leg(left_volume: Money, right_volume: Money) -> Leg {
    if right_volume < left_volume {
        Leg::Right
    } else {
        Leg::Left
    }
}

/// `min/max * 100`, or 100 when both legs are empty.
pub fn balance_ratio(left_volume: Money, right_volume: Money) -> Money {
    let (min, max) = if left_volume <= right_volume {
        (left_volume, right_volume)
    } else {
        (right_volume, left_volume)
    };
    match (min * Money::hundred()).checked_div(max) {
        Some(ratio) => ratio.round_dp(2),
        None => Money::hundred(),
    }
}

/// Aggregate rollup over a member's full subtree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Performance {
    /// Members below this one (self excluded).
    pub total_members: u64,
    /// Members below this one with positive own volume.
    pub active_members: u64,
    pub total_volume: Money,
    /// Mean depth of descendants relative to this member.
    pub average_level: Money,
    /// Percent growth of the downline within the growth window.
    pub growth_rate: Money,
    pub balance_ratio: Money,
}
