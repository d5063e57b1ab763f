//! Binary matrix engine: pure, deterministic tree and ledger logic.
//!
//! Nothing in here performs I/O or reads the clock; callers pass `now`.

use crate::domain::Money;
use chrono::Duration;

pub mod commission;
pub mod error;
pub mod invariants;
pub mod ledger;
pub mod overflow;
pub mod placement;
pub mod rebalance;
pub mod state;
pub mod store;

pub use commission::{
    CommissionBook, CommissionCalculator, ConfiguredRates, LevelCommission, LevelRateTable,
};
pub use error::MatrixError;
pub use invariants::AuditReport;
pub use ledger::{LegAggregate, VolumeLedger};
pub use overflow::{OverflowQueue, ResolveOutcome, SweepReport};
pub use placement::{
    PlacementOutcome, PlacementPlan, PlacementRequest, SearchBounds, SpilloverPolicy,
};
pub use rebalance::{MovePlan, RebalanceOutcome};
pub use state::{ChangeSet, MatrixState, PositionSnapshot, Snapshot, SubtreePage, VolumeReceipt};
pub use store::{MoveReceipt, PositionStore};

/// Deployment-wide engine settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub policy: SpilloverPolicy,
    /// Levels below the upline searched for a free slot.
    pub max_search_depth: u32,
    /// Absolute level cap, if the deployment has one.
    pub depth_limit: Option<u32>,
    /// Matching commission, in percent of the weaker leg.
    pub matching_rate: Money,
    /// Level commission percentages, level 1 first.
    pub level_rates: Vec<Money>,
    pub rebalance_threshold: Money,
    pub rebalance_max_moves: u32,
    pub growth_window: Duration,
}

impl EngineConfig {
    pub fn bounds(&self) -> SearchBounds {
        SearchBounds {
            max_depth: self.max_search_depth,
            depth_limit: self.depth_limit,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            policy: SpilloverPolicy::AutoBalance,
            max_search_depth: 10,
            depth_limit: None,
            matching_rate: Money::from_units(10),
            level_rates: [10, 7, 5, 3, 1].into_iter().map(Money::from_units).collect(),
            rebalance_threshold: Money::zero(),
            rebalance_max_moves: 1,
            growth_window: Duration::days(30),
        }
    }
}
