//! Domain types for the binary matrix engine.
//!
//! This module provides:
//! - Exact monetary amounts via the Money wrapper
//! - Identity primitives: MemberId, PositionId, OverflowId, Leg
//! - MatrixPosition, the node type of the tree
//! - Append-only records and derived statistics

pub mod money;
pub mod position;
pub mod primitives;
pub mod records;
pub mod stats;

pub use money::Money;
pub use position::MatrixPosition;
pub use primitives::{Leg, LegParseError, MemberId, OverflowId, PositionId};
pub use records::{
    CommissionKind, CommissionRecord, OverflowEntry, OverflowStatus, RebalanceRecord, VolumeEntry,
};
pub use stats::{balance_ratio, weaker_leg, LegStats, Performance};
