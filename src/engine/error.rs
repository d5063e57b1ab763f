use crate::domain::{Leg, MemberId, OverflowId, PositionId};
use thiserror::Error;

/// Failures of matrix engine operations.
///
/// `Deferred` placements and `NothingToRebalance` are outcomes, not errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MatrixError {
    #[error("position {0} not found")]
    PositionNotFound(PositionId),
    #[error("member {0} has no matrix position")]
    MemberNotFound(MemberId),
    #[error("upline member {0} has no matrix position")]
    InvalidUpline(MemberId),
    #[error("member {0} is already enrolled in the matrix")]
    AlreadyEnrolled(MemberId),
    #[error("matrix already has a root position {0}")]
    RootExists(PositionId),
    #[error("slot {leg} under position {parent} is occupied")]
    SlotOccupied { parent: PositionId, leg: Leg },
    #[error("moving subtree {root} under position {new_parent} would create a cycle")]
    CycleDetected {
        root: PositionId,
        new_parent: PositionId,
    },
    #[error("level {level} exceeds the matrix depth limit {limit}")]
    DepthLimitExceeded { level: u32, limit: u32 },
    #[error("invalid manual placement path under member {upline}: {reason}")]
    InvalidPath { upline: MemberId, reason: String },
    #[error("invalid amount for member {member}: {reason}")]
    InvalidAmount { member: MemberId, reason: String },
    #[error("position {0} has children")]
    NotALeaf(PositionId),
    #[error("position {0} carries volume and cannot be removed")]
    HasVolume(PositionId),
    #[error("overflow entry {0} not found")]
    OverflowNotFound(OverflowId),
    #[error("overflow entry {0} is not pending")]
    OverflowNotPending(OverflowId),
    #[error("intended parent {parent} of overflow entry {entry} no longer exists")]
    ParentRemoved {
        entry: OverflowId,
        parent: PositionId,
    },
    #[error("contention on the matrix, retry budget exhausted")]
    Contention,
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl MatrixError {
    /// Only contention is safe to retry transparently.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MatrixError::Contention)
    }
}
