//! Matrix position: one per enrolled member.

use crate::domain::{Leg, MemberId, PositionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A member's seat in the binary matrix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatrixPosition {
    pub id: PositionId,
    pub member_id: MemberId,
    /// `None` only for the single root position.
    pub parent_id: Option<PositionId>,
    /// Which child slot of the parent this position occupies. `None` for the root.
    pub leg: Option<Leg>,
    /// Depth from the root; root is 0.
    pub level: u32,
    pub left_child: Option<PositionId>,
    pub right_child: Option<PositionId>,
    /// Structural version stamp, bumped whenever this node's links or level change.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MatrixPosition {
    /// Create the root position.
    pub fn root(id: PositionId, member_id: MemberId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            member_id,
            parent_id: None,
            leg: None,
            level: 0,
            left_child: None,
            right_child: None,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// Create a position attached to `parent` on `leg`.
    pub fn child_of(
        id: PositionId,
        member_id: MemberId,
        parent: &MatrixPosition,
        leg: Leg,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            member_id,
            parent_id: Some(parent.id),
            leg: Some(leg),
            level: parent.level + 1,
            left_child: None,
            right_child: None,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn is_leaf(&self) -> bool {
        self.left_child.is_none() && self.right_child.is_none()
    }

    pub fn child(&self, leg: Leg) -> Option<PositionId> {
        match leg {
            Leg::Left => self.left_child,
            Leg::Right => self.right_child,
        }
    }

    pub(crate) fn set_child(&mut self, leg: Leg, child: Option<PositionId>) {
        match leg {
            Leg::Left => self.left_child = child,
            Leg::Right => self.right_child = child,
        }
    }

    /// Children in canonical order (Left first).
    pub fn children(&self) -> impl Iterator<Item = (Leg, PositionId)> + '_ {
        Leg::BOTH
            .into_iter()
            .filter_map(move |leg| self.child(leg).map(|id| (leg, id)))
    }

    pub(crate) fn touch(&mut self, now: DateTime<Utc>) {
        self.version += 1;
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_of_sets_level_and_link() {
        let now = Utc::now();
        let root = MatrixPosition::root(PositionId::new(1), MemberId::random(), now);
        let child =
            MatrixPosition::child_of(PositionId::new(2), MemberId::random(), &root, Leg::Right, now);

        assert!(root.is_root());
        assert_eq!(child.level, 1);
        assert_eq!(child.parent_id, Some(root.id));
        assert_eq!(child.leg, Some(Leg::Right));
    }

    #[test]
    fn test_children_order_is_left_first() {
        let now = Utc::now();
        let mut root = MatrixPosition::root(PositionId::new(1), MemberId::random(), now);
        root.set_child(Leg::Right, Some(PositionId::new(3)));
        root.set_child(Leg::Left, Some(PositionId::new(2)));

        let kids: Vec<_> = root.children().collect();
        assert_eq!(
            kids,
            vec![(Leg::Left, PositionId::new(2)), (Leg::Right, PositionId::new(3))]
        );
        assert!(!root.is_leaf());
    }
}
