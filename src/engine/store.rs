//! Authoritative arena of matrix positions.
//!
//! Positions are keyed by [`PositionId`]; parent and child links are lookup
//! keys into the arena. Every structural mutation goes through this store.

use super::MatrixError;
use crate::domain::{Leg, MatrixPosition, MemberId, PositionId};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Result of a committed subtree move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveReceipt {
    pub root: PositionId,
    pub old_parent: PositionId,
    pub old_leg: Leg,
    pub new_parent: PositionId,
    pub new_leg: Leg,
    pub new_level: u32,
}

#[derive(Debug, Clone, Default)]
pub struct PositionStore {
    positions: HashMap<PositionId, MatrixPosition>,
    by_member: HashMap<MemberId, PositionId>,
    root: Option<PositionId>,
    next_id: u64,
}

impl PositionStore {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Default::default()
        }
    }

    /// Rebuild a store from persisted positions.
    ///
    /// Child links are derived from each position's `parent_id`/`leg`, so
    /// persisted child links are ignored.
    pub fn restore(mut positions: Vec<MatrixPosition>) -> Result<Self, MatrixError> {
        positions.sort_by_key(|p| (p.level, p.id));
        let mut store = Self::new();

        for mut position in positions {
            position.left_child = None;
            position.right_child = None;

            if store.by_member.contains_key(&position.member_id) {
                return Err(MatrixError::AlreadyEnrolled(position.member_id));
            }

            match (position.parent_id, position.leg) {
                (None, _) => {
                    if let Some(root) = store.root {
                        return Err(MatrixError::RootExists(root));
                    }
                    if position.level != 0 {
                        return Err(MatrixError::InvariantViolation(format!(
                            "root position {} stored at level {}",
                            position.id, position.level
                        )));
                    }
                    store.root = Some(position.id);
                }
                (Some(parent_id), Some(leg)) => {
                    let parent = store
                        .positions
                        .get_mut(&parent_id)
                        .ok_or(MatrixError::PositionNotFound(parent_id))?;
                    if parent.child(leg).is_some() {
                        return Err(MatrixError::SlotOccupied {
                            parent: parent_id,
                            leg,
                        });
                    }
                    if position.level != parent.level + 1 {
                        return Err(MatrixError::InvariantViolation(format!(
                            "position {} stored at level {} under parent at level {}",
                            position.id, position.level, parent.level
                        )));
                    }
                    parent.set_child(leg, Some(position.id));
                }
                (Some(_), None) => {
                    return Err(MatrixError::InvariantViolation(format!(
                        "position {} has a parent but no leg",
                        position.id
                    )));
                }
            }

            store.next_id = store.next_id.max(position.id.as_u64() + 1);
            store.by_member.insert(position.member_id, position.id);
            store.positions.insert(position.id, position);
        }

        Ok(store)
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn root(&self) -> Option<PositionId> {
        self.root
    }

    pub fn get(&self, id: PositionId) -> Result<&MatrixPosition, MatrixError> {
        self.positions
            .get(&id)
            .ok_or(MatrixError::PositionNotFound(id))
    }

    pub fn contains(&self, id: PositionId) -> bool {
        self.positions.contains_key(&id)
    }

    pub fn position_id_of(&self, member: &MemberId) -> Option<PositionId> {
        self.by_member.get(member).copied()
    }

    pub fn get_position(&self, member: &MemberId) -> Result<&MatrixPosition, MatrixError> {
        let id = self
            .position_id_of(member)
            .ok_or(MatrixError::MemberNotFound(*member))?;
        self.get(id)
    }

    pub fn positions(&self) -> impl Iterator<Item = &MatrixPosition> {
        self.positions.values()
    }

    fn allocate_id(&mut self) -> PositionId {
        let id = PositionId::new(self.next_id);
        self.next_id += 1;
        id
    }

    /// Create the single root position of an empty matrix.
    pub fn create_root(
        &mut self,
        member: MemberId,
        now: DateTime<Utc>,
    ) -> Result<MatrixPosition, MatrixError> {
        if let Some(root) = self.root {
            return Err(MatrixError::RootExists(root));
        }
        if self.by_member.contains_key(&member) {
            return Err(MatrixError::AlreadyEnrolled(member));
        }

        let id = self.allocate_id();
        let position = MatrixPosition::root(id, member, now);
        self.root = Some(id);
        self.by_member.insert(member, id);
        self.positions.insert(id, position.clone());
        Ok(position)
    }

    /// Attach a new position for `member` in the `(parent, leg)` slot.
    pub fn create_position(
        &mut self,
        member: MemberId,
        parent_id: PositionId,
        leg: Leg,
        now: DateTime<Utc>,
    ) -> Result<MatrixPosition, MatrixError> {
        if self.by_member.contains_key(&member) {
            return Err(MatrixError::AlreadyEnrolled(member));
        }
        if self.get(parent_id)?.child(leg).is_some() {
            return Err(MatrixError::SlotOccupied {
                parent: parent_id,
                leg,
            });
        }

        let id = self.allocate_id();
        let position = MatrixPosition::child_of(id, member, self.get(parent_id)?, leg, now);

        let parent = self
            .positions
            .get_mut(&parent_id)
            .ok_or(MatrixError::PositionNotFound(parent_id))?;
        parent.set_child(leg, Some(id));
        parent.touch(now);

        self.by_member.insert(member, id);
        self.positions.insert(id, position.clone());
        Ok(position)
    }

    /// Remove a leaf position. Non-leaves are rejected.
    pub fn remove_leaf(
        &mut self,
        id: PositionId,
        now: DateTime<Utc>,
    ) -> Result<MatrixPosition, MatrixError> {
        let position = self.get(id)?;
        if !position.is_leaf() {
            return Err(MatrixError::NotALeaf(id));
        }

        let position = self
            .positions
            .remove(&id)
            .ok_or(MatrixError::PositionNotFound(id))?;
        self.by_member.remove(&position.member_id);

        match (position.parent_id, position.leg) {
            (Some(parent_id), Some(leg)) => {
                if let Some(parent) = self.positions.get_mut(&parent_id) {
                    parent.set_child(leg, None);
                    parent.touch(now);
                }
            }
            _ => self.root = None,
        }

        Ok(position)
    }

    /// Reparent the subtree rooted at `root_id` into `(new_parent_id, new_leg)`.
    ///
    /// Levels of every position in the subtree are rewritten.
    pub fn move_subtree(
        &mut self,
        root_id: PositionId,
        new_parent_id: PositionId,
        new_leg: Leg,
        now: DateTime<Utc>,
    ) -> Result<MoveReceipt, MatrixError> {
        let root = self.get(root_id)?;
        let new_parent = self.get(new_parent_id)?;

        if new_parent_id == root_id || self.is_ancestor_of(root_id, new_parent_id) {
            return Err(MatrixError::CycleDetected {
                root: root_id,
                new_parent: new_parent_id,
            });
        }
        if new_parent.child(new_leg).is_some() {
            return Err(MatrixError::SlotOccupied {
                parent: new_parent_id,
                leg: new_leg,
            });
        }
        let (old_parent_id, old_leg) = match (root.parent_id, root.leg) {
            (Some(p), Some(l)) => (p, l),
            // The tree root is an ancestor of every other position.
            _ => {
                return Err(MatrixError::CycleDetected {
                    root: root_id,
                    new_parent: new_parent_id,
                })
            }
        };
        let new_level = new_parent.level + 1;

        if let Some(old_parent) = self.positions.get_mut(&old_parent_id) {
            old_parent.set_child(old_leg, None);
            old_parent.touch(now);
        }
        if let Some(new_parent) = self.positions.get_mut(&new_parent_id) {
            new_parent.set_child(new_leg, Some(root_id));
            new_parent.touch(now);
        }
        if let Some(root) = self.positions.get_mut(&root_id) {
            root.parent_id = Some(new_parent_id);
            root.leg = Some(new_leg);
        }
        self.relevel(root_id, new_level, now);

        Ok(MoveReceipt {
            root: root_id,
            old_parent: old_parent_id,
            old_leg,
            new_parent: new_parent_id,
            new_leg,
            new_level,
        })
    }

    fn relevel(&mut self, root_id: PositionId, root_level: u32, now: DateTime<Utc>) {
        let mut stack = vec![(root_id, root_level)];
        while let Some((id, level)) = stack.pop() {
            if let Some(position) = self.positions.get_mut(&id) {
                position.level = level;
                position.touch(now);
                for (_, child) in position.children() {
                    stack.push((child, level + 1));
                }
            }
        }
    }

    /// Ancestors of `id`, nearest first, paired with the leg through which
    /// the walk arrived at each ancestor.
    pub fn ancestors(&self, id: PositionId) -> Ancestors<'_> {
        Ancestors {
            store: self,
            current: self.positions.get(&id),
        }
    }

    /// True when `ancestor` lies strictly above `id`.
    pub fn is_ancestor_of(&self, ancestor: PositionId, id: PositionId) -> bool {
        self.ancestors(id).any(|(a, _)| a == ancestor)
    }

    /// Levels between `ancestor` and `id`, `Some(0)` when they are the same
    /// position, `None` when `id` is outside the subtree.
    pub fn depth_below(&self, ancestor: PositionId, id: PositionId) -> Option<u32> {
        if ancestor == id {
            return self.contains(id).then_some(0);
        }
        self.ancestors(id)
            .position(|(a, _)| a == ancestor)
            .map(|steps| steps as u32 + 1)
    }

    /// Height of the subtree at `id` (0 for a leaf).
    pub fn subtree_height(&self, id: PositionId) -> u32 {
        let base = match self.positions.get(&id) {
            Some(p) => p.level,
            None => return 0,
        };
        self.subtree(id)
            .map(|p| p.level - base)
            .max()
            .unwrap_or(0)
    }

    /// Lazy pre-order traversal (node, Left subtree, Right subtree).
    pub fn subtree(&self, root: PositionId) -> SubtreeIter<'_> {
        let stack = if self.contains(root) {
            vec![root]
        } else {
            Vec::new()
        };
        SubtreeIter { store: self, stack }
    }

    /// Resume the pre-order traversal of `root`'s subtree right after `cursor`.
    ///
    /// Fails when `cursor` is not inside the subtree.
    pub fn subtree_after(
        &self,
        root: PositionId,
        cursor: PositionId,
    ) -> Result<SubtreeIter<'_>, MatrixError> {
        self.get(root)?;
        let at = self.get(cursor)?;
        if self.depth_below(root, cursor).is_none() {
            return Err(MatrixError::PositionNotFound(cursor));
        }

        // Right siblings still owed by ancestors we descended into via Left.
        let mut owed = Vec::new();
        let mut node = cursor;
        while node != root {
            let position = self.get(node)?;
            let (parent_id, leg) = match (position.parent_id, position.leg) {
                (Some(p), Some(l)) => (p, l),
                _ => break,
            };
            if leg == Leg::Left {
                if let Some(right) = self.get(parent_id)?.right_child {
                    owed.push(right);
                }
            }
            node = parent_id;
        }
        owed.reverse();

        let mut stack = owed;
        stack.extend(at.right_child);
        stack.extend(at.left_child);
        Ok(SubtreeIter { store: self, stack })
    }
}

pub struct Ancestors<'a> {
    store: &'a PositionStore,
    current: Option<&'a MatrixPosition>,
}

impl Iterator for Ancestors<'_> {
    type Item = (PositionId, Leg);

    fn next(&mut self) -> Option<Self::Item> {
        let position = self.current?;
        let (parent_id, leg) = match (position.parent_id, position.leg) {
            (Some(p), Some(l)) => (p, l),
            _ => {
                self.current = None;
                return None;
            }
        };
        self.current = self.store.positions.get(&parent_id);
        Some((parent_id, leg))
    }
}

pub struct SubtreeIter<'a> {
    store: &'a PositionStore,
    stack: Vec<PositionId>,
}

impl<'a> Iterator for SubtreeIter<'a> {
    type Item = &'a MatrixPosition;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(id) = self.stack.pop() {
            if let Some(position) = self.store.positions.get(&id) {
                self.stack.extend(position.right_child);
                self.stack.extend(position.left_child);
                return Some(position);
            }
        }
        None
    }
}
