//! Volume ledger: own volume per position plus per-leg subtotals at every
//! ancestor, kept in step with the tree through explicit upward walks.

use super::store::PositionStore;
use super::MatrixError;
use crate::domain::{
    balance_ratio, weaker_leg, Leg, LegStats, MemberId, Money, Performance, PositionId,
};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

/// Volume and head-count below (and at) one position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LegAggregate {
    pub own_volume: Money,
    pub left_volume: Money,
    pub right_volume: Money,
    pub left_count: u64,
    pub right_count: u64,
}

impl LegAggregate {
    pub fn total_volume(&self) -> Money {
        self.own_volume + self.left_volume + self.right_volume
    }

    /// Positions in the subtree, this one included.
    pub fn total_count(&self) -> u64 {
        1 + self.left_count + self.right_count
    }

    pub fn leg_volume(&self, leg: Leg) -> Money {
        match leg {
            Leg::Left => self.left_volume,
            Leg::Right => self.right_volume,
        }
    }

    pub fn leg_count(&self, leg: Leg) -> u64 {
        match leg {
            Leg::Left => self.left_count,
            Leg::Right => self.right_count,
        }
    }

    fn add_to_leg(&mut self, leg: Leg, volume: Money, count: u64) {
        match leg {
            Leg::Left => {
                self.left_volume += volume;
                self.left_count += count;
            }
            Leg::Right => {
                self.right_volume += volume;
                self.right_count += count;
            }
        }
    }

    fn sub_from_leg(&mut self, leg: Leg, volume: Money, count: u64) {
        match leg {
            Leg::Left => {
                self.left_volume -= volume;
                self.left_count = self.left_count.saturating_sub(count);
            }
            Leg::Right => {
                self.right_volume -= volume;
                self.right_count = self.right_count.saturating_sub(count);
            }
        }
    }

    /// Whether `amount` more volume keeps this aggregate's total, and a
    /// full-rate commission on it, inside the decimal range.
    fn can_absorb(&self, amount: Money) -> bool {
        self.own_volume
            .checked_add(self.left_volume)
            .and_then(|total| total.checked_add(self.right_volume))
            .and_then(|total| total.checked_add(amount))
            .and_then(|total| total.checked_mul(Money::hundred()))
            .is_some()
    }

    /// `|left - right|`.
    pub fn differential(&self) -> Money {
        (self.left_volume - self.right_volume).abs()
    }
}

#[derive(Debug, Clone, Default)]
pub struct VolumeLedger {
    aggregates: HashMap<PositionId, LegAggregate>,
}

impl VolumeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recompute every aggregate from own volumes.
    pub fn rebuild(
        store: &PositionStore,
        own_volumes: &HashMap<PositionId, Money>,
    ) -> Result<Self, MatrixError> {
        let mut ledger = Self::new();
        let root = match store.root() {
            Some(root) => root,
            None => return Ok(ledger),
        };

        // Reverse pre-order visits every child before its parent.
        let order: Vec<PositionId> = store.subtree(root).map(|p| p.id).collect();
        for id in order.into_iter().rev() {
            let position = store.get(id)?;
            let mut aggregate = LegAggregate {
                own_volume: own_volumes.get(&id).copied().unwrap_or_default(),
                ..Default::default()
            };
            for (leg, child) in position.children() {
                let below = ledger.aggregate(child);
                aggregate.add_to_leg(leg, below.total_volume(), below.total_count());
            }
            ledger.aggregates.insert(id, aggregate);
        }
        Ok(ledger)
    }

    /// Aggregate of a position; zero for unknown ids.
    pub fn aggregate(&self, id: PositionId) -> LegAggregate {
        self.aggregates.get(&id).copied().unwrap_or_default()
    }

    pub fn own_volume(&self, id: PositionId) -> Money {
        self.aggregate(id).own_volume
    }

    /// Account for a freshly attached leaf.
    pub fn on_position_created(&mut self, store: &PositionStore, id: PositionId) {
        self.aggregates.insert(id, LegAggregate::default());
        for (ancestor, leg) in store.ancestors(id) {
            self.aggregates
                .entry(ancestor)
                .or_default()
                .add_to_leg(leg, Money::zero(), 1);
        }
    }

    /// Account for a leaf about to be removed. Must run before the store
    /// forgets the position.
    pub fn on_position_removed(
        &mut self,
        store: &PositionStore,
        id: PositionId,
    ) -> Result<(), MatrixError> {
        let aggregate = self.aggregate(id);
        if !aggregate.own_volume.is_zero() {
            return Err(MatrixError::HasVolume(id));
        }
        for (ancestor, leg) in store.ancestors(id) {
            self.aggregates
                .entry(ancestor)
                .or_default()
                .sub_from_leg(leg, Money::zero(), 1);
        }
        self.aggregates.remove(&id);
        Ok(())
    }

    /// Add `amount` to the member's own volume and to the arrival leg of
    /// every ancestor. Returns the member's position id.
    pub fn record_volume(
        &mut self,
        store: &PositionStore,
        member: &MemberId,
        amount: Money,
    ) -> Result<PositionId, MatrixError> {
        if amount.is_negative() {
            return Err(MatrixError::InvalidAmount {
                member: *member,
                reason: format!("volume must be non-negative, got {}", amount),
            });
        }
        let id = store
            .position_id_of(member)
            .ok_or(MatrixError::MemberNotFound(*member))?;

        // Every figure on the chain is checked before any of them changes.
        let chain = std::iter::once(id).chain(store.ancestors(id).map(|(ancestor, _)| ancestor));
        for position in chain {
            if !self.aggregate(position).can_absorb(amount) {
                return Err(MatrixError::InvalidAmount {
                    member: *member,
                    reason: format!(
                        "volume {} exceeds the ledger's range at position {}",
                        amount, position
                    ),
                });
            }
        }

        self.aggregates.entry(id).or_default().own_volume += amount;
        for (ancestor, leg) in store.ancestors(id) {
            self.aggregates
                .entry(ancestor)
                .or_default()
                .add_to_leg(leg, amount, 0);
        }
        Ok(id)
    }

    /// Remove the subtree at `root` from every ancestor's subtotal.
    /// Call before the store detaches the subtree.
    pub fn detach_subtree(&mut self, store: &PositionStore, root: PositionId) {
        let moved = self.aggregate(root);
        let (volume, count) = (moved.total_volume(), moved.total_count());
        for (ancestor, leg) in store.ancestors(root) {
            self.aggregates
                .entry(ancestor)
                .or_default()
                .sub_from_leg(leg, volume, count);
        }
    }

    /// Add the subtree at `root` to every ancestor's subtotal.
    /// Call after the store attached the subtree at its new place.
    pub fn attach_subtree(&mut self, store: &PositionStore, root: PositionId) {
        let moved = self.aggregate(root);
        let (volume, count) = (moved.total_volume(), moved.total_count());
        for (ancestor, leg) in store.ancestors(root) {
            self.aggregates
                .entry(ancestor)
                .or_default()
                .add_to_leg(leg, volume, count);
        }
    }

    pub fn stats(&self, store: &PositionStore, member: &MemberId) -> Result<LegStats, MatrixError> {
        let position = store.get_position(member)?;
        let aggregate = self.aggregate(position.id);
        Ok(LegStats {
            left_volume: aggregate.left_volume,
            right_volume: aggregate.right_volume,
            left_count: aggregate.left_count,
            right_count: aggregate.right_count,
            own_volume: aggregate.own_volume,
            weaker_leg: weaker_leg(aggregate.left_volume, aggregate.right_volume),
            total_volume: aggregate.total_volume(),
        })
    }

    /// Rollup over the member's full subtree.
    pub fn performance(
        &self,
        store: &PositionStore,
        member: &MemberId,
        now: DateTime<Utc>,
        growth_window: Duration,
    ) -> Result<Performance, MatrixError> {
        let position = store.get_position(member)?;
        let aggregate = self.aggregate(position.id);
        let window_start = now - growth_window;

        let mut total_members = 0u64;
        let mut active_members = 0u64;
        let mut recent_members = 0u64;
        let mut depth_sum = 0u64;
        for descendant in store.subtree(position.id).skip(1) {
            total_members += 1;
            depth_sum += u64::from(descendant.level - position.level);
            if self.own_volume(descendant.id).is_positive() {
                active_members += 1;
            }
            if descendant.created_at >= window_start {
                recent_members += 1;
            }
        }

        let average_level = if total_members == 0 {
            Money::zero()
        } else {
            (Money::from_units(depth_sum as i64))
                .checked_div(Money::from_units(total_members as i64))
                .unwrap_or_default()
                .round_dp(2)
        };

        let prior = total_members - recent_members;
        let growth_rate = if prior == 0 {
            if recent_members > 0 {
                Money::hundred()
            } else {
                Money::zero()
            }
        } else {
            (Money::from_units(recent_members as i64) * Money::hundred())
                .checked_div(Money::from_units(prior as i64))
                .unwrap_or_default()
                .round_dp(2)
        };

        Ok(Performance {
            total_members,
            active_members,
            total_volume: aggregate.total_volume(),
            average_level,
            growth_rate,
            balance_ratio: balance_ratio(aggregate.left_volume, aggregate.right_volume),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn m(units: i64) -> Money {
        Money::from_units(units)
    }

    struct Fixture {
        store: PositionStore,
        ledger: VolumeLedger,
        members: Vec<MemberId>,
    }

    impl Fixture {
        fn new() -> Self {
            let mut store = PositionStore::new();
            let mut ledger = VolumeLedger::new();
            let root = MemberId::random();
            let id = store.create_root(root, now()).unwrap().id;
            ledger.on_position_created(&store, id);
            Self {
                store,
                ledger,
                members: vec![root],
            }
        }

        fn add(&mut self, parent: usize, leg: Leg) -> usize {
            let member = MemberId::random();
            let parent_id = self.store.position_id_of(&self.members[parent]).unwrap();
            let id = self
                .store
                .create_position(member, parent_id, leg, now())
                .unwrap()
                .id;
            self.ledger.on_position_created(&self.store, id);
            self.members.push(member);
            self.members.len() - 1
        }
    }

    #[test]
    fn test_volume_propagates_to_arrival_leg() {
        let mut fx = Fixture::new();
        let a = fx.add(0, Leg::Left);
        let b = fx.add(0, Leg::Right);
        let c = fx.add(a, Leg::Right);

        fx.ledger
            .record_volume(&fx.store, &fx.members[c], m(250))
            .unwrap();
        fx.ledger
            .record_volume(&fx.store, &fx.members[b], m(100))
            .unwrap();

        let root = fx.ledger.stats(&fx.store, &fx.members[0]).unwrap();
        assert_eq!(root.left_volume, m(250));
        assert_eq!(root.right_volume, m(100));
        assert_eq!(root.left_count, 2);
        assert_eq!(root.right_count, 1);
        assert_eq!(root.weaker_leg, Leg::Right);

        let a_stats = fx.ledger.stats(&fx.store, &fx.members[a]).unwrap();
        assert_eq!(a_stats.right_volume, m(250));
        assert_eq!(a_stats.left_volume, m(0));
    }

    #[test]
    fn test_negative_volume_rejected() {
        let mut fx = Fixture::new();
        let err = fx
            .ledger
            .record_volume(&fx.store, &fx.members[0], m(-1))
            .unwrap_err();
        assert!(matches!(err, MatrixError::InvalidAmount { .. }));
    }

    #[test]
    fn test_out_of_range_volume_leaves_chain_untouched() {
        let mut fx = Fixture::new();
        let a = fx.add(0, Leg::Left);
        let b = fx.add(0, Leg::Right);
        let big = Money::from_str_canonical("500000000000000000000000000").unwrap();
        fx.ledger
            .record_volume(&fx.store, &fx.members[a], big)
            .unwrap();

        // b alone fits, but the shared root would leave the decimal range
        let err = fx
            .ledger
            .record_volume(&fx.store, &fx.members[b], big)
            .unwrap_err();
        assert!(matches!(err, MatrixError::InvalidAmount { member, .. } if member == fx.members[b]));

        let root = fx.ledger.stats(&fx.store, &fx.members[0]).unwrap();
        assert_eq!((root.left_volume, root.right_volume), (big, m(0)));
        let b_stats = fx.ledger.stats(&fx.store, &fx.members[b]).unwrap();
        assert_eq!(b_stats.own_volume, m(0));
    }

    #[test]
    fn test_zero_volume_is_accepted() {
        let mut fx = Fixture::new();
        fx.ledger
            .record_volume(&fx.store, &fx.members[0], m(0))
            .unwrap();
        assert_eq!(fx.ledger.own_volume(PositionId::new(1)), m(0));
    }

    #[test]
    fn test_unknown_member_volume() {
        let mut fx = Fixture::new();
        let stranger = MemberId::random();
        let err = fx
            .ledger
            .record_volume(&fx.store, &stranger, m(1))
            .unwrap_err();
        assert_eq!(err, MatrixError::MemberNotFound(stranger));
    }

    #[test]
    fn test_rebuild_matches_incremental() {
        let mut fx = Fixture::new();
        let a = fx.add(0, Leg::Left);
        let b = fx.add(0, Leg::Right);
        let c = fx.add(a, Leg::Left);
        for (i, amount) in [(a, 10), (b, 20), (c, 30), (0, 5)] {
            fx.ledger
                .record_volume(&fx.store, &fx.members[i], m(amount))
                .unwrap();
        }

        let own: HashMap<_, _> = fx
            .store
            .positions()
            .map(|p| (p.id, fx.ledger.own_volume(p.id)))
            .collect();
        let rebuilt = VolumeLedger::rebuild(&fx.store, &own).unwrap();
        for position in fx.store.positions() {
            assert_eq!(
                rebuilt.aggregate(position.id),
                fx.ledger.aggregate(position.id)
            );
        }
    }

    #[test]
    fn test_detach_attach_around_move() {
        let mut fx = Fixture::new();
        let a = fx.add(0, Leg::Left);
        let b = fx.add(0, Leg::Right);
        let c = fx.add(a, Leg::Left);
        fx.ledger
            .record_volume(&fx.store, &fx.members[c], m(700))
            .unwrap();

        let c_id = fx.store.position_id_of(&fx.members[c]).unwrap();
        let b_id = fx.store.position_id_of(&fx.members[b]).unwrap();
        fx.ledger.detach_subtree(&fx.store, c_id);
        fx.store.move_subtree(c_id, b_id, Leg::Left, now()).unwrap();
        fx.ledger.attach_subtree(&fx.store, c_id);

        let root = fx.ledger.stats(&fx.store, &fx.members[0]).unwrap();
        assert_eq!(root.left_volume, m(0));
        assert_eq!(root.right_volume, m(700));
        assert_eq!(root.left_count, 1);
        assert_eq!(root.right_count, 2);
        assert_eq!(root.total_volume, m(700));
    }

    #[test]
    fn test_performance_rollup() {
        let mut fx = Fixture::new();
        let a = fx.add(0, Leg::Left);
        let b = fx.add(0, Leg::Right);
        let _c = fx.add(a, Leg::Left);
        fx.ledger
            .record_volume(&fx.store, &fx.members[a], m(300))
            .unwrap();
        fx.ledger
            .record_volume(&fx.store, &fx.members[b], m(100))
            .unwrap();

        let perf = fx
            .ledger
            .performance(&fx.store, &fx.members[0], now(), Duration::days(30))
            .unwrap();
        assert_eq!(perf.total_members, 3);
        assert_eq!(perf.active_members, 2);
        assert_eq!(perf.total_volume, m(400));
        // depths 1, 1, 2
        assert_eq!(perf.average_level, Money::from_str_canonical("1.33").unwrap());
        // everyone joined inside the window
        assert_eq!(perf.growth_rate, m(100));
        assert_eq!(
            perf.balance_ratio,
            Money::from_str_canonical("33.33").unwrap()
        );
    }

    #[test]
    fn test_performance_of_lone_member() {
        let fx = Fixture::new();
        let perf = fx
            .ledger
            .performance(&fx.store, &fx.members[0], now(), Duration::days(30))
            .unwrap();
        assert_eq!(perf.total_members, 0);
        assert_eq!(perf.average_level, m(0));
        assert_eq!(perf.growth_rate, m(0));
        assert_eq!(perf.balance_ratio, m(100));
    }
}
