//! Commission calculation: weaker-leg matching and per-level unilevel rates.

use super::ledger::VolumeLedger;
use super::store::PositionStore;
use super::MatrixError;
use crate::domain::{CommissionKind, CommissionRecord, MemberId, Money};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;

/// Lookup of the level-commission rate (in percent) for an upline that sits
/// `depth` levels above the member generating volume.
pub trait LevelRateTable: Send + Sync + fmt::Debug {
    fn rate_for_depth(&self, depth: u32) -> Option<Money>;

    /// Deepest level with a rate; the upward walk stops there.
    fn max_depth(&self) -> u32;
}

/// Rate table backed by a list, level 1 first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfiguredRates(pub Vec<Money>);

impl LevelRateTable for ConfiguredRates {
    fn rate_for_depth(&self, depth: u32) -> Option<Money> {
        if depth == 0 {
            return None;
        }
        self.0
            .get(depth as usize - 1)
            .copied()
            .filter(|rate| rate.is_positive())
    }

    fn max_depth(&self) -> u32 {
        self.0.len() as u32
    }
}

/// Append-only commission history plus the matching basis already paid.
#[derive(Debug, Clone, Default)]
pub struct CommissionBook {
    records: Vec<CommissionRecord>,
    paid_matching_basis: HashMap<MemberId, Money>,
    next_id: u64,
}

impl CommissionBook {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Default::default()
        }
    }

    pub fn restore(mut records: Vec<CommissionRecord>) -> Self {
        records.sort_by_key(|r| r.id);
        let mut book = Self::new();
        for record in records {
            book.index(&record);
            book.next_id = book.next_id.max(record.id + 1);
            book.records.push(record);
        }
        book
    }

    fn index(&mut self, record: &CommissionRecord) {
        if record.kind == CommissionKind::Matching {
            *self
                .paid_matching_basis
                .entry(record.member_id)
                .or_default() += record.basis;
        }
    }

    fn append(
        &mut self,
        member_id: MemberId,
        kind: CommissionKind,
        amount: Money,
        basis: Money,
        now: DateTime<Utc>,
    ) -> CommissionRecord {
        let record = CommissionRecord {
            id: self.next_id,
            member_id,
            kind,
            amount,
            basis,
            created_at: now,
        };
        self.next_id += 1;
        self.index(&record);
        self.records.push(record.clone());
        record
    }

    /// Record precomputed level commissions for volume from `source`.
    pub fn record_level(
        &mut self,
        source: &MemberId,
        basis: Money,
        owed: Vec<LevelCommission>,
        now: DateTime<Utc>,
    ) -> Vec<CommissionRecord> {
        owed.into_iter()
            .map(|share| {
                self.append(
                    share.upline,
                    CommissionKind::Level {
                        depth: share.depth,
                        source_member_id: *source,
                    },
                    share.amount,
                    basis,
                    now,
                )
            })
            .collect()
    }

    pub fn paid_matching_basis(&self, member: &MemberId) -> Money {
        self.paid_matching_basis
            .get(member)
            .copied()
            .unwrap_or_default()
    }

    pub fn history(&self, member: &MemberId) -> Vec<CommissionRecord> {
        self.records
            .iter()
            .filter(|r| &r.member_id == member)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

pub struct CommissionCalculator<'a> {
    store: &'a PositionStore,
    ledger: &'a VolumeLedger,
    matching_rate: Money,
    level_rates: &'a dyn LevelRateTable,
}

impl<'a> CommissionCalculator<'a> {
    pub fn new(
        store: &'a PositionStore,
        ledger: &'a VolumeLedger,
        matching_rate: Money,
        level_rates: &'a dyn LevelRateTable,
    ) -> Self {
        Self {
            store,
            ledger,
            matching_rate,
            level_rates,
        }
    }

    /// `min(left, right) * rate`, from the current leg volumes.
    ///
    /// Pure: repeated calls without volume changes return the same amount.
    pub fn calculate_matching(&self, member: &MemberId) -> Result<Money, MatrixError> {
        let stats = self.ledger.stats(self.store, member)?;
        commission_on(member, stats.weaker_volume(), self.matching_rate)
    }

    /// Append a matching record for weaker-leg volume not yet paid out.
    pub fn settle_matching(
        &self,
        book: &mut CommissionBook,
        member: &MemberId,
        now: DateTime<Utc>,
    ) -> Result<Option<CommissionRecord>, MatrixError> {
        let stats = self.ledger.stats(self.store, member)?;
        let new_basis = stats.weaker_volume() - book.paid_matching_basis(member);
        // Weaker-leg volume can shrink after a rebalance; nothing is clawed back.
        if !new_basis.is_positive() {
            return Ok(None);
        }
        let amount = commission_on(member, new_basis, self.matching_rate)?;
        Ok(Some(book.append(
            *member,
            CommissionKind::Matching,
            amount,
            new_basis,
            now,
        )))
    }

    /// Level commissions owed to the uplines of `source` for `amount` of new
    /// volume. Nothing is recorded; every amount is computed up front so a
    /// caller can reject the volume before touching any state.
    pub fn level_commissions_owed(
        &self,
        source: &MemberId,
        amount: Money,
    ) -> Result<Vec<LevelCommission>, MatrixError> {
        let id = self
            .store
            .position_id_of(source)
            .ok_or(MatrixError::MemberNotFound(*source))?;
        if !amount.is_positive() {
            return Ok(Vec::new());
        }

        let max_depth = self.level_rates.max_depth();
        let mut owed = Vec::new();
        for (depth, (ancestor, _)) in (1..=max_depth).zip(self.store.ancestors(id)) {
            let rate = match self.level_rates.rate_for_depth(depth) {
                Some(rate) => rate,
                None => continue,
            };
            owed.push(LevelCommission {
                upline: self.store.get(ancestor)?.member_id,
                depth,
                amount: commission_on(source, amount, rate)?,
            });
        }
        Ok(owed)
    }

    /// Compute and record level commissions in one step.
    pub fn level_commissions(
        &self,
        book: &mut CommissionBook,
        source: &MemberId,
        amount: Money,
        now: DateTime<Utc>,
    ) -> Result<Vec<CommissionRecord>, MatrixError> {
        let owed = self.level_commissions_owed(source, amount)?;
        Ok(book.record_level(source, amount, owed, now))
    }
}

/// One upline's share of new volume, not yet recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelCommission {
    pub upline: MemberId,
    pub depth: u32,
    pub amount: Money,
}

fn commission_on(member: &MemberId, basis: Money, rate: Money) -> Result<Money, MatrixError> {
    basis
        .checked_percent_of(rate)
        .ok_or_else(|| MatrixError::InvalidAmount {
            member: *member,
            reason: format!("{}% of {} exceeds the decimal range", rate, basis),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Leg;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn m(units: i64) -> Money {
        Money::from_units(units)
    }

    fn chain(len: usize) -> (PositionStore, VolumeLedger, Vec<MemberId>) {
        let mut store = PositionStore::new();
        let mut ledger = VolumeLedger::new();
        let mut members = vec![MemberId::random()];
        let mut parent = store.create_root(members[0], now()).unwrap().id;
        ledger.on_position_created(&store, parent);
        for _ in 1..len {
            let member = MemberId::random();
            parent = store
                .create_position(member, parent, Leg::Left, now())
                .unwrap()
                .id;
            ledger.on_position_created(&store, parent);
            members.push(member);
        }
        (store, ledger, members)
    }

    #[test]
    fn test_configured_rates_lookup() {
        let rates = ConfiguredRates(vec![m(10), m(0), m(5)]);
        assert_eq!(rates.rate_for_depth(0), None);
        assert_eq!(rates.rate_for_depth(1), Some(m(10)));
        assert_eq!(rates.rate_for_depth(2), None);
        assert_eq!(rates.rate_for_depth(3), Some(m(5)));
        assert_eq!(rates.rate_for_depth(4), None);
        assert_eq!(rates.max_depth(), 3);
    }

    #[test]
    fn test_level_commissions_walk_uplines() {
        let (store, mut ledger, members) = chain(4);
        let rates = ConfiguredRates(vec![m(10), m(5)]);
        let mut book = CommissionBook::new();
        ledger.record_volume(&store, &members[3], m(200)).unwrap();

        let calc = CommissionCalculator::new(&store, &ledger, m(10), &rates);
        let records = calc
            .level_commissions(&mut book, &members[3], m(200), now())
            .unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].member_id, members[2]);
        assert_eq!(records[0].amount, m(20));
        assert_eq!(records[1].member_id, members[1]);
        assert_eq!(records[1].amount, m(10));
        assert!(book.history(&members[0]).is_empty());
    }

    #[test]
    fn test_level_commission_overflow_records_nothing() {
        let (store, ledger, members) = chain(3);
        let huge = Money::from_str_canonical("79228162514264337593543950335").unwrap();
        let rates = ConfiguredRates(vec![m(10), huge]);
        let mut book = CommissionBook::new();

        let calc = CommissionCalculator::new(&store, &ledger, m(10), &rates);
        let err = calc
            .level_commissions(&mut book, &members[2], m(200), now())
            .unwrap_err();
        assert!(matches!(err, MatrixError::InvalidAmount { member, .. } if member == members[2]));
        // the level-1 share was computable but must not be recorded alone
        assert!(book.is_empty());
    }

    #[test]
    fn test_settlement_only_pays_new_basis() {
        let mut store = PositionStore::new();
        let mut ledger = VolumeLedger::new();
        let root = MemberId::random();
        let (a, b) = (MemberId::random(), MemberId::random());
        let root_id = store.create_root(root, now()).unwrap().id;
        ledger.on_position_created(&store, root_id);
        for (member, leg) in [(a, Leg::Left), (b, Leg::Right)] {
            let id = store.create_position(member, root_id, leg, now()).unwrap().id;
            ledger.on_position_created(&store, id);
        }
        ledger.record_volume(&store, &a, m(1000)).unwrap();
        ledger.record_volume(&store, &b, m(400)).unwrap();

        let rates = ConfiguredRates::default();
        let mut book = CommissionBook::new();
        {
            let calc = CommissionCalculator::new(&store, &ledger, m(10), &rates);
            let first = calc.settle_matching(&mut book, &root, now()).unwrap().unwrap();
            assert_eq!(first.basis, m(400));
            assert_eq!(first.amount, m(40));
            assert_eq!(calc.settle_matching(&mut book, &root, now()).unwrap(), None);
        }

        ledger.record_volume(&store, &b, m(100)).unwrap();
        let calc = CommissionCalculator::new(&store, &ledger, m(10), &rates);
        let second = calc.settle_matching(&mut book, &root, now()).unwrap().unwrap();
        assert_eq!(second.basis, m(100));
        assert_eq!(second.amount, m(10));
        assert_eq!(book.paid_matching_basis(&root), m(500));

        let restored = CommissionBook::restore(book.history(&root));
        assert_eq!(restored.paid_matching_basis(&root), m(500));
    }
}
