use super::commission::{CommissionBook, CommissionCalculator, ConfiguredRates, LevelRateTable};
use super::invariants::{self, AuditReport};
use super::ledger::VolumeLedger;
use super::overflow::{OverflowQueue, ResolveOutcome, SweepReport};
use super::placement::{Placement, PlacementOutcome, PlacementPlan, PlacementRequest, SpilloverPolicy};
use super::rebalance::{describe_move, MovePlan, RebalanceOutcome, RebalanceSettings, Rebalancer};
use super::store::PositionStore;
use super::{EngineConfig, MatrixError};
use crate::domain::{
    CommissionRecord, Leg, LegStats, MatrixPosition, MemberId, Money, OverflowEntry, OverflowId,
    Performance, PositionId, RebalanceRecord, VolumeEntry,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, error, warn};

/// A position together with its own (not aggregated) volume, as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionSnapshot {
    pub position: MatrixPosition,
    pub own_volume: Money,
}

/// Everything needed to rebuild a [`MatrixState`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub positions: Vec<PositionSnapshot>,
    pub volume_entries: Vec<VolumeEntry>,
    pub commissions: Vec<CommissionRecord>,
    pub overflow: Vec<OverflowEntry>,
    pub rebalances: Vec<RebalanceRecord>,
}

/// Mutations accumulated since the last [`MatrixState::take_changes`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub positions: Vec<PositionSnapshot>,
    pub removed_positions: Vec<PositionId>,
    pub volume_entries: Vec<VolumeEntry>,
    pub commissions: Vec<CommissionRecord>,
    pub overflow: Vec<OverflowEntry>,
    pub rebalances: Vec<RebalanceRecord>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
            && self.removed_positions.is_empty()
            && self.volume_entries.is_empty()
            && self.commissions.is_empty()
            && self.overflow.is_empty()
            && self.rebalances.is_empty()
    }
}

/// Result of recording volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeReceipt {
    pub entry: VolumeEntry,
    pub level_commissions: Vec<CommissionRecord>,
}

/// One page of a pre-order subtree walk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubtreePage {
    pub positions: Vec<MatrixPosition>,
    /// Pass back as `after` to continue; `None` when the walk is complete.
    pub next_cursor: Option<PositionId>,
}

/// The whole matrix: tree, ledger, commissions, overflow queue and audit logs.
#[derive(Debug)]
pub struct MatrixState {
    config: EngineConfig,
    rates: Box<dyn LevelRateTable>,
    store: PositionStore,
    ledger: VolumeLedger,
    commissions: CommissionBook,
    overflow: OverflowQueue,
    rebalances: Vec<RebalanceRecord>,
    volume_entries: Vec<VolumeEntry>,
    touched: BTreeSet<PositionId>,
    changes: ChangeSet,
}

impl MatrixState {
    pub fn new(config: EngineConfig) -> Self {
        let rates = Box::new(ConfiguredRates(config.level_rates.clone()));
        Self {
            config,
            rates,
            store: PositionStore::new(),
            ledger: VolumeLedger::new(),
            commissions: CommissionBook::new(),
            overflow: OverflowQueue::new(),
            rebalances: Vec::new(),
            volume_entries: Vec::new(),
            touched: BTreeSet::new(),
            changes: ChangeSet::default(),
        }
    }

    /// Replace the level-commission rate table.
    pub fn with_rate_table(mut self, rates: Box<dyn LevelRateTable>) -> Self {
        self.rates = rates;
        self
    }

    /// Rebuild from persisted rows; aggregates are re-derived and audited.
    pub fn restore(config: EngineConfig, snapshot: Snapshot) -> Result<Self, MatrixError> {
        let own: HashMap<PositionId, Money> = snapshot
            .positions
            .iter()
            .map(|p| (p.position.id, p.own_volume))
            .collect();
        let store =
            PositionStore::restore(snapshot.positions.into_iter().map(|p| p.position).collect())?;
        let ledger = VolumeLedger::rebuild(&store, &own)?;

        let mut rebalances = snapshot.rebalances;
        rebalances.sort_by_key(|r| r.id);
        let mut volume_entries = snapshot.volume_entries;
        volume_entries.sort_by_key(|v| v.id);

        let mut state = Self::new(config);
        state.store = store;
        state.ledger = ledger;
        state.commissions = CommissionBook::restore(snapshot.commissions);
        state.overflow = OverflowQueue::restore(snapshot.overflow);
        state.rebalances = rebalances;
        state.volume_entries = volume_entries;

        let report = state.audit();
        if !report.is_clean() {
            return Err(MatrixError::InvariantViolation(report.violations.join("; ")));
        }
        Ok(state)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &PositionStore {
        &self.store
    }

    pub fn ledger(&self) -> &VolumeLedger {
        &self.ledger
    }

    /// Drain the mutations made since the previous call.
    pub fn take_changes(&mut self) -> ChangeSet {
        let mut changes = std::mem::take(&mut self.changes);
        for id in std::mem::take(&mut self.touched) {
            if let Ok(position) = self.store.get(id) {
                changes.positions.push(PositionSnapshot {
                    position: position.clone(),
                    own_volume: self.ledger.own_volume(id),
                });
            }
        }
        changes
    }

    fn rebalance_settings(&self) -> RebalanceSettings {
        RebalanceSettings {
            threshold: self.config.rebalance_threshold,
            max_moves: self.config.rebalance_max_moves,
            bounds: self.config.bounds(),
        }
    }

    fn planner(&self) -> Placement<'_> {
        Placement::new(
            &self.store,
            &self.ledger,
            self.config.policy,
            self.config.bounds(),
        )
    }

    fn calculator(&self) -> CommissionCalculator<'_> {
        CommissionCalculator::new(
            &self.store,
            &self.ledger,
            self.config.matching_rate,
            self.rates.as_ref(),
        )
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn get_position(&self, member: &MemberId) -> Result<MatrixPosition, MatrixError> {
        self.store.get_position(member).cloned()
    }

    /// Pre-order page of the member's subtree, resuming after `after`.
    pub fn subtree_page(
        &self,
        member: &MemberId,
        after: Option<PositionId>,
        limit: usize,
    ) -> Result<SubtreePage, MatrixError> {
        let root = self.store.get_position(member)?.id;
        let iter = match after {
            Some(cursor) => self.store.subtree_after(root, cursor)?,
            None => self.store.subtree(root),
        };
        let mut iter = iter.peekable();
        let positions: Vec<MatrixPosition> = iter.by_ref().take(limit.max(1)).cloned().collect();
        let next_cursor = match (iter.peek(), positions.last()) {
            (Some(_), Some(last)) => Some(last.id),
            _ => None,
        };
        Ok(SubtreePage {
            positions,
            next_cursor,
        })
    }

    pub fn stats(&self, member: &MemberId) -> Result<LegStats, MatrixError> {
        self.ledger.stats(&self.store, member)
    }

    pub fn performance(
        &self,
        member: &MemberId,
        now: DateTime<Utc>,
    ) -> Result<Performance, MatrixError> {
        self.ledger
            .performance(&self.store, member, now, self.config.growth_window)
    }

    pub fn calculate_matching_commission(&self, member: &MemberId) -> Result<Money, MatrixError> {
        self.calculator().calculate_matching(member)
    }

    pub fn commission_history(&self, member: &MemberId) -> Vec<CommissionRecord> {
        self.commissions.history(member)
    }

    pub fn volume_history(&self, member: &MemberId) -> Vec<VolumeEntry> {
        self.volume_entries
            .iter()
            .filter(|v| &v.member_id == member)
            .cloned()
            .collect()
    }

    pub fn overflow_entry(&self, id: OverflowId) -> Result<OverflowEntry, MatrixError> {
        self.overflow.get(id).cloned()
    }

    /// Pending overflow entries aimed anywhere inside the member's subtree.
    pub fn list_pending_overflow(&self, member: &MemberId) -> Result<Vec<OverflowEntry>, MatrixError> {
        let root = self.store.get_position(member)?.id;
        Ok(self.overflow.pending_under(&self.store, root))
    }

    /// Moves pivoted at the member or anywhere below it.
    pub fn rebalance_history(&self, member: &MemberId) -> Result<Vec<RebalanceRecord>, MatrixError> {
        let root = self.store.get_position(member)?.id;
        Ok(self
            .rebalances
            .iter()
            .filter(|r| {
                self.store
                    .position_id_of(&r.pivot_member_id)
                    .and_then(|pivot| self.store.depth_below(root, pivot))
                    .is_some()
            })
            .cloned()
            .collect())
    }

    pub fn audit(&self) -> AuditReport {
        invariants::audit(&self.store, &self.ledger)
    }

    // =========================================================================
    // Placement
    // =========================================================================

    fn ensure_not_enrolled(&self, member: &MemberId) -> Result<(), MatrixError> {
        if self.store.position_id_of(member).is_some() || self.overflow.pending_for(member).is_some()
        {
            return Err(MatrixError::AlreadyEnrolled(*member));
        }
        Ok(())
    }

    /// Read-only half of a placement.
    pub fn plan_placement(&self, request: &PlacementRequest) -> Result<PlacementPlan, MatrixError> {
        self.ensure_not_enrolled(&request.member_id)?;
        self.planner().plan(request)
    }

    /// Apply a plan, re-validating it against the current tree. A plan made
    /// stale by a concurrent writer fails with `Contention`.
    pub fn commit_placement(
        &mut self,
        request: &PlacementRequest,
        plan: PlacementPlan,
        now: DateTime<Utc>,
    ) -> Result<PlacementOutcome, MatrixError> {
        let member = request.member_id;
        self.ensure_not_enrolled(&member)?;

        match plan {
            PlacementPlan::Root => {
                let position = self.store.create_root(member, now)?;
                self.ledger.on_position_created(&self.store, position.id);
                self.touched.insert(position.id);
                Ok(PlacementOutcome::Placed { position })
            }
            PlacementPlan::Slot {
                upline,
                parent,
                leg,
                parent_version,
            } => {
                let node = self.store.get(parent).map_err(|_| MatrixError::Contention)?;
                if node.version != parent_version || node.child(leg).is_some() {
                    return Err(MatrixError::Contention);
                }
                if self.config.policy != SpilloverPolicy::Manual {
                    let within = self
                        .store
                        .depth_below(upline, parent)
                        .map_or(false, |d| d < self.config.max_search_depth);
                    if !within {
                        return Err(MatrixError::Contention);
                    }
                }
                let position = self.store.create_position(member, parent, leg, now)?;
                self.ledger.on_position_created(&self.store, position.id);
                self.touched.insert(position.id);
                self.touched.insert(parent);
                Ok(PlacementOutcome::Placed { position })
            }
            PlacementPlan::Overflow { upline, leg } => {
                let level = self
                    .store
                    .get(upline)
                    .map_err(|_| MatrixError::Contention)?
                    .level
                    + 1;
                if self.planner().search(upline, self.config.policy)?.is_some() {
                    return Err(MatrixError::Contention);
                }
                let entry = self.overflow.enqueue(member, upline, leg, level, now);
                let overflow_id = entry.id;
                self.changes.overflow.push(entry);
                Ok(PlacementOutcome::Deferred { overflow_id })
            }
        }
    }

    /// Plan and commit in one step.
    pub fn place(
        &mut self,
        request: &PlacementRequest,
        now: DateTime<Utc>,
    ) -> Result<PlacementOutcome, MatrixError> {
        let plan = self.plan_placement(request)?;
        self.commit_placement(request, plan, now)
    }

    /// Remove an unfunded leaf member.
    pub fn withdraw(
        &mut self,
        member: &MemberId,
        now: DateTime<Utc>,
    ) -> Result<MatrixPosition, MatrixError> {
        let position = self.store.get_position(member)?.clone();
        if !position.is_leaf() {
            return Err(MatrixError::NotALeaf(position.id));
        }
        self.ledger.on_position_removed(&self.store, position.id)?;
        let removed = self.store.remove_leaf(position.id, now)?;
        if let Some(parent) = removed.parent_id {
            self.touched.insert(parent);
        }
        self.touched.remove(&removed.id);
        self.changes.removed_positions.push(removed.id);
        Ok(removed)
    }

    // =========================================================================
    // Volume and commissions
    // =========================================================================

    /// Record volume at the member's own position and pay level commissions.
    ///
    /// Commission amounts and the ledger's range are both validated before
    /// anything changes, so a rejected amount leaves no trace.
    pub fn record_volume(
        &mut self,
        member: &MemberId,
        amount: Money,
        now: DateTime<Utc>,
    ) -> Result<VolumeReceipt, MatrixError> {
        let owed = self
            .calculator()
            .level_commissions_owed(member, amount)?;
        let id = self.ledger.record_volume(&self.store, member, amount)?;
        self.touched.insert(id);

        let entry = VolumeEntry {
            id: self.volume_entries.last().map_or(1, |v| v.id + 1),
            member_id: *member,
            amount,
            created_at: now,
        };
        self.volume_entries.push(entry.clone());
        self.changes.volume_entries.push(entry.clone());

        let level_commissions = self.commissions.record_level(member, amount, owed, now);
        self.changes
            .commissions
            .extend(level_commissions.iter().cloned());

        Ok(VolumeReceipt {
            entry,
            level_commissions,
        })
    }

    /// Pay matching commission on weaker-leg volume not yet settled.
    pub fn settle_matching(
        &mut self,
        member: &MemberId,
        now: DateTime<Utc>,
    ) -> Result<Option<CommissionRecord>, MatrixError> {
        let calculator = CommissionCalculator::new(
            &self.store,
            &self.ledger,
            self.config.matching_rate,
            self.rates.as_ref(),
        );
        let record = calculator.settle_matching(&mut self.commissions, member, now)?;
        if let Some(record) = &record {
            self.changes.commissions.push(record.clone());
        }
        Ok(record)
    }

    // =========================================================================
    // Overflow
    // =========================================================================

    /// Retry one pending entry from its intended parent.
    pub fn resolve_overflow(
        &mut self,
        id: OverflowId,
        now: DateTime<Utc>,
    ) -> Result<ResolveOutcome, MatrixError> {
        let entry = self.overflow.get(id)?.clone();
        if !entry.is_pending() {
            return Err(MatrixError::OverflowNotPending(id));
        }

        if !self.store.contains(entry.intended_parent_id) {
            let failed = self.overflow.mark_failed(id, now)?;
            self.changes.overflow.push(failed);
            return Err(MatrixError::ParentRemoved {
                entry: id,
                parent: entry.intended_parent_id,
            });
        }

        if let Ok(existing) = self.store.get_position(&entry.member_id) {
            let existing = existing.clone();
            let processed = self.overflow.mark_processed(id, existing.id, now)?;
            self.changes.overflow.push(processed);
            return Ok(ResolveOutcome::Placed { position: existing });
        }

        let policy = match self.config.policy {
            SpilloverPolicy::Manual => match entry.leg {
                Leg::Left => SpilloverPolicy::LeftPriority,
                Leg::Right => SpilloverPolicy::RightPriority,
            },
            policy => policy,
        };
        let found = self.planner().search(entry.intended_parent_id, policy)?;
        match found {
            Some((parent, leg)) => {
                let position = self
                    .store
                    .create_position(entry.member_id, parent, leg, now)?;
                self.ledger.on_position_created(&self.store, position.id);
                self.touched.insert(position.id);
                self.touched.insert(parent);
                let processed = self.overflow.mark_processed(id, position.id, now)?;
                self.changes.overflow.push(processed);
                Ok(ResolveOutcome::Placed { position })
            }
            None => {
                let attempted = self.overflow.mark_attempted(id, now)?;
                self.changes.overflow.push(attempted);
                Ok(ResolveOutcome::StillDeferred)
            }
        }
    }

    /// Retry every pending entry in creation order.
    pub fn resolve_all_pending(&mut self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        for id in self.overflow.pending_ids() {
            match self.resolve_overflow(id, now) {
                Ok(ResolveOutcome::Placed { .. }) => report.placed.push(id),
                Ok(ResolveOutcome::StillDeferred) => report.still_deferred.push(id),
                Err(MatrixError::ParentRemoved { .. }) => report.failed.push(id),
                Err(e) => {
                    warn!(overflow_id = %id, error = %e, "Overflow entry could not be resolved");
                    report.still_deferred.push(id);
                }
            }
        }
        report
    }

    // =========================================================================
    // Rebalancing
    // =========================================================================

    pub fn plan_rebalance(&self, member: &MemberId) -> Result<Option<MovePlan>, MatrixError> {
        Rebalancer::new(&self.store, &self.ledger, self.rebalance_settings()).plan(member)
    }

    /// Apply one planned move and verify conservation along both chains.
    /// The move is undone if the check fails.
    pub fn apply_move(
        &mut self,
        plan: &MovePlan,
        now: DateTime<Utc>,
    ) -> Result<RebalanceRecord, MatrixError> {
        for (id, version) in &plan.versions {
            if self.store.get(*id).ok().map(|p| p.version) != Some(*version) {
                return Err(MatrixError::Contention);
            }
        }
        let moved_member = self.store.get(plan.subtree_root)?.member_id;
        let pivot_member = self.store.get(plan.pivot)?.member_id;

        self.ledger.detach_subtree(&self.store, plan.subtree_root);
        let receipt = match self
            .store
            .move_subtree(plan.subtree_root, plan.new_parent, plan.leg, now)
        {
            Ok(receipt) => receipt,
            Err(e) => {
                self.ledger.attach_subtree(&self.store, plan.subtree_root);
                return Err(e);
            }
        };
        self.ledger.attach_subtree(&self.store, plan.subtree_root);
        self.touch_subtree(plan.subtree_root);
        self.touched.insert(receipt.old_parent);
        self.touched.insert(receipt.new_parent);

        if let Err(e) = invariants::check_chains(
            &self.store,
            &self.ledger,
            &[receipt.old_parent, receipt.new_parent],
        ) {
            error!(error = %e, subtree_root = %plan.subtree_root, "Rebalance broke conservation, undoing move");
            self.ledger.detach_subtree(&self.store, plan.subtree_root);
            self.store
                .move_subtree(plan.subtree_root, receipt.old_parent, receipt.old_leg, now)?;
            self.ledger.attach_subtree(&self.store, plan.subtree_root);
            self.touch_subtree(plan.subtree_root);
            return Err(e);
        }

        let record = RebalanceRecord {
            id: self.rebalances.last().map_or(1, |r| r.id + 1),
            member_id: moved_member,
            pivot_member_id: pivot_member,
            old_parent_id: receipt.old_parent,
            new_parent_id: receipt.new_parent,
            old_leg: receipt.old_leg,
            leg: receipt.new_leg,
            level: receipt.new_level,
            moved_volume: plan.moved_volume,
            reason: describe_move(plan, &pivot_member),
            created_at: now,
        };
        debug!(member_id = %moved_member, pivot = %pivot_member, "Subtree moved");
        self.rebalances.push(record.clone());
        self.changes.rebalances.push(record.clone());
        Ok(record)
    }

    fn touch_subtree(&mut self, root: PositionId) {
        let ids: Vec<PositionId> = self.store.subtree(root).map(|p| p.id).collect();
        self.touched.extend(ids);
    }

    /// Plan and apply up to `rebalance_max_moves` moves under the member.
    pub fn rebalance(
        &mut self,
        member: &MemberId,
        now: DateTime<Utc>,
    ) -> Result<RebalanceOutcome, MatrixError> {
        let mut moves = Vec::new();
        for _ in 0..self.rebalance_settings().max_moves.max(1) {
            match self.plan_rebalance(member)? {
                Some(plan) => moves.push(self.apply_move(&plan, now)?),
                None => break,
            }
        }
        if moves.is_empty() {
            Ok(RebalanceOutcome::NothingToRebalance)
        } else {
            Ok(RebalanceOutcome::Moved { moves })
        }
    }
}
