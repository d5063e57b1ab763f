//! Async front of the matrix engine.
//!
//! Reads and plans run under a shared lock. Commits take the exclusive lock
//! briefly, re-validate the plan and queue the resulting change set before
//! releasing it; the queue is written to the journal afterwards, in commit
//! order, so journal latency never holds the matrix lock. A lock that cannot
//! be taken, or a plan invalidated by a concurrent commit, is retried with
//! exponential backoff until the contention budget runs out, then surfaces
//! as `MatrixError::Contention`.

use crate::domain::{
    CommissionRecord, LegStats, MatrixPosition, MemberId, Money, OverflowEntry, OverflowId,
    Performance, PositionId, RebalanceRecord, VolumeEntry,
};
use crate::engine::{
    AuditReport, EngineConfig, MatrixError, MatrixState, PlacementOutcome, PlacementRequest,
    RebalanceOutcome, ResolveOutcome, SubtreePage, SweepReport, VolumeReceipt,
};
use crate::journal::Journal;
use backoff::future::retry;
use backoff::ExponentialBackoff;
use chrono::Utc;
use futures::stream::{self, Stream, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::engine::ChangeSet;

#[derive(Clone, Debug)]
pub struct MatrixService {
    state: Arc<RwLock<MatrixState>>,
    journal: Arc<dyn Journal>,
    /// Change sets the journal has not accepted yet, oldest first.
    backlog: Arc<Mutex<VecDeque<ChangeSet>>>,
    /// Held across journal I/O so one drainer writes at a time.
    journal_writer: Arc<Mutex<()>>,
    contention_budget: Duration,
}

fn contended() -> backoff::Error<MatrixError> {
    backoff::Error::transient(MatrixError::Contention)
}

fn classify(err: MatrixError) -> backoff::Error<MatrixError> {
    if err.is_retryable() {
        backoff::Error::transient(err)
    } else {
        backoff::Error::permanent(err)
    }
}

impl MatrixService {
    pub fn new(state: MatrixState, journal: Arc<dyn Journal>, contention_budget: Duration) -> Self {
        Self {
            state: Arc::new(RwLock::new(state)),
            journal,
            backlog: Arc::new(Mutex::new(VecDeque::new())),
            journal_writer: Arc::new(Mutex::new(())),
            contention_budget,
        }
    }

    /// Rebuild the matrix from the journal.
    pub async fn open(
        config: EngineConfig,
        journal: Arc<dyn Journal>,
        contention_budget: Duration,
    ) -> Result<Self, MatrixError> {
        let snapshot = journal.load().await?;
        let state = MatrixState::restore(config, snapshot)?;
        info!(positions = state.store().len(), "Matrix restored");
        Ok(Self::new(state, journal, contention_budget))
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: Duration::from_millis(2),
            max_interval: Duration::from_millis(100),
            max_elapsed_time: Some(self.contention_budget),
            ..Default::default()
        }
    }

    async fn read<T, F>(&self, query: F) -> Result<T, MatrixError>
    where
        F: Fn(&MatrixState) -> Result<T, MatrixError> + Send + Sync,
        T: Send,
    {
        let query = &query;
        retry(self.backoff(), || async move {
            let state = self.state.try_read().map_err(|_| contended())?;
            query(&state).map_err(classify)
        })
        .await
    }

    /// Run a mutation under the write lock and journal whatever it changed,
    /// including changes made on the way to an error.
    async fn write<T, F>(&self, command: F) -> Result<T, MatrixError>
    where
        F: Fn(&mut MatrixState) -> Result<T, MatrixError> + Send + Sync,
        T: Send,
    {
        let command = &command;
        let result = retry(self.backoff(), || async move {
            let mut state = self.state.try_write().map_err(|_| contended())?;
            let result = command(&mut state);
            self.enqueue_locked(&mut state).await;
            result.map_err(classify)
        })
        .await;
        self.drain().await;
        result
    }

    /// Move pending changes onto the backlog. Must be called with the write
    /// lock held so the backlog keeps commit order.
    async fn enqueue_locked(&self, state: &mut MatrixState) {
        let changes = state.take_changes();
        if !changes.is_empty() {
            self.backlog.lock().await.push_back(changes);
        }
    }

    /// Write queued change sets to the journal, oldest first. Returns false
    /// when the journal rejected one; it stays queued for the next drain.
    async fn drain(&self) -> bool {
        let _writer = self.journal_writer.lock().await;
        loop {
            let next = self.backlog.lock().await.front().cloned();
            let Some(next) = next else {
                return true;
            };
            match self.journal.persist(&next).await {
                Ok(()) => {
                    self.backlog.lock().await.pop_front();
                }
                Err(e) => {
                    let queued = self.backlog.lock().await.len();
                    error!(error = %e, queued, "Journal write failed, keeping change set queued");
                    return false;
                }
            }
        }
    }

    /// Retry any change sets the journal rejected earlier.
    pub async fn flush(&self) -> Result<(), MatrixError> {
        if self.drain().await {
            Ok(())
        } else {
            Err(MatrixError::Storage("journal backlog not drained".to_string()))
        }
    }

    /// True when every committed change has reached the journal.
    pub async fn is_durable(&self) -> bool {
        self.backlog.lock().await.is_empty()
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn get_position(&self, member: MemberId) -> Result<MatrixPosition, MatrixError> {
        self.read(|state| state.get_position(&member)).await
    }

    pub async fn subtree_page(
        &self,
        member: MemberId,
        after: Option<PositionId>,
        limit: usize,
    ) -> Result<SubtreePage, MatrixError> {
        self.read(|state| state.subtree_page(&member, after, limit))
            .await
    }

    /// Whole subtree in pre-order, fetched lazily one page at a time so the
    /// lock is never held for the full walk.
    pub fn subtree_stream(
        &self,
        member: MemberId,
        page_size: usize,
    ) -> impl Stream<Item = Result<MatrixPosition, MatrixError>> + '_ {
        stream::unfold(Some(None), move |cursor: Option<Option<PositionId>>| async move {
            let after = cursor?;
            match self.subtree_page(member, after, page_size).await {
                Ok(page) => {
                    let next = page.next_cursor.map(Some);
                    let items: Vec<Result<MatrixPosition, MatrixError>> =
                        page.positions.into_iter().map(Ok).collect();
                    Some((stream::iter(items), next))
                }
                Err(e) => Some((stream::iter(vec![Err(e)]), None)),
            }
        })
        .flatten()
    }

    pub async fn stats(&self, member: MemberId) -> Result<LegStats, MatrixError> {
        self.read(|state| state.stats(&member)).await
    }

    pub async fn performance(&self, member: MemberId) -> Result<Performance, MatrixError> {
        let now = Utc::now();
        self.read(|state| state.performance(&member, now)).await
    }

    pub async fn calculate_matching_commission(
        &self,
        member: MemberId,
    ) -> Result<Money, MatrixError> {
        self.read(|state| state.calculate_matching_commission(&member))
            .await
    }

    pub async fn commission_history(
        &self,
        member: MemberId,
    ) -> Result<Vec<CommissionRecord>, MatrixError> {
        self.read(|state| {
            state.get_position(&member)?;
            Ok(state.commission_history(&member))
        })
        .await
    }

    pub async fn volume_history(&self, member: MemberId) -> Result<Vec<VolumeEntry>, MatrixError> {
        self.read(|state| {
            state.get_position(&member)?;
            Ok(state.volume_history(&member))
        })
        .await
    }

    pub async fn overflow_entry(&self, id: OverflowId) -> Result<OverflowEntry, MatrixError> {
        self.read(|state| state.overflow_entry(id)).await
    }

    pub async fn list_pending_overflow(
        &self,
        member: MemberId,
    ) -> Result<Vec<OverflowEntry>, MatrixError> {
        self.read(|state| state.list_pending_overflow(&member))
            .await
    }

    pub async fn rebalance_history(
        &self,
        member: MemberId,
    ) -> Result<Vec<RebalanceRecord>, MatrixError> {
        self.read(|state| state.rebalance_history(&member)).await
    }

    pub async fn audit(&self) -> Result<AuditReport, MatrixError> {
        self.read(|state| Ok(state.audit())).await
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Place a member: plan under the shared lock, commit under the exclusive
    /// one. A plan made stale in between is re-planned.
    pub async fn place(&self, request: PlacementRequest) -> Result<PlacementOutcome, MatrixError> {
        let request = &request;
        let outcome = retry(self.backoff(), || async move {
            let plan = {
                let state = self.state.try_read().map_err(|_| contended())?;
                state.plan_placement(request).map_err(classify)?
            };
            let mut state = self.state.try_write().map_err(|_| contended())?;
            let result = state.commit_placement(request, plan, Utc::now());
            self.enqueue_locked(&mut state).await;
            result.map_err(|e| {
                if e.is_retryable() {
                    debug!(member_id = %request.member_id, "Placement plan went stale, replanning");
                }
                classify(e)
            })
        })
        .await;
        self.drain().await;

        match &outcome {
            Ok(PlacementOutcome::Placed { position }) => info!(
                member_id = %request.member_id,
                position_id = %position.id,
                level = position.level,
                "Member placed"
            ),
            Ok(PlacementOutcome::Deferred { overflow_id }) => warn!(
                member_id = %request.member_id,
                overflow_id = %overflow_id,
                "No free slot within search depth, placement deferred"
            ),
            Err(MatrixError::Contention) => {
                warn!(member_id = %request.member_id, "Placement gave up under contention")
            }
            Err(_) => {}
        }
        outcome
    }

    pub async fn withdraw(&self, member: MemberId) -> Result<MatrixPosition, MatrixError> {
        let removed = self
            .write(|state| state.withdraw(&member, Utc::now()))
            .await?;
        info!(member_id = %member, position_id = %removed.id, "Member withdrawn");
        Ok(removed)
    }

    pub async fn record_volume(
        &self,
        member: MemberId,
        amount: Money,
    ) -> Result<VolumeReceipt, MatrixError> {
        let receipt = self
            .write(|state| state.record_volume(&member, amount, Utc::now()))
            .await?;
        debug!(
            member_id = %member,
            amount = %amount,
            level_commissions = receipt.level_commissions.len(),
            "Volume recorded"
        );
        Ok(receipt)
    }

    pub async fn settle_matching(
        &self,
        member: MemberId,
    ) -> Result<Option<CommissionRecord>, MatrixError> {
        self.write(|state| state.settle_matching(&member, Utc::now()))
            .await
    }

    pub async fn resolve_overflow(&self, id: OverflowId) -> Result<ResolveOutcome, MatrixError> {
        let outcome = self
            .write(|state| state.resolve_overflow(id, Utc::now()))
            .await;
        if let Err(e @ MatrixError::ParentRemoved { .. }) = &outcome {
            warn!(overflow_id = %id, error = %e, "Overflow entry failed");
        }
        outcome
    }

    pub async fn resolve_all_pending(&self) -> Result<SweepReport, MatrixError> {
        let report = self
            .write(|state| Ok(state.resolve_all_pending(Utc::now())))
            .await?;
        if !report.placed.is_empty() || !report.failed.is_empty() {
            info!(
                placed = report.placed.len(),
                still_deferred = report.still_deferred.len(),
                failed = report.failed.len(),
                "Overflow sweep finished"
            );
        }
        Ok(report)
    }

    /// Apply up to the configured number of moves, planning each one under
    /// the shared lock and committing it under the exclusive lock.
    pub async fn rebalance(&self, member: MemberId) -> Result<RebalanceOutcome, MatrixError> {
        let max_moves = self
            .read(|state| Ok(state.config().rebalance_max_moves.max(1)))
            .await?;
        let member = &member;

        let mut moves = Vec::new();
        for _ in 0..max_moves {
            let applied = retry(self.backoff(), || async move {
                let plan = {
                    let state = self.state.try_read().map_err(|_| contended())?;
                    state.plan_rebalance(member).map_err(classify)?
                };
                let Some(plan) = plan else {
                    return Ok(None);
                };
                let mut state = self.state.try_write().map_err(|_| contended())?;
                let result = state.apply_move(&plan, Utc::now());
                self.enqueue_locked(&mut state).await;
                result.map(Some).map_err(classify)
            })
            .await;
            self.drain().await;

            match applied {
                Ok(Some(record)) => {
                    info!(
                        member_id = %record.member_id,
                        pivot = %record.pivot_member_id,
                        moved_volume = %record.moved_volume,
                        "Rebalance move applied"
                    );
                    moves.push(record);
                }
                Ok(None) => break,
                Err(e) if moves.is_empty() => return Err(e),
                Err(e) => {
                    warn!(member_id = %member, error = %e, "Rebalance stopped early");
                    break;
                }
            }
        }

        if moves.is_empty() {
            Ok(RebalanceOutcome::NothingToRebalance)
        } else {
            Ok(RebalanceOutcome::Moved { moves })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::MemoryJournal;

    fn service() -> (MatrixService, Arc<MemoryJournal>) {
        let journal = Arc::new(MemoryJournal::new());
        let service = MatrixService::new(
            MatrixState::new(EngineConfig::default()),
            journal.clone(),
            Duration::from_millis(500),
        );
        (service, journal)
    }

    #[tokio::test]
    async fn test_place_is_journaled() {
        let (service, journal) = service();
        let root = MemberId::random();
        service.place(PlacementRequest::root(root)).await.unwrap();
        assert_eq!(journal.persisted().await.positions.len(), 1);
        assert!(service.is_durable().await);
    }

    #[tokio::test]
    async fn test_journal_failure_keeps_backlog_until_flushed() {
        let (service, journal) = service();
        journal.set_failing(true);
        let root = MemberId::random();
        service.place(PlacementRequest::root(root)).await.unwrap();
        assert!(!service.is_durable().await);
        assert!(journal.persisted().await.positions.is_empty());

        journal.set_failing(false);
        service.flush().await.unwrap();
        assert!(service.is_durable().await);
        assert_eq!(journal.persisted().await.positions.len(), 1);
    }

    #[tokio::test]
    async fn test_domain_errors_are_not_retried() {
        let (service, _journal) = service();
        let started = std::time::Instant::now();
        let err = service.get_position(MemberId::random()).await.unwrap_err();
        assert!(matches!(err, MatrixError::MemberNotFound(_)));
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_held_write_lock_surfaces_contention() {
        let (service, _journal) = service();
        let service = MatrixService {
            contention_budget: Duration::from_millis(50),
            ..service
        };
        let _guard = service.state.write().await;
        let err = service
            .place(PlacementRequest::root(MemberId::random()))
            .await
            .unwrap_err();
        assert_eq!(err, MatrixError::Contention);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_journal_does_not_block_readers() {
        let (service, journal) = service();
        let service = MatrixService {
            contention_budget: Duration::from_millis(50),
            ..service
        };
        let root = MemberId::random();
        service.place(PlacementRequest::root(root)).await.unwrap();
        journal.set_write_delay(Duration::from_millis(400));

        let writer = {
            let service = service.clone();
            tokio::spawn(async move { service.record_volume(root, Money::from_units(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        // the commit is visible while its change set is still being written
        let stats = service.stats(root).await.unwrap();
        assert_eq!(stats.own_volume, Money::from_units(5));
        assert!(!service.is_durable().await);

        // a second writer commits too and waits only for its own journal turn
        service
            .record_volume(root, Money::from_units(7))
            .await
            .unwrap();
        writer.await.unwrap().unwrap();

        assert!(service.is_durable().await);
        assert_eq!(journal.persisted().await.volume_entries.len(), 2);
    }

    #[tokio::test]
    async fn test_subtree_stream_walks_every_page() {
        let (service, _journal) = service();
        let root = MemberId::random();
        service.place(PlacementRequest::root(root)).await.unwrap();
        for _ in 0..6 {
            service
                .place(PlacementRequest::under(MemberId::random(), root))
                .await
                .unwrap();
        }

        let streamed: Vec<MatrixPosition> = service
            .subtree_stream(root, 2)
            .map(|r| r.unwrap())
            .collect()
            .await;
        let page = service.subtree_page(root, None, 100).await.unwrap();
        assert_eq!(streamed, page.positions);
        assert_eq!(streamed.len(), 7);
    }
}
