//! In-memory journal for tests and ephemeral runs.

use super::{Journal, JournalError};
use crate::engine::{ChangeSet, PositionSnapshot, Snapshot};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

/// Journal that keeps persisted rows in memory, with optional write failures.
#[derive(Debug, Default)]
pub struct MemoryJournal {
    rows: Mutex<Snapshot>,
    fail_writes: AtomicBool,
    write_delay_ms: AtomicU64,
    writes: AtomicUsize,
}

impl MemoryJournal {
    /// Create an empty journal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from previously persisted rows.
    pub fn with_snapshot(mut self, snapshot: Snapshot) -> Self {
        self.rows = Mutex::new(snapshot);
        self
    }

    /// Make every `persist` call fail.
    pub fn failing(self) -> Self {
        self.fail_writes.store(true, Ordering::SeqCst);
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_writes.store(failing, Ordering::SeqCst);
    }

    /// Stall every `persist` call, like a journal under heavy I/O.
    pub fn set_write_delay(&self, delay: Duration) {
        self.write_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of non-empty change sets persisted.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Copy of everything persisted so far.
    pub async fn persisted(&self) -> Snapshot {
        self.rows.lock().await.clone()
    }
}

fn upsert_position(rows: &mut Vec<PositionSnapshot>, incoming: &PositionSnapshot) {
    match rows
        .iter_mut()
        .find(|p| p.position.id == incoming.position.id)
    {
        Some(existing) if existing.position.version <= incoming.position.version => {
            *existing = incoming.clone();
        }
        Some(_) => {}
        None => rows.push(incoming.clone()),
    }
}

#[async_trait]
impl Journal for MemoryJournal {
    async fn load(&self) -> Result<Snapshot, JournalError> {
        Ok(self.persisted().await)
    }

    async fn persist(&self, changes: &ChangeSet) -> Result<(), JournalError> {
        if changes.is_empty() {
            return Ok(());
        }
        let delay = self.write_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(JournalError::Unavailable("memory journal set to fail".to_string()));
        }

        let mut rows = self.rows.lock().await;
        for position in &changes.positions {
            upsert_position(&mut rows.positions, position);
        }
        rows.positions
            .retain(|p| !changes.removed_positions.contains(&p.position.id));
        rows.volume_entries
            .extend(changes.volume_entries.iter().cloned());
        rows.commissions.extend(changes.commissions.iter().cloned());
        for entry in &changes.overflow {
            match rows.overflow.iter_mut().find(|e| e.id == entry.id) {
                Some(existing) => *existing = entry.clone(),
                None => rows.overflow.push(entry.clone()),
            }
        }
        rows.rebalances.extend(changes.rebalances.iter().cloned());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MemberId;
    use crate::engine::{EngineConfig, MatrixState, PlacementRequest};
    use chrono::{DateTime, Utc};

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[tokio::test]
    async fn test_memory_journal_persists_and_loads() {
        let journal = MemoryJournal::new();
        let mut state = MatrixState::new(EngineConfig::default());
        let root = MemberId::random();
        state.place(&PlacementRequest::root(root), now()).unwrap();
        journal.persist(&state.take_changes()).await.unwrap();

        let loaded = journal.load().await.unwrap();
        assert_eq!(loaded.positions.len(), 1);
        assert_eq!(loaded.positions[0].position.member_id, root);
        assert_eq!(journal.writes(), 1);
    }

    #[tokio::test]
    async fn test_failing_journal_rejects_writes() {
        let journal = MemoryJournal::new().failing();
        let mut state = MatrixState::new(EngineConfig::default());
        state
            .place(&PlacementRequest::root(MemberId::random()), now())
            .unwrap();
        let result = journal.persist(&state.take_changes()).await;
        assert!(matches!(result, Err(JournalError::Unavailable(_))));
        assert!(journal.persisted().await.positions.is_empty());
    }

    #[tokio::test]
    async fn test_empty_change_set_is_not_counted() {
        let journal = MemoryJournal::new().failing();
        journal.persist(&ChangeSet::default()).await.unwrap();
        assert_eq!(journal.writes(), 0);
    }

    #[tokio::test]
    async fn test_write_delay_stalls_persist() {
        let journal = MemoryJournal::new();
        journal.set_write_delay(Duration::from_millis(60));
        let mut state = MatrixState::new(EngineConfig::default());
        state
            .place(&PlacementRequest::root(MemberId::random()), now())
            .unwrap();

        let started = std::time::Instant::now();
        journal.persist(&state.take_changes()).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(60));
        assert_eq!(journal.writes(), 1);
    }
}
