//! Repository layer for database operations.
//!
//! This module provides the `Repository` struct for all database operations.
//! Methods are organized across submodules by table:
//! - `positions.rs` - Tree positions and volume entries
//! - `records.rs` - Commissions, overflow entries and rebalance records
//!
//! `apply_changes` writes one engine change set in a single transaction.

mod positions;
mod records;

use crate::domain::{Leg, MemberId, Money, PositionId};
use crate::engine::{ChangeSet, Snapshot};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;
use std::str::FromStr;

/// Repository for database operations.
#[derive(Debug, Clone)]
pub struct Repository {
    pool: SqlitePool,
}

impl Repository {
    /// Create a new repository with the given connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Repository { pool }
    }

    /// Load every persisted row needed to rebuild the matrix.
    ///
    /// # Errors
    /// Returns an error if a query fails or a stored value cannot be decoded.
    pub async fn load_snapshot(&self) -> Result<Snapshot, sqlx::Error> {
        Ok(Snapshot {
            positions: self.load_positions().await?,
            volume_entries: self.load_volume_entries().await?,
            commissions: self.load_commissions().await?,
            overflow: self.load_overflow_entries().await?,
            rebalances: self.load_rebalance_records().await?,
        })
    }

    /// Persist a change set atomically.
    ///
    /// # Errors
    /// Returns an error if the transaction fails; nothing is written then.
    pub async fn apply_changes(&self, changes: &ChangeSet) -> Result<(), sqlx::Error> {
        if changes.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for snapshot in &changes.positions {
            Self::upsert_position(&mut *tx, snapshot).await?;
        }
        for id in &changes.removed_positions {
            Self::delete_position(&mut *tx, *id).await?;
        }
        for entry in &changes.volume_entries {
            Self::insert_volume_entry(&mut *tx, entry).await?;
        }
        for record in &changes.commissions {
            Self::insert_commission(&mut *tx, record).await?;
        }
        for entry in &changes.overflow {
            Self::upsert_overflow_entry(&mut *tx, entry).await?;
        }
        for record in &changes.rebalances {
            Self::insert_rebalance_record(&mut *tx, record).await?;
        }
        tx.commit().await
    }
}

// =============================================================================
// Column codecs
// =============================================================================

fn decode_error(column: &str, value: impl std::fmt::Display) -> sqlx::Error {
    sqlx::Error::Decode(format!("invalid {} value: {}", column, value).into())
}

fn ms(at: &DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn parse_time(column: &str, ms: i64) -> Result<DateTime<Utc>, sqlx::Error> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| decode_error(column, ms))
}

fn parse_member(column: &str, raw: &str) -> Result<MemberId, sqlx::Error> {
    MemberId::from_str(raw).map_err(|_| decode_error(column, raw))
}

fn parse_money(column: &str, raw: &str) -> Result<Money, sqlx::Error> {
    Money::from_str_canonical(raw).map_err(|_| decode_error(column, raw))
}

fn parse_leg(column: &str, raw: &str) -> Result<Leg, sqlx::Error> {
    Leg::from_str(raw).map_err(|_| decode_error(column, raw))
}

fn position_id(raw: i64) -> PositionId {
    PositionId::new(raw as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;
    use crate::engine::{EngineConfig, MatrixState, PlacementRequest};
    use tempfile::TempDir;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    async fn setup() -> (TempDir, Repository) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir
            .path()
            .join("matrix.db")
            .to_string_lossy()
            .to_string();
        let pool = init_db(&db_path).await.expect("init_db failed");
        (temp_dir, Repository::new(pool))
    }

    #[tokio::test]
    async fn test_empty_database_loads_empty_snapshot() {
        let (_dir, repo) = setup().await;
        let snapshot = repo.load_snapshot().await.unwrap();
        assert_eq!(snapshot, Snapshot::default());
    }

    #[tokio::test]
    async fn test_change_sets_round_trip_through_restore() {
        let (_dir, repo) = setup().await;
        let mut state = MatrixState::new(EngineConfig::default());
        let root = MemberId::random();
        let child = MemberId::random();

        state.place(&PlacementRequest::root(root), now()).unwrap();
        repo.apply_changes(&state.take_changes()).await.unwrap();
        state
            .place(&PlacementRequest::under(child, root), now())
            .unwrap();
        repo.apply_changes(&state.take_changes()).await.unwrap();
        state
            .record_volume(&child, Money::from_units(250), now())
            .unwrap();
        repo.apply_changes(&state.take_changes()).await.unwrap();

        let restored =
            MatrixState::restore(EngineConfig::default(), repo.load_snapshot().await.unwrap())
                .unwrap();
        assert_eq!(restored.get_position(&child), state.get_position(&child));
        assert_eq!(restored.stats(&root), state.stats(&root));
        assert_eq!(
            restored.commission_history(&root),
            state.commission_history(&root)
        );
        assert_eq!(restored.volume_history(&child).len(), 1);
    }

    #[tokio::test]
    async fn test_withdrawn_position_is_deleted() {
        let (_dir, repo) = setup().await;
        let mut state = MatrixState::new(EngineConfig::default());
        let root = MemberId::random();
        let leaf = MemberId::random();
        state.place(&PlacementRequest::root(root), now()).unwrap();
        state
            .place(&PlacementRequest::under(leaf, root), now())
            .unwrap();
        repo.apply_changes(&state.take_changes()).await.unwrap();

        state.withdraw(&leaf, now()).unwrap();
        repo.apply_changes(&state.take_changes()).await.unwrap();

        let snapshot = repo.load_snapshot().await.unwrap();
        assert_eq!(snapshot.positions.len(), 1);
        assert_eq!(snapshot.positions[0].position.member_id, root);
    }

    #[tokio::test]
    async fn test_stale_position_version_does_not_overwrite() {
        let (_dir, repo) = setup().await;
        let mut state = MatrixState::new(EngineConfig::default());
        let root = MemberId::random();
        state.place(&PlacementRequest::root(root), now()).unwrap();
        let first = state.take_changes();
        state
            .place(&PlacementRequest::under(MemberId::random(), root), now())
            .unwrap();
        let second = state.take_changes();

        repo.apply_changes(&second).await.unwrap();
        repo.apply_changes(&first).await.unwrap();

        let snapshot = repo.load_snapshot().await.unwrap();
        let stored_root = snapshot
            .positions
            .iter()
            .find(|p| p.position.member_id == root)
            .unwrap();
        assert_eq!(
            stored_root.position.version,
            state.get_position(&root).unwrap().version
        );
    }
}
