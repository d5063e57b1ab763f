//! Commission, overflow and rebalance record operations for the repository.

use crate::domain::{
    CommissionKind, CommissionRecord, OverflowEntry, OverflowId, OverflowStatus, RebalanceRecord,
};
use sqlx::sqlite::SqliteConnection;
use sqlx::Row;

use super::{
    decode_error, ms, parse_leg, parse_member, parse_money, parse_time, position_id, Repository,
};

impl Repository {
    /// Load every commission record in id order.
    ///
    /// # Errors
    /// Returns an error if the query fails or a row cannot be decoded.
    pub async fn load_commissions(&self) -> Result<Vec<CommissionRecord>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT id, member_id, kind, depth, source_member_id, amount, basis, created_at_ms
            FROM commissions
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let kind = match row.get::<&str, _>("kind") {
                    "matching" => CommissionKind::Matching,
                    "level" => {
                        let depth: Option<i64> = row.get("depth");
                        let source: Option<&str> = row.get("source_member_id");
                        match (depth, source) {
                            (Some(depth), Some(source)) => CommissionKind::Level {
                                depth: depth as u32,
                                source_member_id: parse_member("source_member_id", source)?,
                            },
                            _ => return Err(decode_error("level commission", "missing source")),
                        }
                    }
                    other => return Err(decode_error("kind", other)),
                };
                Ok(CommissionRecord {
                    id: row.get::<i64, _>("id") as u64,
                    member_id: parse_member("member_id", row.get("member_id"))?,
                    kind,
                    amount: parse_money("amount", row.get("amount"))?,
                    basis: parse_money("basis", row.get("basis"))?,
                    created_at: parse_time("created_at_ms", row.get("created_at_ms"))?,
                })
            })
            .collect()
    }

    pub(super) async fn insert_commission(
        conn: &mut SqliteConnection,
        record: &CommissionRecord,
    ) -> Result<(), sqlx::Error> {
        let (kind, depth, source) = match record.kind {
            CommissionKind::Matching => ("matching", None, None),
            CommissionKind::Level {
                depth,
                source_member_id,
            } => ("level", Some(depth as i64), Some(source_member_id.to_string())),
        };
        sqlx::query(
            r#"
            INSERT INTO commissions
            (id, member_id, kind, depth, source_member_id, amount, basis, created_at_ms)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(record.id as i64)
        .bind(record.member_id.to_string())
        .bind(kind)
        .bind(depth)
        .bind(source)
        .bind(record.amount.to_canonical_string())
        .bind(record.basis.to_canonical_string())
        .bind(ms(&record.created_at))
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Load the full overflow queue, including processed and failed entries.
    ///
    /// # Errors
    /// Returns an error if the query fails or a row cannot be decoded.
    pub async fn load_overflow_entries(&self) -> Result<Vec<OverflowEntry>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT id, member_id, intended_parent_id, leg, level, status, attempts,
                   placed_position_id, created_at_ms, updated_at_ms
            FROM overflow_entries
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let status_raw: &str = row.get("status");
                let status =
                    OverflowStatus::parse(status_raw).ok_or_else(|| decode_error("status", status_raw))?;
                Ok(OverflowEntry {
                    id: OverflowId::new(row.get::<i64, _>("id") as u64),
                    member_id: parse_member("member_id", row.get("member_id"))?,
                    intended_parent_id: position_id(row.get("intended_parent_id")),
                    leg: parse_leg("leg", row.get("leg"))?,
                    level: row.get::<i64, _>("level") as u32,
                    status,
                    attempts: row.get::<i64, _>("attempts") as u32,
                    placed_position_id: row
                        .get::<Option<i64>, _>("placed_position_id")
                        .map(position_id),
                    created_at: parse_time("created_at_ms", row.get("created_at_ms"))?,
                    updated_at: parse_time("updated_at_ms", row.get("updated_at_ms"))?,
                })
            })
            .collect()
    }

    pub(super) async fn upsert_overflow_entry(
        conn: &mut SqliteConnection,
        entry: &OverflowEntry,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO overflow_entries
            (id, member_id, intended_parent_id, leg, level, status, attempts,
             placed_position_id, created_at_ms, updated_at_ms)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                attempts = excluded.attempts,
                placed_position_id = excluded.placed_position_id,
                updated_at_ms = excluded.updated_at_ms
            WHERE excluded.attempts >= overflow_entries.attempts
            "#,
        )
        .bind(entry.id.as_u64() as i64)
        .bind(entry.member_id.to_string())
        .bind(entry.intended_parent_id.as_u64() as i64)
        .bind(entry.leg.as_str())
        .bind(entry.level as i64)
        .bind(entry.status.as_str())
        .bind(entry.attempts as i64)
        .bind(entry.placed_position_id.map(|p| p.as_u64() as i64))
        .bind(ms(&entry.created_at))
        .bind(ms(&entry.updated_at))
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Load every rebalance move in id order.
    ///
    /// # Errors
    /// Returns an error if the query fails or a row cannot be decoded.
    pub async fn load_rebalance_records(&self) -> Result<Vec<RebalanceRecord>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT id, member_id, pivot_member_id, old_parent_id, new_parent_id, old_leg, leg,
                   level, moved_volume, reason, created_at_ms
            FROM rebalance_records
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(RebalanceRecord {
                    id: row.get::<i64, _>("id") as u64,
                    member_id: parse_member("member_id", row.get("member_id"))?,
                    pivot_member_id: parse_member("pivot_member_id", row.get("pivot_member_id"))?,
                    old_parent_id: position_id(row.get("old_parent_id")),
                    new_parent_id: position_id(row.get("new_parent_id")),
                    old_leg: parse_leg("old_leg", row.get("old_leg"))?,
                    leg: parse_leg("leg", row.get("leg"))?,
                    level: row.get::<i64, _>("level") as u32,
                    moved_volume: parse_money("moved_volume", row.get("moved_volume"))?,
                    reason: row.get("reason"),
                    created_at: parse_time("created_at_ms", row.get("created_at_ms"))?,
                })
            })
            .collect()
    }

    pub(super) async fn insert_rebalance_record(
        conn: &mut SqliteConnection,
        record: &RebalanceRecord,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO rebalance_records
            (id, member_id, pivot_member_id, old_parent_id, new_parent_id, old_leg, leg,
             level, moved_volume, reason, created_at_ms)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(record.id as i64)
        .bind(record.member_id.to_string())
        .bind(record.pivot_member_id.to_string())
        .bind(record.old_parent_id.as_u64() as i64)
        .bind(record.new_parent_id.as_u64() as i64)
        .bind(record.old_leg.as_str())
        .bind(record.leg.as_str())
        .bind(record.level as i64)
        .bind(record.moved_volume.to_canonical_string())
        .bind(&record.reason)
        .bind(ms(&record.created_at))
        .execute(&mut *conn)
        .await?;
        Ok(())
    }
}
