//! Position and volume-entry operations for the repository.

use crate::domain::{MatrixPosition, PositionId, VolumeEntry};
use crate::engine::PositionSnapshot;
use sqlx::sqlite::SqliteConnection;
use sqlx::Row;

use super::{ms, parse_leg, parse_member, parse_money, parse_time, position_id, Repository};

impl Repository {
    /// Load all positions with their own volume, shallowest first.
    ///
    /// Child links are not stored; the engine rebuilds them from `parent_id`.
    ///
    /// # Errors
    /// Returns an error if the query fails or a row cannot be decoded.
    pub async fn load_positions(&self) -> Result<Vec<PositionSnapshot>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT id, member_id, parent_id, leg, level, own_volume, version,
                   created_at_ms, updated_at_ms
            FROM positions
            ORDER BY level ASC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let leg = match row.get::<Option<String>, _>("leg") {
                    Some(raw) => Some(parse_leg("leg", &raw)?),
                    None => None,
                };
                let position = MatrixPosition {
                    id: position_id(row.get("id")),
                    member_id: parse_member("member_id", row.get("member_id"))?,
                    parent_id: row.get::<Option<i64>, _>("parent_id").map(position_id),
                    leg,
                    level: row.get::<i64, _>("level") as u32,
                    left_child: None,
                    right_child: None,
                    version: row.get::<i64, _>("version") as u64,
                    created_at: parse_time("created_at_ms", row.get("created_at_ms"))?,
                    updated_at: parse_time("updated_at_ms", row.get("updated_at_ms"))?,
                };
                Ok(PositionSnapshot {
                    position,
                    own_volume: parse_money("own_volume", row.get("own_volume"))?,
                })
            })
            .collect()
    }

    /// Insert or update a position. An older version never overwrites a newer one.
    pub(super) async fn upsert_position(
        conn: &mut SqliteConnection,
        snapshot: &PositionSnapshot,
    ) -> Result<(), sqlx::Error> {
        let position = &snapshot.position;
        sqlx::query(
            r#"
            INSERT INTO positions
            (id, member_id, parent_id, leg, level, own_volume, version, created_at_ms, updated_at_ms)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                parent_id = excluded.parent_id,
                leg = excluded.leg,
                level = excluded.level,
                own_volume = excluded.own_volume,
                version = excluded.version,
                updated_at_ms = excluded.updated_at_ms
            WHERE excluded.version >= positions.version
            "#,
        )
        .bind(position.id.as_u64() as i64)
        .bind(position.member_id.to_string())
        .bind(position.parent_id.map(|p| p.as_u64() as i64))
        .bind(position.leg.map(|l| l.as_str()))
        .bind(position.level as i64)
        .bind(snapshot.own_volume.to_canonical_string())
        .bind(position.version as i64)
        .bind(ms(&position.created_at))
        .bind(ms(&position.updated_at))
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub(super) async fn delete_position(
        conn: &mut SqliteConnection,
        id: PositionId,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM positions WHERE id = ?")
            .bind(id.as_u64() as i64)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Load the volume event log in insertion order.
    ///
    /// # Errors
    /// Returns an error if the query fails or a row cannot be decoded.
    pub async fn load_volume_entries(&self) -> Result<Vec<VolumeEntry>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT id, member_id, amount, created_at_ms
            FROM volume_entries
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(VolumeEntry {
                    id: row.get::<i64, _>("id") as u64,
                    member_id: parse_member("member_id", row.get("member_id"))?,
                    amount: parse_money("amount", row.get("amount"))?,
                    created_at: parse_time("created_at_ms", row.get("created_at_ms"))?,
                })
            })
            .collect()
    }

    pub(super) async fn insert_volume_entry(
        conn: &mut SqliteConnection,
        entry: &VolumeEntry,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO volume_entries (id, member_id, amount, created_at_ms)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(entry.id as i64)
        .bind(entry.member_id.to_string())
        .bind(entry.amount.to_canonical_string())
        .bind(ms(&entry.created_at))
        .execute(&mut *conn)
        .await?;
        Ok(())
    }
}
