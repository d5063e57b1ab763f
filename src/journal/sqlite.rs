//! SQLite-backed journal.

use super::{Journal, JournalError};
use crate::db::Repository;
use crate::engine::{ChangeSet, Snapshot};
use async_trait::async_trait;
use tracing::debug;

#[async_trait]
impl Journal for Repository {
    async fn load(&self) -> Result<Snapshot, JournalError> {
        let snapshot = self.load_snapshot().await?;
        debug!(
            positions = snapshot.positions.len(),
            commissions = snapshot.commissions.len(),
            overflow = snapshot.overflow.len(),
            "Loaded matrix snapshot"
        );
        Ok(snapshot)
    }

    async fn persist(&self, changes: &ChangeSet) -> Result<(), JournalError> {
        self.apply_changes(changes).await?;
        Ok(())
    }
}
