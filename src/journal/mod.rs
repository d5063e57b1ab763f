//! Journal abstraction: where matrix change sets are made durable.
//!
//! The service writes every committed change set through a [`Journal`] while
//! it still holds the write lock, so durable order matches commit order.

use crate::engine::{ChangeSet, MatrixError, Snapshot};
use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryJournal;

/// Durable store for matrix state.
#[async_trait]
pub trait Journal: Send + Sync + fmt::Debug {
    /// Load everything persisted so far.
    async fn load(&self) -> Result<Snapshot, JournalError>;

    /// Persist one change set atomically. An empty set is a no-op.
    async fn persist(&self, changes: &ChangeSet) -> Result<(), JournalError>;
}

#[derive(Debug, Error)]
pub enum JournalError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("journal unavailable: {0}")]
    Unavailable(String),
}

impl From<JournalError> for MatrixError {
    fn from(err: JournalError) -> Self {
        MatrixError::Storage(err.to_string())
    }
}
