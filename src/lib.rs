pub mod api;
pub mod config;
pub mod db;
pub mod domain;
pub mod engine;
pub mod error;
pub mod journal;
pub mod orchestration;

pub use config::Config;
pub use db::{init_db, Repository};
pub use domain::{Leg, LegStats, MatrixPosition, MemberId, Money, OverflowId, Performance, PositionId};
pub use engine::{EngineConfig, MatrixError, MatrixState, PlacementOutcome, PlacementRequest, SpilloverPolicy};
pub use error::AppError;
pub use journal::{Journal, JournalError, MemoryJournal};
pub use orchestration::MatrixService;
