//! Orchestration: the async service around the engine and its background tasks.

pub mod service;
pub mod sweeper;

pub use service::MatrixService;
pub use sweeper::spawn_overflow_sweeper;
