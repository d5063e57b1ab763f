//! Database module for SQLite persistence.
//!
//! This module provides:
//! - Database initialization and migrations
//! - SQLite pragma configuration
//! - Repository layer that loads and applies matrix change sets

pub mod migrations;
pub mod repo;

pub use migrations::init_db;
pub use repo::Repository;
