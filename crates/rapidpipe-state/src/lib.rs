//! Quarantine persistence for the rapidpipe engine.
//!
//! Provides the [`QuarantineStore`] trait and a [`SqliteQuarantineStore`]
//! implementation that durably appends the original records of failed
//! partitions.

#![warn(clippy::pedantic)]

pub mod backend;
pub mod error;
pub mod sqlite;

pub use backend::QuarantineStore;
pub use error::StateError;
pub use sqlite::SqliteQuarantineStore;
