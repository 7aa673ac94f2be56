//! Shared rapidpipe identifiers, failure categories, and quarantine record types.
//!
//! This crate is dependency-boundary-safe for both the engine and the state crate.

#![warn(clippy::pedantic)]

pub mod error;
pub mod ids;
pub mod quarantine;
