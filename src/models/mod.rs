//! Core data models for the scheduled file delivery service.
//!
//! These entities represent deliveries waiting to go out and the aggregate
//! outcome of a dispatch run. They map cleanly to database rows via
//! `sqlx::FromRow` and serialize naturally as JSON via `serde`.

pub mod batch;
pub mod delivery;
