//! Crash-persistent device fault tracking and health reconciliation.
//!
//! Active error ids per device live in a growable memory-mapped region
//! ([`store::PersistentStore`]) that survives process restarts. Each device's
//! health is derived from those ids and pushed to an external sink
//! ([`health::HealthReconciler`]); failed publishes are retried on a timer
//! until they succeed. [`service::HealthService`] ties both together behind a
//! single-owner event loop.

pub mod config;
pub mod core;
pub mod error;
pub mod health;
pub mod ingest;
pub mod limits;
pub mod messages;
pub mod service;
pub mod store;
