//! HTTP layer for the mirror cache.
//!
//! Serves the read-only half of the Git smart HTTP protocol from local
//! mirrors, plus JSON listings of the metadata store, health and metrics.

pub mod handler;
