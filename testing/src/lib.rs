//! Testing utilities for the lineage index.
//!
//! Provides fast, deterministic infrastructure for exercising the
//! materialization pipeline without external services:
//!
//! - [`InMemoryMaterializedStore`]: `HashMap`-backed implementation of the
//!   full materialized-store contract
//! - [`events`]: provenance event fixtures with readable ids

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Test utilities document panics where critical

pub mod events;
pub mod store;

pub use store::InMemoryMaterializedStore;
