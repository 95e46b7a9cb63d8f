//! Core types and trait definitions for the lineage aggregate store.
//!
//! An aggregate is a versioned entity with a stable uid, a Draft → Final →
//! Retired lifecycle, and any number of ordered selection lists whose every
//! change is kept as an append-only audit trail.
//!
//! This crate is deliberately free of database dependencies. Storage backends
//! implement [`store::EntityStore`]; [`memory::MemoryStore`] is the in-process
//! backend used by tests.

pub mod aggregate;
pub mod audit;
pub mod capability;
pub mod config;
pub mod entity;
pub mod error;
pub mod guard;
pub mod lifecycle;
pub mod memory;
pub mod repository;
pub mod selection;
pub mod store;
pub mod version;

pub use aggregate::Aggregate;
pub use error::{Error, ErrorKind, Result, StateViolation};
pub use repository::{AggregateRepository, FindOptions};
