//! Gleaner DB - PostgreSQL persistence for harvest sources, runs, records
//! and errors.

pub mod repository;

pub use repository::{HarvestRepository, SCHEMA};
