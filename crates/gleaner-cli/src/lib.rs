//! Gleaner CLI - command-line front end for the catalog harvester.
//!
//! This crate wires the fetcher, catalog client and PostgreSQL store into a
//! [`gleaner_core::HarvestService`].

pub mod config;

pub use config::{Command, Config};
