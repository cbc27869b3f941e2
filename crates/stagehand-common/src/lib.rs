//! # stagehand-common
//!
//! Shared types, error definitions, configuration models, and constants
//! used across the entire Stagehand workspace.
//!
//! This crate is the leaf of the dependency graph. It depends on no other
//! internal crate and provides the container description, lifecycle state,
//! and error taxonomy that the runner and the controller agree on.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod config;
pub mod constants;
pub mod error;
pub mod oci;
pub mod types;
