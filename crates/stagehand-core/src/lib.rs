//! # stagehand-core
//!
//! Low-level Linux primitives applied by the container's entry process
//! between fork and exec.
//!
//! This crate provides safe abstractions over:
//! - **Resource limits**: ordered `setrlimit(2)` with duplicate detection.
//! - **Terminal**: adopting a pseudo-terminal slave as the standard streams
//!   and controlling terminal.
//! - **Security**: the policy collaborator applied right before exec.
//! - **Exec**: argv0 lookup and process image replacement.
//!
//! All unsafe system calls are encapsulated in safe wrappers with
//! proper error handling and `// SAFETY:` documentation.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod exec;
pub mod rlimit;
pub mod security;
pub mod terminal;
