//! Container process lifecycle for the Stagehand runtime.
//!
//! A container starts as a forked child that configures itself and blocks
//! on a private handshake channel. The privileged controller stops it,
//! runs prestart hooks, publishes an attach socket, records the `created`
//! state and releases it; the child applies its security policy and execs.
//! The attach service then fans the process output out to every connected
//! client and merges their input back into the process.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod attach;
pub mod broadcast;
pub mod controller;
pub mod handshake;
pub mod hooks;
pub mod instance;
pub mod launcher;
pub mod runner;
pub mod signals;
pub mod state;
