//! Integration tests for the container process lifecycle.
//!
//! These tests are implemented in:
//! `crates/stagehand-runtime/tests/lifecycle_test.rs`
//!
//! Covered scenarios:
//! - `true_runs_to_completion`: `/bin/true` goes through the handshake, hooks see `created` then `running`
//! - `duplicate_limit_never_execs`: duplicate resource limit kinds abort before any user code runs
//! - `failing_prestart_hook_never_execs`: a failing prestart hook aborts startup
//! - `empty_process_holds_until_interrupted`: empty-process mode waits for `SIGTERM`
//! - `terminal_session_relays_attach_io`: an attach client drives `cat` through the pty
