//! Signal handling for a process that holds a container without running
//! a command of its own.
//!
//! Signals are read from a signalfd and turned into [`ReapEvent`] values
//! on a channel. [`reap_loop`] consumes them: child exits are reaped,
//! interrupt or terminate ends the loop.

use nix::errno::Errno;
use nix::sys::signal::{SigSet, SigmaskHow, Signal, sigprocmask};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use stagehand_common::error::{Result, StagehandError};
use tokio::sync::mpsc;

/// Event delivered to the reap loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapEvent {
    /// At least one child changed state (`SIGCHLD`).
    ChildExited,
    /// `SIGINT` or `SIGTERM` was received.
    Interrupt,
}

/// Signals the holder process waits on.
#[must_use]
pub fn holder_signals() -> SigSet {
    [Signal::SIGCHLD, Signal::SIGINT, Signal::SIGTERM]
        .into_iter()
        .collect()
}

/// Maps a delivered signal number to a reap loop event.
#[must_use]
pub fn event_for(signo: u32) -> Option<ReapEvent> {
    let signal = Signal::try_from(i32::try_from(signo).ok()?).ok()?;
    match signal {
        Signal::SIGCHLD => Some(ReapEvent::ChildExited),
        Signal::SIGINT | Signal::SIGTERM => Some(ReapEvent::Interrupt),
        _ => None,
    }
}

/// Reads signals from `fd` on a dedicated thread and forwards them as
/// events.
///
/// The signals in the descriptor's mask must be blocked in every thread of
/// the process, otherwise they are delivered normally and never reach the
/// descriptor.
pub fn signal_events(fd: SignalFd) -> mpsc::Receiver<ReapEvent> {
    let (tx, rx) = mpsc::channel(16);
    drop(std::thread::spawn(move || {
        loop {
            let event = match fd.read_signal() {
                Ok(Some(info)) => match event_for(info.ssi_signo) {
                    Some(event) => event,
                    None => continue,
                },
                Ok(None) | Err(Errno::EINTR) => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "signalfd read failed");
                    break;
                }
            };
            if tx.blocking_send(event).is_err() {
                break;
            }
        }
    }));
    rx
}

/// Reaps every exited child without blocking. Returns how many were reaped.
pub fn reap_children() -> usize {
    let mut reaped = 0;
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => return reaped,
            Ok(status) => {
                tracing::debug!(?status, "reaped child");
                reaped += 1;
            }
            Err(Errno::EINTR) => {}
            Err(e) => {
                tracing::warn!(error = %e, "waitpid failed");
                return reaped;
            }
        }
    }
}

/// Consumes events until an interrupt arrives or the channel closes,
/// calling `reap` for every child exit. Returns the total reaped.
pub async fn reap_loop<F>(mut events: mpsc::Receiver<ReapEvent>, mut reap: F) -> usize
where
    F: FnMut() -> usize,
{
    let mut total = 0;
    while let Some(event) = events.recv().await {
        match event {
            ReapEvent::ChildExited => total += reap(),
            ReapEvent::Interrupt => {
                tracing::info!("interrupted, leaving reap loop");
                break;
            }
        }
    }
    total
}

/// Signal subscriptions of a process holding a container.
///
/// Installed before the controller is released so that a `SIGTERM` sent
/// right after startup is not lost to the default disposition.
#[derive(Debug)]
pub struct TerminationWatch {
    runtime: tokio::runtime::Runtime,
    events: mpsc::Receiver<ReapEvent>,
}

impl TerminationWatch {
    /// Blocks the holder signals and starts reading them from a signalfd.
    ///
    /// Tokio's signal handling is process-global state shared with the
    /// parent after a fork, so the holder does not use it.
    ///
    /// # Errors
    ///
    /// Returns an error if the signals cannot be blocked, the signalfd
    /// cannot be created, or the runtime cannot be built.
    pub fn install() -> Result<Self> {
        let mask = holder_signals();
        sigprocmask(SigmaskHow::SIG_BLOCK, Some(&mask), None)
            .map_err(|e| StagehandError::config(format!("blocking signals: {e}")))?;
        let fd = SignalFd::with_flags(&mask, SfdFlags::SFD_CLOEXEC)
            .map_err(|e| StagehandError::config(format!("signalfd: {e}")))?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .map_err(|e| StagehandError::config(format!("signal runtime: {e}")))?;
        let events = signal_events(fd);
        Ok(Self { runtime, events })
    }

    /// Blocks in the reap loop until interrupted.
    pub fn wait(self) {
        let reaped = self.runtime.block_on(reap_loop(self.events, reap_children));
        tracing::debug!(reaped, "reap loop finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn child_events_reap_and_interrupt_stops() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(ReapEvent::ChildExited).await.unwrap();
        tx.send(ReapEvent::ChildExited).await.unwrap();
        tx.send(ReapEvent::Interrupt).await.unwrap();
        tx.send(ReapEvent::ChildExited).await.unwrap();

        let mut calls = 0;
        let total = reap_loop(rx, || {
            calls += 1;
            2
        })
        .await;

        assert_eq!(calls, 2);
        assert_eq!(total, 4);
    }

    #[test]
    fn holder_signals_map_to_events() {
        let chld = u32::try_from(Signal::SIGCHLD as i32).unwrap();
        let term = u32::try_from(Signal::SIGTERM as i32).unwrap();
        let int = u32::try_from(Signal::SIGINT as i32).unwrap();
        let hup = u32::try_from(Signal::SIGHUP as i32).unwrap();

        assert_eq!(event_for(chld), Some(ReapEvent::ChildExited));
        assert_eq!(event_for(term), Some(ReapEvent::Interrupt));
        assert_eq!(event_for(int), Some(ReapEvent::Interrupt));
        assert_eq!(event_for(hup), None);
        assert_eq!(event_for(0), None);

        let mask = holder_signals();
        assert!(mask.contains(Signal::SIGCHLD));
        assert!(mask.contains(Signal::SIGTERM));
        assert!(!mask.contains(Signal::SIGHUP));
    }

    #[tokio::test]
    async fn closed_channel_ends_the_loop() {
        let (tx, rx) = mpsc::channel(1);
        drop(tx);
        assert_eq!(reap_loop(rx, || 1).await, 0);
    }
}
