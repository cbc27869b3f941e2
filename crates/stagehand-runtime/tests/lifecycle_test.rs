//! End-to-end lifecycle tests: fork a real container process, run the
//! handshake, exec, and observe state and attach behaviour.
//!
//! Covered scenarios:
//! - `true_runs_to_completion`: configure, handshake, exec `/bin/true`, EOF, `running`
//! - `duplicate_limit_never_execs`: duplicate `nofile` limits fail before exec
//! - `failing_prestart_hook_never_execs`: a prestart hook failure aborts startup
//! - `rejected_policy_ends_stopped`: a failure after `created` is recorded as `stopped`
//! - `empty_process_holds_until_interrupted`: namespace holder mode
//! - `empty_process_after_an_earlier_launch`: holder signals survive a previous launch
//! - `terminal_session_relays_attach_io`: pty output and input through the attach socket

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use stagehand_common::config::RuntimeConfig;
use stagehand_common::constants::ATTACH_SOCKET_ANNOTATION;
use stagehand_common::error::StagehandError;
use stagehand_common::oci::{ContainerSpec, Hook, Hooks, ProcessSpec, Rlimit};
use stagehand_common::types::{ContainerId, ContainerState, StateSnapshot};
use stagehand_core::security::SecurityPolicy;
use stagehand_runtime::instance::{InstanceDir, InstanceLocator};
use stagehand_runtime::launcher::{ExitOutcome, Launcher};
use stagehand_runtime::state::JsonStateFile;

// Forked children inherit every descriptor open in the test binary, so the
// launches run one at a time.
static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(PoisonError::into_inner)
}

fn process(args: &[&str]) -> ProcessSpec {
    ProcessSpec {
        cwd: PathBuf::from("/"),
        args: args.iter().map(ToString::to_string).collect(),
        env: vec!["PATH=/usr/bin:/bin".into()],
        ..ProcessSpec::default()
    }
}

/// Hook that copies the state it receives on stdin to `out`.
fn capture_hook(out: &Path) -> Hook {
    Hook {
        path: PathBuf::from("/bin/sh"),
        args: vec!["sh".into(), "-c".into(), format!("cat > {}", out.display())],
        env: vec!["PATH=/usr/bin:/bin".into()],
        timeout: Some(10),
    }
}

fn read_state(path: &Path) -> StateSnapshot {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

fn state_file(data_dir: &Path, id: &ContainerId) -> JsonStateFile {
    JsonStateFile::for_instance(&InstanceDir::new(data_dir).instance_file(id))
}

/// Refuses every process after the controller has released it.
struct DenyAll;

impl SecurityPolicy for DenyAll {
    fn apply(&self, _process: &ProcessSpec) -> stagehand_common::error::Result<()> {
        Err(StagehandError::Policy {
            message: "denied".into(),
        })
    }
}

#[test]
fn true_runs_to_completion() {
    let _guard = serial();
    let dir = tempfile::tempdir().unwrap();
    let pre = dir.path().join("prestart.json");
    let post = dir.path().join("poststart.json");
    let id = ContainerId::new("e2e-true");

    let spec = ContainerSpec {
        process: process(&["/bin/true"]),
        hooks: Hooks {
            prestart: vec![capture_hook(&pre)],
            poststart: vec![capture_hook(&post)],
        },
        ..ContainerSpec::default()
    };

    let outcome = Launcher::new(id.clone(), RuntimeConfig::with_data_dir(dir.path().into()))
        .bundle("/bundle")
        .launch(spec)
        .unwrap();
    assert_eq!(outcome, ExitOutcome::Exited(0));

    let at_prestart = read_state(&pre);
    assert_eq!(at_prestart.status, ContainerState::Created);
    assert!(at_prestart.pid.is_some());

    let at_poststart = read_state(&post);
    assert_eq!(at_poststart.status, ContainerState::Running);
    let socket = at_poststart.annotations.get(ATTACH_SOCKET_ANNOTATION).unwrap();
    assert!(socket.ends_with("e2e-true.sock"));

    let record = state_file(dir.path(), &id).load().unwrap();
    assert_eq!(record.state.status, ContainerState::Stopped);
}

#[test]
fn duplicate_limit_never_execs() {
    let _guard = serial();
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("ran");
    let mut spec = ContainerSpec {
        process: process(&["/bin/sh", "-c", &format!("touch {}", marker.display())]),
        ..ContainerSpec::default()
    };
    spec.process.rlimits = vec![
        Rlimit::new("nofile", 1024, 1024),
        Rlimit::new("nofile", 512, 512),
    ];

    let err = Launcher::new(
        ContainerId::new("e2e-dup"),
        RuntimeConfig::with_data_dir(dir.path().into()),
    )
    .launch(spec)
    .unwrap_err();

    assert!(matches!(err, StagehandError::Sync { step: "waiting for pause", .. }));
    assert!(err.to_string().contains("duplicate resource limit kind nofile"), "{err}");
    assert!(!marker.exists());
}

#[test]
fn rejected_policy_ends_stopped() {
    let _guard = serial();
    let dir = tempfile::tempdir().unwrap();
    let id = ContainerId::new("e2e-deny");
    let spec = ContainerSpec {
        process: process(&["/bin/true"]),
        ..ContainerSpec::default()
    };

    let err = Launcher::new(id.clone(), RuntimeConfig::with_data_dir(dir.path().into()))
        .policy(Box::new(DenyAll))
        .launch(spec)
        .unwrap_err();

    assert!(matches!(err, StagehandError::Sync { step: "waiting for exec", .. }));
    let record = state_file(dir.path(), &id).load().unwrap();
    assert_eq!(record.state.status, ContainerState::Stopped);
}

#[test]
fn failing_prestart_hook_never_execs() {
    let _guard = serial();
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("ran");
    let spec = ContainerSpec {
        process: process(&["/bin/sh", "-c", &format!("touch {}", marker.display())]),
        hooks: Hooks {
            prestart: vec![Hook {
                path: PathBuf::from("/bin/false"),
                args: Vec::new(),
                env: Vec::new(),
                timeout: None,
            }],
            poststart: Vec::new(),
        },
        ..ContainerSpec::default()
    };

    let err = Launcher::new(
        ContainerId::new("e2e-hook"),
        RuntimeConfig::with_data_dir(dir.path().into()),
    )
    .launch(spec)
    .unwrap_err();

    assert!(matches!(err, StagehandError::Hook { stage: "prestart", .. }));
    std::thread::sleep(Duration::from_millis(200));
    assert!(!marker.exists());
}

fn wait_for(path: &Path) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !path.exists() {
        assert!(Instant::now() < deadline, "{} never appeared", path.display());
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn empty_process_holds_until_interrupted() {
    let _guard = serial();
    let dir = tempfile::tempdir().unwrap();
    let post = dir.path().join("poststart.json");
    let id = ContainerId::new("e2e-empty");
    let spec = ContainerSpec {
        process: process(&["/bin/this-is-never-run"]),
        hooks: Hooks {
            prestart: Vec::new(),
            poststart: vec![capture_hook(&post)],
        },
        ..ContainerSpec::default()
    };

    let data_dir = dir.path().to_path_buf();
    let launch = std::thread::spawn(move || {
        Launcher::new(id, RuntimeConfig::with_data_dir(data_dir))
            .empty_process(true)
            .launch(spec)
    });

    wait_for(&post);
    let pid = read_state(&post).pid.unwrap();
    std::thread::sleep(Duration::from_millis(200));
    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid),
        nix::sys::signal::Signal::SIGTERM,
    )
    .unwrap();

    let outcome = launch.join().unwrap().unwrap();
    assert_eq!(outcome, ExitOutcome::Exited(0));
}

#[test]
fn empty_process_after_an_earlier_launch() {
    let _guard = serial();
    let dir = tempfile::tempdir().unwrap();
    let config = RuntimeConfig::with_data_dir(dir.path().into());
    let first = ContainerSpec {
        process: process(&["/bin/true"]),
        ..ContainerSpec::default()
    };
    let outcome = Launcher::new(ContainerId::new("e2e-first"), config.clone())
        .launch(first)
        .unwrap();
    assert_eq!(outcome, ExitOutcome::Exited(0));

    let post = dir.path().join("poststart.json");
    let spec = ContainerSpec {
        process: process(&["/bin/this-is-never-run"]),
        hooks: Hooks {
            prestart: Vec::new(),
            poststart: vec![capture_hook(&post)],
        },
        ..ContainerSpec::default()
    };
    let launch = std::thread::spawn(move || {
        Launcher::new(ContainerId::new("e2e-second"), config)
            .empty_process(true)
            .launch(spec)
    });

    wait_for(&post);
    let pid = read_state(&post).pid.unwrap();
    std::thread::sleep(Duration::from_millis(200));
    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid),
        nix::sys::signal::Signal::SIGTERM,
    )
    .unwrap();

    let outcome = launch.join().unwrap().unwrap();
    assert_eq!(outcome, ExitOutcome::Exited(0));
}

#[test]
fn terminal_session_relays_attach_io() {
    let _guard = serial();
    let dir = tempfile::tempdir().unwrap();
    let id = ContainerId::new("e2e-tty");
    let mut spec = ContainerSpec {
        process: process(&["cat"]),
        ..ContainerSpec::default()
    };
    spec.process.terminal = true;

    let data_dir = dir.path().to_path_buf();
    let launch_id = id.clone();
    let launch = std::thread::spawn(move || {
        Launcher::new(launch_id, RuntimeConfig::with_data_dir(data_dir)).launch(spec)
    });

    let instance = InstanceDir::new(dir.path()).instance_file(&id);
    let socket = instance.parent().unwrap().join("e2e-tty.sock");
    wait_for(&socket);

    let mut client = UnixStream::connect(&socket).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    client.write_all(b"hello\n").unwrap();

    let mut seen = Vec::new();
    let mut buf = [0_u8; 256];
    while String::from_utf8_lossy(&seen).matches("hello").count() < 2 {
        let n = client.read(&mut buf).unwrap();
        assert!(n > 0, "attach stream closed early: {seen:?}");
        seen.extend_from_slice(&buf[..n]);
    }

    // ^D at the start of a line ends cat's input.
    client.write_all(&[0x04]).unwrap();
    let outcome = launch.join().unwrap().unwrap();
    assert_eq!(outcome, ExitOutcome::Exited(0));
}
