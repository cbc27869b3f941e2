//! Resource limits for the container process.
//!
//! Limits are applied in the order they are listed. A kind listed twice is
//! a configuration error; limits applied before the failure stay in effect,
//! there is no rollback.

use nix::sys::resource::{Resource, setrlimit};
use stagehand_common::error::{Result, StagehandError};
use stagehand_common::oci::Rlimit;

/// Parses a limit kind such as `RLIMIT_NOFILE` or `nofile`.
///
/// # Errors
///
/// Returns a configuration error for unknown kinds.
pub fn parse_kind(kind: &str) -> Result<Resource> {
    let upper = kind.to_ascii_uppercase();
    let name = upper.strip_prefix("RLIMIT_").unwrap_or(&upper);
    let resource = match name {
        "AS" => Resource::RLIMIT_AS,
        "CORE" => Resource::RLIMIT_CORE,
        "CPU" => Resource::RLIMIT_CPU,
        "DATA" => Resource::RLIMIT_DATA,
        "FSIZE" => Resource::RLIMIT_FSIZE,
        "LOCKS" => Resource::RLIMIT_LOCKS,
        "MEMLOCK" => Resource::RLIMIT_MEMLOCK,
        "MSGQUEUE" => Resource::RLIMIT_MSGQUEUE,
        "NICE" => Resource::RLIMIT_NICE,
        "NOFILE" => Resource::RLIMIT_NOFILE,
        "NPROC" => Resource::RLIMIT_NPROC,
        "RSS" => Resource::RLIMIT_RSS,
        "RTPRIO" => Resource::RLIMIT_RTPRIO,
        "RTTIME" => Resource::RLIMIT_RTTIME,
        "SIGPENDING" => Resource::RLIMIT_SIGPENDING,
        "STACK" => Resource::RLIMIT_STACK,
        _ => {
            return Err(StagehandError::config(format!(
                "unknown resource limit kind {kind}"
            )));
        }
    };
    Ok(resource)
}

/// Applies resource limits to the calling process.
///
/// # Errors
///
/// Returns an error on an unknown or duplicated kind, or if `setrlimit(2)`
/// rejects a value.
pub fn apply_rlimits(limits: &[Rlimit]) -> Result<()> {
    apply_rlimits_with(limits, |resource, soft, hard| {
        setrlimit(resource, soft, hard).map_err(std::io::Error::from)
    })
}

/// Applies resource limits through the given setter.
///
/// Each entry is checked against the kinds already applied before the
/// setter runs, so nothing past a duplicate is ever applied.
///
/// # Errors
///
/// Returns an error on an unknown or duplicated kind, or if the setter
/// fails.
pub fn apply_rlimits_with<F>(limits: &[Rlimit], mut set: F) -> Result<()>
where
    F: FnMut(Resource, u64, u64) -> std::io::Result<()>,
{
    let mut applied: Vec<Resource> = Vec::with_capacity(limits.len());

    for limit in limits {
        let resource = parse_kind(&limit.kind)?;
        if applied.contains(&resource) {
            return Err(StagehandError::DuplicateRlimit {
                kind: limit.kind.clone(),
            });
        }
        set(resource, limit.soft, limit.hard).map_err(|e| StagehandError::Rlimit {
            kind: limit.kind.clone(),
            source: e,
        })?;
        tracing::debug!(kind = %limit.kind, soft = limit.soft, hard = limit.hard, "resource limit set");
        applied.push(resource);
    }
    Ok(())
}
