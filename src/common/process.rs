//! OS process helpers
//!
//! Thin wrappers over `kill(2)` and `/proc` used by the supervisor. A zombie
//! counts as exited: the engine is spawned detached and may never be reaped
//! by us.

use crate::{Error, Result};
use std::time::Duration;
use tokio::process::{Child, Command};

/// "Text file busy": the executable is still open for writing somewhere
const ETXTBSY: i32 = 26;

/// Termination strength
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// SIGTERM
    Graceful,
    /// SIGKILL
    Forceful,
}

/// Liveness probe without delivering a signal
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }

    match kill(Pid::from_raw(raw), None) {
        Ok(()) => !is_zombie(pid),
        // EPERM means the pid now belongs to someone else
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn is_alive(_pid: u32) -> bool {
    false
}

/// Deliver a termination signal. Returns `false` if the process is already gone.
#[cfg(unix)]
pub fn terminate(pid: u32, how: Termination) -> Result<bool> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid)
        .ok()
        .filter(|p| *p > 0)
        .ok_or_else(|| Error::internal(format!("invalid pid: {}", pid)))?;

    let signal = match how {
        Termination::Graceful => Signal::SIGTERM,
        Termination::Forceful => Signal::SIGKILL,
    };

    match kill(Pid::from_raw(raw), signal) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(e) => Err(Error::internal(format!("kill({}, {}) failed: {}", pid, signal, e))),
    }
}

#[cfg(not(unix))]
pub fn terminate(pid: u32, _how: Termination) -> Result<bool> {
    Err(Error::unsupported(format!(
        "signalling pid {} is only supported on unix",
        pid
    )))
}

/// Spawn `cmd`, retrying briefly on ETXTBSY
///
/// A freshly written executable can still be held open by a child forked
/// concurrently from another thread until that child execs.
pub async fn spawn(cmd: &mut Command) -> std::io::Result<Child> {
    let mut attempt = 0;
    loop {
        match cmd.spawn() {
            Err(e) if e.raw_os_error() == Some(ETXTBSY) && attempt < 3 => {
                attempt += 1;
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            other => return other,
        }
    }
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    // /proc/<pid>/stat: "<pid> (<comm>) <state> ..."; comm may contain ')'
    std::fs::read_to_string(format!("/proc/{}/stat", pid))
        .ok()
        .and_then(|stat| {
            let rest = &stat[stat.rfind(')')? + 1..];
            rest.split_whitespace().next().map(|state| state == "Z")
        })
        .unwrap_or(false)
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_zombie(_pid: u32) -> bool {
    false
}

/// Arguments of a live process; `None` where they cannot be read
#[cfg(target_os = "linux")]
pub fn cmdline(pid: u32) -> Option<Vec<String>> {
    let raw = std::fs::read(format!("/proc/{}/cmdline", pid)).ok()?;
    Some(
        raw.split(|b| *b == 0)
            .filter(|arg| !arg.is_empty())
            .map(|arg| String::from_utf8_lossy(arg).into_owned())
            .collect(),
    )
}

#[cfg(not(target_os = "linux"))]
pub fn cmdline(_pid: u32) -> Option<Vec<String>> {
    None
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn test_current_process_is_alive() {
        assert!(is_alive(std::process::id()));
    }

    #[test]
    fn test_invalid_pids() {
        assert!(!is_alive(0));
        assert!(!is_alive(u32::MAX));
        assert!(terminate(0, Termination::Graceful).is_err());
    }

    #[test]
    fn test_terminate_child() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        assert!(is_alive(pid));

        assert!(terminate(pid, Termination::Forceful).unwrap());
        child.wait().unwrap();
        assert!(!is_alive(pid));
        assert!(!terminate(pid, Termination::Graceful).unwrap());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_zombie_counts_as_exited() {
        let child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        // Not reaped yet: the process is a zombie until wait()
        std::thread::sleep(Duration::from_millis(200));
        assert!(!is_alive(pid));
        drop(child);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_cmdline() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let args = cmdline(child.id()).unwrap();
        assert_eq!(args.last().map(String::as_str), Some("30"));

        child.kill().unwrap();
        child.wait().unwrap();
        assert!(cmdline(child.id()).is_none());
    }
}
