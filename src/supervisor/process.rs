//! mihomo process supervisor
//!
//! Manages the lifecycle of the detached engine process:
//! - Starting (replacing any previous instance) and readiness probing
//! - Stopping with SIGTERM, escalating to SIGKILL
//! - Liveness from the PID record, health through the proxy
//! - Ignoring PID records whose process no longer runs our config
//! - Hot reload through the control API

use super::control::ControlClient;
use crate::common::fs::remove_if_exists;
use crate::common::net::{is_port_open, wait_port_free};
use crate::common::process::{self as proc, Termination};
use crate::config::{ProxyConfig, Timings};
use crate::{Error, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};

/// Number of log lines surfaced when the engine dies during start
const LOG_TAIL_LINES: usize = 10;

/// Instance state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// No live process behind the PID record
    Stopped,
    /// Process alive, listen port not open yet
    Starting,
    /// Process alive and listening, health not yet checked
    Running,
    /// Process alive and traffic flows through it
    Healthy,
    /// Process alive but the health probe failed
    Degraded,
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceState::Stopped => write!(f, "stopped"),
            InstanceState::Starting => write!(f, "starting"),
            InstanceState::Running => write!(f, "running"),
            InstanceState::Healthy => write!(f, "healthy"),
            InstanceState::Degraded => write!(f, "degraded"),
        }
    }
}

/// Plain-text PID file in the runtime directory
#[derive(Debug, Clone)]
pub struct PidRecord {
    path: PathBuf,
}

impl PidRecord {
    pub fn new(path: PathBuf) -> Self {
        PidRecord { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Recorded PID; missing or garbled records read as `None`
    pub async fn read(&self) -> Option<u32> {
        let content = tokio::fs::read_to_string(&self.path).await.ok()?;
        content.trim().parse().ok().filter(|pid| *pid > 0)
    }

    pub async fn write(&self, pid: u32) -> Result<()> {
        tokio::fs::write(&self.path, pid.to_string()).await?;
        Ok(())
    }

    pub async fn remove(&self) -> Result<()> {
        remove_if_exists(&self.path).await
    }
}

/// Lease on a started engine process
///
/// Returned by [`ProcessSupervisor::start`]. There is exactly one owner per
/// started instance: whoever holds the handle may stop it with
/// [`ProcessSupervisor::stop_instance`], which consumes the handle. Later
/// invocations that no longer have the handle go through the PID record
/// with [`ProcessSupervisor::stop`]. Dropping the handle leaves the
/// process running.
#[derive(Debug, PartialEq, Eq)]
pub struct InstanceHandle {
    pid: u32,
    proxy_url: String,
    state: InstanceState,
}

impl InstanceHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn proxy_url(&self) -> &str {
        &self.proxy_url
    }

    /// `Running` if the port opened before `start` returned, else `Starting`
    pub fn state(&self) -> InstanceState {
        self.state
    }
}

/// Supervises one engine instance for one `ProxyConfig`
///
/// Invocations are assumed not to overlap: the PID record has a single
/// writer, the current supervisor.
pub struct ProcessSupervisor {
    binary: PathBuf,
    config_file: PathBuf,
    config_dir: PathBuf,
    log_file: PathBuf,
    proxy_port: u16,
    proxy_url: String,
    pid_record: PidRecord,
    timings: Timings,
    control: ControlClient,
}

impl ProcessSupervisor {
    /// Create a supervisor for the given configuration
    pub fn new(config: &ProxyConfig) -> Self {
        ProcessSupervisor {
            binary: config.binary_path(),
            config_file: config.config_file(),
            config_dir: config.config_dir.clone(),
            log_file: config.log_file(),
            proxy_port: config.proxy_port,
            proxy_url: config.proxy_url(),
            pid_record: PidRecord::new(config.pid_file()),
            timings: config.timings.clone(),
            control: ControlClient::new(config),
        }
    }

    pub fn pid_record(&self) -> &PidRecord {
        &self.pid_record
    }

    pub fn log_file(&self) -> &Path {
        &self.log_file
    }

    /// Check if the recorded process is alive, without signalling it
    pub async fn is_running(&self) -> bool {
        match self.pid_record.read().await {
            Some(pid) => proc::is_alive(pid) && self.owns(pid),
            None => false,
        }
    }

    /// Liveness only: `Running` or `Stopped`, no health probe
    pub async fn liveness(&self) -> InstanceState {
        if self.is_running().await {
            InstanceState::Running
        } else {
            InstanceState::Stopped
        }
    }

    /// Whether `pid` was started with our config file
    ///
    /// A PID record can outlive its process and the number can be reused.
    /// Where arguments cannot be read the record is trusted.
    fn owns(&self, pid: u32) -> bool {
        match proc::cmdline(pid) {
            Some(args) => args.iter().any(|arg| Path::new(arg) == self.config_file),
            None => true,
        }
    }

    /// Start the engine, replacing any running instance
    pub async fn start(&self) -> Result<InstanceHandle> {
        if !self.binary.exists() {
            error!("mihomo binary not found: {}", self.binary.display());
            return Err(Error::process_start(format!(
                "binary not found: {}",
                self.binary.display()
            )));
        }

        if !self.config_file.exists() {
            error!("Routing document not found: {}", self.config_file.display());
            return Err(Error::config(format!(
                "config file not found: {}",
                self.config_file.display()
            )));
        }

        if self.is_running().await {
            info!("mihomo already running, restarting");
            self.stop().await?;
            if !wait_port_free(
                self.proxy_port,
                self.timings.port_release_timeout,
                self.timings.poll_interval,
            )
            .await
            {
                warn!("Port {} still busy after stopping the previous instance", self.proxy_port);
            }
        }

        tokio::fs::create_dir_all(&self.config_dir).await?;

        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file)?;

        let mut cmd = Command::new(&self.binary);
        cmd.arg("-f")
            .arg(&self.config_file)
            .arg("-d")
            .arg(&self.config_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log))
            // Outlives the supervisor; `stop` is the only way down
            .kill_on_drop(false);

        #[cfg(unix)]
        cmd.process_group(0);

        info!(
            "Starting mihomo: {} -f {} -d {}",
            self.binary.display(),
            self.config_file.display(),
            self.config_dir.display()
        );
        let mut child = proc::spawn(&mut cmd)
            .await
            .map_err(|e| Error::process_start(format!("failed to spawn mihomo: {}", e)))?;

        let pid = child
            .id()
            .ok_or_else(|| Error::process_start("mihomo exited before reporting a pid"))?;

        if let Err(e) = self.pid_record.write(pid).await {
            let _ = child.start_kill();
            return Err(e);
        }

        // Ready when the port opens; an early exit ends the wait too
        let deadline = Instant::now() + self.timings.ready_timeout;
        let ready = loop {
            if is_port_open(self.proxy_port).await {
                break true;
            }
            if matches!(child.try_wait(), Ok(Some(_))) || Instant::now() >= deadline {
                break false;
            }
            sleep(self.timings.poll_interval).await;
        };

        if let Ok(Some(status)) = child.try_wait() {
            let tail = read_log_tail(&self.log_file, LOG_TAIL_LINES).await;
            error!(
                "mihomo exited during start ({}), see {}",
                status,
                self.log_file.display()
            );
            if !tail.is_empty() {
                error!("Log tail:\n{}", tail);
            }
            let _ = self.pid_record.remove().await;
            return Err(Error::process_start(format!("mihomo exited with {}: {}", status, tail)));
        }

        let state = if ready {
            InstanceState::Running
        } else {
            warn!(
                "mihomo (PID {}) is running but port {} is not open yet",
                pid, self.proxy_port
            );
            InstanceState::Starting
        };

        info!("mihomo started (PID {}, proxy {}, {})", pid, self.proxy_url, state);
        Ok(InstanceHandle {
            pid,
            proxy_url: self.proxy_url.clone(),
            state,
        })
    }

    /// Stop the instance named by the PID record. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        let Some(pid) = self.pid_record.read().await else {
            self.pid_record.remove().await?;
            info!("No mihomo PID record, already stopped");
            return Ok(());
        };

        let result = self.terminate(pid).await;
        self.pid_record.remove().await?;
        result
    }

    /// Stop the instance behind a handle
    pub async fn stop_instance(&self, handle: InstanceHandle) -> Result<()> {
        let result = self.terminate(handle.pid).await;
        if self.pid_record.read().await == Some(handle.pid) {
            self.pid_record.remove().await?;
        }
        result
    }

    /// SIGTERM, wait, SIGKILL
    async fn terminate(&self, pid: u32) -> Result<()> {
        if proc::is_alive(pid) && !self.owns(pid) {
            warn!("PID {} is not our mihomo; discarding the stale record", pid);
            return Ok(());
        }

        if !proc::terminate(pid, Termination::Graceful)? {
            info!("mihomo (PID {}) was not running", pid);
            return Ok(());
        }

        if self.wait_exit(pid).await {
            info!("mihomo stopped (PID {})", pid);
            return Ok(());
        }

        let timeout = Error::process_stop_timeout(format!(
            "PID {} ignored SIGTERM for {:?}",
            pid, self.timings.stop_grace
        ));
        warn!("{}; sending SIGKILL", timeout);
        proc::terminate(pid, Termination::Forceful)?;

        if !self.wait_exit(pid).await {
            warn!("mihomo (PID {}) still present after SIGKILL", pid);
        } else {
            info!("mihomo killed (PID {})", pid);
        }
        Ok(())
    }

    async fn wait_exit(&self, pid: u32) -> bool {
        let deadline = Instant::now() + self.timings.stop_grace;
        loop {
            if !proc::is_alive(pid) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(self.timings.poll_interval).await;
        }
    }

    /// Hot reload the config file through the control API
    pub async fn reload(&self) -> Result<()> {
        if !self.is_running().await {
            warn!("mihomo not running, cannot hot reload");
            return Err(Error::internal("mihomo is not running"));
        }
        self.control.reload().await.map_err(|e| {
            warn!("Hot reload failed (a restart may help): {}", e);
            e
        })
    }

    /// End-to-end check: a real request through the proxy succeeds
    pub async fn health_check(&self) -> bool {
        if !self.is_running().await {
            return false;
        }
        match self.control.probe().await {
            Ok(()) => true,
            Err(e) => {
                warn!("{}", e);
                false
            }
        }
    }

    /// Current state from liveness plus health
    pub async fn state(&self) -> InstanceState {
        match self.liveness().await {
            InstanceState::Stopped => InstanceState::Stopped,
            _ if self.health_check().await => InstanceState::Healthy,
            _ => InstanceState::Degraded,
        }
    }
}

/// Last `lines` lines of the log, empty if unreadable
async fn read_log_tail(path: &Path, lines: usize) -> String {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let text = String::from_utf8_lossy(&bytes);
            let all: Vec<&str> = text.trim_end().lines().collect();
            all[all.len().saturating_sub(lines)..].join("\n")
        }
        Err(_) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_in(dir: &Path) -> ProxyConfig {
        ProxyConfig {
            install_dir: dir.join("bin"),
            config_dir: dir.join("run"),
            ..Default::default()
        }
    }

    #[test]
    fn test_state_display() {
        assert_eq!(InstanceState::Stopped.to_string(), "stopped");
        assert_eq!(InstanceState::Starting.to_string(), "starting");
        assert_eq!(InstanceState::Healthy.to_string(), "healthy");
        assert_eq!(InstanceState::Degraded.to_string(), "degraded");
    }

    #[tokio::test]
    async fn test_pid_record() {
        let dir = tempfile::tempdir().unwrap();
        let record = PidRecord::new(dir.path().join("mihomo.pid"));

        assert_eq!(record.read().await, None);
        record.write(4242).await.unwrap();
        assert_eq!(record.read().await, Some(4242));

        tokio::fs::write(record.path(), "not-a-pid").await.unwrap();
        assert_eq!(record.read().await, None);

        record.remove().await.unwrap();
        assert!(!record.path().exists());
    }

    #[tokio::test]
    async fn test_stop_without_record_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = ProcessSupervisor::new(&config_in(dir.path()));

        supervisor.stop().await.unwrap();
        supervisor.stop().await.unwrap();
        assert!(!supervisor.pid_record().path().exists());
        assert!(!supervisor.is_running().await);
        assert_eq!(supervisor.state().await, InstanceState::Stopped);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_foreign_pid_is_not_signalled() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = ProcessSupervisor::new(&config_in(dir.path()));
        tokio::fs::create_dir_all(dir.path().join("run")).await.unwrap();

        // A live process that is not the engine took over the recorded pid
        let mut other = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        supervisor.pid_record().write(other.id()).await.unwrap();

        assert!(!supervisor.is_running().await);
        assert_eq!(supervisor.liveness().await, InstanceState::Stopped);

        supervisor.stop().await.unwrap();
        assert!(other.try_wait().unwrap().is_none());
        assert!(!supervisor.pid_record().path().exists());

        other.kill().unwrap();
        other.wait().unwrap();
    }

    #[tokio::test]
    async fn test_start_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = ProcessSupervisor::new(&config_in(dir.path()));

        let result = supervisor.start().await;
        assert!(matches!(result, Err(Error::ProcessStart(_))));
    }

    #[tokio::test]
    async fn test_reload_when_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = ProcessSupervisor::new(&config_in(dir.path()));
        assert!(supervisor.reload().await.is_err());
        assert!(!supervisor.health_check().await);
    }

    #[tokio::test]
    async fn test_log_tail() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("mihomo.log");
        let content: String = (1..=15).map(|i| format!("line {}\n", i)).collect();
        tokio::fs::write(&log, content).await.unwrap();

        let tail = read_log_tail(&log, 3).await;
        assert_eq!(tail, "line 13\nline 14\nline 15");
        assert_eq!(read_log_tail(&dir.path().join("missing.log"), 3).await, "");
    }
}
