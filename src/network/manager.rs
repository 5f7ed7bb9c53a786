//! Network orchestration
//!
//! Composes installer, acquirer, supervisor and state sync into one setup
//! policy. Every failure before the engine is up degrades to bootstrap
//! acceleration; nothing here returns an error from `setup`.

use super::env::ProxyEnvironment;
use super::extras::apply_extras;
use super::turbo::Bootstrap;
use crate::common::http::Route;
use crate::config::NetworkSettings;
use crate::installer::BinaryInstaller;
use crate::provider::{ConfigAcquirer, FetchOutcome, GeoDataFetcher};
use crate::state::StateSync;
use crate::supervisor::{InstanceHandle, InstanceState, ProcessSupervisor};
use crate::{Error, Result};
use tracing::{error, info, warn};

/// How downstream traffic leaves the host after `setup`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkMode {
    /// Through the supervised engine
    Proxy,
    /// Through the bootstrap accelerator
    Bootstrap,
    /// No proxy at all
    Direct,
}

impl std::fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkMode::Proxy => write!(f, "proxy"),
            NetworkMode::Bootstrap => write!(f, "bootstrap"),
            NetworkMode::Direct => write!(f, "direct"),
        }
    }
}

/// Result of `setup`
#[derive(Debug)]
pub struct NetworkSetup {
    pub mode: NetworkMode,
    /// Variables for downstream tools
    pub env: ProxyEnvironment,
    /// Lease on the started engine, `Proxy` mode only
    pub handle: Option<InstanceHandle>,
    /// Health probe result, `Proxy` mode only
    pub healthy: bool,
}

/// Drives the setup, shutdown and refresh flows
pub struct ProxyOrchestrator {
    settings: NetworkSettings,
    bootstrap: Bootstrap,
}

impl ProxyOrchestrator {
    pub fn new(settings: NetworkSettings) -> Self {
        let bootstrap = Bootstrap::from_process(settings.turbo_script.clone())
            .with_own_proxy(settings.proxy.proxy_url());
        ProxyOrchestrator { settings, bootstrap }
    }

    /// Replace the bootstrap loader
    pub fn with_bootstrap(mut self, bootstrap: Bootstrap) -> Self {
        self.bootstrap = bootstrap;
        self
    }

    pub fn settings(&self) -> &NetworkSettings {
        &self.settings
    }

    pub fn supervisor(&self) -> ProcessSupervisor {
        ProcessSupervisor::new(&self.settings.proxy)
    }

    fn state_sync(&self) -> StateSync {
        StateSync::new(&self.settings.proxy)
    }

    /// Bring the network up. Never fails; the mode says what was achieved.
    pub async fn setup(&self) -> NetworkSetup {
        let config = &self.settings.proxy;
        let bootstrap_env = self.bootstrap.load().await;
        let bootstrap_proxy = bootstrap_env.proxy_url().map(str::to_string);

        let mut setup = if !config.has_subscription() && !self.state_sync().has_snapshot().await {
            info!("No subscription and no backup snapshot; using bootstrap acceleration only");
            fallback(bootstrap_env)
        } else {
            match self.launch(bootstrap_proxy.as_deref()).await {
                Ok((handle, healthy)) => {
                    let mut env = bootstrap_env;
                    env.set_proxy(&config.proxy_url());
                    NetworkSetup {
                        mode: NetworkMode::Proxy,
                        env,
                        handle: Some(handle),
                        healthy,
                    }
                }
                Err(e) => {
                    error!("Proxy setup failed, falling back: {}", e);
                    fallback(bootstrap_env)
                }
            }
        };

        apply_extras(&mut setup.env, &self.settings.extras, self.bootstrap.ambient());
        info!("Network mode: {}", setup.mode);
        setup
    }

    /// Install, Restore, Acquire, Backup, Start, Backup, HealthCheck
    async fn launch(&self, bootstrap_proxy: Option<&str>) -> Result<(InstanceHandle, bool)> {
        let config = &self.settings.proxy;
        let route = Route::from_proxy(bootstrap_proxy);
        let state = self.state_sync();

        info!("[install] mihomo {} ({})", config.version, route);
        BinaryInstaller::new(config, route.clone()).install().await?;

        if state.restore().await {
            info!("[restore] previous state restored");
        }

        let outcome = ConfigAcquirer::new(config, bootstrap_proxy)
            .fetch(&config.config_file())
            .await?;
        if outcome == FetchOutcome::Stale {
            warn!("[acquire] running with the previous routing document");
        }

        let geodata = GeoDataFetcher::new(&config.geodata_mirrors, route, config.timings.download_timeout)
            .ensure(&config.config_dir)
            .await;
        if !geodata.is_complete() {
            warn!("[geodata] missing: {}", geodata.missing.join(", "));
        }

        if let Err(e) = state.backup().await {
            warn!("[backup] {}", e);
        }

        let supervisor = self.supervisor();
        let handle = supervisor.start().await?;

        if let Err(e) = state.backup().await {
            warn!("[backup] {}", e);
        }

        let healthy = supervisor.health_check().await;
        if healthy {
            info!("[health] traffic flows through {}", handle.proxy_url());
        } else {
            warn!("[health] engine is up but the probe failed ({})", InstanceState::Degraded);
        }

        Ok((handle, healthy))
    }

    /// Back up state and stop the engine
    pub async fn stop(&self) -> Result<()> {
        if let Err(e) = self.state_sync().backup().await {
            warn!("Backup before stop failed: {}", e);
        }
        self.supervisor().stop().await
    }

    /// Explicit sync point: back up runtime state
    pub async fn sync(&self) -> Result<usize> {
        self.state_sync().backup().await
    }

    /// Re-fetch the subscription and apply it to the running engine
    ///
    /// Hot reload is tried first; a failed reload, or a stopped engine,
    /// falls back to a full (re)start.
    pub async fn refresh(&self) -> Result<FetchOutcome> {
        let config = &self.settings.proxy;
        if !config.has_subscription() {
            return Err(Error::config("no subscription_url configured"));
        }

        let bootstrap_env = self.bootstrap.load().await;
        let supervisor = self.supervisor();
        let running = supervisor.is_running().await;

        // A running engine is a better route than the bootstrap accelerator
        let via = if running {
            Some(config.proxy_url())
        } else {
            bootstrap_env.proxy_url().map(str::to_string)
        };

        let outcome = ConfigAcquirer::new(config, via.as_deref())
            .fetch(&config.config_file())
            .await?;

        if !outcome.is_fresh() {
            warn!("Subscription unreachable; keeping the current routing document");
            return Ok(outcome);
        }

        let reloaded = running && supervisor.reload().await.is_ok();
        if !reloaded {
            info!("Restarting mihomo with the refreshed routing document");
            let handle = supervisor.start().await?;
            info!("mihomo running (PID {})", handle.pid());
        }

        if let Err(e) = self.state_sync().backup().await {
            warn!("Backup after refresh failed: {}", e);
        }
        Ok(outcome)
    }
}

fn fallback(env: ProxyEnvironment) -> NetworkSetup {
    let mode = if env.proxy_url().is_some() {
        NetworkMode::Bootstrap
    } else {
        NetworkMode::Direct
    };
    NetworkSetup {
        mode,
        env,
        handle: None,
        healthy: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExtraEnv;
    use std::collections::HashMap;

    fn settings_in(dir: &std::path::Path) -> NetworkSettings {
        let mut settings = NetworkSettings::default();
        settings.proxy.install_dir = dir.join("bin");
        settings.proxy.config_dir = dir.join("run");
        settings.proxy.backup_dir = Some(dir.join("backup"));
        settings.turbo_script = dir.join("network_turbo");
        settings
    }

    #[test]
    fn test_fallback_mode() {
        assert_eq!(fallback(ProxyEnvironment::new()).mode, NetworkMode::Direct);
        let env = ProxyEnvironment::from_vars([("https_proxy", "http://10.0.0.1:3128")]);
        assert_eq!(fallback(env).mode, NetworkMode::Bootstrap);
    }

    #[tokio::test]
    async fn test_setup_without_config_uses_bootstrap() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings_in(dir.path());
        settings.extras = ExtraEnv {
            hf_endpoint: Some("https://hf-mirror.com".into()),
            ..Default::default()
        };
        let ambient: HashMap<String, String> =
            [("http_proxy".to_string(), "http://10.0.0.1:3128".to_string())].into();
        let orchestrator = ProxyOrchestrator::new(settings)
            .with_bootstrap(Bootstrap::with_vars(ambient, dir.path().join("network_turbo")));

        let setup = orchestrator.setup().await;

        assert_eq!(setup.mode, NetworkMode::Bootstrap);
        assert!(setup.handle.is_none());
        assert_eq!(setup.env.get("http_proxy"), Some("http://10.0.0.1:3128"));
        assert_eq!(setup.env.get("HF_ENDPOINT"), Some("https://hf-mirror.com"));
        assert!(!dir.path().join("bin").exists());
    }

    #[tokio::test]
    async fn test_refresh_requires_subscription() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = ProxyOrchestrator::new(settings_in(dir.path()))
            .with_bootstrap(Bootstrap::with_vars(HashMap::new(), dir.path().join("network_turbo")));

        assert!(matches!(orchestrator.refresh().await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_stop_and_sync_when_idle() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = ProxyOrchestrator::new(settings_in(dir.path()));

        orchestrator.stop().await.unwrap();
        assert_eq!(orchestrator.sync().await.unwrap(), 0);
    }
}
