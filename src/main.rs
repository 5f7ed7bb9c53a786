//! mihomo-supervisor - CLI Entry Point
//!
//! `eval "$(mihomo-supervisor up)"` brings the proxy up and exports its
//! environment into the calling shell. Logs go to stderr so stdout stays
//! eval-clean.

use clap::{Parser, Subcommand};
use mihomo_supervisor::{NetworkMode, NetworkSettings, ProxyOrchestrator, VERSION};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "mihomo-supervisor")]
#[command(version = VERSION)]
#[command(about = "Install, configure and supervise a local mihomo proxy")]
struct Args {
    /// Path to the manifest (ports, version, directories, mirrors)
    #[arg(long = "manifest", global = true, default_value = "manifest.yaml")]
    manifest: PathBuf,

    /// Path to the secrets file (subscription URL, API secret, tokens)
    #[arg(long = "secrets", global = true, default_value = "secrets.yaml")]
    secrets: PathBuf,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Bring the network up and print shell exports
    Up {
        /// Run this command with the environment instead of printing it
        #[arg(last = true)]
        exec: Vec<String>,
    },
    /// Back up state and stop the engine
    Down,
    /// Show engine state
    Status,
    /// Back up runtime state to the durable directory
    Sync,
    /// Re-fetch the subscription and apply it
    Refresh,
}

fn main() -> anyhow::Result<()> {
    // Sequential control flow; one thread is enough
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let code = runtime.block_on(async_main())?;
    std::process::exit(code);
}

async fn async_main() -> anyhow::Result<i32> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("mihomo_supervisor=info".parse()?))
        .init();

    let args = Args::parse();
    let settings = load_settings(&args.manifest, &args.secrets);
    let orchestrator = ProxyOrchestrator::new(settings);

    match args.command {
        Cmd::Up { exec } => {
            let setup = orchestrator.setup().await;
            if setup.mode == NetworkMode::Proxy && !setup.healthy {
                warn!("Proxy is up but degraded");
            }

            if exec.is_empty() {
                print!("{}", setup.env.export_shell());
                return Ok(0);
            }

            let mut cmd = Command::new(&exec[0]);
            cmd.args(&exec[1..]);
            setup.env.apply_to(&mut cmd);
            let status = cmd.status().await?;
            Ok(status.code().unwrap_or(1))
        }
        Cmd::Down => {
            orchestrator.stop().await?;
            Ok(0)
        }
        Cmd::Status => {
            let supervisor = orchestrator.supervisor();
            let state = supervisor.state().await;
            let proxy = &orchestrator.settings().proxy;
            println!("state: {}", state);
            if let Some(pid) = supervisor.pid_record().read().await {
                println!("pid: {}", pid);
            }
            println!("proxy: {}", proxy.proxy_url());
            println!("controller: {}", proxy.api_url());
            println!("log: {}", supervisor.log_file().display());
            Ok(0)
        }
        Cmd::Sync => {
            let written = orchestrator.sync().await?;
            info!("Sync complete ({} file(s) written)", written);
            Ok(0)
        }
        Cmd::Refresh => {
            let outcome = orchestrator.refresh().await?;
            if outcome.is_fresh() {
                info!("Subscription refreshed");
                Ok(0)
            } else {
                Ok(1)
            }
        }
    }
}

/// Settings from disk; unreadable settings fall back to defaults
fn load_settings(manifest: &Path, secrets: &Path) -> NetworkSettings {
    match NetworkSettings::load(manifest, secrets) {
        Ok(settings) => {
            info!(
                "mihomo-supervisor v{} (engine {}, proxy port {})",
                VERSION, settings.proxy.version, settings.proxy.proxy_port
            );
            settings
        }
        Err(e) => {
            error!("Failed to load configuration, using defaults: {}", e);
            NetworkSettings::default()
        }
    }
}
