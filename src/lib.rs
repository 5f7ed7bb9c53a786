//! mihomo-supervisor - Network bootstrap for ephemeral GPU instances
//!
//! Installs a pinned mihomo release, turns a subscription into a safe
//! local-only routing document, runs the engine as a detached process and
//! hands downstream tools a proxy environment. Every failure degrades to
//! the platform's bootstrap accelerator instead of aborting.
//!
//! # Architecture
//!
//! ```text
//!                    +----------------------+
//!                    |  network/ (manager)  |
//!                    +-----------+----------+
//!                                |
//!      +-------------+-----------+-----+--------------+
//!      |             |                 |              |
//! +----v-----+ +-----v------+ +--------v-----+ +------v---+
//! |installer/| | provider/  | | supervisor/  | |  state/  |
//! | (binary) | |(sub + geo) | | (pid, health)| | (backup) |
//! +----------+ +-----+------+ +--------------+ +----------+
//!                    |
//!              +-----v------+
//!              |  config/   |
//!              |  (patch)   |
//!              +------------+
//! ```

pub mod common;
pub mod config;
pub mod installer;
pub mod network;
pub mod provider;
pub mod state;
pub mod supervisor;

pub use common::error::{Error, Result};
pub use config::{NetworkSettings, ProxyConfig};
pub use network::{NetworkMode, NetworkSetup, ProxyEnvironment, ProxyOrchestrator};
pub use supervisor::{InstanceHandle, InstanceState, ProcessSupervisor};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
