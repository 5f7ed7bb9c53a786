//! Network setup for downstream tools

mod env;
mod extras;
mod manager;
mod turbo;

pub use env::{ProxyEnvironment, DEFAULT_NO_PROXY, NO_PROXY_KEYS, PROXY_KEYS};
pub use extras::{apply_extras, CIVITAI_API_TOKEN, HF_ENDPOINT, HF_TOKEN};
pub use manager::{NetworkMode, NetworkSetup, ProxyOrchestrator};
pub use turbo::{Bootstrap, TURBO_KEYS};
