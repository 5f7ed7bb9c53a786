//! Variables for downstream model-hub tooling

use super::env::ProxyEnvironment;
use crate::config::ExtraEnv;
use std::collections::HashMap;
use tracing::debug;

pub const HF_ENDPOINT: &str = "HF_ENDPOINT";
pub const HF_TOKEN: &str = "HF_TOKEN";
pub const CIVITAI_API_TOKEN: &str = "CIVITAI_API_TOKEN";

/// Add configured extras that the ambient environment does not already set
pub fn apply_extras(env: &mut ProxyEnvironment, extras: &ExtraEnv, ambient: &HashMap<String, String>) {
    let candidates = [
        (HF_ENDPOINT, &extras.hf_endpoint),
        (HF_TOKEN, &extras.hf_token),
        (CIVITAI_API_TOKEN, &extras.civitai_token),
    ];

    for (key, value) in candidates {
        let Some(value) = value else { continue };
        if ambient.get(key).map_or(false, |v| !v.is_empty()) {
            debug!("{} already set, keeping it", key);
            continue;
        }
        env.set(key, value.as_str());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_extras() {
        let extras = ExtraEnv {
            hf_endpoint: Some("https://hf-mirror.com".into()),
            hf_token: Some("hf_new".into()),
            civitai_token: None,
        };
        let ambient: HashMap<String, String> = [("HF_TOKEN".to_string(), "hf_mine".to_string())].into();

        let mut env = ProxyEnvironment::new();
        apply_extras(&mut env, &extras, &ambient);

        assert_eq!(env.get(HF_ENDPOINT), Some("https://hf-mirror.com"));
        assert!(!env.contains(HF_TOKEN));
        assert!(!env.contains(CIVITAI_API_TOKEN));
    }
}
