//! Routing document patcher
//!
//! Subscriptions arrive with whatever ports and features the provider chose.
//! Before the engine sees the document it is forced into a shape that is
//! safe on an unprivileged, shared instance:
//! - only `mixed-port` listens, on the configured port
//! - one control endpoint, on loopback
//! - no TUN, no IPv6, no process matching
//! - DNS never on port 53
//! - node selection and fake-ip cache persisted
//! - geodata URLs pointed at our mirror

use crate::common::fs::write_atomic;
use crate::config::ProxyConfig;
use crate::{Error, Result};
use serde_yaml::{Mapping, Value};
use std::path::Path;
use tracing::debug;

/// Listening-port keys superseded by `mixed-port`
pub const LEGACY_PORT_KEYS: &[&str] = &["port", "socks-port", "redir-port", "tproxy-port"];

/// Control endpoints other than the loopback TCP one
const EXTRA_CONTROLLER_KEYS: &[&str] = &[
    "external-controller-tls",
    "external-controller-unix",
    "external-controller-pipe",
];

/// Where DNS goes when the provider asked for port 53
pub const SAFE_DNS_LISTEN: &str = "127.0.0.1:1053";

fn key(k: &str) -> Value {
    Value::String(k.to_string())
}

fn set(map: &mut Mapping, k: &str, v: impl Into<Value>) {
    map.insert(key(k), v.into());
}

/// Get or create a nested mapping; non-mapping values are replaced
fn section<'a>(map: &'a mut Mapping, k: &str) -> &'a mut Mapping {
    let entry = map.entry(key(k)).or_insert_with(|| Value::Mapping(Mapping::new()));
    if !entry.is_mapping() {
        *entry = Value::Mapping(Mapping::new());
    }
    match entry {
        Value::Mapping(m) => m,
        _ => unreachable!("entry was just normalised to a mapping"),
    }
}

/// Port component of a `host:port` listen string
fn listen_port(listen: &str) -> Option<u16> {
    listen.rsplit_once(':').and_then(|(_, port)| port.trim().parse().ok())
}

/// Patch a parsed document in place
pub fn patch_document(doc: &mut Value, config: &ProxyConfig) -> Result<()> {
    if doc.is_null() {
        *doc = Value::Mapping(Mapping::new());
    }
    let map = doc
        .as_mapping_mut()
        .ok_or_else(|| Error::parse("routing document is not a YAML mapping"))?;

    for k in LEGACY_PORT_KEYS.iter().chain(EXTRA_CONTROLLER_KEYS) {
        if map.remove(*k).is_some() {
            debug!("Removed '{}' from routing document", k);
        }
    }

    set(map, "mixed-port", config.proxy_port);
    set(map, "external-controller", format!("127.0.0.1:{}", config.api_port));
    set(map, "allow-lan", false);
    set(map, "mode", "rule");
    set(map, "log-level", "warning");
    set(map, "ipv6", false);
    set(map, "find-process-mode", "off");

    let profile = section(map, "profile");
    set(profile, "store-selected", true);
    set(profile, "store-fake-ip", true);

    if map.contains_key("tun") {
        set(section(map, "tun"), "enable", false);
    }

    if let Some(Value::Mapping(dns)) = map.get_mut("dns") {
        let listen = dns.get("listen").and_then(Value::as_str).map(str::to_string);
        if let Some(listen) = listen {
            if listen_port(&listen) == Some(53) {
                debug!("DNS listen {} rewritten to {}", listen, SAFE_DNS_LISTEN);
                set(dns, "listen", SAFE_DNS_LISTEN);
            }
        }
    }

    if let Some(secret) = config.api_secret.as_deref() {
        set(map, "secret", secret);
    }

    if let Some(mirror) = config.geodata_mirrors.first() {
        let base = mirror.trim_end_matches('/');
        let geox = section(map, "geox-url");
        set(geox, "geoip", format!("{}/geoip.dat", base));
        set(geox, "geosite", format!("{}/geosite.dat", base));
        set(geox, "mmdb", format!("{}/geoip.metadb", base));
        set(geox, "asn", format!("{}/GeoLite2-ASN.mmdb", base));
    }

    Ok(())
}

/// Patch a routing document on disk
pub async fn patch_config(config: &ProxyConfig, file: &Path) -> Result<()> {
    let content = tokio::fs::read_to_string(file).await?;
    let mut doc: Value = serde_yaml::from_str(&content)?;

    patch_document(&mut doc, config)?;

    let out = serde_yaml::to_string(&doc)?;
    write_atomic(file, out.as_bytes()).await
}
