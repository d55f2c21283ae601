//! Load config from file and environment.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::server::ProxyConfig;

/// Both peers live on the loopback interface.
const LOOPBACK: Ipv4Addr = Ipv4Addr::LOCALHOST;

/// Proxy configuration. File: ~/.config/citeproxy/config.toml or /etc/citeproxy/config.toml.
/// Env overrides: CITEPROXY_LISTEN_PORT, CITEPROXY_UPSTREAM_PORT, CITEPROXY_IDLE_TIMEOUT_MS.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Port the add-in talks to (default 21931).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Zotero connector server port (default 23119).
    #[serde(default = "default_upstream_port")]
    pub upstream_port: u16,
    /// Per-connection read, write and dial timeout.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Upper bound on one readiness wait.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// The log file is deleted at startup once it grows past this.
    #[serde(default = "default_log_max_bytes")]
    pub log_max_bytes: u64,
}

fn default_listen_port() -> u16 {
    21931
}
fn default_upstream_port() -> u16 {
    23119
}
fn default_idle_timeout_ms() -> u64 {
    5000
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_buffer_size() -> usize {
    8192
}
fn default_log_max_bytes() -> u64 {
    100 * 1024
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            upstream_port: default_upstream_port(),
            idle_timeout_ms: default_idle_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            buffer_size: default_buffer_size(),
            log_max_bytes: default_log_max_bytes(),
        }
    }
}

impl Config {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from((LOOPBACK, self.listen_port))
    }

    pub fn upstream_addr(&self) -> SocketAddr {
        SocketAddr::from((LOOPBACK, self.upstream_port))
    }

    /// Run-time settings for one proxy instance.
    pub fn proxy_config(&self, persistent: bool) -> ProxyConfig {
        ProxyConfig {
            listen_addr: self.listen_addr(),
            upstream_addr: self.upstream_addr(),
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            buffer_size: self.buffer_size,
            persistent,
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |name| std::env::var(name).ok());
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    override_from(&var, "CITEPROXY_LISTEN_PORT", &mut c.listen_port);
    override_from(&var, "CITEPROXY_UPSTREAM_PORT", &mut c.upstream_port);
    override_from(&var, "CITEPROXY_IDLE_TIMEOUT_MS", &mut c.idle_timeout_ms);
}

/// Unparseable values leave the field untouched.
fn override_from<T: FromStr>(var: &impl Fn(&str) -> Option<String>, name: &str, field: &mut T) {
    if let Some(v) = var(name).and_then(|s| s.trim().parse().ok()) {
        *field = v;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/citeproxy/config.toml"));
    }
    out.push(PathBuf::from("/etc/citeproxy/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    let text = std::fs::read_to_string(&path).ok()?;
    parse(&text)
}

fn parse(text: &str) -> Option<Config> {
    toml::from_str(text).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_zotero_setup() {
        let c = Config::default();
        assert_eq!(c.listen_addr(), "127.0.0.1:21931".parse::<SocketAddr>().unwrap());
        assert_eq!(c.upstream_addr(), "127.0.0.1:23119".parse::<SocketAddr>().unwrap());
        let p = c.proxy_config(false);
        assert_eq!(p.idle_timeout, Duration::from_secs(5));
        assert_eq!(p.poll_interval, Duration::from_secs(1));
        assert!(!p.persistent);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let c = parse("upstream_port = 24000\n").unwrap();
        assert_eq!(c.upstream_port, 24000);
        assert_eq!(c.listen_port, 21931);
        assert_eq!(c.log_max_bytes, 100 * 1024);
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(parse("listen_port = 1\nproxy_host = \"0.0.0.0\"\n").is_none());
    }

    #[test]
    fn env_overrides_win_and_garbage_is_ignored() {
        let mut c = Config::default();
        apply_env(&mut c, |name| match name {
            "CITEPROXY_LISTEN_PORT" => Some("31000".into()),
            "CITEPROXY_UPSTREAM_PORT" => Some("not-a-port".into()),
            "CITEPROXY_IDLE_TIMEOUT_MS" => Some(" 250 ".into()),
            _ => None,
        });
        assert_eq!(c.listen_port, 31000);
        assert_eq!(c.upstream_port, 23119);
        assert_eq!(c.idle_timeout_ms, 250);
    }
}
