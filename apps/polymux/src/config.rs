//! Boot configuration: YAML file, overridden by environment variables,
//! overridden by CLI flags (12-factor order).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8317
}

fn default_auth_dir() -> String {
    "~/.polymux/auths".to_string()
}

fn default_request_retry() -> u32 {
    3
}

fn default_max_retry_interval() -> u64 {
    30
}

fn default_max_request_size() -> usize {
    50 * 1024 * 1024
}

fn default_max_response_size() -> usize {
    100 * 1024 * 1024
}

fn default_stream_timeout() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub debug: bool,
    pub auth_dir: String,
    pub api_keys: Vec<String>,
    pub disable_auth: bool,
    pub request_retry: u32,
    /// Seconds a request may wait for the closest cooldown to lift.
    pub max_retry_interval: u64,
    pub disable_cooling: bool,
    pub proxy_url: Option<String>,
    pub max_request_size: usize,
    pub max_response_size: usize,
    /// Seconds of stream silence before the connection is torn down.
    pub stream_timeout: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            debug: false,
            auth_dir: default_auth_dir(),
            api_keys: Vec::new(),
            disable_auth: false,
            request_retry: default_request_retry(),
            max_retry_interval: default_max_retry_interval(),
            disable_cooling: false,
            proxy_url: None,
            max_request_size: default_max_request_size(),
            max_response_size: default_max_response_size(),
            stream_timeout: default_stream_timeout(),
        }
    }
}

impl Config {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let text = std::fs::read_to_string(path)?;
                serde_yaml::from_str(&text)?
            }
            _ => Config::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// `POLYMUX_*` variables override the file.
    fn apply_env(&mut self) {
        if let Ok(host) = std::env::var("POLYMUX_HOST") {
            if !host.is_empty() {
                self.host = host;
            }
        }
        if let Ok(port) = std::env::var("POLYMUX_PORT") {
            if let Ok(port) = port.parse() {
                self.port = port;
            }
        }
        if let Ok(dir) = std::env::var("POLYMUX_AUTH_DIR") {
            if !dir.is_empty() {
                self.auth_dir = dir;
            }
        }
        if let Ok(keys) = std::env::var("POLYMUX_API_KEYS") {
            let keys: Vec<String> = keys
                .split(',')
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect();
            if !keys.is_empty() {
                self.api_keys = keys;
            }
        }
        if let Ok(value) = std::env::var("POLYMUX_DISABLE_AUTH") {
            self.disable_auth = value == "1" || value.eq_ignore_ascii_case("true");
        }
        if let Ok(value) = std::env::var("POLYMUX_DEBUG") {
            self.debug = value == "1" || value.eq_ignore_ascii_case("true");
        }
        if let Ok(proxy) = std::env::var("POLYMUX_PROXY_URL") {
            if !proxy.is_empty() {
                self.proxy_url = Some(proxy);
            }
        }
        if let Ok(retry) = std::env::var("POLYMUX_REQUEST_RETRY") {
            if let Ok(retry) = retry.parse() {
                self.request_retry = retry;
            }
        }
    }

    pub fn max_retry_interval(&self) -> Duration {
        Duration::from_secs(self.max_retry_interval)
    }

    pub fn auth_dir_resolved(&self) -> std::path::PathBuf {
        if let Some(rest) = self.auth_dir.strip_prefix("~/") {
            if let Some(home) = std::env::var_os("HOME") {
                return std::path::PathBuf::from(home).join(rest);
            }
        }
        std::path::PathBuf::from(&self.auth_dir)
    }
}
