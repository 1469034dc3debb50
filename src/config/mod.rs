use crate::connection::push_endpoint;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

const CONFIG_FILE: &str = "config.toml";
const ENV_PREFIX: &str = "CONSOLE_SYNC_";
const MIN_RECONNECT_INTERVAL_MS: u64 = 100;

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub push: PushConfig,
    pub reconnect: ReconnectConfig,
    pub session: SessionConfig,
    pub console: ConsoleConfig,
    pub status: StatusConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PushConfig {
    pub url: String,
    pub path: String,
    pub connect_timeout_ms: u64,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8443".to_string(),
            path: "/ws".to_string(),
            connect_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub interval_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self { interval_ms: 5000 }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct SessionConfig {
    pub account_id: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConsoleConfig {
    pub initial_path: String,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            initial_path: "/dashboard".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StatusConfig {
    pub enable: bool,
    pub port: u16,
    pub token: Option<String>,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enable: true,
            port: 7071,
            token: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let mut config = Self::default();
        let config_path = active_config_path();

        if let Ok(raw) = fs::read_to_string(&config_path) {
            match toml::from_str::<Config>(&raw) {
                Ok(file_config) => config = file_config,
                Err(err) => {
                    tracing::warn!(path = %config_path.display(), error = %err, "config file unreadable; using defaults")
                }
            }
        }

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| env::var(format!("{}{}", ENV_PREFIX, key)).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(val) = lookup("PUSH_URL") {
            self.push.url = val;
        }
        if let Some(val) = lookup("PUSH_PATH") {
            self.push.path = val;
        }
        if let Some(val) = lookup("RECONNECT_INTERVAL_MS") {
            if let Ok(interval) = val.parse() {
                self.reconnect.interval_ms = interval;
            }
        }

        if let Some(val) = lookup("ACCOUNT_ID") {
            self.session.account_id = Some(val);
        }
        if let Some(val) = lookup("AUTH_TOKEN") {
            self.session.token = Some(val);
        }

        if let Some(val) = lookup("INITIAL_PATH") {
            self.console.initial_path = val;
        }

        if let Some(val) = lookup("STATUS_ENABLE") {
            self.status.enable = val.parse().unwrap_or(true);
        }
        if let Some(val) = lookup("STATUS_PORT") {
            if let Ok(port) = val.parse() {
                self.status.port = port;
            }
        }
        if let Some(val) = lookup("STATUS_TOKEN") {
            self.status.token = Some(val);
        }
    }

    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.push.path.trim().is_empty() {
            return Err("push.path must be set".into());
        }
        self.push_endpoint()?;
        if self.reconnect.interval_ms < MIN_RECONNECT_INTERVAL_MS {
            return Err(format!(
                "reconnect.interval_ms must be >= {}",
                MIN_RECONNECT_INTERVAL_MS
            )
            .into());
        }
        if self.status.port == 0 {
            return Err("status.port must be non-zero".into());
        }
        let has_account = self
            .session
            .account_id
            .as_deref()
            .is_some_and(|id| !id.trim().is_empty());
        let has_token = self
            .session
            .token
            .as_deref()
            .is_some_and(|t| !t.trim().is_empty());
        if has_account && !has_token {
            return Err("session.token is required when session.account_id is set".into());
        }
        Ok(())
    }

    pub fn push_endpoint(&self) -> Result<Url, Box<dyn std::error::Error>> {
        Ok(push_endpoint(&self.push.url, &self.push.path)?)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect.interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.push.connect_timeout_ms)
    }

    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<(), Box<dyn std::error::Error>> {
        if path.as_ref().exists() {
            return Err("config.toml already exists".into());
        }
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let data = toml::to_string_pretty(&Config::default())?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        managed_config_path()
    }
}

fn managed_config_path() -> PathBuf {
    if let Ok(path) = env::var(format!("{}CONFIG_PATH", ENV_PREFIX)) {
        return PathBuf::from(path);
    }
    let appdata = env::var("APPDATA").unwrap_or_else(|_| ".".to_string());
    Path::new(&appdata).join("ConsoleSync").join(CONFIG_FILE)
}

fn active_config_path() -> PathBuf {
    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        local
    } else {
        managed_config_path()
    }
}
