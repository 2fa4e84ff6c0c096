use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::validation;

pub const DEFAULT_PORT: u16 = 6667;
pub const DEFAULT_USER: &str = "slirc";
pub const DEFAULT_REALNAME: &str = "SLIRC Engine";

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_user() -> String {
    DEFAULT_USER.to_string()
}

fn default_realname() -> String {
    DEFAULT_REALNAME.to_string()
}

fn default_true() -> bool {
    true
}

/// Everything needed for one connection attempt.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    pub server: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub tls: bool,
    pub nick: String,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default = "default_realname")]
    pub real_name: String,
    /// Joined after welcome / end of MOTD, and tracked for membership.
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default = "default_true")]
    pub request_caps: bool,
    #[serde(default)]
    pub sasl_account: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sasl_password: Option<String>,
}

impl SessionConfig {
    pub fn new(server: impl Into<String>, nick: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            port: DEFAULT_PORT,
            tls: false,
            nick: nick.into(),
            user: default_user(),
            real_name: default_realname(),
            channel: None,
            request_caps: true,
            sasl_account: None,
            sasl_password: None,
        }
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn with_sasl(mut self, account: impl Into<String>, password: impl Into<String>) -> Self {
        self.sasl_account = Some(account.into());
        self.sasl_password = Some(password.into());
        self
    }

    /// `(account, password)` when both are configured.
    pub fn sasl_credentials(&self) -> Option<(&str, &str)> {
        match (&self.sasl_account, &self.sasl_password) {
            (Some(a), Some(p)) => Some((a.as_str(), p.as_str())),
            _ => None,
        }
    }

    /// Copy of this configuration switched to TLS on `port` (STS upgrade).
    pub fn with_sts_upgrade(&self, port: u16) -> Self {
        Self {
            tls: true,
            port,
            ..self.clone()
        }
    }

    /// The auto-join channel, ignoring blank values.
    pub fn auto_join(&self) -> Option<&str> {
        self.channel.as_deref().map(str::trim).filter(|c| !c.is_empty())
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.server, self.port)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validation::validate_host(&self.server).map_err(ConfigError::Invalid)?;
        if self.port == 0 {
            return Err(ConfigError::Invalid("Port number must be greater than 0".into()));
        }
        validation::validate_nickname(&self.nick).map_err(ConfigError::Invalid)?;
        if self.user.trim().is_empty() || self.user.contains(' ') {
            return Err(ConfigError::Invalid(format!("Invalid username: {:?}", self.user)));
        }
        if let Some(channel) = self.auto_join() {
            validation::validate_channel_name(channel).map_err(ConfigError::Invalid)?;
        }
        Ok(())
    }
}

/// Engine-wide tuning. Durations are stored in milliseconds for the profile file.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct EngineSettings {
    pub connect_timeout_ms: u64,
    pub min_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub max_jitter_ms: u64,
    /// Saturation point of the attempt counter.
    pub attempt_cap: u32,
    /// Delay forced after the server reports connection rate limiting.
    pub rate_limit_cooldown_ms: u64,
    /// Capacity of the raw line broadcast.
    pub raw_buffer: usize,
    /// Capacity of the normalized event channel.
    pub event_buffer: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            min_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            max_jitter_ms: 500,
            attempt_cap: 10,
            rate_limit_cooldown_ms: 10 * 60 * 1_000,
            raw_buffer: 256,
            event_buffer: 1024,
        }
    }
}

impl EngineSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn min_backoff(&self) -> Duration {
        Duration::from_millis(self.min_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn max_jitter(&self) -> Duration {
        Duration::from_millis(self.max_jitter_ms)
    }

    pub fn rate_limit_cooldown(&self) -> Duration {
        Duration::from_millis(self.rate_limit_cooldown_ms)
    }
}

/// On-disk profile: one session plus engine tuning.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Profile {
    pub session: SessionConfig,
    #[serde(default)]
    pub engine: EngineSettings,
}

pub fn settings_path() -> Result<PathBuf, ConfigError> {
    let proj = ProjectDirs::from("com", "sid3xyz", "slirc-engine").ok_or(ConfigError::NoConfigDir)?;
    Ok(proj.config_dir().join("settings.json"))
}

pub fn load_profile(path: &Path) -> Result<Profile, ConfigError> {
    let content = fs::read_to_string(path)?;
    let profile: Profile = serde_json::from_str(&content)?;
    Ok(profile)
}

pub fn save_profile(path: &Path, profile: &Profile) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let data = serde_json::to_string_pretty(profile)?;
    fs::write(path, data)?;
    Ok(())
}
