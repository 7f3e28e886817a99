use chrono::TimeDelta;
use log::warn;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::model::seconds;

/// Chunks a client may request ahead of the live edge; the DASH window must cover them
pub const MAX_CHUNK_LOOKAHEAD: f64 = 8.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Local,
    Dev,
    Prod,
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("radio.sqlite")
}

fn default_token_ttl() -> f64 {
    24.0 * 3600.0
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_manifest_path() -> PathBuf {
    PathBuf::from("content/manifest.mpd")
}

fn default_content_dir() -> PathBuf {
    PathBuf::from("content")
}

fn default_chunk_length() -> f64 {
    2.0
}

fn default_buffer_time() -> f64 {
    30.0
}

fn default_buffer_depth() -> f64 {
    5.0
}

fn default_client_update_freq() -> f64 {
    10.0
}

fn default_dash_update_freq() -> f64 {
    20.0
}

fn default_dash_horizon() -> f64 {
    300.0
}

fn default_utc_timing_url() -> String {
    "https://time.akamai.com/?iso&ms".to_string()
}

/// Engine configuration file structure. Durations are in seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Deployment environment: local, dev or prod (default: local)
    #[serde(default)]
    pub env: Environment,
    /// SQLite timeline database (default: radio.sqlite)
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,
    /// Lifetime of issued editor tokens (default: 1 day)
    #[serde(default = "default_token_ttl")]
    pub token_ttl: f64,
    /// HTTP listen address (default: 127.0.0.1:8080)
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Where the MPD is written (default: content/manifest.mpd)
    #[serde(default = "default_manifest_path")]
    pub manifest_path: PathBuf,
    /// Segment artifact directory, also served to listeners (default: content)
    #[serde(default = "default_content_dir")]
    pub content_dir: PathBuf,
    #[serde(default = "default_chunk_length")]
    pub chunk_length: f64,
    #[serde(default = "default_buffer_time")]
    pub buffer_time: f64,
    #[serde(default = "default_buffer_depth")]
    pub buffer_depth: f64,
    /// Advertised `minimumUpdatePeriod`
    #[serde(default = "default_client_update_freq")]
    pub client_update_freq: f64,
    /// Manifest rebuild period when nothing changes
    #[serde(default = "default_dash_update_freq")]
    pub dash_update_freq: f64,
    /// Timeline window published in the manifest
    #[serde(default = "default_dash_horizon")]
    pub dash_horizon: f64,
    #[serde(default = "default_utc_timing_url")]
    pub utc_timing_url: String,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub autodj: AutoDjConfig,
    #[serde(default)]
    pub live: LiveConfig,
    /// JWT signing secret, from `SECRET`
    #[serde(skip)]
    pub secret: String,
    /// Root password, from `ROOT_PASS`
    #[serde(skip)]
    pub root_pass: Option<String>,
}

/// Source blob store (maps to [source] section in TOML)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub path: PathBuf,
    /// One directory level per leading id character
    pub nesting_depth: usize,
    pub id_length: usize,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("sources"),
            nesting_depth: 2,
            id_length: 16,
        }
    }
}

/// Segment encoder (maps to [encoder] section in TOML)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub program: String,
    /// Extra arguments placed before the generated ones
    pub args: Vec<String>,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            program: "ffmpeg".to_string(),
            args: Vec::new(),
        }
    }
}

/// AutoDJ tuning (maps to [autodj] section in TOML)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AutoDjConfig {
    /// Publication margin ahead of playout
    pub time_delay: f64,
    /// Segments kept queued ahead of playout
    pub segments_buff: usize,
}

impl Default for AutoDjConfig {
    fn default() -> Self {
        Self {
            time_delay: 10.0,
            segments_buff: 5,
        }
    }
}

/// Live capture (maps to [live] section in TOML)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    /// Capture program; receives its output layout through LIVE_* variables
    pub program: Option<String>,
    pub args: Vec<String>,
    /// Growth step of the reserved segment
    pub step: f64,
    /// Minimum capture latency
    pub delay: f64,
    /// Keep chunks this long after they ended
    pub wait_before_delete: f64,
    /// Grace period between SIGTERM and SIGKILL
    pub stop_timeout: f64,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: Vec::new(),
            step: 10.0,
            delay: 5.0,
            wait_before_delete: 60.0,
            stop_timeout: 5.0,
        }
    }
}

impl Config {
    /// Read the TOML file, then secrets from the environment
    pub fn load(path: &Path) -> Result<Config, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file '{}': {}", path.display(), e))?;
        let mut config = Self::from_toml(&content)
            .map_err(|e| format!("Failed to parse config file '{}': {}", path.display(), e))?;
        config.apply_env(std::env::var("SECRET").ok(), std::env::var("ROOT_PASS").ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Config, toml::de::Error> {
        toml::from_str(content)
    }

    /// Install secrets. Only a local deployment may run without `SECRET`.
    pub fn apply_env(
        &mut self,
        secret: Option<String>,
        root_pass: Option<String>,
    ) -> Result<(), String> {
        match secret.filter(|s| !s.is_empty()) {
            Some(secret) => self.secret = secret,
            None if self.env == Environment::Local => {
                warn!("SECRET is not set, using a random signing secret");
                self.secret = crate::constants::generate_id(48);
            }
            None => return Err("SECRET must be set outside of the local environment".to_string()),
        }
        self.root_pass = root_pass.filter(|p| !p.is_empty());
        if self.root_pass.is_none() {
            warn!("ROOT_PASS is not set, root login is disabled");
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), String> {
        let positive = [
            ("chunk_length", self.chunk_length),
            ("token_ttl", self.token_ttl),
            ("dash_update_freq", self.dash_update_freq),
            ("client_update_freq", self.client_update_freq),
            ("live.step", self.live.step),
        ];
        for (name, value) in positive {
            if !(value > 0.0) {
                return Err(format!("{} must be positive, got {}", name, value));
            }
        }
        let lookahead = self.buffer_time + self.chunk_length * MAX_CHUNK_LOOKAHEAD;
        if self.dash_horizon <= lookahead {
            return Err(format!(
                "dash_horizon ({}s) must exceed buffer_time + chunk_length x {} ({}s)",
                self.dash_horizon, MAX_CHUNK_LOOKAHEAD, lookahead
            ));
        }
        if self.autodj.segments_buff == 0 {
            return Err("autodj.segments_buff must be at least 1".to_string());
        }
        if self.source.id_length == 0 || self.source.nesting_depth > self.source.id_length {
            return Err("source.nesting_depth must not exceed source.id_length".to_string());
        }
        Ok(())
    }

    pub fn chunk_length(&self) -> TimeDelta {
        seconds(self.chunk_length)
    }

    pub fn dash_horizon(&self) -> TimeDelta {
        seconds(self.dash_horizon)
    }

    /// Lock file guarding the timeline database against a second engine
    pub fn lock_path(&self) -> PathBuf {
        let mut name = self.storage_path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_file() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.env, Environment::Local);
        assert_eq!(config.chunk_length, 2.0);
        assert_eq!(config.buffer_time, 30.0);
        assert_eq!(config.buffer_depth, 5.0);
        assert_eq!(config.client_update_freq, 10.0);
        assert_eq!(config.dash_update_freq, 20.0);
        assert_eq!(config.dash_horizon, 300.0);
        assert_eq!(config.source.nesting_depth, 2);
        assert_eq!(config.source.id_length, 16);
        assert_eq!(config.encoder.program, "ffmpeg");
        assert_eq!(config.autodj.segments_buff, 5);
        assert!(config.live.program.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_sections_override_defaults() {
        let config = Config::from_toml(
            r#"
env = "prod"
bind = "0.0.0.0:9000"
chunk_length = 4
dash_horizon = 600

[source]
path = "/srv/sources"
nesting_depth = 3

[live]
program = "/usr/local/bin/capture"
step = 5
"#,
        )
        .unwrap();
        assert_eq!(config.env, Environment::Prod);
        assert_eq!(config.bind, "0.0.0.0:9000");
        assert_eq!(config.chunk_length(), TimeDelta::seconds(4));
        assert_eq!(config.source.path, PathBuf::from("/srv/sources"));
        assert_eq!(config.source.nesting_depth, 3);
        assert_eq!(config.source.id_length, 16);
        assert_eq!(config.live.program.as_deref(), Some("/usr/local/bin/capture"));
        assert_eq!(config.live.step, 5.0);
        assert_eq!(config.live.delay, 5.0);
    }

    #[test]
    fn test_short_horizon_is_rejected() {
        let config = Config::from_toml("dash_horizon = 40").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.contains("dash_horizon"), "got {}", err);
    }

    #[test]
    fn test_prod_requires_secret() {
        let mut config = Config::from_toml("env = \"prod\"").unwrap();
        assert!(config.apply_env(None, None).is_err());
        config
            .apply_env(Some("s3cret".to_string()), Some("root".to_string()))
            .unwrap();
        assert_eq!(config.secret, "s3cret");
        assert_eq!(config.root_pass.as_deref(), Some("root"));
    }

    #[test]
    fn test_lock_path_sits_next_to_storage() {
        let config = Config::from_toml("storage_path = \"/var/lib/radio/timeline.sqlite\"").unwrap();
        assert_eq!(
            config.lock_path(),
            PathBuf::from("/var/lib/radio/timeline.sqlite.lock")
        );
    }
}
