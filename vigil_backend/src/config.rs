use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const APP_DIR_NAME: &str = ".vigil";
pub const CONFIG_FILE_NAME: &str = "vigil_config.toml";
pub const DATABASE_FILE_NAME: &str = "vigil_memory.db";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceMode {
    /// Ask the multiplexer whether any client is attached.
    Tmux,
    /// No operator session to watch; always unattended.
    Never,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceConfig {
    #[serde(default = "default_presence_mode")]
    pub mode: PresenceMode,
    #[serde(default = "default_tmux_binary")]
    pub tmux_binary: String,
    #[serde(default)]
    pub tmux_socket: Option<String>,
    /// Run the multiplexer query as this user (via `sudo -n -u`).
    #[serde(default)]
    pub run_as: Option<String>,
    #[serde(default = "default_presence_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_presence_mode() -> PresenceMode {
    PresenceMode::Tmux
}

fn default_tmux_binary() -> String {
    "tmux".to_string()
}

fn default_presence_timeout_ms() -> u64 {
    2000
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            mode: default_presence_mode(),
            tmux_binary: default_tmux_binary(),
            tmux_socket: None,
            run_as: None,
            timeout_ms: default_presence_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    // Storage
    #[serde(default = "default_database_path")]
    pub database_path: String,
    /// External directives manifest; the embedded one is used when unset.
    #[serde(default)]
    pub directives_path: Option<String>,

    // Autonomy timing
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_attended_poll_interval_secs")]
    pub attended_poll_interval_secs: u64,
    #[serde(default = "default_save_interval_secs")]
    pub save_interval_secs: u64,

    #[serde(default)]
    pub presence: PresenceConfig,

    /// Optional file describing the host, read on each self-maintenance pass.
    #[serde(default)]
    pub context_file: Option<String>,

    // Transcript sync
    /// Chat directory whose newest `session-*.json` is kept imported.
    #[serde(default)]
    pub transcript_dir: Option<String>,
    #[serde(default = "default_transcript_poll_secs")]
    pub transcript_poll_secs: u64,

    // Local API
    #[serde(default = "default_true")]
    pub enable_api: bool,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

fn default_database_path() -> String {
    app_dir().join(DATABASE_FILE_NAME).display().to_string()
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_attended_poll_interval_secs() -> u64 {
    10
}

fn default_save_interval_secs() -> u64 {
    20 * 60
}

fn default_transcript_poll_secs() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

fn default_bind_addr() -> String {
    "127.0.0.1:8088".to_string()
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            directives_path: None,
            poll_interval_secs: default_poll_interval_secs(),
            attended_poll_interval_secs: default_attended_poll_interval_secs(),
            save_interval_secs: default_save_interval_secs(),
            presence: PresenceConfig::default(),
            context_file: None,
            transcript_dir: None,
            transcript_poll_secs: default_transcript_poll_secs(),
            enable_api: true,
            bind_addr: default_bind_addr(),
        }
    }
}

/// Per-user application directory (`~/.vigil`), or the working directory
/// when no home directory can be resolved.
pub fn app_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(APP_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from("."))
}

impl BackendConfig {
    pub fn config_path() -> PathBuf {
        app_dir().join(CONFIG_FILE_NAME)
    }

    /// Load configuration.
    ///
    /// An explicitly requested file must exist and parse. Otherwise the default
    /// config file is used when present, falling back to defaults + env vars.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {:?}", path))?;
            let config = toml::from_str::<BackendConfig>(&contents)
                .with_context(|| format!("Failed to parse config {:?}", path))?;
            tracing::info!("Loaded config from {:?}", path);
            return Ok(config);
        }

        let path = Self::config_path();
        if let Ok(contents) = fs::read_to_string(&path) {
            match toml::from_str::<BackendConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    return Ok(config);
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                }
            }
        }

        tracing::info!("No config file found, using defaults + env vars");
        Ok(Self::from_env())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory {:?}", parent))?;
        }
        fs::write(path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_overrides(|key| env::var(key).ok());
        config
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let seconds = |key: &str| non_empty(key).and_then(|value| value.trim().parse::<u64>().ok());

        if let Some(path) = non_empty("VIGIL_DB_PATH") {
            self.database_path = path;
        }
        if let Some(path) = non_empty("VIGIL_DIRECTIVES_PATH") {
            self.directives_path = Some(path);
        }
        if let Some(secs) = seconds("VIGIL_POLL_INTERVAL_SECS") {
            self.poll_interval_secs = secs;
        }
        if let Some(secs) = seconds("VIGIL_ATTENDED_POLL_INTERVAL_SECS") {
            self.attended_poll_interval_secs = secs;
        }
        if let Some(secs) = seconds("VIGIL_SAVE_INTERVAL_SECS") {
            self.save_interval_secs = secs;
        }
        if let Some(mode) = non_empty("VIGIL_PRESENCE_MODE") {
            match mode.trim().to_ascii_lowercase().as_str() {
                "tmux" => self.presence.mode = PresenceMode::Tmux,
                "never" | "none" | "off" => self.presence.mode = PresenceMode::Never,
                other => tracing::warn!("Ignoring unknown VIGIL_PRESENCE_MODE '{}'", other),
            }
        }
        if let Some(socket) = non_empty("VIGIL_TMUX_SOCKET") {
            self.presence.tmux_socket = Some(socket);
        }
        if let Some(user) = non_empty("VIGIL_TMUX_RUN_AS") {
            self.presence.run_as = Some(user);
        }
        if let Some(path) = non_empty("VIGIL_CONTEXT_FILE") {
            self.context_file = Some(path);
        }
        if let Some(dir) = non_empty("VIGIL_TRANSCRIPT_DIR") {
            self.transcript_dir = Some(dir);
        }
        if let Some(secs) = seconds("VIGIL_TRANSCRIPT_POLL_SECS") {
            self.transcript_poll_secs = secs;
        }
        if let Some(enabled) = non_empty("VIGIL_ENABLE_API") {
            self.enable_api = parse_flag(&enabled);
        }
        if let Some(addr) = non_empty("VIGIL_BACKEND_BIND") {
            self.bind_addr = addr;
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn attended_poll_interval(&self) -> Duration {
        Duration::from_secs(self.attended_poll_interval_secs.max(1))
    }

    pub fn save_interval(&self) -> Duration {
        Duration::from_secs(self.save_interval_secs.max(1))
    }

    pub fn transcript_poll_interval(&self) -> Duration {
        Duration::from_secs(self.transcript_poll_secs.max(1))
    }
}

fn parse_flag(raw: &str) -> bool {
    let value = raw.trim();
    value.eq_ignore_ascii_case("1")
        || value.eq_ignore_ascii_case("true")
        || value.eq_ignore_ascii_case("yes")
        || value.eq_ignore_ascii_case("on")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_toml_fills_defaults() {
        let config: BackendConfig = toml::from_str(
            r#"
            database_path = "/srv/vigil/journal.db"
            poll_interval_secs = 3

            [presence]
            tmux_socket = "/home/agent/brain.sock"
            "#,
        )
        .unwrap();

        assert_eq!(config.database_path, "/srv/vigil/journal.db");
        assert_eq!(config.poll_interval(), Duration::from_secs(3));
        assert_eq!(config.attended_poll_interval(), Duration::from_secs(10));
        assert_eq!(config.save_interval(), Duration::from_secs(1200));
        assert_eq!(config.presence.mode, PresenceMode::Tmux);
        assert_eq!(config.presence.tmux_binary, "tmux");
        assert_eq!(
            config.presence.tmux_socket.as_deref(),
            Some("/home/agent/brain.sock")
        );
        assert!(config.enable_api);
    }

    #[test]
    fn overrides_apply_only_valid_values() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("VIGIL_DB_PATH", "/tmp/override.db"),
            ("VIGIL_POLL_INTERVAL_SECS", "not-a-number"),
            ("VIGIL_SAVE_INTERVAL_SECS", "60"),
            ("VIGIL_PRESENCE_MODE", "never"),
            ("VIGIL_TMUX_SOCKET", "   "),
            ("VIGIL_ENABLE_API", "off"),
            ("VIGIL_TRANSCRIPT_DIR", "/home/op/chats"),
        ]);
        let mut config = BackendConfig::default();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.database_path, "/tmp/override.db");
        assert_eq!(config.poll_interval_secs, 5);
        assert_eq!(config.save_interval_secs, 60);
        assert_eq!(config.presence.mode, PresenceMode::Never);
        assert!(config.presence.tmux_socket.is_none());
        assert!(!config.enable_api);
        assert_eq!(config.transcript_dir.as_deref(), Some("/home/op/chats"));
        assert_eq!(config.transcript_poll_interval(), Duration::from_secs(5));
    }

    #[test]
    fn zero_intervals_are_clamped() {
        let config = BackendConfig {
            poll_interval_secs: 0,
            attended_poll_interval_secs: 0,
            save_interval_secs: 0,
            transcript_poll_secs: 0,
            ..BackendConfig::default()
        };
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.attended_poll_interval(), Duration::from_secs(1));
        assert_eq!(config.save_interval(), Duration::from_secs(1));
        assert_eq!(config.transcript_poll_interval(), Duration::from_secs(1));
    }

    #[test]
    fn save_then_load_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf").join(CONFIG_FILE_NAME);
        let config = BackendConfig {
            context_file: Some("/etc/vigil/context.txt".to_string()),
            ..BackendConfig::default()
        };
        config.save(&path).unwrap();

        let loaded = BackendConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded, config);

        let missing = BackendConfig::load(Some(&dir.path().join("missing.toml")));
        assert!(missing.is_err());
    }
}
