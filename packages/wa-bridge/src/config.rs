//! Bridge configuration.
//!
//! Loaded from a YAML file (`config.yaml` by default). Missing optional
//! sections fall back to the defaults below; the homeserver and appservice
//! sections are required.

use std::path::{Path, PathBuf};

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::registration::Registration;
use crate::types::{MatrixUserID, WhatsAppID};

/// Placeholder replaced by the WhatsApp user part in `username_template`.
pub const TEMPLATE_PLACEHOLDER: &str = "{{.}}";

/// Sentinel that clears a bot profile field instead of setting it.
pub const PROFILE_REMOVE: &str = "remove";

/// Length of generated `as_token` / `hs_token` values.
const TOKEN_LENGTH: usize = 64;

const DEFAULT_AUTOSAVE_INTERVAL_SECS: u64 = 30;
/// Longest accepted autosave interval: one day.
pub const MAX_AUTOSAVE_INTERVAL_SECS: u64 = 24 * 60 * 60;
const DEFAULT_DISCONNECT_TIMEOUT_SECS: u64 = 10;

/// Top-level configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub homeserver: HomeserverConfig,
    pub appservice: AppServiceConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HomeserverConfig {
    /// Client-server API base URL, e.g. `https://matrix.example.com`.
    pub address: String,
    /// Server name used in Matrix IDs, e.g. `example.com`.
    pub domain: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppServiceConfig {
    /// URL the homeserver uses to reach this bridge.
    pub address: String,
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_appservice_id")]
    pub id: String,
    #[serde(default = "default_state_store_path")]
    pub state_store_path: PathBuf,
    #[serde(default)]
    pub bot: BotConfig,
    /// Filled in by `--generate-registration`.
    #[serde(default)]
    pub as_token: String,
    #[serde(default)]
    pub hs_token: String,
}

/// Desired profile of the bridge bot.
///
/// Each of `displayname` and `avatar` is either empty (leave as is),
/// `"remove"` (clear) or a literal value (set).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    #[serde(default = "default_bot_username")]
    pub username: String,
    #[serde(default)]
    pub displayname: String,
    #[serde(default)]
    pub avatar: String,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            username: default_bot_username(),
            displayname: String::new(),
            avatar: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Localpart template for puppets; `{{.}}` is the WhatsApp user part.
    pub username_template: String,
    /// Directory holding `users.json`, `portals.json` and `puppets.json`.
    pub data_dir: PathBuf,
    pub autosave_interval_secs: u64,
    /// Upper bound for one user's disconnect during shutdown.
    pub disconnect_timeout_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            username_template: "whatsapp_{{.}}".to_string(),
            data_dir: PathBuf::from("./data"),
            autosave_interval_secs: DEFAULT_AUTOSAVE_INTERVAL_SECS,
            disconnect_timeout_secs: DEFAULT_DISCONNECT_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub directory: PathBuf,
    /// Log file name inside `directory`. Stdout only when unset.
    pub file_name: Option<String>,
    /// `EnvFilter` directives; `RUST_LOG` takes precedence.
    pub filter: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./logs"),
            file_name: None,
            filter: "wa_bridge=info,tower_http=info".to_string(),
            json: false,
        }
    }
}

impl LoggingConfig {
    pub fn file_path(&self) -> Option<PathBuf> {
        self.file_name.as_ref().map(|name| self.directory.join(name))
    }
}

fn default_hostname() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    29318
}

fn default_appservice_id() -> String {
    "whatsapp".to_string()
}

fn default_state_store_path() -> PathBuf {
    PathBuf::from("./mx-state.json")
}

fn default_bot_username() -> String {
    "whatsappbot".to_string()
}

/// Settings the application service needs at runtime, validated from the
/// config.
#[derive(Debug, Clone)]
pub struct AppServiceSettings {
    pub bind_addr: String,
    pub homeserver_url: String,
    pub as_token: String,
    pub hs_token: String,
    pub bot_mxid: MatrixUserID,
}

impl Config {
    /// Read and validate the config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the config back to disk (temp file + rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let yaml = serde_yaml::to_string(self)?;
        write_atomic(path.as_ref(), &yaml)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.homeserver.address.trim().is_empty() {
            return Err(ConfigError::Invalid("homeserver.address is empty".to_string()));
        }
        if self.homeserver.domain.trim().is_empty() {
            return Err(ConfigError::Invalid("homeserver.domain is empty".to_string()));
        }
        if !self.bridge.username_template.contains(TEMPLATE_PLACEHOLDER) {
            return Err(ConfigError::Invalid(format!(
                "bridge.username_template must contain {}",
                TEMPLATE_PLACEHOLDER
            )));
        }
        if self.bridge.autosave_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "bridge.autosave_interval_secs must be positive".to_string(),
            ));
        }
        if self.bridge.autosave_interval_secs > MAX_AUTOSAVE_INTERVAL_SECS {
            return Err(ConfigError::Invalid(format!(
                "bridge.autosave_interval_secs must be at most {}",
                MAX_AUTOSAVE_INTERVAL_SECS
            )));
        }
        Ok(())
    }

    pub fn bot_mxid(&self) -> MatrixUserID {
        MatrixUserID::new(format!(
            "@{}:{}",
            self.appservice.bot.username, self.homeserver.domain
        ))
    }

    pub fn format_username(&self, user_part: &str) -> String {
        self.bridge
            .username_template
            .replace(TEMPLATE_PLACEHOLDER, user_part)
    }

    /// Matrix ID of the ghost user representing `jid`.
    pub fn puppet_mxid(&self, jid: &WhatsAppID) -> MatrixUserID {
        MatrixUserID::new(format!(
            "@{}:{}",
            self.format_username(jid.user_part()),
            self.homeserver.domain
        ))
    }

    /// Generate fresh tokens, store them in this config and build the
    /// matching registration. The caller is expected to save both.
    pub fn new_registration(&mut self) -> Result<Registration, ConfigError> {
        self.validate()?;
        self.appservice.as_token = random_token();
        self.appservice.hs_token = random_token();
        Ok(Registration::from_config(self))
    }

    /// Validate the settings the application service needs.
    pub fn make_app_service(&self) -> Result<AppServiceSettings, ConfigError> {
        if self.appservice.as_token.is_empty() || self.appservice.hs_token.is_empty() {
            return Err(ConfigError::Invalid(
                "appservice tokens are missing, generate a registration first".to_string(),
            ));
        }
        if !self.homeserver.address.starts_with("http://")
            && !self.homeserver.address.starts_with("https://")
        {
            return Err(ConfigError::Invalid(format!(
                "homeserver.address must be an http(s) URL, got {}",
                self.homeserver.address
            )));
        }
        Ok(AppServiceSettings {
            bind_addr: format!("{}:{}", self.appservice.hostname, self.appservice.port),
            homeserver_url: self.homeserver.address.trim_end_matches('/').to_string(),
            as_token: self.appservice.as_token.clone(),
            hs_token: self.appservice.hs_token.clone(),
            bot_mxid: self.bot_mxid(),
        })
    }
}

fn random_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LENGTH)
        .map(char::from)
        .collect()
}

/// Atomic write: temp file + rename.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, contents).map_err(|source| ConfigError::Write {
        path: tmp_path.clone(),
        source,
    })?;
    std::fs::rename(&tmp_path, path).map_err(|source| {
        let _ = std::fs::remove_file(&tmp_path);
        ConfigError::Write {
            path: path.to_path_buf(),
            source,
        }
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const SAMPLE: &str = r#"
homeserver:
  address: https://matrix.example.com
  domain: example.com
appservice:
  address: http://localhost:29318
  bot:
    displayname: WhatsApp bridge bot
    avatar: remove
"#;

    #[test]
    fn test_defaults_fill_missing_sections() {
        let config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.appservice.port, 29318);
        assert_eq!(config.appservice.bot.username, "whatsappbot");
        assert_eq!(config.bridge.autosave_interval_secs, 30);
        assert!(config.logging.file_path().is_none());
    }

    #[test]
    fn test_puppet_mxid_uses_template() {
        let config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        let mxid = config.puppet_mxid(&WhatsAppID::user("15551234567"));
        assert_eq!(mxid.as_str(), "@whatsapp_15551234567:example.com");
        assert_eq!(config.bot_mxid().as_str(), "@whatsappbot:example.com");
    }

    #[test]
    fn test_template_without_placeholder_is_rejected() {
        let mut config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        config.bridge.username_template = "whatsapp_".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_autosave_interval_bounds() {
        let mut config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        config.bridge.autosave_interval_secs = u64::MAX;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        config.bridge.autosave_interval_secs = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        config.bridge.autosave_interval_secs = MAX_AUTOSAVE_INTERVAL_SECS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_make_app_service_requires_tokens() {
        let mut config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        assert!(config.make_app_service().is_err());

        config.new_registration().unwrap();
        let settings = config.make_app_service().unwrap();
        assert_eq!(settings.bind_addr, "0.0.0.0:29318");
        assert_eq!(settings.as_token.len(), TOKEN_LENGTH);
        assert_ne!(settings.as_token, settings.hs_token);
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load("/nonexistent/config.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
