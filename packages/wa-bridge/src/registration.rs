//! Application service registration file.
//!
//! The homeserver reads this file to learn where the bridge lives, which
//! tokens authenticate each side, and which user IDs the bridge owns.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::{write_atomic, Config, TEMPLATE_PLACEHOLDER};
use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    pub id: String,
    pub url: String,
    pub as_token: String,
    pub hs_token: String,
    pub sender_localpart: String,
    pub rate_limited: bool,
    pub namespaces: Namespaces,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Namespaces {
    #[serde(default)]
    pub users: Vec<Namespace>,
    #[serde(default)]
    pub aliases: Vec<Namespace>,
    #[serde(default)]
    pub rooms: Vec<Namespace>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Namespace {
    pub regex: String,
    pub exclusive: bool,
}

impl Registration {
    /// Build a registration from the tokens and namespaces in `config`.
    pub fn from_config(config: &Config) -> Self {
        let domain = regex::escape(&config.homeserver.domain);
        let (prefix, suffix) = config
            .bridge
            .username_template
            .split_once(TEMPLATE_PLACEHOLDER)
            .unwrap_or((config.bridge.username_template.as_str(), ""));

        let puppets = Namespace {
            regex: format!(
                "@{}.+{}:{}",
                regex::escape(prefix),
                regex::escape(suffix),
                domain
            ),
            exclusive: true,
        };
        let bot = Namespace {
            regex: format!(
                "@{}:{}",
                regex::escape(&config.appservice.bot.username),
                domain
            ),
            exclusive: true,
        };

        Self {
            id: config.appservice.id.clone(),
            url: config.appservice.address.clone(),
            as_token: config.appservice.as_token.clone(),
            hs_token: config.appservice.hs_token.clone(),
            sender_localpart: config.appservice.bot.username.clone(),
            rate_limited: false,
            namespaces: Namespaces {
                users: vec![bot, puppets],
                ..Namespaces::default()
            },
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let yaml = serde_yaml::to_string(self)?;
        write_atomic(path.as_ref(), &yaml)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_yaml::from_str(&contents)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::SAMPLE;

    #[test]
    fn test_namespaces_cover_bot_and_puppets() {
        let mut config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        let registration = config.new_registration().unwrap();

        assert_eq!(registration.sender_localpart, "whatsappbot");
        assert_eq!(registration.as_token, config.appservice.as_token);
        assert!(!registration.rate_limited);

        let regexes: Vec<&str> = registration
            .namespaces
            .users
            .iter()
            .map(|ns| ns.regex.as_str())
            .collect();
        assert_eq!(
            regexes,
            vec!["@whatsappbot:example\\.com", "@whatsapp_.+:example\\.com"]
        );
    }

    #[test]
    fn test_namespaces_compile_and_match() {
        let mut config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        config.homeserver.domain = "matrix.example.com:8448".to_string();
        config.bridge.username_template = "wa.{{.}}+".to_string();
        let registration = config.new_registration().unwrap();

        let users: Vec<regex::Regex> = registration
            .namespaces
            .users
            .iter()
            .map(|ns| regex::Regex::new(&format!("^{}$", ns.regex)).unwrap())
            .collect();
        assert!(users[0].is_match("@whatsappbot:matrix.example.com:8448"));
        assert!(users[1].is_match("@wa.15551234567+:matrix.example.com:8448"));
        // Template punctuation is literal.
        assert!(!users[1].is_match("@waX15551234567+:matrix.example.com:8448"));
        assert!(!users[1].is_match("@wa.15551234567+:matrixXexample.com:8448"));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registration.yaml");
        let mut config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        let registration = config.new_registration().unwrap();

        registration.save(&path).unwrap();
        assert_eq!(Registration::load(&path).unwrap(), registration);
    }
}
