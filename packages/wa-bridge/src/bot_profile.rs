//! One-shot reconciliation of the bridge bot's profile with the config.
//!
//! Runs once at startup, independently of everything else. A failure only
//! costs a stale avatar or name, so it is logged and never escalated.

use crate::config::{BotConfig, PROFILE_REMOVE};
use crate::matrix::MatrixClient;

/// What to do with one profile field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileUpdate {
    /// Empty setting: leave the field as it is.
    Keep,
    /// `"remove"`: clear the field.
    Clear,
    Set(String),
}

impl ProfileUpdate {
    pub fn from_setting(value: &str) -> Self {
        if value == PROFILE_REMOVE {
            ProfileUpdate::Clear
        } else if value.is_empty() {
            ProfileUpdate::Keep
        } else {
            ProfileUpdate::Set(value.to_string())
        }
    }

    /// Value to send to the homeserver, or `None` when nothing is sent.
    fn value(&self) -> Option<&str> {
        match self {
            ProfileUpdate::Keep => None,
            ProfileUpdate::Clear => Some(""),
            ProfileUpdate::Set(value) => Some(value),
        }
    }
}

/// Push the configured avatar and display name of the bot.
///
/// The two fields are reconciled independently; a failure on one does not
/// skip the other.
pub async fn sync_bot_profile(client: &dyn MatrixClient, bot: &BotConfig) {
    tracing::debug!("Updating bot profile");

    if let Some(avatar) = ProfileUpdate::from_setting(&bot.avatar).value() {
        if let Err(e) = client.set_avatar_url(avatar).await {
            tracing::warn!(error = %e, "Failed to update bot avatar");
        }
    }

    if let Some(name) = ProfileUpdate::from_setting(&bot.displayname).value() {
        if let Err(e) = client.set_display_name(name).await {
            tracing::warn!(error = %e, "Failed to update bot displayname");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MatrixError;
    use crate::types::{MatrixRoomID, MatrixUserID};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingClient {
        calls: Mutex<Vec<(String, String)>>,
        fail_avatar: bool,
    }

    #[async_trait]
    impl MatrixClient for RecordingClient {
        async fn set_avatar_url(&self, url: &str) -> Result<(), MatrixError> {
            self.calls.lock().push(("avatar".into(), url.into()));
            if self.fail_avatar {
                return Err(MatrixError::Status {
                    status: 500,
                    body: "boom".into(),
                });
            }
            Ok(())
        }

        async fn set_display_name(&self, name: &str) -> Result<(), MatrixError> {
            self.calls.lock().push(("displayname".into(), name.into()));
            Ok(())
        }

        async fn join_room(&self, _room: &MatrixRoomID) -> Result<(), MatrixError> {
            Ok(())
        }

        async fn joined_members(
            &self,
            _room: &MatrixRoomID,
        ) -> Result<Vec<MatrixUserID>, MatrixError> {
            Ok(Vec::new())
        }

        async fn whoami(&self, _access_token: &str) -> Result<MatrixUserID, MatrixError> {
            unreachable!("not used by profile sync")
        }
    }

    fn bot(displayname: &str, avatar: &str) -> BotConfig {
        BotConfig {
            username: "whatsappbot".to_string(),
            displayname: displayname.to_string(),
            avatar: avatar.to_string(),
        }
    }

    #[test]
    fn test_setting_decisions() {
        assert_eq!(ProfileUpdate::from_setting(""), ProfileUpdate::Keep);
        assert_eq!(ProfileUpdate::from_setting("remove"), ProfileUpdate::Clear);
        assert_eq!(
            ProfileUpdate::from_setting("mxc://example.com/abc"),
            ProfileUpdate::Set("mxc://example.com/abc".to_string())
        );
    }

    #[tokio::test]
    async fn test_remove_clears_and_value_sets() {
        let client = RecordingClient::default();
        sync_bot_profile(&client, &bot("WhatsApp bridge bot", "remove")).await;
        assert_eq!(
            *client.calls.lock(),
            vec![
                ("avatar".to_string(), String::new()),
                ("displayname".to_string(), "WhatsApp bridge bot".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_displayname_does_not_depend_on_avatar() {
        let client = RecordingClient::default();
        sync_bot_profile(&client, &bot("Bridge", "")).await;
        assert_eq!(
            *client.calls.lock(),
            vec![("displayname".to_string(), "Bridge".to_string())]
        );
    }

    #[tokio::test]
    async fn test_empty_settings_make_no_calls() {
        let client = RecordingClient::default();
        sync_bot_profile(&client, &bot("", "")).await;
        assert!(client.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_avatar_failure_still_updates_displayname() {
        let client = RecordingClient {
            fail_avatar: true,
            ..RecordingClient::default()
        };
        sync_bot_profile(&client, &bot("Bridge", "mxc://example.com/a")).await;
        assert_eq!(client.calls.lock().len(), 2);
    }
}
