//! Homeserver client.
//!
//! The handful of client-server API calls the supervisor makes itself:
//! updating the bot profile, joining rooms as the bot, and checking custom
//! puppet tokens. Everything else goes through the event translation layer.

use async_trait::async_trait;
use reqwest::{Client, Response};
use std::collections::HashMap;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::AppServiceSettings;
use crate::error::MatrixError;
use crate::types::{MatrixRoomID, MatrixUserID};

/// Calls made on behalf of the bridge bot.
#[async_trait]
pub trait MatrixClient: Send + Sync {
    /// Set the bot's avatar; an empty URL clears it.
    async fn set_avatar_url(&self, url: &str) -> Result<(), MatrixError>;

    /// Set the bot's display name; an empty name clears it.
    async fn set_display_name(&self, name: &str) -> Result<(), MatrixError>;

    async fn join_room(&self, room: &MatrixRoomID) -> Result<(), MatrixError>;

    /// Users currently joined to `room`, as the homeserver sees it.
    async fn joined_members(&self, room: &MatrixRoomID) -> Result<Vec<MatrixUserID>, MatrixError>;

    /// Resolve the Matrix user an access token belongs to.
    async fn whoami(&self, access_token: &str) -> Result<MatrixUserID, MatrixError>;
}

#[derive(Debug, Deserialize)]
struct WhoamiResponse {
    user_id: String,
}

#[derive(Debug, Deserialize)]
struct JoinedMembersResponse {
    #[serde(default)]
    joined: HashMap<String, Value>,
}

/// `MatrixClient` over HTTP, authenticated with the appservice `as_token`.
pub struct HomeserverClient {
    http: Client,
    base_url: String,
    as_token: String,
    bot_mxid: MatrixUserID,
}

impl HomeserverClient {
    pub fn new(settings: &AppServiceSettings) -> Self {
        Self {
            http: Client::new(),
            base_url: settings.homeserver_url.clone(),
            as_token: settings.as_token.clone(),
            bot_mxid: settings.bot_mxid.clone(),
        }
    }

    fn client_url(&self, path: &str) -> String {
        format!("{}/_matrix/client/v3{}", self.base_url, path)
    }

    fn profile_url(&self, field: &str) -> String {
        self.client_url(&format!(
            "/profile/{}/{}",
            urlencoding::encode(self.bot_mxid.as_str()),
            field
        ))
    }

    async fn check(response: Response) -> Result<Response, MatrixError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(MatrixError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl MatrixClient for HomeserverClient {
    async fn set_avatar_url(&self, url: &str) -> Result<(), MatrixError> {
        let response = self
            .http
            .put(self.profile_url("avatar_url"))
            .bearer_auth(&self.as_token)
            .json(&json!({ "avatar_url": url }))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn set_display_name(&self, name: &str) -> Result<(), MatrixError> {
        let response = self
            .http
            .put(self.profile_url("displayname"))
            .bearer_auth(&self.as_token)
            .json(&json!({ "displayname": name }))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn join_room(&self, room: &MatrixRoomID) -> Result<(), MatrixError> {
        let url = self.client_url(&format!("/join/{}", urlencoding::encode(room.as_str())));
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.as_token)
            .json(&json!({}))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn joined_members(&self, room: &MatrixRoomID) -> Result<Vec<MatrixUserID>, MatrixError> {
        let url = self.client_url(&format!(
            "/rooms/{}/joined_members",
            urlencoding::encode(room.as_str())
        ));
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.as_token)
            .send()
            .await?;
        let members: JoinedMembersResponse = Self::check(response).await?.json().await?;
        Ok(members.joined.into_keys().map(MatrixUserID::new).collect())
    }

    async fn whoami(&self, access_token: &str) -> Result<MatrixUserID, MatrixError> {
        let response = self
            .http
            .get(self.client_url("/account/whoami"))
            .bearer_auth(access_token)
            .send()
            .await?;
        let whoami: WhoamiResponse = Self::check(response).await?.json().await?;
        Ok(MatrixUserID::new(whoami.user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> HomeserverClient {
        HomeserverClient::new(&AppServiceSettings {
            bind_addr: "127.0.0.1:0".to_string(),
            homeserver_url: "https://matrix.example.com".to_string(),
            as_token: "as".to_string(),
            hs_token: "hs".to_string(),
            bot_mxid: MatrixUserID::new("@whatsappbot:example.com"),
        })
    }

    #[test]
    fn test_profile_url_encodes_user_id() {
        assert_eq!(
            client().profile_url("displayname"),
            "https://matrix.example.com/_matrix/client/v3/profile/%40whatsappbot%3Aexample.com/displayname"
        );
    }

    #[test]
    fn test_joined_members_response_shape() {
        let body = r#"{"joined":{"@alice:example.com":{"display_name":"Alice"},"@whatsappbot:example.com":{}}}"#;
        let parsed: JoinedMembersResponse = serde_json::from_str(body).unwrap();
        let mut members: Vec<String> = parsed.joined.into_keys().collect();
        members.sort();
        assert_eq!(members, vec!["@alice:example.com", "@whatsappbot:example.com"]);
    }
}
