//! Matrix event handler.
//!
//! Receives events the homeserver pushed to the application service. Keeps
//! the state store's membership cache current and binds management rooms:
//! a user who invites the bridge bot into a private room gets that room as
//! their management room.
//!
//! Message translation is not handled here.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::matrix::MatrixClient;
use crate::registry::Registry;
use crate::state_store::{Membership, StateStore};
use crate::types::{MatrixRoomID, MatrixUserID};

/// A room event as delivered in an application service transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatrixEvent {
    #[serde(default)]
    pub event_id: String,
    pub room_id: MatrixRoomID,
    pub sender: MatrixUserID,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub state_key: Option<String>,
    #[serde(default)]
    pub content: serde_json::Value,
}

/// Maximum joined members for a room to qualify as a management room
/// (the user and the bot).
const MANAGEMENT_ROOM_MAX_MEMBERS: usize = 2;

pub struct MatrixHandler {
    registry: Arc<Registry>,
    state_store: Arc<StateStore>,
    client: Arc<dyn MatrixClient>,
    bot_mxid: MatrixUserID,
}

impl MatrixHandler {
    pub fn new(
        registry: Arc<Registry>,
        state_store: Arc<StateStore>,
        client: Arc<dyn MatrixClient>,
        bot_mxid: MatrixUserID,
    ) -> Self {
        Self {
            registry,
            state_store,
            client,
            bot_mxid,
        }
    }

    pub async fn handle_event(&self, event: MatrixEvent) {
        match event.event_type.as_str() {
            "m.room.member" => self.handle_membership(&event).await,
            "m.room.power_levels" => {
                self.state_store
                    .set_power_levels(&event.room_id, event.content.clone());
            }
            other => {
                tracing::trace!(event_type = other, room = %event.room_id, "Ignoring event");
            }
        }
    }

    async fn handle_membership(&self, event: &MatrixEvent) {
        let Some(target) = event.state_key.as_deref().map(MatrixUserID::from) else {
            tracing::debug!(event_id = event.event_id.as_str(), "Member event without state key");
            return;
        };
        let Some(membership) = event
            .content
            .get("membership")
            .and_then(|m| m.as_str())
            .and_then(Membership::parse)
        else {
            tracing::debug!(event_id = event.event_id.as_str(), "Unknown membership value");
            return;
        };

        self.state_store
            .set_membership(&event.room_id, &target, membership);

        if membership == Membership::Invite && target == self.bot_mxid {
            self.handle_bot_invite(&event.room_id, &event.sender).await;
        }
    }

    async fn handle_bot_invite(&self, room: &MatrixRoomID, inviter: &MatrixUserID) {
        if let Err(e) = self.client.join_room(room).await {
            tracing::warn!(room = %room, error = %e, "Failed to join room after invite");
            return;
        }
        self.state_store
            .set_membership(room, &self.bot_mxid, Membership::Join);

        // Member events from before the invite never reach the bridge, so ask
        // the homeserver who is in the room.
        let members = match self.client.joined_members(room).await {
            Ok(members) => members,
            Err(e) => {
                tracing::warn!(room = %room, error = %e, "Failed to fetch joined members");
                return;
            }
        };
        for member in &members {
            self.state_store.set_membership(room, member, Membership::Join);
        }
        if members.len() > MANAGEMENT_ROOM_MAX_MEMBERS {
            tracing::info!(
                room = %room,
                members = members.len(),
                "Invited to a group room, not using it as management room"
            );
            return;
        }

        let user = self.registry.get_or_create_user(inviter);
        match self.registry.set_management_room(&user.mxid, room.clone()) {
            Ok(()) => tracing::info!(user = %inviter, room = %room, "Management room set"),
            Err(e) => tracing::error!(user = %inviter, error = %e, "Failed to set management room"),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::MatrixError;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    pub(crate) struct StubClient {
        pub joined: Mutex<Vec<MatrixRoomID>>,
        pub fail_join: bool,
        pub fail_members: bool,
        /// Reported by `joined_members` for every room.
        pub members: Vec<MatrixUserID>,
    }

    impl StubClient {
        pub(crate) fn with_members(members: &[&str]) -> Self {
            Self {
                members: members.iter().map(|m| MatrixUserID::new(*m)).collect(),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl MatrixClient for StubClient {
        async fn set_avatar_url(&self, _url: &str) -> Result<(), MatrixError> {
            Ok(())
        }
        async fn set_display_name(&self, _name: &str) -> Result<(), MatrixError> {
            Ok(())
        }
        async fn join_room(&self, room: &MatrixRoomID) -> Result<(), MatrixError> {
            if self.fail_join {
                return Err(MatrixError::Status {
                    status: 403,
                    body: "forbidden".into(),
                });
            }
            self.joined.lock().push(room.clone());
            Ok(())
        }
        async fn joined_members(
            &self,
            _room: &MatrixRoomID,
        ) -> Result<Vec<MatrixUserID>, MatrixError> {
            if self.fail_members {
                return Err(MatrixError::Status {
                    status: 500,
                    body: "unavailable".into(),
                });
            }
            Ok(self.members.clone())
        }
        async fn whoami(&self, _access_token: &str) -> Result<MatrixUserID, MatrixError> {
            Ok(MatrixUserID::new("@nobody:example.com"))
        }
    }

    fn bot() -> MatrixUserID {
        MatrixUserID::new("@whatsappbot:example.com")
    }

    fn invite(room: &str, sender: &str) -> MatrixEvent {
        MatrixEvent {
            event_id: "$invite".to_string(),
            room_id: MatrixRoomID::new(room),
            sender: MatrixUserID::new(sender),
            event_type: "m.room.member".to_string(),
            state_key: Some(bot().to_string()),
            content: serde_json::json!({ "membership": "invite" }),
        }
    }

    fn handler(client: Arc<StubClient>) -> (MatrixHandler, Arc<Registry>, Arc<StateStore>) {
        let registry = Arc::new(Registry::new());
        let state_store = Arc::new(StateStore::new("/unused/state.json"));
        let handler = MatrixHandler::new(
            Arc::clone(&registry),
            Arc::clone(&state_store),
            client,
            bot(),
        );
        (handler, registry, state_store)
    }

    #[tokio::test]
    async fn test_bot_invite_binds_management_room() {
        let client = Arc::new(StubClient::with_members(&[
            "@alice:example.com",
            "@whatsappbot:example.com",
        ]));
        let (handler, registry, state_store) = handler(Arc::clone(&client));
        let room = MatrixRoomID::new("!dm:example.com");

        handler
            .handle_event(invite("!dm:example.com", "@alice:example.com"))
            .await;

        assert_eq!(*client.joined.lock(), vec![room.clone()]);
        let user = registry.get_user_by_management_room(&room).unwrap();
        assert_eq!(user.mxid.as_str(), "@alice:example.com");
        assert_eq!(state_store.membership(&room, &bot()), Some(Membership::Join));
    }

    #[tokio::test]
    async fn test_group_room_is_not_a_management_room() {
        // Nothing about the room is cached before the bot is invited.
        let client = Arc::new(StubClient::with_members(&[
            "@alice:example.com",
            "@bob:example.com",
            "@whatsappbot:example.com",
        ]));
        let (handler, registry, state_store) = handler(client);
        let room = MatrixRoomID::new("!group:example.com");

        handler
            .handle_event(invite("!group:example.com", "@alice:example.com"))
            .await;

        assert!(registry.get_user_by_management_room(&room).is_none());
        assert_eq!(registry.user_count(), 0);
        assert_eq!(state_store.joined_members(&room).len(), 3);
    }

    #[tokio::test]
    async fn test_failed_join_leaves_registry_untouched() {
        let client = Arc::new(StubClient {
            fail_join: true,
            ..StubClient::default()
        });
        let (handler, registry, _) = handler(client);

        handler
            .handle_event(invite("!dm:example.com", "@alice:example.com"))
            .await;

        assert_eq!(registry.user_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_member_count_does_not_bind() {
        let client = Arc::new(StubClient {
            fail_members: true,
            ..StubClient::default()
        });
        let (handler, registry, _) = handler(Arc::clone(&client));

        handler
            .handle_event(invite("!dm:example.com", "@alice:example.com"))
            .await;

        assert_eq!(client.joined.lock().len(), 1);
        assert_eq!(registry.user_count(), 0);
    }

    #[tokio::test]
    async fn test_membership_and_power_levels_are_cached() {
        let (handler, _, state_store) = handler(Arc::new(StubClient::default()));
        let room = MatrixRoomID::new("!room:example.com");
        let alice = MatrixUserID::new("@alice:example.com");

        handler
            .handle_event(MatrixEvent {
                event_id: "$join".to_string(),
                room_id: room.clone(),
                sender: alice.clone(),
                event_type: "m.room.member".to_string(),
                state_key: Some(alice.to_string()),
                content: serde_json::json!({ "membership": "join" }),
            })
            .await;
        handler
            .handle_event(MatrixEvent {
                event_id: "$pl".to_string(),
                room_id: room.clone(),
                sender: alice.clone(),
                event_type: "m.room.power_levels".to_string(),
                state_key: Some(String::new()),
                content: serde_json::json!({ "users": { "@alice:example.com": 100 } }),
            })
            .await;

        assert_eq!(state_store.membership(&room, &alice), Some(Membership::Join));
        assert!(state_store.power_levels(&room).is_some());
    }
}
