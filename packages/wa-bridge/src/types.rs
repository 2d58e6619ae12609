//! Identifier types shared by every part of the bridge.
//!
//! Matrix and WhatsApp identifiers are plain strings on the wire. Wrapping
//! them keeps the two namespaces from being mixed up in the registry, where
//! one collection is indexed by both.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Server part of WhatsApp user JIDs.
pub const WHATSAPP_USER_SERVER: &str = "s.whatsapp.net";

/// Server part of WhatsApp group JIDs.
pub const WHATSAPP_GROUP_SERVER: &str = "g.us";

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// A Matrix user ID, e.g. `@alice:example.com`.
    MatrixUserID
);

string_id!(
    /// A Matrix room ID, e.g. `!abcdef:example.com`.
    MatrixRoomID
);

string_id!(
    /// A WhatsApp JID, e.g. `15551234567@s.whatsapp.net` or `123-456@g.us`.
    WhatsAppID
);

impl MatrixUserID {
    /// Localpart without the leading `@` and the server name.
    pub fn localpart(&self) -> &str {
        let id = self.0.strip_prefix('@').unwrap_or(&self.0);
        id.split(':').next().unwrap_or(id)
    }
}

impl WhatsAppID {
    /// Build a user JID from a phone number.
    pub fn user(number: &str) -> Self {
        Self(format!("{}@{}", number, WHATSAPP_USER_SERVER))
    }

    /// Part of the JID before `@`.
    pub fn user_part(&self) -> &str {
        self.0.split('@').next().unwrap_or(&self.0)
    }

    pub fn is_group(&self) -> bool {
        self.0.ends_with(&format!("@{}", WHATSAPP_GROUP_SERVER))
    }
}

/// Key of a bridged conversation.
///
/// Private chats are scoped to the receiving user, so the same remote JID
/// maps to a different portal per receiver. Group chats are shared and use
/// the group JID as receiver.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortalKey {
    pub jid: WhatsAppID,
    pub receiver: WhatsAppID,
}

impl PortalKey {
    pub fn new(jid: WhatsAppID, receiver: WhatsAppID) -> Self {
        if jid.is_group() {
            Self {
                receiver: jid.clone(),
                jid,
            }
        } else {
            Self { jid, receiver }
        }
    }
}

impl fmt::Display for PortalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.jid == self.receiver {
            write!(f, "{}", self.jid)
        } else {
            write!(f, "{}-{}", self.jid, self.receiver)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_localpart() {
        let mxid = MatrixUserID::new("@alice:example.com");
        assert_eq!(mxid.localpart(), "alice");
    }

    #[test]
    fn test_group_portal_key_uses_group_as_receiver() {
        let group = WhatsAppID::new("123-456@g.us");
        let key = PortalKey::new(group.clone(), WhatsAppID::user("15550001"));
        assert_eq!(key.receiver, group);
        assert_eq!(key.to_string(), "123-456@g.us");
    }

    #[test]
    fn test_private_portal_key_keeps_receiver() {
        let key = PortalKey::new(WhatsAppID::user("15550001"), WhatsAppID::user("15550002"));
        assert_eq!(key.receiver.user_part(), "15550002");
        assert!(!key.jid.is_group());
    }
}
