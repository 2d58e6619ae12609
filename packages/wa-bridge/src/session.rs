//! Remote-network session interface.
//!
//! The WhatsApp wire protocol lives outside this crate. The supervisor only
//! needs to reconnect a user from a stored [`Session`] and to disconnect a
//! live connection, capturing the session it hands back so the next start
//! can resume instead of asking the user to scan a QR code again.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::types::{MatrixUserID, WhatsAppID};

/// Resumable session state returned by a disconnect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub client_id: String,
    pub client_token: String,
    pub server_token: String,
    pub enc_key: Vec<u8>,
    pub mac_key: Vec<u8>,
    /// JID the session is authenticated as.
    pub wid: WhatsAppID,
}

/// A live connection to the remote network.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Close the connection and return the state needed to resume it.
    async fn disconnect(&self) -> Result<Session, SessionError>;
}

/// Result of a successful connect.
#[derive(Clone)]
pub struct Connection {
    pub session: Arc<dyn RemoteSession>,
    /// Authenticated WhatsApp identity of the user.
    pub jid: WhatsAppID,
}

/// Opens remote-network connections for users.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self, user: &MatrixUserID, session: Session)
        -> Result<Connection, SessionError>;
}

/// Connector used when no remote-network client is linked into the binary.
///
/// Every reconnect fails with a connect error, which the supervisor logs per
/// user; the Matrix side of the bridge keeps serving.
pub struct UnlinkedConnector;

#[async_trait]
impl SessionConnector for UnlinkedConnector {
    async fn connect(
        &self,
        _user: &MatrixUserID,
        _session: Session,
    ) -> Result<Connection, SessionError> {
        Err(SessionError::Connect(
            "no WhatsApp client is linked into this build".to_string(),
        ))
    }
}
