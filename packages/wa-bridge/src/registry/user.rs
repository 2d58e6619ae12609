//! Bridged Matrix user.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::database::UserRecord;
use crate::session::{RemoteSession, Session};
use crate::types::{MatrixRoomID, MatrixUserID, WhatsAppID};

/// A Matrix user bridged into WhatsApp.
///
/// The Matrix ID is fixed for the lifetime of the user. The JID and the
/// management room are registry keys and only change through [`Registry`],
/// which keeps its indexes in step.
///
/// [`Registry`]: crate::registry::Registry
pub struct User {
    pub mxid: MatrixUserID,
    state: Mutex<UserState>,
}

#[derive(Default)]
struct UserState {
    jid: Option<WhatsAppID>,
    management_room: Option<MatrixRoomID>,
    session: Option<Session>,
    last_connected_at: Option<DateTime<Utc>>,
    /// Live connection; never persisted.
    conn: Option<Arc<dyn RemoteSession>>,
}

impl User {
    pub fn new(mxid: MatrixUserID) -> Self {
        Self {
            mxid,
            state: Mutex::new(UserState::default()),
        }
    }

    pub(crate) fn from_record(record: UserRecord) -> Self {
        Self {
            mxid: record.mxid,
            state: Mutex::new(UserState {
                jid: record.jid,
                management_room: record.management_room,
                session: record.session,
                last_connected_at: record.last_connected_at,
                conn: None,
            }),
        }
    }

    pub fn to_record(&self) -> UserRecord {
        let state = self.state.lock();
        UserRecord {
            mxid: self.mxid.clone(),
            jid: state.jid.clone(),
            management_room: state.management_room.clone(),
            session: state.session.clone(),
            last_connected_at: state.last_connected_at,
        }
    }

    pub fn jid(&self) -> Option<WhatsAppID> {
        self.state.lock().jid.clone()
    }

    pub fn management_room(&self) -> Option<MatrixRoomID> {
        self.state.lock().management_room.clone()
    }

    pub fn session(&self) -> Option<Session> {
        self.state.lock().session.clone()
    }

    pub fn last_connected_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().last_connected_at
    }

    pub fn connection(&self) -> Option<Arc<dyn RemoteSession>> {
        self.state.lock().conn.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().conn.is_some()
    }

    pub(crate) fn set_jid(&self, jid: Option<&WhatsAppID>) {
        self.state.lock().jid = jid.cloned();
    }

    pub(crate) fn set_management_room(&self, room: Option<MatrixRoomID>) {
        self.state.lock().management_room = room;
    }

    pub(crate) fn set_session(&self, session: Option<Session>) {
        self.state.lock().session = session;
    }

    /// Attach a live connection and stamp the connection time.
    pub(crate) fn attach(&self, conn: Arc<dyn RemoteSession>) {
        let mut state = self.state.lock();
        state.conn = Some(conn);
        state.last_connected_at = Some(Utc::now());
    }

    /// Detach the live connection, returning it.
    pub(crate) fn detach(&self) -> Option<Arc<dyn RemoteSession>> {
        self.state.lock().conn.take()
    }
}

impl fmt::Debug for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("User")
            .field("mxid", &self.mxid)
            .field("jid", &state.jid)
            .field("management_room", &state.management_room)
            .field("connected", &state.conn.is_some())
            .finish()
    }
}
