//! Bridged conversation.

use parking_lot::Mutex;

use crate::database::PortalRecord;
use crate::types::{MatrixRoomID, PortalKey};

/// Room metadata mirrored from the remote conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortalInfo {
    pub name: String,
    pub topic: String,
    pub avatar: String,
}

/// A WhatsApp conversation mirrored as a Matrix room.
///
/// The key is immutable once the portal exists; the room ID is assigned
/// when the Matrix room is created.
#[derive(Debug)]
pub struct Portal {
    pub key: PortalKey,
    state: Mutex<PortalState>,
}

#[derive(Debug, Default)]
struct PortalState {
    mxid: Option<MatrixRoomID>,
    info: PortalInfo,
}

impl Portal {
    pub fn new(key: PortalKey) -> Self {
        Self {
            key,
            state: Mutex::new(PortalState::default()),
        }
    }

    pub(crate) fn from_record(record: PortalRecord) -> Self {
        Self {
            key: record.key,
            state: Mutex::new(PortalState {
                mxid: record.mxid,
                info: PortalInfo {
                    name: record.name,
                    topic: record.topic,
                    avatar: record.avatar,
                },
            }),
        }
    }

    pub fn to_record(&self) -> PortalRecord {
        let state = self.state.lock();
        PortalRecord {
            key: self.key.clone(),
            mxid: state.mxid.clone(),
            name: state.info.name.clone(),
            topic: state.info.topic.clone(),
            avatar: state.info.avatar.clone(),
        }
    }

    pub fn mxid(&self) -> Option<MatrixRoomID> {
        self.state.lock().mxid.clone()
    }

    pub fn info(&self) -> PortalInfo {
        self.state.lock().info.clone()
    }

    pub(crate) fn set_mxid(&self, mxid: Option<&MatrixRoomID>) {
        self.state.lock().mxid = mxid.cloned();
    }

    pub(crate) fn update_info(&self, update: impl FnOnce(&mut PortalInfo)) {
        update(&mut self.state.lock().info);
    }
}
