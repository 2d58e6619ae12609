//! Matrix ghost of a WhatsApp user.

use parking_lot::Mutex;

use crate::database::PuppetRecord;
use crate::types::{MatrixUserID, WhatsAppID};

/// Profile mirrored from the WhatsApp contact.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PuppetProfile {
    pub displayname: String,
    pub avatar: String,
}

/// The Matrix-side ghost of one WhatsApp identity.
///
/// When the WhatsApp user has opted into double puppeting, the puppet is
/// bound to their own Matrix account (`custom_mxid`) and acts through it
/// with `access_token`.
#[derive(Debug)]
pub struct Puppet {
    pub jid: WhatsAppID,
    state: Mutex<PuppetState>,
}

#[derive(Debug, Default)]
struct PuppetState {
    profile: PuppetProfile,
    custom_mxid: Option<MatrixUserID>,
    access_token: Option<String>,
}

impl Puppet {
    pub fn new(jid: WhatsAppID) -> Self {
        Self {
            jid,
            state: Mutex::new(PuppetState::default()),
        }
    }

    pub(crate) fn from_record(record: PuppetRecord) -> Self {
        Self {
            jid: record.jid,
            state: Mutex::new(PuppetState {
                profile: PuppetProfile {
                    displayname: record.displayname,
                    avatar: record.avatar,
                },
                custom_mxid: record.custom_mxid,
                access_token: record.access_token,
            }),
        }
    }

    pub fn to_record(&self) -> PuppetRecord {
        let state = self.state.lock();
        PuppetRecord {
            jid: self.jid.clone(),
            displayname: state.profile.displayname.clone(),
            avatar: state.profile.avatar.clone(),
            custom_mxid: state.custom_mxid.clone(),
            access_token: state.access_token.clone(),
        }
    }

    pub fn profile(&self) -> PuppetProfile {
        self.state.lock().profile.clone()
    }

    pub fn custom_mxid(&self) -> Option<MatrixUserID> {
        self.state.lock().custom_mxid.clone()
    }

    pub fn access_token(&self) -> Option<String> {
        self.state.lock().access_token.clone()
    }

    pub fn has_custom_mxid(&self) -> bool {
        self.state.lock().custom_mxid.is_some()
    }

    /// Set or clear the double-puppeting binding. The token is dropped
    /// together with the binding.
    pub(crate) fn set_custom_mxid(&self, mxid: Option<&MatrixUserID>, access_token: Option<String>) {
        let mut state = self.state.lock();
        state.custom_mxid = mxid.cloned();
        state.access_token = mxid.and(access_token);
    }

    pub(crate) fn update_profile(&self, update: impl FnOnce(&mut PuppetProfile)) {
        update(&mut self.state.lock().profile);
    }
}
