//! Matrix state cache.
//!
//! Remembers which ghost users are registered on the homeserver, room
//! membership and room power levels, so the bridge does not have to ask the
//! homeserver every time. Stored as one JSON file; mutations set a dirty
//! flag that the autosave loop picks up.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::database::write_json_atomic;
use crate::error::StoreError;
use crate::types::{MatrixRoomID, MatrixUserID};

/// Membership state of a user in a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Membership {
    Invite,
    Join,
    Leave,
    Ban,
    Knock,
}

impl Membership {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "invite" => Some(Membership::Invite),
            "join" => Some(Membership::Join),
            "leave" => Some(Membership::Leave),
            "ban" => Some(Membership::Ban),
            "knock" => Some(Membership::Knock),
            _ => None,
        }
    }
}

/// On-disk persistence format.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StateData {
    #[serde(default)]
    registrations: HashSet<MatrixUserID>,
    #[serde(default)]
    members: HashMap<MatrixRoomID, HashMap<MatrixUserID, Membership>>,
    #[serde(default)]
    power_levels: HashMap<MatrixRoomID, serde_json::Value>,
}

/// File-backed Matrix state cache.
pub struct StateStore {
    path: PathBuf,
    data: Mutex<StateData>,
    dirty: AtomicBool,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            data: Mutex::new(StateData::default()),
            dirty: AtomicBool::new(false),
        }
    }

    /// Load the cache from disk. A missing file starts an empty cache; an
    /// unreadable or malformed one is an error.
    pub fn load(&self) -> Result<(), StoreError> {
        if !self.path.exists() {
            tracing::info!(path = %self.path.display(), "No state store file, starting fresh");
            return Ok(());
        }
        let contents = std::fs::read_to_string(&self.path).map_err(|source| StoreError::Read {
            path: self.path.clone(),
            source,
        })?;
        let data: StateData =
            serde_json::from_str(&contents).map_err(|source| StoreError::Parse {
                path: self.path.clone(),
                source,
            })?;
        tracing::info!(
            rooms = data.members.len(),
            registrations = data.registrations.len(),
            "State store loaded"
        );
        *self.data.lock() = data;
        self.dirty.store(false, Ordering::Release);
        Ok(())
    }

    /// Write the whole cache to disk.
    pub fn save(&self) -> Result<(), StoreError> {
        self.dirty.store(false, Ordering::Release);
        let json = {
            let data = self.data.lock();
            serde_json::to_string(&*data)
        };
        let result = json
            .map_err(StoreError::from)
            .and_then(|json| write_json_atomic(&self.path, &json));
        if result.is_err() {
            self.dirty.store(true, Ordering::Release);
        }
        result
    }

    /// Save only when something changed since the last save.
    pub fn save_if_dirty(&self) -> Result<bool, StoreError> {
        if !self.is_dirty() {
            return Ok(false);
        }
        self.save().map(|_| true)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    fn touch(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn is_registered(&self, user: &MatrixUserID) -> bool {
        self.data.lock().registrations.contains(user)
    }

    pub fn mark_registered(&self, user: &MatrixUserID) {
        if self.data.lock().registrations.insert(user.clone()) {
            self.touch();
        }
    }

    pub fn membership(&self, room: &MatrixRoomID, user: &MatrixUserID) -> Option<Membership> {
        self.data
            .lock()
            .members
            .get(room)
            .and_then(|members| members.get(user))
            .copied()
    }

    pub fn set_membership(&self, room: &MatrixRoomID, user: &MatrixUserID, membership: Membership) {
        let previous = self
            .data
            .lock()
            .members
            .entry(room.clone())
            .or_default()
            .insert(user.clone(), membership);
        if previous != Some(membership) {
            self.touch();
        }
    }

    /// Users currently joined to `room`.
    pub fn joined_members(&self, room: &MatrixRoomID) -> Vec<MatrixUserID> {
        let data = self.data.lock();
        let mut members: Vec<MatrixUserID> = data
            .members
            .get(room)
            .map(|members| {
                members
                    .iter()
                    .filter(|(_, m)| **m == Membership::Join)
                    .map(|(user, _)| user.clone())
                    .collect()
            })
            .unwrap_or_default();
        members.sort();
        members
    }

    pub fn power_levels(&self, room: &MatrixRoomID) -> Option<serde_json::Value> {
        self.data.lock().power_levels.get(room).cloned()
    }

    pub fn set_power_levels(&self, room: &MatrixRoomID, levels: serde_json::Value) {
        self.data.lock().power_levels.insert(room.clone(), levels);
        self.touch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_membership_changes_dirty_the_store() {
        let store = StateStore::new("/unused/state.json");
        let room = MatrixRoomID::new("!room:example.com");
        let alice = MatrixUserID::new("@alice:example.com");

        store.set_membership(&room, &alice, Membership::Join);
        assert!(store.is_dirty());
        assert_eq!(store.membership(&room, &alice), Some(Membership::Join));
        assert_eq!(store.joined_members(&room), vec![alice]);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mx-state.json");
        let room = MatrixRoomID::new("!room:example.com");
        let bot = MatrixUserID::new("@bot:example.com");

        let store = StateStore::new(&path);
        store.mark_registered(&bot);
        store.set_membership(&room, &bot, Membership::Invite);
        store.set_power_levels(&room, serde_json::json!({"users_default": 0}));
        assert!(store.save_if_dirty().unwrap());
        assert!(!store.is_dirty());
        assert!(!store.save_if_dirty().unwrap());

        let reloaded = StateStore::new(&path);
        reloaded.load().unwrap();
        assert!(reloaded.is_registered(&bot));
        assert_eq!(reloaded.membership(&room, &bot), Some(Membership::Invite));
        assert_eq!(
            reloaded.power_levels(&room).unwrap()["users_default"],
            serde_json::json!(0)
        );
    }

    #[test]
    fn test_malformed_file_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mx-state.json");
        std::fs::write(&path, "[1, 2").unwrap();
        assert!(matches!(
            StateStore::new(&path).load(),
            Err(StoreError::Parse { .. })
        ));
    }

    #[test]
    fn test_missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("absent.json"));
        store.load().unwrap();
        assert!(!store.is_dirty());
    }
}
