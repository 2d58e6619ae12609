//! Persistence backend for users, portals and puppets.
//!
//! The supervisor treats the backend as synchronous and all-or-nothing per
//! call: a collection is always loaded or saved as a whole.
//!
//! ## Storage
//!
//! [`JsonDatabase`] stores one JSON file per collection in the bridge data
//! directory (`users.json`, `portals.json`, `puppets.json`). Writes go to a
//! `.json.tmp` file that is renamed over the old one, so a crash mid-write
//! leaves the previous file intact.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::session::Session;
use crate::types::{MatrixRoomID, MatrixUserID, PortalKey, WhatsAppID};

// ── Records ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub mxid: MatrixUserID,
    #[serde(default)]
    pub jid: Option<WhatsAppID>,
    #[serde(default)]
    pub management_room: Option<MatrixRoomID>,
    #[serde(default)]
    pub session: Option<Session>,
    #[serde(default)]
    pub last_connected_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortalRecord {
    pub key: PortalKey,
    #[serde(default)]
    pub mxid: Option<MatrixRoomID>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub avatar: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PuppetRecord {
    pub jid: WhatsAppID,
    #[serde(default)]
    pub displayname: String,
    #[serde(default)]
    pub avatar: String,
    #[serde(default)]
    pub custom_mxid: Option<MatrixUserID>,
    #[serde(default)]
    pub access_token: Option<String>,
}

// ── Backend ──────────────────────────────────────────────────────────────────

/// Load-all / save-all storage for the registry collections.
pub trait Database: Send + Sync {
    fn load_users(&self) -> Result<Vec<UserRecord>, StoreError>;
    fn save_users(&self, users: &[UserRecord]) -> Result<(), StoreError>;

    fn load_portals(&self) -> Result<Vec<PortalRecord>, StoreError>;
    fn save_portals(&self, portals: &[PortalRecord]) -> Result<(), StoreError>;

    fn load_puppets(&self) -> Result<Vec<PuppetRecord>, StoreError>;
    fn save_puppets(&self, puppets: &[PuppetRecord]) -> Result<(), StoreError>;
}

/// File-backed database, one JSON array per collection.
pub struct JsonDatabase {
    dir: PathBuf,
}

impl JsonDatabase {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn load_file<T: DeserializeOwned>(&self, name: &str) -> Result<Vec<T>, StoreError> {
        let path = self.dir.join(name);
        if !path.exists() {
            tracing::info!(path = %path.display(), "No existing data file, starting fresh");
            return Ok(Vec::new());
        }
        let contents = std::fs::read_to_string(&path).map_err(|source| StoreError::Read {
            path: path.clone(),
            source,
        })?;
        let records: Vec<T> =
            serde_json::from_str(&contents).map_err(|source| StoreError::Parse {
                path: path.clone(),
                source,
            })?;
        tracing::debug!(path = %path.display(), count = records.len(), "Loaded data file");
        Ok(records)
    }

    fn save_file<T: Serialize>(&self, name: &str, records: &[T]) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(records)?;
        write_json_atomic(&self.dir.join(name), &json)
    }
}

impl Database for JsonDatabase {
    fn load_users(&self) -> Result<Vec<UserRecord>, StoreError> {
        self.load_file("users.json")
    }

    fn save_users(&self, users: &[UserRecord]) -> Result<(), StoreError> {
        self.save_file("users.json", users)
    }

    fn load_portals(&self) -> Result<Vec<PortalRecord>, StoreError> {
        self.load_file("portals.json")
    }

    fn save_portals(&self, portals: &[PortalRecord]) -> Result<(), StoreError> {
        self.save_file("portals.json", portals)
    }

    fn load_puppets(&self) -> Result<Vec<PuppetRecord>, StoreError> {
        self.load_file("puppets.json")
    }

    fn save_puppets(&self, puppets: &[PuppetRecord]) -> Result<(), StoreError> {
        self.save_file("puppets.json", puppets)
    }
}

/// Atomic write: temp file + rename.
pub(crate) fn write_json_atomic(path: &Path, json: &str) -> Result<(), StoreError> {
    if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|source| StoreError::Write {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, json).map_err(|source| StoreError::Write {
        path: tmp_path.clone(),
        source,
    })?;
    if let Err(source) = std::fs::rename(&tmp_path, path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(StoreError::Write {
            path: path.to_path_buf(),
            source,
        });
    }
    Ok(())
}
