//! Entity registry.
//!
//! Owns every in-memory index of bridged identities:
//!
//! | Collection | Primary key    | Secondary key              |
//! |------------|----------------|----------------------------|
//! | users      | `MatrixUserID` | `WhatsAppID`               |
//! | portals    | `PortalKey`    | `MatrixRoomID`             |
//! | puppets    | `WhatsAppID`   | custom `MatrixUserID`      |
//!
//! plus the management-room binding (`MatrixRoomID → User`).
//!
//! Each collection has its own lock, so operations on different collections
//! never contend. Enumerations return snapshots; the lock is released before
//! the caller iterates.
//!
//! Dirty flags are per collection: any mutation marks the whole collection
//! for the next save.

mod portal;
mod puppet;
mod table;
mod user;

use std::sync::Arc;

use dashmap::DashMap;

use crate::database::Database;
use crate::error::{RegistryError, StoreError};
use crate::session::{Connection, Session};
use crate::types::{MatrixRoomID, MatrixUserID, PortalKey, WhatsAppID};

pub use portal::{Portal, PortalInfo};
pub use puppet::{Puppet, PuppetProfile};
pub use table::DualKeyTable;
pub use user::User;

/// One of the three persisted collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Users,
    Portals,
    Puppets,
}

impl Collection {
    /// Fixed save order used at shutdown.
    pub const ALL: [Collection; 3] = [Collection::Users, Collection::Portals, Collection::Puppets];

    pub fn name(self) -> &'static str {
        match self {
            Collection::Users => "users",
            Collection::Portals => "portals",
            Collection::Puppets => "puppets",
        }
    }
}

/// In-memory indexes of users, portals and puppets.
#[derive(Default)]
pub struct Registry {
    users: DualKeyTable<MatrixUserID, WhatsAppID, User>,
    management_rooms: DashMap<MatrixRoomID, Arc<User>>,
    portals: DualKeyTable<PortalKey, MatrixRoomID, Portal>,
    puppets: DualKeyTable<WhatsAppID, MatrixUserID, Puppet>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Loading ──────────────────────────────────────────────────────────

    /// Hydrate users (and their management rooms) from storage.
    pub fn load_users(&self, db: &dyn Database) -> Result<usize, StoreError> {
        let records = db.load_users()?;
        let count = records.len();
        for record in records {
            let mxid = record.mxid.clone();
            let jid = record.jid.clone();
            let room = record.management_room.clone();
            let user = self
                .users
                .insert(mxid, jid, User::from_record(record))
                .map_err(|e| StoreError::Inconsistent(e.to_string()))?;
            if let Some(room) = room {
                self.management_rooms.insert(room, user);
            }
        }
        tracing::info!(count, "Loaded users");
        Ok(count)
    }

    pub fn load_portals(&self, db: &dyn Database) -> Result<usize, StoreError> {
        let records = db.load_portals()?;
        let count = records.len();
        for record in records {
            let key = record.key.clone();
            let mxid = record.mxid.clone();
            self.portals
                .insert(key, mxid, Portal::from_record(record))
                .map_err(|e| StoreError::Inconsistent(e.to_string()))?;
        }
        tracing::info!(count, "Loaded portals");
        Ok(count)
    }

    pub fn load_puppets(&self, db: &dyn Database) -> Result<usize, StoreError> {
        let records = db.load_puppets()?;
        let count = records.len();
        for record in records {
            let jid = record.jid.clone();
            let custom_mxid = record.custom_mxid.clone();
            self.puppets
                .insert(jid, custom_mxid, Puppet::from_record(record))
                .map_err(|e| StoreError::Inconsistent(e.to_string()))?;
        }
        tracing::info!(count, "Loaded puppets");
        Ok(count)
    }

    // ── Saving ───────────────────────────────────────────────────────────

    pub fn is_dirty(&self, collection: Collection) -> bool {
        match collection {
            Collection::Users => self.users.is_dirty(),
            Collection::Portals => self.portals.is_dirty(),
            Collection::Puppets => self.puppets.is_dirty(),
        }
    }

    pub fn mark_dirty(&self, collection: Collection) {
        match collection {
            Collection::Users => self.users.mark_dirty(),
            Collection::Portals => self.portals.mark_dirty(),
            Collection::Puppets => self.puppets.mark_dirty(),
        }
    }

    fn take_dirty(&self, collection: Collection) -> bool {
        match collection {
            Collection::Users => self.users.take_dirty(),
            Collection::Portals => self.portals.take_dirty(),
            Collection::Puppets => self.puppets.take_dirty(),
        }
    }

    /// Snapshot the collection under its lock and write it out.
    fn write(&self, collection: Collection, db: &dyn Database) -> Result<usize, StoreError> {
        match collection {
            Collection::Users => {
                let mut records = self.users.snapshot(User::to_record);
                records.sort_by(|a, b| a.mxid.cmp(&b.mxid));
                db.save_users(&records)?;
                Ok(records.len())
            }
            Collection::Portals => {
                let mut records = self.portals.snapshot(Portal::to_record);
                records.sort_by(|a, b| a.key.cmp(&b.key));
                db.save_portals(&records)?;
                Ok(records.len())
            }
            Collection::Puppets => {
                let mut records = self.puppets.snapshot(Puppet::to_record);
                records.sort_by(|a, b| a.jid.cmp(&b.jid));
                db.save_puppets(&records)?;
                Ok(records.len())
            }
        }
    }

    /// Persist a whole collection regardless of its dirty flag.
    ///
    /// The flag is cleared before the snapshot, so a mutation racing with the
    /// save re-dirties it. A failed save restores the flag.
    pub fn save(&self, collection: Collection, db: &dyn Database) -> Result<usize, StoreError> {
        self.take_dirty(collection);
        self.write(collection, db).inspect_err(|_| self.mark_dirty(collection))
    }

    /// Persist the collection only if it is dirty. Returns the number of
    /// records written, or `None` when there was nothing to save.
    pub fn save_if_dirty(
        &self,
        collection: Collection,
        db: &dyn Database,
    ) -> Result<Option<usize>, StoreError> {
        if !self.take_dirty(collection) {
            return Ok(None);
        }
        self.write(collection, db)
            .map(Some)
            .inspect_err(|_| self.mark_dirty(collection))
    }

    // ── Users ────────────────────────────────────────────────────────────

    pub fn get_user_by_mxid(&self, mxid: &MatrixUserID) -> Option<Arc<User>> {
        self.users.get(mxid)
    }

    pub fn get_user_by_jid(&self, jid: &WhatsAppID) -> Option<Arc<User>> {
        self.users.get_by_secondary(jid)
    }

    /// Look up a user by Matrix ID, creating it on first contact.
    pub fn get_or_create_user(&self, mxid: &MatrixUserID) -> Arc<User> {
        let (user, created) = self
            .users
            .get_or_insert_with(mxid.clone(), || User::new(mxid.clone()));
        if created {
            tracing::debug!(user = %mxid, "Created user");
        }
        user
    }

    /// Assign (or clear) the WhatsApp identity of a user.
    pub fn set_user_jid(
        &self,
        mxid: &MatrixUserID,
        jid: Option<WhatsAppID>,
    ) -> Result<(), RegistryError> {
        self.users
            .set_secondary(mxid, jid, |user, jid| user.set_jid(jid))
            .map(|_| ())
    }

    /// Index the user under its authenticated JID and attach the live
    /// connection, in one step.
    pub fn attach_connection(
        &self,
        mxid: &MatrixUserID,
        connection: Connection,
    ) -> Result<(), RegistryError> {
        let Connection { session, jid } = connection;
        self.users
            .set_secondary(mxid, Some(jid), |user, jid| {
                user.set_jid(jid);
                user.attach(session);
            })
            .map(|_| ())
    }

    pub fn set_user_session(
        &self,
        mxid: &MatrixUserID,
        session: Option<Session>,
    ) -> Result<(), RegistryError> {
        self.users.update(mxid, |user| user.set_session(session))
    }

    /// Drop the live connection of a user, storing the resumable session
    /// when the disconnect produced one.
    pub fn detach_connection(
        &self,
        mxid: &MatrixUserID,
        session: Option<Session>,
    ) -> Result<(), RegistryError> {
        self.users.update(mxid, |user| {
            user.detach();
            if let Some(session) = session {
                user.set_session(Some(session));
            }
        })
    }

    /// Bind `room` as the management room of `mxid`.
    ///
    /// A user owns at most one management room, so a previous binding of
    /// the user is removed. If the room belonged to another user, that user
    /// loses it.
    pub fn set_management_room(
        &self,
        mxid: &MatrixUserID,
        room: MatrixRoomID,
    ) -> Result<(), RegistryError> {
        let user = self
            .users
            .get(mxid)
            .ok_or_else(|| RegistryError::NotFound(mxid.to_string()))?;

        self.users.update(mxid, |_| {
            if let Some(old) = user.management_room() {
                self.management_rooms.remove(&old);
            }
            if let Some((_, previous_owner)) = self.management_rooms.remove(&room) {
                previous_owner.set_management_room(None);
            }
            user.set_management_room(Some(room.clone()));
            self.management_rooms.insert(room, Arc::clone(&user));
        })
    }

    pub fn get_user_by_management_room(&self, room: &MatrixRoomID) -> Option<Arc<User>> {
        self.management_rooms.get(room).map(|r| Arc::clone(r.value()))
    }

    pub fn all_users(&self) -> Vec<Arc<User>> {
        self.users.values()
    }

    pub fn connected_users(&self) -> Vec<Arc<User>> {
        self.users.filter(User::is_connected)
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    // ── Portals ──────────────────────────────────────────────────────────

    pub fn get_portal(&self, key: &PortalKey) -> Option<Arc<Portal>> {
        self.portals.get(key)
    }

    pub fn get_portal_by_mxid(&self, mxid: &MatrixRoomID) -> Option<Arc<Portal>> {
        self.portals.get_by_secondary(mxid)
    }

    pub fn get_or_create_portal(&self, key: &PortalKey) -> Arc<Portal> {
        let (portal, created) = self
            .portals
            .get_or_insert_with(key.clone(), || Portal::new(key.clone()));
        if created {
            tracing::debug!(portal = %key, "Created portal");
        }
        portal
    }

    /// Record the Matrix room of a portal (or clear it).
    pub fn set_portal_mxid(
        &self,
        key: &PortalKey,
        mxid: Option<MatrixRoomID>,
    ) -> Result<(), RegistryError> {
        self.portals
            .set_secondary(key, mxid, |portal, mxid| portal.set_mxid(mxid))
            .map(|_| ())
    }

    pub fn update_portal_info(
        &self,
        key: &PortalKey,
        update: impl FnOnce(&mut PortalInfo),
    ) -> Result<(), RegistryError> {
        self.portals.update(key, |portal| portal.update_info(update))
    }

    pub fn all_portals(&self) -> Vec<Arc<Portal>> {
        self.portals.values()
    }

    pub fn portal_count(&self) -> usize {
        self.portals.len()
    }

    // ── Puppets ──────────────────────────────────────────────────────────

    pub fn get_puppet(&self, jid: &WhatsAppID) -> Option<Arc<Puppet>> {
        self.puppets.get(jid)
    }

    pub fn get_puppet_by_custom_mxid(&self, mxid: &MatrixUserID) -> Option<Arc<Puppet>> {
        self.puppets.get_by_secondary(mxid)
    }

    pub fn get_or_create_puppet(&self, jid: &WhatsAppID) -> Arc<Puppet> {
        let (puppet, created) = self
            .puppets
            .get_or_insert_with(jid.clone(), || Puppet::new(jid.clone()));
        if created {
            tracing::debug!(puppet = %jid, "Created puppet");
        }
        puppet
    }

    /// Bind a puppet to a user's own Matrix account, or clear the binding.
    ///
    /// A custom Matrix ID already bound to a different puppet is rejected
    /// with [`RegistryError::SecondaryKeyTaken`]; neither puppet changes.
    pub fn set_puppet_custom_mxid(
        &self,
        jid: &WhatsAppID,
        mxid: Option<MatrixUserID>,
        access_token: Option<String>,
    ) -> Result<(), RegistryError> {
        self.puppets
            .set_secondary(jid, mxid, |puppet, mxid| {
                puppet.set_custom_mxid(mxid, access_token)
            })
            .map(|_| ())
    }

    pub fn update_puppet_profile(
        &self,
        jid: &WhatsAppID,
        update: impl FnOnce(&mut PuppetProfile),
    ) -> Result<(), RegistryError> {
        self.puppets.update(jid, |puppet| puppet.update_profile(update))
    }

    pub fn all_puppets(&self) -> Vec<Arc<Puppet>> {
        self.puppets.values()
    }

    pub fn all_puppets_with_custom_mxid(&self) -> Vec<Arc<Puppet>> {
        self.puppets.filter(Puppet::has_custom_mxid)
    }

    pub fn puppet_count(&self) -> usize {
        self.puppets.len()
    }
}
