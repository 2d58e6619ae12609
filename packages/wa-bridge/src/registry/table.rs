//! Dual-keyed table.
//!
//! Every registry collection is reachable through two key spaces: a primary
//! key that never changes and an optional secondary key that is assigned
//! later (a user's WhatsApp JID, a portal's Matrix room, a puppet's custom
//! Matrix ID). Both indexes live behind one exclusive lock so another thread
//! can never observe a key in one index and not the other.
//!
//! A secondary key identifies at most one entity. Binding a secondary key
//! that belongs to a different entity is rejected and leaves the table
//! unchanged.

use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::RegistryError;

struct Entry<S, V> {
    value: Arc<V>,
    secondary: Option<S>,
}

struct Indexes<P, S, V> {
    primary: HashMap<P, Entry<S, V>>,
    secondary: HashMap<S, P>,
}

/// A lock-guarded collection indexed by a primary and a secondary key, with
/// a collection-wide dirty flag.
pub struct DualKeyTable<P, S, V> {
    indexes: Mutex<Indexes<P, S, V>>,
    dirty: AtomicBool,
}

impl<P, S, V> Default for DualKeyTable<P, S, V>
where
    P: Eq + Hash + Clone + Display,
    S: Eq + Hash + Clone + Display,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<P, S, V> DualKeyTable<P, S, V>
where
    P: Eq + Hash + Clone + Display,
    S: Eq + Hash + Clone + Display,
{
    pub fn new() -> Self {
        Self {
            indexes: Mutex::new(Indexes {
                primary: HashMap::new(),
                secondary: HashMap::new(),
            }),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn get(&self, key: &P) -> Option<Arc<V>> {
        let indexes = self.indexes.lock();
        indexes.primary.get(key).map(|e| Arc::clone(&e.value))
    }

    pub fn get_by_secondary(&self, key: &S) -> Option<Arc<V>> {
        let indexes = self.indexes.lock();
        indexes
            .secondary
            .get(key)
            .and_then(|primary| indexes.primary.get(primary))
            .map(|e| Arc::clone(&e.value))
    }

    /// Secondary key currently bound to `key`.
    pub fn secondary_of(&self, key: &P) -> Option<S> {
        let indexes = self.indexes.lock();
        indexes.primary.get(key).and_then(|e| e.secondary.clone())
    }

    /// Insert a new entity under both keys at once.
    ///
    /// Used when hydrating from storage, so it does not mark the table dirty.
    pub fn insert(&self, key: P, secondary: Option<S>, value: V) -> Result<Arc<V>, RegistryError> {
        let mut guard = self.indexes.lock();
        let Indexes {
            primary,
            secondary: by_secondary,
        } = &mut *guard;

        if primary.contains_key(&key) {
            return Err(RegistryError::DuplicateKey(key.to_string()));
        }
        if let Some(ref s) = secondary {
            if let Some(owner) = by_secondary.get(s) {
                return Err(RegistryError::SecondaryKeyTaken {
                    key: s.to_string(),
                    owner: owner.to_string(),
                });
            }
            by_secondary.insert(s.clone(), key.clone());
        }

        let value = Arc::new(value);
        primary.insert(
            key,
            Entry {
                value: Arc::clone(&value),
                secondary,
            },
        );
        Ok(value)
    }

    /// Look up `key`, creating the entity with `create` if absent.
    ///
    /// Returns the entity and whether it was created. Creation marks the
    /// table dirty.
    pub fn get_or_insert_with(&self, key: P, create: impl FnOnce() -> V) -> (Arc<V>, bool) {
        let mut indexes = self.indexes.lock();
        if let Some(entry) = indexes.primary.get(&key) {
            return (Arc::clone(&entry.value), false);
        }
        let value = Arc::new(create());
        indexes.primary.insert(
            key,
            Entry {
                value: Arc::clone(&value),
                secondary: None,
            },
        );
        self.mark_dirty();
        (value, true)
    }

    /// Bind, rebind or clear the secondary key of `key`.
    ///
    /// `apply` runs while the lock is still held so the entity's own copy of
    /// the key changes together with the index. Returns the previous
    /// secondary key.
    pub fn set_secondary(
        &self,
        key: &P,
        secondary: Option<S>,
        apply: impl FnOnce(&V, Option<&S>),
    ) -> Result<Option<S>, RegistryError> {
        let mut guard = self.indexes.lock();
        let Indexes {
            primary,
            secondary: by_secondary,
        } = &mut *guard;

        let entry = primary
            .get_mut(key)
            .ok_or_else(|| RegistryError::NotFound(key.to_string()))?;

        if let Some(ref s) = secondary {
            match by_secondary.get(s) {
                Some(owner) if owner != key => {
                    return Err(RegistryError::SecondaryKeyTaken {
                        key: s.to_string(),
                        owner: owner.to_string(),
                    });
                }
                _ => {}
            }
        }

        let previous = entry.secondary.take();
        if let Some(ref old) = previous {
            by_secondary.remove(old);
        }
        if let Some(ref s) = secondary {
            by_secondary.insert(s.clone(), key.clone());
        }
        apply(&entry.value, secondary.as_ref());
        entry.secondary = secondary;

        self.mark_dirty();
        Ok(previous)
    }

    /// Mutate a non-key field of `key` under the table lock and mark the
    /// table dirty.
    pub fn update(&self, key: &P, apply: impl FnOnce(&V)) -> Result<(), RegistryError> {
        let indexes = self.indexes.lock();
        let entry = indexes
            .primary
            .get(key)
            .ok_or_else(|| RegistryError::NotFound(key.to_string()))?;
        apply(&entry.value);
        self.mark_dirty();
        Ok(())
    }

    /// Copy every entity out. The lock is released before the caller
    /// iterates.
    pub fn values(&self) -> Vec<Arc<V>> {
        self.filter(|_| true)
    }

    pub fn filter(&self, predicate: impl Fn(&V) -> bool) -> Vec<Arc<V>> {
        let indexes = self.indexes.lock();
        indexes
            .primary
            .values()
            .filter(|e| predicate(&e.value))
            .map(|e| Arc::clone(&e.value))
            .collect()
    }

    /// Map every entity while holding the lock, producing a consistent
    /// snapshot (used to build records for persistence).
    pub fn snapshot<R>(&self, map: impl Fn(&V) -> R) -> Vec<R> {
        let indexes = self.indexes.lock();
        indexes.primary.values().map(|e| map(&e.value)).collect()
    }

    pub fn len(&self) -> usize {
        self.indexes.lock().primary.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Clear the dirty flag, returning whether it was set.
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    type Table = DualKeyTable<String, String, Mutex<Option<String>>>;

    fn bind(table: &Table, key: &str, secondary: Option<&str>) -> Result<Option<String>, RegistryError> {
        table.set_secondary(&key.to_string(), secondary.map(str::to_string), |v, s| {
            *v.lock() = s.cloned();
        })
    }

    #[test]
    fn test_lookup_by_both_keys_returns_same_entity() {
        let table = Table::new();
        let (alice, created) = table.get_or_insert_with("alice".into(), || Mutex::new(None));
        assert!(created);
        bind(&table, "alice", Some("a-jid")).unwrap();

        let by_primary = table.get(&"alice".to_string()).unwrap();
        let by_secondary = table.get_by_secondary(&"a-jid".to_string()).unwrap();
        assert!(Arc::ptr_eq(&alice, &by_primary));
        assert!(Arc::ptr_eq(&by_primary, &by_secondary));
        assert_eq!(alice.lock().as_deref(), Some("a-jid"));
    }

    #[test]
    fn test_taken_secondary_is_rejected() {
        let table = Table::new();
        table.get_or_insert_with("alice".into(), || Mutex::new(None));
        table.get_or_insert_with("bob".into(), || Mutex::new(None));
        bind(&table, "alice", Some("shared")).unwrap();

        let err = bind(&table, "bob", Some("shared")).unwrap_err();
        assert_eq!(
            err,
            RegistryError::SecondaryKeyTaken {
                key: "shared".to_string(),
                owner: "alice".to_string(),
            }
        );
        // Nothing changed on either side.
        assert_eq!(table.secondary_of(&"alice".to_string()).as_deref(), Some("shared"));
        assert_eq!(table.secondary_of(&"bob".to_string()), None);
        assert!(table.get(&"bob".to_string()).unwrap().lock().is_none());
    }

    #[test]
    fn test_rebind_drops_old_secondary() {
        let table = Table::new();
        table.get_or_insert_with("alice".into(), || Mutex::new(None));
        bind(&table, "alice", Some("old")).unwrap();

        let previous = bind(&table, "alice", Some("new")).unwrap();
        assert_eq!(previous.as_deref(), Some("old"));
        assert!(table.get_by_secondary(&"old".to_string()).is_none());
        assert!(table.get_by_secondary(&"new".to_string()).is_some());

        bind(&table, "alice", None).unwrap();
        assert!(table.get_by_secondary(&"new".to_string()).is_none());
    }

    #[test]
    fn test_insert_rejects_duplicates_and_does_not_dirty() {
        let table = Table::new();
        table
            .insert("alice".into(), Some("a".into()), Mutex::new(None))
            .unwrap();
        assert!(!table.is_dirty());
        assert!(matches!(
            table.insert("alice".into(), None, Mutex::new(None)),
            Err(RegistryError::DuplicateKey(_))
        ));
        assert!(matches!(
            table.insert("bob".into(), Some("a".into()), Mutex::new(None)),
            Err(RegistryError::SecondaryKeyTaken { .. })
        ));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_take_dirty_clears_flag() {
        let table = Table::new();
        assert!(!table.take_dirty());
        table.get_or_insert_with("alice".into(), || Mutex::new(None));
        assert!(table.take_dirty());
        assert!(!table.is_dirty());
    }

    #[test]
    fn test_concurrent_binds_keep_indexes_consistent() {
        let table = Arc::new(Table::new());
        let threads: Vec<_> = (0..8)
            .map(|t| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    for i in 0..200 {
                        let key = format!("user-{}", i % 50);
                        table.get_or_insert_with(key.clone(), || Mutex::new(None));
                        // Threads race for the same secondary keys.
                        let secondary = format!("jid-{}", (i + t) % 60);
                        let _ = bind(&table, &key, Some(&secondary));
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(table.len(), 50);
        for i in 0..60 {
            let secondary = format!("jid-{}", i);
            if let Some(entity) = table.get_by_secondary(&secondary) {
                // The entity's own copy agrees with the index that found it.
                assert_eq!(entity.lock().as_deref(), Some(secondary.as_str()));
            }
        }
        for i in 0..50 {
            let key = format!("user-{}", i);
            let entity = table.get(&key).unwrap();
            let bound = table.secondary_of(&key);
            assert_eq!(*entity.lock(), bound);
            if let Some(s) = bound {
                assert!(Arc::ptr_eq(&entity, &table.get_by_secondary(&s).unwrap()));
            }
        }
    }
}
