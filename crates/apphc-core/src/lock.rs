//! Process-wide lock registry.
//!
//! Two tiers of keys share one map:
//!
//! - **global-action keys** ([`GLOBAL_ACTION_KEYS`]) block every other
//!   exclusivity-requiring operation while held;
//! - **app keys** (`appName + rootGroupId`) block only operations on the
//!   same key.
//!
//! Acquisition is a single atomic check-and-insert under the registry mutex.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

pub const UPGRADE_CLUSTER: &str = "UpgradeCluster";
pub const ENABLE_DISABLE_APPS: &str = "EnableDisableApps";
pub const DELETE_APPS: &str = "DeleteApps";
pub const ADD_NODE: &str = "AddNode";
pub const REMOVE_NODE: &str = "RemoveNode";
/// Exclusive among node state changes only.
pub const UPDATE_NODE_STATE: &str = "UpdateNodeState";

/// Keys whose presence blocks all other exclusivity-requiring operations.
pub const GLOBAL_ACTION_KEYS: [&str; 5] = [
    ENABLE_DISABLE_APPS,
    DELETE_APPS,
    UPGRADE_CLUSTER,
    ADD_NODE,
    REMOVE_NODE,
];

pub fn is_global_action(key: &str) -> bool {
    GLOBAL_ACTION_KEYS.contains(&key)
}

/// Lock key for an application, optionally scoped by root group.
pub fn app_locker_key(app_name: &str, root_group_id: Option<&str>) -> String {
    format!("{app_name}{}", root_group_id.unwrap_or_default())
}

/// Record stored for a held key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockEntry {
    pub holder: String,
    pub acquired_at: u64,
}

#[derive(Debug, Clone, Default)]
pub struct LockRegistry {
    entries: Arc<Mutex<HashMap<String, LockEntry>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, LockEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn blocked(entries: &HashMap<String, LockEntry>, key: &str) -> bool {
        entries.contains_key(key) || GLOBAL_ACTION_KEYS.iter().any(|g| entries.contains_key(*g))
    }

    /// Acquire `key` if nothing blocks it. Returns `false` when locked.
    ///
    /// A global-action key additionally requires the registry to be empty,
    /// since global actions are exclusive with every in-flight operation.
    pub fn try_lock(&self, key: &str, holder: &str) -> bool {
        let mut entries = self.entries();
        let blocked = if is_global_action(key) {
            !entries.is_empty()
        } else {
            Self::blocked(&entries, key)
        };
        if blocked {
            debug!(%key, %holder, "lock acquisition refused");
            return false;
        }
        entries.insert(
            key.to_string(),
            LockEntry {
                holder: holder.to_string(),
                acquired_at: epoch_secs(),
            },
        );
        debug!(%key, %holder, "lock acquired");
        true
    }

    pub fn unlock(&self, key: &str) {
        if self.entries().remove(key).is_some() {
            debug!(%key, "lock released");
        }
    }

    /// True when `key` is held or any global-action key is held.
    pub fn is_locked(&self, key: &str) -> bool {
        Self::blocked(&self.entries(), key)
    }

    /// Acquire `key` and return a guard that releases it on drop.
    pub fn acquire(&self, key: &str, holder: &str) -> Option<LockGuard> {
        self.try_lock(key, holder).then(|| LockGuard {
            registry: self.clone(),
            key: key.to_string(),
        })
    }

    /// Currently held keys, sorted.
    pub fn held_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn entry(&self, key: &str) -> Option<LockEntry> {
        self.entries().get(key).cloned()
    }
}

/// Releases its key when dropped, including on early error returns.
#[derive(Debug)]
pub struct LockGuard {
    registry: LockRegistry,
    key: String,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.registry.unlock(&self.key);
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_keys_are_independent() {
        let reg = LockRegistry::new();
        assert!(reg.try_lock("foo", "create"));
        assert!(!reg.try_lock("foo", "update"));
        assert!(reg.try_lock("bar", "create"));
        assert!(reg.is_locked("foo"));
        assert!(!reg.is_locked("baz"));

        reg.unlock("foo");
        assert!(!reg.is_locked("foo"));
        assert!(reg.try_lock("foo", "update"));
    }

    #[test]
    fn global_key_blocks_every_key() {
        let reg = LockRegistry::new();
        for global in GLOBAL_ACTION_KEYS {
            assert!(reg.try_lock(global, "bulk"));
            assert!(reg.is_locked("some-app"));
            assert!(reg.is_locked("other-app"));
            assert!(!reg.try_lock("some-app", "create"));

            reg.unlock(global);
            assert!(!reg.is_locked("some-app"));
        }
    }

    #[test]
    fn global_key_waits_for_app_locks() {
        let reg = LockRegistry::new();
        assert!(reg.try_lock("foo", "create"));
        assert!(!reg.try_lock(DELETE_APPS, "bulk delete"));
        reg.unlock("foo");
        assert!(reg.try_lock(DELETE_APPS, "bulk delete"));
        assert!(!reg.try_lock(UPGRADE_CLUSTER, "upgrade"));
    }

    #[test]
    fn guard_releases_on_drop() {
        let reg = LockRegistry::new();
        {
            let guard = reg.acquire("foo", "create").unwrap();
            assert_eq!(guard.key(), "foo");
            assert!(reg.acquire("foo", "create").is_none());
            assert_eq!(reg.entry("foo").unwrap().holder, "create");
        }
        assert!(reg.held_keys().is_empty());
    }

    #[test]
    fn concurrent_acquire_has_single_winner() {
        let reg = LockRegistry::new();
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let reg = reg.clone();
                std::thread::spawn(move || reg.try_lock("foo", &format!("t{i}")))
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn node_state_key_is_not_global() {
        let reg = LockRegistry::new();
        assert!(reg.try_lock("foo", "create"));
        assert!(reg.try_lock(UPDATE_NODE_STATE, "cordon"));
        assert!(!reg.try_lock(UPDATE_NODE_STATE, "drain"));
        assert!(!reg.try_lock(ADD_NODE, "add node"));
    }

    #[test]
    fn locker_key_includes_root_group() {
        assert_eq!(app_locker_key("foo", None), "foo");
        assert_eq!(app_locker_key("foo", Some("r1")), "foor1");
    }
}
