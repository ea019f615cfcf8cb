//! In-memory reference implementations of the store contracts.
//!
//! These keep everything behind an `RwLock` and serialize to JSON under the
//! configured data directory for backups. The on-disk binary stores used by
//! production deployments implement the same contracts externally.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::RwLock;

use tracing::info;

use crate::store::{GroupStore, StoreAdmin, StoreError, StoreResult, UserStore, ZipscriptDb};
use crate::users::{Group, User};

/// Digest used by the in-memory user store. FNV-1a over the password; the
/// external binary stores supply their own scheme behind the same contract.
pub fn hash_password(password: &str) -> String {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = FNV_OFFSET;
    for byte in password.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    format!("{hash:016x}")
}

#[derive(Default)]
pub struct MemoryUserStore {
    users: RwLock<BTreeMap<String, User>>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_users(users: impl IntoIterator<Item = User>) -> Self {
        let map = users.into_iter().map(|u| (u.name.to_ascii_lowercase(), u)).collect();
        MemoryUserStore { users: RwLock::new(map) }
    }

    fn key(name: &str) -> String {
        name.to_ascii_lowercase()
    }
}

impl UserStore for MemoryUserStore {
    fn try_authenticate(&self, name: &str, password: &str) -> Option<User> {
        let users = self.users.read().expect("user store lock");
        let user = users.get(&Self::key(name))?;
        if user.password_hash == hash_password(password) {
            Some(user.clone())
        } else {
            None
        }
    }

    fn find(&self, name: &str) -> Option<User> {
        self.users.read().expect("user store lock").get(&Self::key(name)).cloned()
    }

    fn all(&self) -> Vec<User> {
        self.users.read().expect("user store lock").values().cloned().collect()
    }

    fn try_add(&self, user: User) -> StoreResult<()> {
        let mut users = self.users.write().expect("user store lock");
        let key = Self::key(&user.name);
        if users.contains_key(&key) {
            return Err(StoreError::Duplicate(user.name));
        }
        users.insert(key, user);
        Ok(())
    }

    fn try_update(&self, user: User) -> StoreResult<()> {
        let mut users = self.users.write().expect("user store lock");
        let key = Self::key(&user.name);
        if !users.contains_key(&key) {
            return Err(StoreError::Missing(user.name));
        }
        users.insert(key, user);
        Ok(())
    }

    fn on_logout(&self, _user: &User) {}
}

#[derive(Default)]
pub struct MemoryGroupStore {
    groups: RwLock<BTreeMap<String, Group>>,
}

impl MemoryGroupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_groups(groups: impl IntoIterator<Item = Group>) -> Self {
        let map = groups.into_iter().map(|g| (g.name.to_ascii_lowercase(), g)).collect();
        MemoryGroupStore { groups: RwLock::new(map) }
    }

    fn key(name: &str) -> String {
        name.to_ascii_lowercase()
    }
}

impl GroupStore for MemoryGroupStore {
    fn find(&self, name: &str) -> Option<Group> {
        self.groups.read().expect("group store lock").get(&Self::key(name)).cloned()
    }

    fn all(&self) -> Vec<Group> {
        self.groups.read().expect("group store lock").values().cloned().collect()
    }

    fn try_add(&self, group: Group) -> StoreResult<()> {
        let mut groups = self.groups.write().expect("group store lock");
        let key = Self::key(&group.name);
        if groups.contains_key(&key) {
            return Err(StoreError::Duplicate(group.name));
        }
        groups.insert(key, group);
        Ok(())
    }

    fn try_update(&self, group: Group) -> StoreResult<()> {
        let mut groups = self.groups.write().expect("group store lock");
        let key = Self::key(&group.name);
        if !groups.contains_key(&key) {
            return Err(StoreError::Missing(group.name));
        }
        groups.insert(key, group);
        Ok(())
    }

    fn try_delete(&self, name: &str) -> StoreResult<()> {
        let mut groups = self.groups.write().expect("group store lock");
        groups
            .remove(&Self::key(name))
            .map(|_| ())
            .ok_or_else(|| StoreError::Missing(name.to_string()))
    }

    fn try_rename(&self, from: &str, to: &str) -> StoreResult<()> {
        let mut groups = self.groups.write().expect("group store lock");
        if groups.contains_key(&Self::key(to)) {
            return Err(StoreError::Duplicate(to.to_string()));
        }
        let mut group =
            groups.remove(&Self::key(from)).ok_or_else(|| StoreError::Missing(from.to_string()))?;
        group.name = to.to_string();
        groups.insert(Self::key(to), group);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryZipscriptDb {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryZipscriptDb {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ZipscriptDb for MemoryZipscriptDb {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.read().expect("zipscript db lock").get(key).cloned()
    }

    fn put(&self, key: &str, value: String) {
        self.entries.write().expect("zipscript db lock").insert(key.to_string(), value);
    }

    fn delete(&self, key: &str) -> bool {
        self.entries.write().expect("zipscript db lock").remove(key).is_some()
    }

    fn iterate(&self) -> BTreeMap<String, String> {
        self.entries.read().expect("zipscript db lock").clone()
    }
}

/// Backup/fsck/summary over the in-memory stores, writing JSON snapshots
/// into the configured data directory.
pub struct MemoryStoreAdmin {
    pub data_dir: PathBuf,
    pub users: std::sync::Arc<MemoryUserStore>,
    pub groups: std::sync::Arc<MemoryGroupStore>,
}

impl StoreAdmin for MemoryStoreAdmin {
    fn backup(&self) -> StoreResult<String> {
        std::fs::create_dir_all(&self.data_dir)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let users = self.users.all();
        let groups = self.groups.all();
        let user_path = self.data_dir.join("users.backup.json");
        let group_path = self.data_dir.join("groups.backup.json");
        std::fs::write(
            &user_path,
            serde_json::to_string_pretty(&users).map_err(|e| StoreError::Backend(e.to_string()))?,
        )
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        std::fs::write(
            &group_path,
            serde_json::to_string_pretty(&groups)
                .map_err(|e| StoreError::Backend(e.to_string()))?,
        )
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        info!("Store backup written to {}", self.data_dir.display());
        Ok(format!("{} users, {} groups -> {}", users.len(), groups.len(), self.data_dir.display()))
    }

    fn fsck(&self) -> StoreResult<Vec<String>> {
        let mut findings = Vec::new();
        let groups = self.groups.all();
        for user in self.users.all() {
            if !groups.iter().any(|g| g.name.eq_ignore_ascii_case(&user.primary_group)) {
                findings.push(format!(
                    "user {} references missing group {}",
                    user.name, user.primary_group
                ));
            }
        }
        Ok(findings)
    }

    fn summary(&self) -> Vec<String> {
        vec![
            format!("users: {}", self.users.all().len()),
            format!("groups: {}", self.groups.all().len()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authenticate_checks_digest() {
        let mut user = User::new("alice", &hash_password("secret"), "staff");
        user.credits_kb = 10;
        let store = MemoryUserStore::with_users([user]);
        assert!(store.try_authenticate("alice", "secret").is_some());
        assert!(store.try_authenticate("ALICE", "secret").is_some());
        assert!(store.try_authenticate("alice", "wrong").is_none());
        assert!(store.try_authenticate("bob", "secret").is_none());
    }

    #[test]
    fn add_rejects_case_insensitive_duplicates() {
        let store = MemoryUserStore::new();
        store.try_add(User::new("Alice", "x", "staff")).unwrap();
        assert!(matches!(
            store.try_add(User::new("alice", "x", "staff")),
            Err(StoreError::Duplicate(_))
        ));
    }

    #[test]
    fn group_rename_moves_entry() {
        let store = MemoryGroupStore::new();
        store.try_add(Group::new("old", "desc")).unwrap();
        store.try_rename("OLD", "new").unwrap();
        assert!(store.find("old").is_none());
        assert_eq!(store.find("new").unwrap().description, "desc");
    }
}
