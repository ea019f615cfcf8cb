//! Dupe store: previously-seen releases keyed by `(section, release_name)`.
//!
//! The store contract mirrors what the external database implementations
//! provide; the bundled in-memory store keeps a `moka` read cache in front
//! of its table because `find` sits on the upload hot path (every STOR into
//! a release directory checks for dupes).

use glob::{MatchOptions, Pattern};
use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

/// Metadata for one known release.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DupeEntry {
    pub section: String,
    pub release_name: String,
    pub virtual_path: String,
    pub total_bytes: u64,
    pub first_seen: u64,
    pub last_updated: u64,
    pub uploader: String,
    pub uploader_group: String,
    pub nuked: bool,
    pub nuke_reason: String,
    pub nuke_multiplier: f64,
}

impl DupeEntry {
    pub fn new(section: &str, release_name: &str, virtual_path: &str) -> DupeEntry {
        let now = now_secs();
        DupeEntry {
            section: section.to_string(),
            release_name: release_name.to_string(),
            virtual_path: virtual_path.to_string(),
            total_bytes: 0,
            first_seen: now,
            last_updated: now,
            uploader: String::new(),
            uploader_group: String::new(),
            nuked: false,
            nuke_reason: String::new(),
            nuke_multiplier: 0.0,
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Release identity store. All name/section comparisons are
/// case-insensitive; `(section, release_name)` is unique.
pub trait DupeStore: Send + Sync {
    fn find(&self, section: &str, release: &str) -> Option<DupeEntry>;

    /// Glob search (`*`/`?`) over release names, optionally restricted to a
    /// section, sorted by `(section, release_name)` and cut at `limit`.
    fn search(&self, pattern: &str, section: Option<&str>, limit: usize) -> Vec<DupeEntry>;

    /// Inserts or refreshes an entry. An update keeps the original
    /// `first_seen` and always refreshes `last_updated`.
    fn upsert(&self, entry: DupeEntry);

    fn remove(&self, section: &str, release: &str) -> bool;

    /// Every entry, sorted by `(section, release_name)`.
    fn all(&self) -> Vec<DupeEntry>;
}

fn store_key(section: &str, release: &str) -> (String, String) {
    (section.to_ascii_lowercase(), release.to_ascii_lowercase())
}

/// In-memory dupe store with a bounded read cache.
pub struct MemoryDupeStore {
    entries: RwLock<BTreeMap<(String, String), DupeEntry>>,
    cache: Cache<(String, String), DupeEntry>,
}

impl Default for MemoryDupeStore {
    fn default() -> Self {
        MemoryDupeStore {
            entries: RwLock::new(BTreeMap::new()),
            cache: Cache::new(4096),
        }
    }
}

impl MemoryDupeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DupeStore for MemoryDupeStore {
    fn find(&self, section: &str, release: &str) -> Option<DupeEntry> {
        let key = store_key(section, release);
        if let Some(hit) = self.cache.get(&key) {
            return Some(hit);
        }
        let entry = self.entries.read().expect("dupe store lock").get(&key).cloned()?;
        self.cache.insert(key, entry.clone());
        Some(entry)
    }

    fn search(&self, pattern: &str, section: Option<&str>, limit: usize) -> Vec<DupeEntry> {
        let options = MatchOptions { case_sensitive: false, ..MatchOptions::default() };
        let pattern = match Pattern::new(pattern) {
            Ok(p) => p,
            Err(_) => return Vec::new(),
        };
        let entries = self.entries.read().expect("dupe store lock");
        entries
            .values()
            .filter(|e| {
                section.map(|s| e.section.eq_ignore_ascii_case(s)).unwrap_or(true)
                    && pattern.matches_with(&e.release_name, options)
            })
            .take(limit)
            .cloned()
            .collect()
    }

    fn upsert(&self, mut entry: DupeEntry) {
        let key = store_key(&entry.section, &entry.release_name);
        let mut entries = self.entries.write().expect("dupe store lock");
        entry.last_updated = now_secs();
        if let Some(existing) = entries.get(&key) {
            entry.first_seen = existing.first_seen;
        }
        self.cache.invalidate(&key);
        entries.insert(key, entry);
    }

    fn remove(&self, section: &str, release: &str) -> bool {
        let key = store_key(section, release);
        self.cache.invalidate(&key);
        self.entries.write().expect("dupe store lock").remove(&key).is_some()
    }

    fn all(&self) -> Vec<DupeEntry> {
        self.entries.read().expect("dupe store lock").values().cloned().collect()
    }
}
