//! Race tracker: per-release byte and file contributions by user.
//!
//! A "race" is the concurrent upload of one release by several users. The
//! tracker attributes bytes per user as uploads complete and keeps the
//! per-release totals additive: `total_bytes` always equals the sum over
//! `user_bytes`. Entries are retained after a nuke for reporting; credit
//! reversal is handled separately by the credit engine.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;

/// Point-in-time copy of one race.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RaceSnapshot {
    pub release_path: String,
    pub section: String,
    pub started_at: u64,
    pub last_updated: u64,
    pub file_count: u64,
    pub total_bytes: u64,
    pub user_bytes: BTreeMap<String, u64>,
}

impl RaceSnapshot {
    /// Contributors ordered by descending byte count, then name.
    pub fn standings(&self) -> Vec<(String, u64)> {
        let mut entries: Vec<(String, u64)> =
            self.user_bytes.iter().map(|(k, v)| (k.clone(), *v)).collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        entries
    }
}

/// Striped per-release tracker; one map entry per release key.
#[derive(Default)]
pub struct RaceTracker {
    races: DashMap<String, RaceSnapshot>,
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

impl RaceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `bytes` uploaded by `user` into the release at
    /// `release_path`, creating the race on first contact.
    pub fn on_bytes(&self, release_path: &str, section: &str, user: &str, bytes: u64) {
        let mut race = self.races.entry(release_path.to_string()).or_insert_with(|| {
            let now = now_secs();
            RaceSnapshot {
                release_path: release_path.to_string(),
                section: section.to_string(),
                started_at: now,
                last_updated: now,
                ..RaceSnapshot::default()
            }
        });
        *race.user_bytes.entry(user.to_string()).or_insert(0) += bytes;
        race.total_bytes += bytes;
        race.file_count += 1;
        race.last_updated = now_secs();
    }

    pub fn try_get(&self, release_path: &str) -> Option<RaceSnapshot> {
        self.races.get(release_path).map(|r| r.clone())
    }

    /// The `n` most recently updated races, newest first.
    pub fn recent(&self, n: usize) -> Vec<RaceSnapshot> {
        let mut all: Vec<RaceSnapshot> = self.races.iter().map(|r| r.clone()).collect();
        all.sort_by(|a, b| b.last_updated.cmp(&a.last_updated).then(a.release_path.cmp(&b.release_path)));
        all.truncate(n);
        all
    }

    pub fn remove(&self, release_path: &str) -> Option<RaceSnapshot> {
        self.races.remove(release_path).map(|(_, race)| race)
    }

    /// Relocates a race when its release directory is renamed (nuke, MOVE).
    pub fn rename(&self, from: &str, to: &str) {
        if let Some((_, mut race)) = self.races.remove(from) {
            race.release_path = to.to_string();
            self.races.insert(to.to_string(), race);
        }
    }

    pub fn len(&self) -> usize {
        self.races.len()
    }

    pub fn is_empty(&self) -> bool {
        self.races.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_stay_additive() {
        let tracker = RaceTracker::new();
        tracker.on_bytes("/mp3/rel", "MP3", "alice", 500);
        tracker.on_bytes("/mp3/rel", "MP3", "bob", 300);
        tracker.on_bytes("/mp3/rel", "MP3", "alice", 200);

        let race = tracker.try_get("/mp3/rel").unwrap();
        assert_eq!(race.total_bytes, 1000);
        assert_eq!(race.total_bytes, race.user_bytes.values().sum::<u64>());
        assert_eq!(race.user_bytes["alice"], 700);
        assert_eq!(race.file_count, 3);
    }

    #[test]
    fn standings_order_by_bytes_then_name() {
        let tracker = RaceTracker::new();
        tracker.on_bytes("/mp3/rel", "MP3", "bob", 300);
        tracker.on_bytes("/mp3/rel", "MP3", "alice", 300);
        tracker.on_bytes("/mp3/rel", "MP3", "carol", 900);

        let race = tracker.try_get("/mp3/rel").unwrap();
        let standings = race.standings();
        assert_eq!(standings[0].0, "carol");
        assert_eq!(standings[1].0, "alice");
        assert_eq!(standings[2].0, "bob");
    }

    #[test]
    fn recent_returns_newest_first() {
        let tracker = RaceTracker::new();
        tracker.on_bytes("/mp3/a", "MP3", "alice", 1);
        tracker.on_bytes("/mp3/b", "MP3", "alice", 1);
        let recent = tracker.recent(1);
        assert_eq!(recent.len(), 1);
    }

    #[test]
    fn rename_preserves_contributions() {
        let tracker = RaceTracker::new();
        tracker.on_bytes("/mp3/rel", "MP3", "alice", 42);
        tracker.rename("/mp3/rel", "/mp3/rel.NUKED");
        assert!(tracker.try_get("/mp3/rel").is_none());
        let race = tracker.try_get("/mp3/rel.NUKED").unwrap();
        assert_eq!(race.user_bytes["alice"], 42);
    }
}
