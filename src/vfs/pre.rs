//! PRE announcements and the synthetic `/PRE` tree.
//!
//! A PRE marks a release as just made available. Entries carry a TTL
//! (configurable, 48h default) and expired entries vanish from listings and
//! enumeration without explicit cleanup. The tree is `/PRE` → one directory
//! per section with announcements → one entry per release pointing at the
//! real release directory.

use std::sync::RwLock;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;

use crate::users::User;
use crate::vfs::{path, Lookup, Node, VfsProvider};

/// One announcement.
#[derive(Debug, Clone, PartialEq)]
pub struct PreEntry {
    pub announced_at: SystemTime,
    pub section: String,
    pub release_name: String,
    pub user: String,
    /// Where the release actually lives in the virtual tree.
    pub virtual_path: String,
}

/// TTL-bounded announcement registry.
pub struct PreRegistry {
    entries: RwLock<Vec<PreEntry>>,
    ttl: Duration,
}

impl PreRegistry {
    pub fn new(ttl: Duration) -> Self {
        PreRegistry { entries: RwLock::new(Vec::new()), ttl }
    }

    pub fn announce(&self, entry: PreEntry) {
        let mut entries = self.entries.write().expect("pre registry lock");
        entries.retain(|e| {
            !(e.section.eq_ignore_ascii_case(&entry.section)
                && e.release_name.eq_ignore_ascii_case(&entry.release_name))
        });
        entries.push(entry);
    }

    /// Removes an announcement; true when one was present and unexpired.
    pub fn withdraw(&self, section: &str, release_name: &str) -> bool {
        let mut entries = self.entries.write().expect("pre registry lock");
        let before = entries.len();
        entries.retain(|e| {
            !(e.section.eq_ignore_ascii_case(section)
                && e.release_name.eq_ignore_ascii_case(release_name))
        });
        before != entries.len()
    }

    fn expired(&self, entry: &PreEntry) -> bool {
        entry.announced_at.elapsed().map(|age| age > self.ttl).unwrap_or(false)
    }

    /// Live announcements, newest first.
    pub fn live(&self) -> Vec<PreEntry> {
        let entries = self.entries.read().expect("pre registry lock");
        let mut live: Vec<PreEntry> =
            entries.iter().filter(|e| !self.expired(e)).cloned().collect();
        live.sort_by(|a, b| b.announced_at.cmp(&a.announced_at));
        live
    }

    pub fn live_in_section(&self, section: &str) -> Vec<PreEntry> {
        self.live()
            .into_iter()
            .filter(|e| e.section.eq_ignore_ascii_case(section))
            .collect()
    }

    pub fn find(&self, section: &str, release_name: &str) -> Option<PreEntry> {
        self.live().into_iter().find(|e| {
            e.section.eq_ignore_ascii_case(section)
                && e.release_name.eq_ignore_ascii_case(release_name)
        })
    }
}

/// Provider serving the `/PRE` subtree from the registry.
pub struct PreProvider {
    registry: std::sync::Arc<PreRegistry>,
}

impl PreProvider {
    pub fn new(registry: std::sync::Arc<PreRegistry>) -> Self {
        PreProvider { registry }
    }

    /// Path components below `/PRE`, or `None` when outside the subtree.
    fn components(virtual_path: &str) -> Option<Vec<&str>> {
        let rest = path::strip_prefix(virtual_path, "/PRE")?;
        if rest.is_empty() {
            Some(Vec::new())
        } else {
            Some(rest.split('/').collect())
        }
    }
}

#[async_trait]
impl VfsProvider for PreProvider {
    fn can_handle(&self, virtual_path: &str) -> bool {
        Self::components(virtual_path).is_some()
    }

    async fn resolve(&self, virtual_path: &str, _user: &User) -> Lookup {
        let Some(components) = Self::components(virtual_path) else {
            return Lookup::NotFound;
        };
        match components.as_slice() {
            [] => Lookup::Found(Node::virtual_dir("/PRE")),
            [section] => {
                if self.registry.live_in_section(section).is_empty() {
                    Lookup::NotFound
                } else {
                    Lookup::Found(Node::virtual_dir(format!("/PRE/{}", section.to_uppercase())))
                }
            }
            [section, release] => match self.registry.find(section, release) {
                // Point at the real release directory; CWD follows it.
                Some(entry) => Lookup::Found(Node::virtual_dir(entry.virtual_path)),
                None => Lookup::NotFound,
            },
            _ => Lookup::NotFound,
        }
    }

    async fn enumerate(&self, virtual_path: &str, _user: &User) -> Option<Vec<Node>> {
        let components = Self::components(virtual_path)?;
        match components.as_slice() {
            [] => {
                let mut sections: Vec<String> = self
                    .registry
                    .live()
                    .into_iter()
                    .map(|e| e.section.to_uppercase())
                    .collect();
                sections.sort();
                sections.dedup();
                Some(
                    sections
                        .into_iter()
                        .map(|s| Node::virtual_dir(format!("/PRE/{s}")))
                        .collect(),
                )
            }
            [section] => {
                let entries = self.registry.live_in_section(section);
                if entries.is_empty() {
                    return None;
                }
                Some(
                    entries
                        .into_iter()
                        .map(|e| {
                            Node::virtual_dir(format!(
                                "/PRE/{}/{}",
                                e.section.to_uppercase(),
                                e.release_name
                            ))
                        })
                        .collect(),
                )
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn entry(section: &str, release: &str, age: Duration) -> PreEntry {
        PreEntry {
            announced_at: SystemTime::now() - age,
            section: section.to_string(),
            release_name: release.to_string(),
            user: "alice".to_string(),
            virtual_path: format!("/{}/{}", section.to_lowercase(), release),
        }
    }

    #[test]
    fn expired_entries_disappear() {
        let registry = PreRegistry::new(Duration::from_secs(60));
        registry.announce(entry("MP3", "Fresh-Rel", Duration::from_secs(0)));
        registry.announce(entry("MP3", "Stale-Rel", Duration::from_secs(3600)));

        let live = registry.live();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].release_name, "Fresh-Rel");
        assert!(registry.find("mp3", "stale-rel").is_none());
    }

    #[test]
    fn reannounce_replaces() {
        let registry = PreRegistry::new(Duration::from_secs(3600));
        registry.announce(entry("MP3", "Rel", Duration::from_secs(10)));
        registry.announce(entry("MP3", "REL", Duration::from_secs(0)));
        assert_eq!(registry.live().len(), 1);
    }

    #[tokio::test]
    async fn tree_resolution_follows_the_release() {
        let registry = Arc::new(PreRegistry::new(Duration::from_secs(3600)));
        registry.announce(entry("MP3", "Artist-Album-2024-GRP", Duration::from_secs(0)));
        let provider = PreProvider::new(registry);
        let user = User::new("alice", "x", "staff");

        assert!(provider.can_handle("/PRE"));
        assert!(provider.can_handle("/pre/mp3"));
        assert!(!provider.can_handle("/mp3"));

        let root = provider.resolve("/PRE", &user).await.node().unwrap();
        assert_eq!(root.virtual_path, "/PRE");

        let leaf =
            provider.resolve("/PRE/MP3/Artist-Album-2024-GRP", &user).await.node().unwrap();
        assert_eq!(leaf.virtual_path, "/mp3/Artist-Album-2024-GRP");

        let sections = provider.enumerate("/PRE", &user).await.unwrap();
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].virtual_path, "/PRE/MP3");
    }
}
