//! Synthetic `/GROUPS` tree: releases indexed by uploading group.
//!
//! `/GROUPS` lists every group that has released something; each group
//! directory lists that group's releases as recorded in the dupe store,
//! pointing at the real release directories.

use std::sync::Arc;

use async_trait::async_trait;

use crate::dupe::DupeStore;
use crate::users::User;
use crate::vfs::{path, Lookup, Node, VfsProvider};

pub struct GroupsProvider {
    dupes: Arc<dyn DupeStore>,
}

impl GroupsProvider {
    pub fn new(dupes: Arc<dyn DupeStore>) -> Self {
        GroupsProvider { dupes }
    }

    fn components(virtual_path: &str) -> Option<Vec<&str>> {
        let rest = path::strip_prefix(virtual_path, "/GROUPS")?;
        if rest.is_empty() {
            Some(Vec::new())
        } else {
            Some(rest.split('/').collect())
        }
    }

    fn group_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .dupes
            .all()
            .into_iter()
            .filter(|e| !e.uploader_group.is_empty())
            .map(|e| e.uploader_group.to_uppercase())
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

#[async_trait]
impl VfsProvider for GroupsProvider {
    fn can_handle(&self, virtual_path: &str) -> bool {
        Self::components(virtual_path).is_some()
    }

    async fn resolve(&self, virtual_path: &str, _user: &User) -> Lookup {
        let Some(components) = Self::components(virtual_path) else {
            return Lookup::NotFound;
        };
        match components.as_slice() {
            [] => Lookup::Found(Node::virtual_dir("/GROUPS")),
            [group] => {
                if self.group_names().iter().any(|g| g.eq_ignore_ascii_case(group)) {
                    Lookup::Found(Node::virtual_dir(format!("/GROUPS/{}", group.to_uppercase())))
                } else {
                    Lookup::NotFound
                }
            }
            [group, release] => {
                let hit = self.dupes.all().into_iter().find(|e| {
                    e.uploader_group.eq_ignore_ascii_case(group)
                        && e.release_name.eq_ignore_ascii_case(release)
                });
                match hit {
                    Some(entry) => Lookup::Found(Node::virtual_dir(entry.virtual_path)),
                    None => Lookup::NotFound,
                }
            }
            _ => Lookup::NotFound,
        }
    }

    async fn enumerate(&self, virtual_path: &str, _user: &User) -> Option<Vec<Node>> {
        let components = Self::components(virtual_path)?;
        match components.as_slice() {
            [] => Some(
                self.group_names()
                    .into_iter()
                    .map(|g| Node::virtual_dir(format!("/GROUPS/{g}")))
                    .collect(),
            ),
            [group] => {
                let mut releases: Vec<Node> = self
                    .dupes
                    .all()
                    .into_iter()
                    .filter(|e| e.uploader_group.eq_ignore_ascii_case(group))
                    .map(|e| {
                        Node::virtual_dir(format!(
                            "/GROUPS/{}/{}",
                            e.uploader_group.to_uppercase(),
                            e.release_name
                        ))
                    })
                    .collect();
                if releases.is_empty() {
                    return None;
                }
                releases.sort_by(|a, b| a.virtual_path.cmp(&b.virtual_path));
                Some(releases)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dupe::{DupeEntry, MemoryDupeStore};

    fn store() -> Arc<MemoryDupeStore> {
        let store = Arc::new(MemoryDupeStore::new());
        let mut entry = DupeEntry::new("MP3", "Artist-Album-2024-GRP", "/mp3/Artist-Album-2024-GRP");
        entry.uploader_group = "GRP".to_string();
        store.upsert(entry);
        store
    }

    #[tokio::test]
    async fn lists_groups_and_their_releases() {
        let provider = GroupsProvider::new(store());
        let user = User::new("alice", "x", "staff");

        let groups = provider.enumerate("/GROUPS", &user).await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].virtual_path, "/GROUPS/GRP");

        let releases = provider.enumerate("/GROUPS/grp", &user).await.unwrap();
        assert_eq!(releases.len(), 1);

        let leaf = provider
            .resolve("/GROUPS/GRP/Artist-Album-2024-GRP", &user)
            .await
            .node()
            .unwrap();
        assert_eq!(leaf.virtual_path, "/mp3/Artist-Album-2024-GRP");
    }

    #[tokio::test]
    async fn unknown_group_is_not_found() {
        let provider = GroupsProvider::new(store());
        let user = User::new("alice", "x", "staff");
        assert_eq!(provider.resolve("/GROUPS/NOPE", &user).await, Lookup::NotFound);
    }
}
