//! Section shortcuts: a bare section name or alias anywhere resolves to
//! that section's root, so `CWD MP3` works from any directory.

use std::sync::Arc;

use async_trait::async_trait;

use crate::section::SectionResolver;
use crate::users::User;
use crate::vfs::{Lookup, Node, VfsProvider};

pub struct ShortcutProvider {
    sections: Arc<SectionResolver>,
}

impl ShortcutProvider {
    pub fn new(sections: Arc<SectionResolver>) -> Self {
        ShortcutProvider { sections }
    }

    /// Single path component, i.e. a direct child of `/`.
    fn single_component(virtual_path: &str) -> Option<&str> {
        let rest = virtual_path.strip_prefix('/')?;
        if rest.is_empty() || rest.contains('/') {
            None
        } else {
            Some(rest)
        }
    }
}

#[async_trait]
impl VfsProvider for ShortcutProvider {
    fn can_handle(&self, virtual_path: &str) -> bool {
        Self::single_component(virtual_path).is_some()
    }

    async fn resolve(&self, virtual_path: &str, _user: &User) -> Lookup {
        let Some(name) = Self::single_component(virtual_path) else {
            return Lookup::NotFound;
        };
        match self.sections.by_name(name) {
            // The shortcut is only useful when it redirects somewhere else.
            Some(section) if !section.virtual_root.eq_ignore_ascii_case(virtual_path) => {
                Lookup::Found(Node::virtual_dir(section.virtual_root.clone()))
            }
            _ => Lookup::NotFound,
        }
    }

    async fn enumerate(&self, _virtual_path: &str, _user: &User) -> Option<Vec<Node>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SectionConfig;
    use std::collections::BTreeMap;

    fn provider() -> ShortcutProvider {
        let mut map = BTreeMap::new();
        map.insert("MP3".to_string(), SectionConfig {
            virtual_root: "/archive/mp3".to_string(),
            aliases: vec!["music".to_string()],
            ..SectionConfig::default()
        });
        ShortcutProvider::new(Arc::new(SectionResolver::new(map.iter())))
    }

    #[tokio::test]
    async fn alias_resolves_to_section_root() {
        let provider = provider();
        let user = User::new("alice", "x", "staff");
        let node = provider.resolve("/music", &user).await.node().unwrap();
        assert_eq!(node.virtual_path, "/archive/mp3");
        let node = provider.resolve("/MP3", &user).await.node().unwrap();
        assert_eq!(node.virtual_path, "/archive/mp3");
    }

    #[tokio::test]
    async fn multi_component_paths_are_ignored() {
        let provider = provider();
        let user = User::new("alice", "x", "staff");
        assert!(!provider.can_handle("/music/sub"));
        assert_eq!(provider.resolve("/nothere", &user).await, Lookup::NotFound);
    }
}
