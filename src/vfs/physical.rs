//! Physical provider: maps virtual paths onto mounted directories.
//!
//! Mount selection: user-specific mounts first, then global mounts, longest
//! virtual prefix wins; anything unmatched falls back to the shared site
//! root. Every resolution re-applies the containment check so a crafted
//! path can never leave its mount.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;
use tracing::warn;

use crate::config::{MountConfig, VfsConfig};
use crate::users::User;
use crate::vfs::{path, Lookup, Node, NodeKind, VfsProvider};

#[derive(Debug, Clone)]
struct Mount {
    virtual_prefix: String,
    physical_root: PathBuf,
    /// Lowercased user names; empty means the mount is global.
    users: Vec<String>,
}

impl Mount {
    fn from_config(config: &MountConfig) -> Mount {
        Mount {
            virtual_prefix: path::normalize("/", &config.virtual_path),
            physical_root: PathBuf::from(&config.physical_path),
            users: config.users.iter().map(|u| u.to_ascii_lowercase()).collect(),
        }
    }

    fn applies_to(&self, user: &User) -> bool {
        self.users.is_empty() || self.users.contains(&user.name.to_ascii_lowercase())
    }
}

pub struct PhysicalProvider {
    /// Sorted by descending prefix length.
    mounts: Vec<Mount>,
    site_root: PathBuf,
}

impl PhysicalProvider {
    pub fn new(config: &VfsConfig) -> Self {
        let mut mounts: Vec<Mount> = config.mounts.iter().map(Mount::from_config).collect();
        // User-specific before global at equal length, longer prefix first.
        mounts.sort_by(|a, b| {
            b.virtual_prefix
                .len()
                .cmp(&a.virtual_prefix.len())
                .then_with(|| a.users.is_empty().cmp(&b.users.is_empty()))
        });
        PhysicalProvider { mounts, site_root: PathBuf::from(&config.home_root) }
    }

    /// Picks the mount for a path and maps the remainder, applying
    /// containment. `Err(Lookup::Denied)` when the mapping escapes.
    pub fn physical_target(&self, virtual_path: &str, user: &User) -> Result<PathBuf, Lookup> {
        let (root, suffix) = self.select_mount(virtual_path, user);
        match path::map_to_physical(&root, suffix) {
            Some(physical) => Ok(physical),
            None => {
                warn!("containment refused {:?} under {:?}", virtual_path, root);
                Err(Lookup::Denied)
            }
        }
    }

    fn select_mount<'a>(&self, virtual_path: &'a str, user: &User) -> (PathBuf, &'a str) {
        for specific in [true, false] {
            for mount in &self.mounts {
                if mount.users.is_empty() == specific || !mount.applies_to(user) {
                    continue;
                }
                if let Some(suffix) = path::strip_prefix(virtual_path, &mount.virtual_prefix) {
                    return (mount.physical_root.clone(), suffix);
                }
            }
        }
        (self.site_root.clone(), virtual_path.trim_start_matches('/'))
    }

    async fn node_for(&self, virtual_path: &str, physical: PathBuf) -> Lookup {
        match fs::metadata(&physical).await {
            Ok(meta) => {
                let kind =
                    if meta.is_dir() { NodeKind::PhysicalDir } else { NodeKind::PhysicalFile };
                Lookup::Found(Node {
                    kind,
                    virtual_path: virtual_path.to_string(),
                    physical_path: Some(physical),
                    size: Some(meta.len()),
                    mtime: meta.modified().ok(),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Lookup::NotFound,
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => Lookup::Denied,
            Err(_) => Lookup::NotFound,
        }
    }
}

#[async_trait]
impl VfsProvider for PhysicalProvider {
    fn can_handle(&self, _virtual_path: &str) -> bool {
        true
    }

    async fn resolve(&self, virtual_path: &str, user: &User) -> Lookup {
        match self.physical_target(virtual_path, user) {
            Ok(physical) => self.node_for(virtual_path, physical).await,
            Err(denied) => denied,
        }
    }

    async fn enumerate(&self, virtual_path: &str, user: &User) -> Option<Vec<Node>> {
        let physical = self.physical_target(virtual_path, user).ok()?;
        let mut read_dir = fs::read_dir(&physical).await.ok()?;
        let mut nodes = Vec::new();
        while let Ok(Some(dirent)) = read_dir.next_entry().await {
            let name = dirent.file_name().to_string_lossy().to_string();
            let child_virtual = path::join(virtual_path, &name);
            if let Ok(meta) = dirent.metadata().await {
                let kind =
                    if meta.is_dir() { NodeKind::PhysicalDir } else { NodeKind::PhysicalFile };
                nodes.push(Node {
                    kind,
                    virtual_path: child_virtual,
                    physical_path: Some(dirent.path()),
                    size: Some(meta.len()),
                    mtime: meta.modified().ok(),
                });
            }
        }
        nodes.sort_by(|a, b| a.virtual_path.cmp(&b.virtual_path));
        Some(nodes)
    }
}
