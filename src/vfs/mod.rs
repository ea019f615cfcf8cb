//! Virtual file system: routes client-visible paths onto physical storage
//! and synthetic trees.
//!
//! Resolution walks an ordered provider list (shortcuts, the `/PRE` tree,
//! the `/GROUPS` tree, then physical mounts) and the first provider that
//! does not answer `NotFound` wins. `Denied` and `NotFound` stay distinct so
//! `STOR` can create files where resolution merely found nothing, while a
//! containment failure is always refused.

pub mod path;

mod groups;
mod physical;
mod pre;
mod shortcut;

pub use groups::GroupsProvider;
pub use physical::PhysicalProvider;
pub use pre::{PreEntry, PreProvider, PreRegistry};
pub use shortcut::ShortcutProvider;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;

use crate::users::User;

/// What a resolved node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    PhysicalFile,
    PhysicalDir,
    /// Synthetic directory with no physical backing.
    VirtualDir,
}

/// A resolved node in the virtual tree.
///
/// Synthetic providers may answer with a `virtual_path` that differs from
/// the query: a shortcut or PRE entry resolves to the node it points at,
/// and `CWD` follows the returned path.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub kind: NodeKind,
    pub virtual_path: String,
    pub physical_path: Option<PathBuf>,
    pub size: Option<u64>,
    pub mtime: Option<SystemTime>,
}

impl Node {
    pub fn virtual_dir(virtual_path: impl Into<String>) -> Node {
        Node {
            kind: NodeKind::VirtualDir,
            virtual_path: virtual_path.into(),
            physical_path: None,
            size: None,
            mtime: None,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::PhysicalDir | NodeKind::VirtualDir)
    }

    /// Display name within its parent.
    pub fn name(&self) -> &str {
        path::file_name(&self.virtual_path).unwrap_or("/")
    }
}

/// Resolution outcome. `Denied` means containment or policy refused the
/// path; `NotFound` means no provider knows it.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Found(Node),
    NotFound,
    Denied,
}

impl Lookup {
    pub fn node(self) -> Option<Node> {
        match self {
            Lookup::Found(node) => Some(node),
            _ => None,
        }
    }
}

/// One entry in the resolver's ordered provider chain.
#[async_trait]
pub trait VfsProvider: Send + Sync {
    /// Cheap test whether this provider covers the path at all.
    fn can_handle(&self, virtual_path: &str) -> bool;

    /// Resolves a normalized virtual path for `user`.
    async fn resolve(&self, virtual_path: &str, user: &User) -> Lookup;

    /// Lists the children of a normalized virtual directory.
    async fn enumerate(&self, virtual_path: &str, user: &User) -> Option<Vec<Node>>;
}

/// Ordered-provider resolver, one per runtime snapshot.
pub struct VfsResolver {
    providers: Vec<Arc<dyn VfsProvider>>,
    physical: Arc<PhysicalProvider>,
}

impl VfsResolver {
    /// Builds the standard chain: shortcut, PRE, groups, physical.
    pub fn new(
        shortcut: Arc<ShortcutProvider>,
        pre: Arc<PreProvider>,
        groups: Arc<GroupsProvider>,
        physical: Arc<PhysicalProvider>,
    ) -> Self {
        let providers: Vec<Arc<dyn VfsProvider>> = vec![
            shortcut,
            pre,
            groups,
            physical.clone(),
        ];
        VfsResolver { providers, physical }
    }

    /// First non-`NotFound` answer in provider order.
    pub async fn resolve(&self, virtual_path: &str, user: &User) -> Lookup {
        for provider in &self.providers {
            if !provider.can_handle(virtual_path) {
                continue;
            }
            match provider.resolve(virtual_path, user).await {
                Lookup::NotFound => continue,
                other => return other,
            }
        }
        Lookup::NotFound
    }

    /// Children of a virtual directory, in provider order.
    pub async fn enumerate(&self, virtual_path: &str, user: &User) -> Option<Vec<Node>> {
        for provider in &self.providers {
            if !provider.can_handle(virtual_path) {
                continue;
            }
            if let Some(nodes) = provider.enumerate(virtual_path, user).await {
                return Some(nodes);
            }
        }
        None
    }

    /// Physical location a new file or directory at `virtual_path` would
    /// occupy. `Denied` when containment fails, `NotFound` when the path is
    /// not under any physical mount (synthetic trees are not writable).
    pub fn physical_target(&self, virtual_path: &str, user: &User) -> Result<PathBuf, Lookup> {
        self.physical.physical_target(virtual_path, user)
    }
}
