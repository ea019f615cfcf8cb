//! Listing renderers for `LIST`, `NLST`, `MLSD` and `MLST`.
//!
//! Long listings imitate `ls -l`; machine listings emit the RFC 3659 facts
//! `type`, `size`, `modify`, `perm` and `unique`. Every line is CRLF
//! terminated and rendered before the data connection opens, so the
//! transfer task only streams text.

use std::time::SystemTime;

use crate::fs_util;
use crate::vfs::{Node, NodeKind};

/// `ls -l` style listing, one node per line.
pub fn render_long(nodes: &[Node]) -> String {
    let mut out = String::new();
    for node in nodes {
        out.push_str(&long_line(node));
        out.push_str("\r\n");
    }
    out
}

fn long_line(node: &Node) -> String {
    let meta = node.physical_path.as_deref().and_then(|p| std::fs::metadata(p).ok());
    let (mode, links) = match &meta {
        Some(meta) => (fs_util::mode_string(meta), fs_util::link_count(meta)),
        None => {
            let mode = if node.is_dir() { "drwxr-xr-x" } else { "-rw-r--r--" };
            (mode.to_string(), 1)
        }
    };
    let size = node.size.unwrap_or(0);
    let date = fs_util::list_date(node.mtime.unwrap_or(SystemTime::UNIX_EPOCH));
    format!("{mode} {links:>3} ftp      ftp      {size:>12} {date} {}", node.name())
}

/// Bare names for `NLST`.
pub fn render_names(nodes: &[Node]) -> String {
    let mut out = String::new();
    for node in nodes {
        out.push_str(node.name());
        out.push_str("\r\n");
    }
    out
}

/// RFC 3659 machine listing, one fact line per node.
pub fn render_mlsd(nodes: &[Node]) -> String {
    let mut out = String::new();
    for node in nodes {
        out.push_str(&fact_line(node));
        out.push_str("\r\n");
    }
    out
}

/// Single fact line for `MLST` (no trailing CRLF).
pub fn mlst_line(node: &Node) -> String {
    fact_line(node)
}

fn fact_line(node: &Node) -> String {
    let mut facts = String::new();
    match node.kind {
        NodeKind::PhysicalDir | NodeKind::VirtualDir => {
            facts.push_str("type=dir;");
            facts.push_str("perm=flcdmpe;");
        }
        NodeKind::PhysicalFile => {
            facts.push_str("type=file;");
            if let Some(size) = node.size {
                facts.push_str(&format!("size={size};"));
            }
            facts.push_str("perm=adfrw;");
        }
    }
    if let Some(mtime) = node.mtime {
        facts.push_str(&format!("modify={};", fs_util::modify_stamp(mtime)));
    }
    facts.push_str(&format!("unique={:x};", fingerprint(&node.virtual_path)));
    format!("{facts} {}", node.name())
}

/// Stable per-path token for the `unique` fact.
fn fingerprint(virtual_path: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in virtual_path.to_ascii_lowercase().as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}
