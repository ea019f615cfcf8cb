//! Sections and longest-prefix section resolution.
//!
//! A section is a logical area of the virtual tree carrying its own
//! ratio/credit rules. Resolution picks the section whose virtual root is
//! the longest prefix of the normalized path; when nothing is configured a
//! synthetic `DEFAULT` section rooted at `/` is materialized so every path
//! always belongs to exactly one section.

use crate::config::SectionConfig;
use crate::vfs::path;

/// A resolved section with its rule values.
#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    pub name: String,
    pub virtual_root: String,
    pub allow_upload: bool,
    pub allow_download: bool,
    pub free_leech: bool,
    pub ratio_up: u32,
    pub ratio_down: u32,
    pub upload_multiplier: f64,
    pub download_multiplier: f64,
    pub nuke_multiplier: f64,
    pub aliases: Vec<String>,
}

impl Section {
    fn from_config(name: &str, config: &SectionConfig) -> Section {
        Section {
            name: name.to_string(),
            virtual_root: path::normalize("/", &config.virtual_root),
            allow_upload: config.allow_upload,
            allow_download: config.allow_download,
            free_leech: config.free_leech,
            ratio_up: config.ratio_up.max(1),
            ratio_down: config.ratio_down,
            upload_multiplier: config.upload_multiplier,
            download_multiplier: config.download_multiplier,
            nuke_multiplier: config.nuke_multiplier,
            aliases: config.aliases.clone(),
        }
    }

    /// The synthetic catch-all applied when no configured root matches.
    pub fn default_section() -> Section {
        Section {
            name: "DEFAULT".to_string(),
            virtual_root: "/".to_string(),
            allow_upload: true,
            allow_download: true,
            free_leech: false,
            ratio_up: 1,
            ratio_down: 1,
            upload_multiplier: 1.0,
            download_multiplier: 1.0,
            nuke_multiplier: 3.0,
            aliases: Vec::new(),
        }
    }

    pub fn matches_alias(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
            || self.aliases.iter().any(|a| a.eq_ignore_ascii_case(name))
    }
}

/// Longest-prefix resolver over the configured sections.
#[derive(Debug)]
pub struct SectionResolver {
    /// Sorted by descending root length so the first prefix hit wins.
    sections: Vec<Section>,
    fallback: Section,
}

impl SectionResolver {
    pub fn new<'a>(configured: impl Iterator<Item = (&'a String, &'a SectionConfig)>) -> Self {
        let mut sections: Vec<Section> =
            configured.map(|(name, config)| Section::from_config(name, config)).collect();
        sections.sort_by(|a, b| {
            b.virtual_root.len().cmp(&a.virtual_root.len()).then(a.name.cmp(&b.name))
        });
        SectionResolver { sections, fallback: Section::default_section() }
    }

    /// Section owning `virtual_path` (normalized), longest root wins.
    pub fn section_for(&self, virtual_path: &str) -> &Section {
        self.sections
            .iter()
            .find(|s| path::has_prefix(virtual_path, &s.virtual_root))
            .unwrap_or(&self.fallback)
    }

    /// Looks a section up by name or alias, case-insensitive.
    pub fn by_name(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.matches_alias(name))
    }

    /// All configured sections, longest root first.
    pub fn all(&self) -> &[Section] {
        &self.sections
    }

    /// Release a path belongs to: the first directory level under the
    /// owning section's root. `None` for paths at or directly under the
    /// root itself (top-level files do not race).
    pub fn release_for(&self, virtual_path: &str) -> Option<ReleaseRef> {
        let section = self.section_for(virtual_path);
        let rest = path::strip_prefix(virtual_path, &section.virtual_root)?;
        let mut components = rest.split('/').filter(|c| !c.is_empty());
        let release_name = components.next()?.to_string();
        // A release is a directory containing the path, not the path itself.
        components.next()?;
        Some(ReleaseRef {
            section_name: section.name.clone(),
            release_path: path::join(&section.virtual_root, &release_name),
            release_name,
        })
    }

    /// Like [`Self::release_for`], but for a path that IS the release
    /// directory (one level under the section root).
    pub fn release_dir(&self, virtual_path: &str) -> Option<ReleaseRef> {
        let section = self.section_for(virtual_path);
        let rest = path::strip_prefix(virtual_path, &section.virtual_root)?;
        let mut components = rest.split('/').filter(|c| !c.is_empty());
        let release_name = components.next()?.to_string();
        if components.next().is_some() {
            return None;
        }
        Some(ReleaseRef {
            section_name: section.name.clone(),
            release_path: virtual_path.to_string(),
            release_name,
        })
    }
}

/// A release directory located within its section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseRef {
    pub section_name: String,
    pub release_name: String,
    pub release_path: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn resolver() -> SectionResolver {
        let mut map = BTreeMap::new();
        map.insert("MP3".to_string(), SectionConfig {
            virtual_root: "/mp3".to_string(),
            aliases: vec!["music".to_string()],
            ..SectionConfig::default()
        });
        map.insert("MP3-INT".to_string(), SectionConfig {
            virtual_root: "/mp3/internal".to_string(),
            ..SectionConfig::default()
        });
        SectionResolver::new(map.iter())
    }

    #[test]
    fn longest_prefix_wins() {
        let resolver = resolver();
        assert_eq!(resolver.section_for("/mp3/album").name, "MP3");
        assert_eq!(resolver.section_for("/mp3/internal/album").name, "MP3-INT");
    }

    #[test]
    fn unmatched_paths_fall_back_to_default() {
        let resolver = resolver();
        assert_eq!(resolver.section_for("/iso/game").name, "DEFAULT");
        assert_eq!(resolver.section_for("/").name, "DEFAULT");
    }

    #[test]
    fn matching_is_case_insensitive() {
        let resolver = resolver();
        assert_eq!(resolver.section_for("/MP3/Album").name, "MP3");
    }

    #[test]
    fn release_identification() {
        let resolver = resolver();
        let rel = resolver.release_for("/mp3/Artist-Album-2024-GRP/01-track.mp3").unwrap();
        assert_eq!(rel.section_name, "MP3");
        assert_eq!(rel.release_name, "Artist-Album-2024-GRP");
        assert_eq!(rel.release_path, "/mp3/Artist-Album-2024-GRP");

        // A file directly under the section root has no release.
        assert!(resolver.release_for("/mp3/loose-file.mp3").is_none());

        let dir = resolver.release_dir("/mp3/Artist-Album-2024-GRP").unwrap();
        assert_eq!(dir.release_name, "Artist-Album-2024-GRP");
        assert!(resolver.release_dir("/mp3/Artist-Album-2024-GRP/CD1").is_none());
    }

    #[test]
    fn alias_lookup() {
        let resolver = resolver();
        assert_eq!(resolver.by_name("music").unwrap().name, "MP3");
        assert_eq!(resolver.by_name("mp3-int").unwrap().name, "MP3-INT");
        assert!(resolver.by_name("iso").is_none());
    }
}
