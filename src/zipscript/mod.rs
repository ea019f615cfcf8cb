//! Zipscript engine: SFV-driven release verification.
//!
//! Each release directory carries a small state machine. Uploading an SFV
//! seeds the expected file list; every subsequent upload is CRC-checked
//! against it. A release is complete when the SFV is present and every
//! listed file verified `Ok`. State is striped per release key and flushed
//! to the opaque [`ZipscriptDb`] contract on every change.

pub mod sfv;

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{FtpError, FtpResult};
use crate::store::ZipscriptDb;

/// Verification state of one file within a release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileState {
    /// Listed in the SFV, not yet uploaded or verified.
    Pending,
    /// CRC matched the SFV.
    Ok,
    /// Uploaded but the CRC differs.
    BadCrc,
    /// Listed in the SFV but absent on disk at rescan.
    Missing,
    /// On disk but not listed in the SFV.
    Extra,
    /// Carried over when the release was nuked while pending.
    Nuked,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub expected_crc: Option<u32>,
    pub actual_crc: Option<u32>,
    pub state: FileState,
}

/// Full verification state of one release directory.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReleaseState {
    pub release_path: String,
    pub section: String,
    pub has_sfv: bool,
    /// Keyed by lowercased file name; entries keep original case.
    pub files: BTreeMap<String, FileEntry>,
    pub complete: bool,
    pub nuked: bool,
    pub was_nuked: bool,
    pub nuke_reason: String,
    pub nuke_multiplier: f64,
    pub nuker: String,
}

impl ReleaseState {
    fn new(section: &str, release_path: &str) -> ReleaseState {
        ReleaseState {
            release_path: release_path.to_string(),
            section: section.to_string(),
            ..ReleaseState::default()
        }
    }

    /// Complete means: SFV present and every listed file verified.
    fn recompute_complete(&mut self) {
        self.complete = self.has_sfv
            && self
                .files
                .values()
                .filter(|f| f.expected_crc.is_some())
                .all(|f| f.state == FileState::Ok)
            && self.files.values().any(|f| f.expected_crc.is_some());
    }

    /// Listed files verified so far vs. total listed.
    pub fn progress(&self) -> (usize, usize) {
        let listed = self.files.values().filter(|f| f.expected_crc.is_some()).count();
        let done = self
            .files
            .values()
            .filter(|f| f.expected_crc.is_some() && f.state == FileState::Ok)
            .count();
        (done, listed)
    }
}

/// Context handed to the engine when an upload finishes.
pub struct UploadContext<'a> {
    pub section: &'a str,
    pub release_path: &'a str,
    pub file_name: &'a str,
    pub physical_path: &'a Path,
    /// CRC computed while the bytes streamed in, when available.
    pub crc: Option<u32>,
}

/// Streaming CRC-32 (IEEE) of a file on disk.
pub fn crc_of_file(path: &Path) -> std::io::Result<u32> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

fn is_sfv(file_name: &str) -> bool {
    Path::new(file_name)
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("sfv"))
        .unwrap_or(false)
}

/// The engine itself: striped in-memory projection over the db contract.
pub struct ZipscriptEngine {
    releases: DashMap<String, ReleaseState>,
    db: Arc<dyn ZipscriptDb>,
    enabled: bool,
}

fn db_key(section: &str, release_path: &str) -> String {
    format!("{}\n{}", section.to_ascii_lowercase(), release_path.to_ascii_lowercase())
}

impl ZipscriptEngine {
    pub fn new(db: Arc<dyn ZipscriptDb>, enabled: bool) -> Self {
        ZipscriptEngine { releases: DashMap::new(), db, enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn flush(&self, state: &ReleaseState) {
        match serde_json::to_string(state) {
            Ok(json) => self.db.put(&db_key(&state.section, &state.release_path), json),
            Err(e) => warn!("zipscript flush failed for {}: {}", state.release_path, e),
        }
    }

    fn load_or_new(&self, section: &str, release_path: &str) -> ReleaseState {
        if let Some(json) = self.db.get(&db_key(section, release_path)) {
            match serde_json::from_str(&json) {
                Ok(state) => return state,
                Err(e) => warn!("zipscript state for {} unreadable: {}", release_path, e),
            }
        }
        ReleaseState::new(section, release_path)
    }

    /// Current state of a release, if the engine has seen it.
    pub fn try_get(&self, release_path: &str) -> Option<ReleaseState> {
        if let Some(state) = self.releases.get(release_path) {
            return Some(state.clone());
        }
        // Fall back to persisted state from an earlier run.
        let found = self
            .db
            .iterate()
            .into_iter()
            .find(|(key, _)| {
                key.split('\n').nth(1).map(|p| p == release_path.to_ascii_lowercase()).unwrap_or(false)
            })
            .and_then(|(_, json)| serde_json::from_str::<ReleaseState>(&json).ok())?;
        self.releases.insert(release_path.to_string(), found.clone());
        Some(found)
    }

    /// Feeds one finished upload into the release state machine.
    pub fn on_upload_complete(&self, ctx: UploadContext<'_>) -> FtpResult<ReleaseState> {
        let mut state = self
            .releases
            .entry(ctx.release_path.to_string())
            .or_insert_with(|| self.load_or_new(ctx.section, ctx.release_path));

        if is_sfv(ctx.file_name) {
            let text = std::fs::read_to_string(ctx.physical_path)?;
            let entries = sfv::parse(&text);
            if entries.is_empty() {
                return Err(FtpError::Protocol(format!("{} lists no files", ctx.file_name)));
            }
            state.has_sfv = true;
            state.files.clear();
            for entry in entries {
                state.files.insert(entry.file_name.to_ascii_lowercase(), FileEntry {
                    name: entry.file_name,
                    expected_crc: Some(entry.crc),
                    actual_crc: None,
                    state: FileState::Pending,
                });
            }
            debug!("sfv seeded {} with {} entries", ctx.release_path, state.files.len());
        } else if state.has_sfv {
            let key = ctx.file_name.to_ascii_lowercase();
            let actual = match ctx.crc {
                Some(crc) => crc,
                None => crc_of_file(ctx.physical_path)?,
            };
            match state.files.get_mut(&key) {
                Some(entry) => {
                    entry.actual_crc = Some(actual);
                    entry.state = if entry.expected_crc == Some(actual) {
                        FileState::Ok
                    } else {
                        FileState::BadCrc
                    };
                }
                None => {
                    state.files.insert(key, FileEntry {
                        name: ctx.file_name.to_string(),
                        expected_crc: None,
                        actual_crc: Some(actual),
                        state: FileState::Extra,
                    });
                }
            }
        } else {
            // No SFV yet; remember the file so a later SFV can verify it.
            let key = ctx.file_name.to_ascii_lowercase();
            let actual = match ctx.crc {
                Some(crc) => crc,
                None => crc_of_file(ctx.physical_path)?,
            };
            state.files.entry(key).or_insert(FileEntry {
                name: ctx.file_name.to_string(),
                expected_crc: None,
                actual_crc: Some(actual),
                state: FileState::Extra,
            });
        }

        state.recompute_complete();
        let snapshot = state.clone();
        drop(state);
        self.flush(&snapshot);
        Ok(snapshot)
    }

    /// Re-walks a release directory on disk and recomputes every state.
    pub fn on_rescan_dir(
        &self,
        section: &str,
        release_path: &str,
        physical_dir: &Path,
    ) -> FtpResult<ReleaseState> {
        let mut state = self
            .releases
            .entry(release_path.to_string())
            .or_insert_with(|| self.load_or_new(section, release_path));

        let mut on_disk: BTreeMap<String, std::path::PathBuf> = BTreeMap::new();
        for dirent in std::fs::read_dir(physical_dir)? {
            let dirent = dirent?;
            if dirent.file_type()?.is_file() {
                let name = dirent.file_name().to_string_lossy().to_string();
                on_disk.insert(name.to_ascii_lowercase(), dirent.path());
            }
        }

        // Re-read the SFV if one is on disk.
        if let Some((_, sfv_path)) = on_disk.iter().find(|(name, _)| is_sfv(name)) {
            let text = std::fs::read_to_string(sfv_path)?;
            let entries = sfv::parse(&text);
            if !entries.is_empty() {
                state.has_sfv = true;
                let previous = std::mem::take(&mut state.files);
                for entry in entries {
                    let key = entry.file_name.to_ascii_lowercase();
                    let actual = previous.get(&key).and_then(|e| e.actual_crc);
                    state.files.insert(key, FileEntry {
                        name: entry.file_name,
                        expected_crc: Some(entry.crc),
                        actual_crc: actual,
                        state: FileState::Pending,
                    });
                }
            }
        }

        let listed: Vec<String> = state.files.keys().cloned().collect();
        for key in listed {
            let entry = state.files.get_mut(&key).expect("key just listed");
            if entry.expected_crc.is_none() {
                continue;
            }
            match on_disk.get(&key) {
                Some(path) => {
                    let actual = crc_of_file(path)?;
                    entry.actual_crc = Some(actual);
                    entry.state = if entry.expected_crc == Some(actual) {
                        FileState::Ok
                    } else {
                        FileState::BadCrc
                    };
                }
                None => {
                    entry.actual_crc = None;
                    entry.state = FileState::Missing;
                }
            }
        }

        for (key, path) in &on_disk {
            if is_sfv(key) || state.files.contains_key(key) {
                continue;
            }
            let actual = crc_of_file(path)?;
            state.files.insert(key.clone(), FileEntry {
                name: path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default(),
                expected_crc: None,
                actual_crc: Some(actual),
                state: FileState::Extra,
            });
        }

        state.recompute_complete();
        let snapshot = state.clone();
        drop(state);
        self.flush(&snapshot);
        Ok(snapshot)
    }

    /// Applies a nuke: pending entries become `Nuked`, metadata is recorded.
    pub fn mark_nuked(
        &self,
        section: &str,
        release_path: &str,
        reason: &str,
        multiplier: f64,
        nuker: &str,
    ) -> ReleaseState {
        let mut state = self
            .releases
            .entry(release_path.to_string())
            .or_insert_with(|| self.load_or_new(section, release_path));
        state.nuked = true;
        state.was_nuked = true;
        state.nuke_reason = reason.to_string();
        state.nuke_multiplier = multiplier;
        state.nuker = nuker.to_string();
        for entry in state.files.values_mut() {
            if entry.state == FileState::Pending {
                entry.state = FileState::Nuked;
            }
        }
        state.recompute_complete();
        let snapshot = state.clone();
        drop(state);
        self.flush(&snapshot);
        snapshot
    }

    /// Clears the nuked flag; `was_nuked` stays set.
    pub fn mark_unnuked(&self, section: &str, release_path: &str) -> ReleaseState {
        let mut state = self
            .releases
            .entry(release_path.to_string())
            .or_insert_with(|| self.load_or_new(section, release_path));
        state.nuked = false;
        state.nuke_reason.clear();
        for entry in state.files.values_mut() {
            if entry.state == FileState::Nuked {
                entry.state = FileState::Pending;
            }
        }
        state.recompute_complete();
        let snapshot = state.clone();
        drop(state);
        self.flush(&snapshot);
        snapshot
    }

    /// Drops a release from the projection and the db (WIPE/PURGE).
    pub fn forget(&self, section: &str, release_path: &str) {
        self.releases.remove(release_path);
        self.db.delete(&db_key(section, release_path));
    }

    /// Moves state when the release directory is renamed.
    pub fn rename(&self, section: &str, from: &str, to: &str) {
        if let Some((_, mut state)) = self.releases.remove(from) {
            self.db.delete(&db_key(section, from));
            state.release_path = to.to_string();
            self.flush(&state);
            self.releases.insert(to.to_string(), state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryZipscriptDb;
    use std::io::Write;

    fn engine() -> ZipscriptEngine {
        ZipscriptEngine::new(Arc::new(MemoryZipscriptDb::new()), true)
    }

    fn write_file(dir: &Path, name: &str, contents: &[u8]) -> std::path::PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents).unwrap();
        path
    }

    fn crc(contents: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(contents);
        hasher.finalize()
    }

    #[test]
    fn sfv_then_matching_files_complete_the_release() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine();

        let a = b"first track".as_slice();
        let b = b"second track".as_slice();
        let sfv_text = format!("a.mp3 {:08X}\nb.mp3 {:08X}\n", crc(a), crc(b));
        let sfv_path = write_file(tmp.path(), "rel.sfv", sfv_text.as_bytes());

        let state = engine
            .on_upload_complete(UploadContext {
                section: "MP3",
                release_path: "/mp3/rel",
                file_name: "rel.sfv",
                physical_path: &sfv_path,
                crc: None,
            })
            .unwrap();
        assert!(state.has_sfv);
        assert!(!state.complete);
        assert_eq!(state.progress(), (0, 2));

        let a_path = write_file(tmp.path(), "a.mp3", a);
        let state = engine
            .on_upload_complete(UploadContext {
                section: "MP3",
                release_path: "/mp3/rel",
                file_name: "a.mp3",
                physical_path: &a_path,
                crc: Some(crc(a)),
            })
            .unwrap();
        assert_eq!(state.files["a.mp3"].state, FileState::Ok);
        assert!(!state.complete);

        let b_path = write_file(tmp.path(), "b.mp3", b);
        let state = engine
            .on_upload_complete(UploadContext {
                section: "MP3",
                release_path: "/mp3/rel",
                file_name: "b.mp3",
                physical_path: &b_path,
                crc: None,
            })
            .unwrap();
        assert!(state.complete);
        assert_eq!(state.progress(), (2, 2));
    }

    #[test]
    fn wrong_crc_is_flagged() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine();
        let sfv_path = write_file(tmp.path(), "rel.sfv", b"a.mp3 00000001\n");
        engine
            .on_upload_complete(UploadContext {
                section: "MP3",
                release_path: "/mp3/rel",
                file_name: "rel.sfv",
                physical_path: &sfv_path,
                crc: None,
            })
            .unwrap();
        let a_path = write_file(tmp.path(), "a.mp3", b"not matching");
        let state = engine
            .on_upload_complete(UploadContext {
                section: "MP3",
                release_path: "/mp3/rel",
                file_name: "a.mp3",
                physical_path: &a_path,
                crc: None,
            })
            .unwrap();
        assert_eq!(state.files["a.mp3"].state, FileState::BadCrc);
        assert!(!state.complete);
    }

    #[test]
    fn unlisted_upload_is_extra() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine();
        let sfv_path = write_file(tmp.path(), "rel.sfv", b"a.mp3 00000001\n");
        engine
            .on_upload_complete(UploadContext {
                section: "MP3",
                release_path: "/mp3/rel",
                file_name: "rel.sfv",
                physical_path: &sfv_path,
                crc: None,
            })
            .unwrap();
        let x_path = write_file(tmp.path(), "x.nfo", b"info");
        let state = engine
            .on_upload_complete(UploadContext {
                section: "MP3",
                release_path: "/mp3/rel",
                file_name: "x.nfo",
                physical_path: &x_path,
                crc: None,
            })
            .unwrap();
        assert_eq!(state.files["x.nfo"].state, FileState::Extra);
    }

    #[test]
    fn rescan_marks_missing_and_verifies_disk_state() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine();
        let a = b"track a".as_slice();
        let sfv_text = format!("a.mp3 {:08X}\nb.mp3 00000001\n", crc(a));
        write_file(tmp.path(), "rel.sfv", sfv_text.as_bytes());
        write_file(tmp.path(), "a.mp3", a);
        write_file(tmp.path(), "extra.nfo", b"x");

        let state = engine.on_rescan_dir("MP3", "/mp3/rel", tmp.path()).unwrap();
        assert!(state.has_sfv);
        assert_eq!(state.files["a.mp3"].state, FileState::Ok);
        assert_eq!(state.files["b.mp3"].state, FileState::Missing);
        assert_eq!(state.files["extra.nfo"].state, FileState::Extra);
        assert!(!state.complete);
    }

    #[test]
    fn nuke_and_unnuke_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine();
        let sfv_path = write_file(tmp.path(), "rel.sfv", b"a.mp3 00000001\n");
        engine
            .on_upload_complete(UploadContext {
                section: "MP3",
                release_path: "/mp3/rel",
                file_name: "rel.sfv",
                physical_path: &sfv_path,
                crc: None,
            })
            .unwrap();

        let nuked = engine.mark_nuked("MP3", "/mp3/rel", "dupe", 3.0, "op");
        assert!(nuked.nuked);
        assert_eq!(nuked.files["a.mp3"].state, FileState::Nuked);
        assert_eq!(nuked.nuke_reason, "dupe");

        let unnuked = engine.mark_unnuked("MP3", "/mp3/rel");
        assert!(!unnuked.nuked);
        assert!(unnuked.was_nuked);
        assert_eq!(unnuked.files["a.mp3"].state, FileState::Pending);
    }

    #[test]
    fn state_survives_through_the_db_contract() {
        let tmp = tempfile::tempdir().unwrap();
        let db: Arc<dyn ZipscriptDb> = Arc::new(MemoryZipscriptDb::new());
        let sfv_path = write_file(tmp.path(), "rel.sfv", b"a.mp3 00000001\n");
        {
            let engine = ZipscriptEngine::new(db.clone(), true);
            engine
                .on_upload_complete(UploadContext {
                    section: "MP3",
                    release_path: "/mp3/rel",
                    file_name: "rel.sfv",
                    physical_path: &sfv_path,
                    crc: None,
                })
                .unwrap();
        }
        let engine = ZipscriptEngine::new(db, true);
        let state = engine.try_get("/mp3/rel").expect("persisted state");
        assert!(state.has_sfv);
        assert_eq!(state.progress(), (0, 1));
    }
}
