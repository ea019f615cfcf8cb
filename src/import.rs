//! Background import of release metadata from a physical tree.
//!
//! `SITE IMPORT`/`SITE IMPORTDUPE` walk a directory on disk and register
//! every release-depth directory in the dupe store, so a site migrated from
//! another daemon keeps its dupe history. One job runs at a time; progress
//! is polled by `IMPORTSTATUS` and the job cancels cooperatively.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{info, warn};

use crate::dupe::{DupeEntry, DupeStore};
use crate::section::SectionResolver;
use crate::vfs::path;

/// Where the current (or last) job stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ImportPhase {
    Idle,
    Running,
    Done,
    Cancelled,
    Failed,
}

/// Progress snapshot for the status verbs.
#[derive(Debug, Clone, Serialize)]
pub struct ImportStatus {
    pub phase: ImportPhase,
    pub source: String,
    pub scanned_dirs: u64,
    pub imported_releases: u64,
}

/// Single-job import coordinator, carried across reloads.
pub struct ImportRegistry {
    phase: Mutex<ImportPhase>,
    source: Mutex<String>,
    scanned: AtomicU64,
    imported: AtomicU64,
    cancel: AtomicBool,
}

impl Default for ImportRegistry {
    fn default() -> Self {
        ImportRegistry {
            phase: Mutex::new(ImportPhase::Idle),
            source: Mutex::new(String::new()),
            scanned: AtomicU64::new(0),
            imported: AtomicU64::new(0),
            cancel: AtomicBool::new(false),
        }
    }
}

impl ImportRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn status(&self) -> ImportStatus {
        ImportStatus {
            phase: *self.phase.lock().expect("import phase lock"),
            source: self.source.lock().expect("import source lock").clone(),
            scanned_dirs: self.scanned.load(Ordering::Relaxed),
            imported_releases: self.imported.load(Ordering::Relaxed),
        }
    }

    pub fn cancel(&self) -> bool {
        let running = *self.phase.lock().expect("import phase lock") == ImportPhase::Running;
        if running {
            self.cancel.store(true, Ordering::SeqCst);
        }
        running
    }

    fn set_phase(&self, phase: ImportPhase) {
        *self.phase.lock().expect("import phase lock") = phase;
    }

    /// Starts a job walking `source` mounted at `virtual_root`; `false`
    /// when a job is already running.
    pub fn start(
        self: &Arc<Self>,
        source: PathBuf,
        virtual_root: String,
        sections: Arc<SectionResolver>,
        dupes: Arc<dyn DupeStore>,
        importer: String,
    ) -> bool {
        {
            let mut phase = self.phase.lock().expect("import phase lock");
            if *phase == ImportPhase::Running {
                return false;
            }
            *phase = ImportPhase::Running;
        }
        *self.source.lock().expect("import source lock") = source.display().to_string();
        self.scanned.store(0, Ordering::Relaxed);
        self.imported.store(0, Ordering::Relaxed);
        self.cancel.store(false, Ordering::SeqCst);

        let registry = self.clone();
        tokio::task::spawn_blocking(move || {
            match registry.walk(&source, &virtual_root, &sections, dupes.as_ref(), &importer) {
                Ok(()) if registry.cancel.load(Ordering::SeqCst) => {
                    info!("import of {:?} cancelled", source);
                    registry.set_phase(ImportPhase::Cancelled);
                }
                Ok(()) => {
                    info!(
                        "import of {:?} done, {} releases",
                        source,
                        registry.imported.load(Ordering::Relaxed)
                    );
                    registry.set_phase(ImportPhase::Done);
                }
                Err(e) => {
                    warn!("import of {:?} failed: {}", source, e);
                    registry.set_phase(ImportPhase::Failed);
                }
            }
        });
        true
    }

    fn walk(
        &self,
        source: &PathBuf,
        virtual_root: &str,
        sections: &SectionResolver,
        dupes: &dyn DupeStore,
        importer: &str,
    ) -> std::io::Result<()> {
        for dirent in std::fs::read_dir(source)? {
            if self.cancel.load(Ordering::SeqCst) {
                return Ok(());
            }
            let dirent = dirent?;
            if !dirent.file_type()?.is_dir() {
                continue;
            }
            self.scanned.fetch_add(1, Ordering::Relaxed);

            let name = dirent.file_name().to_string_lossy().to_string();
            let virtual_path = path::join(virtual_root, &name);
            let Some(release) = sections.release_dir(&virtual_path) else {
                // One level deeper: section roots contain the releases.
                self.walk(&dirent.path(), &virtual_path, sections, dupes, importer)?;
                continue;
            };
            if dupes.find(&release.section_name, &release.release_name).is_some() {
                continue;
            }
            let mut entry =
                DupeEntry::new(&release.section_name, &release.release_name, &virtual_path);
            entry.uploader = importer.to_string();
            entry.total_bytes = dir_size(&dirent.path());
            dupes.upsert(entry);
            self.imported.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}

fn dir_size(dir: &std::path::Path) -> u64 {
    let mut total = 0;
    if let Ok(read) = std::fs::read_dir(dir) {
        for dirent in read.flatten() {
            if let Ok(meta) = dirent.metadata() {
                if meta.is_file() {
                    total += meta.len();
                } else if meta.is_dir() {
                    total += dir_size(&dirent.path());
                }
            }
        }
    }
    total
}
