//! SITE import/export verbs: dupe migration between daemons and stores.
//!
//! The SQL provider verbs exist for parity with installations whose dupe
//! store is database-backed; with the bundled stores they report that no
//! provider is configured.

use crate::error::{FtpError, FtpResult};
use crate::import::ImportPhase;
use crate::protocol::reply::Reply;
use crate::session::Session;

pub async fn site_import(session: &mut Session, arg: String) -> FtpResult<()> {
    let words: Vec<&str> = arg.split_whitespace().collect();
    let [physical_dir, virtual_root] = words.as_slice() else {
        return Err(FtpError::bad_arg("usage: SITE IMPORT <physical-dir> <virtual-root>"));
    };
    let source = std::path::PathBuf::from(physical_dir);
    if !source.is_dir() {
        return Err(FtpError::NotFound(format!("{physical_dir} is not a directory")));
    }
    let importer = session.require_user()?.name.clone();
    let snapshot = session.snapshot.clone();
    let started = snapshot.imports.start(
        source,
        crate::vfs::path::normalize("/", virtual_root),
        snapshot.sections.clone(),
        snapshot.dupes.clone(),
        importer,
    );
    if started {
        session.send_line(200, "Import started, poll with SITE IMPORTSTATUS.").await
    } else {
        Err(FtpError::ResourceExhausted("an import is already running".to_string()))
    }
}

pub async fn site_importcancel(session: &mut Session, _arg: String) -> FtpResult<()> {
    if session.snapshot.imports.cancel() {
        session.send_line(200, "Import cancelling.").await
    } else {
        Err(FtpError::NotFound("no import is running".to_string()))
    }
}

fn phase_label(phase: ImportPhase) -> &'static str {
    match phase {
        ImportPhase::Idle => "idle",
        ImportPhase::Running => "running",
        ImportPhase::Done => "done",
        ImportPhase::Cancelled => "cancelled",
        ImportPhase::Failed => "failed",
    }
}

pub async fn site_importstatus(session: &mut Session, _arg: String) -> FtpResult<()> {
    let status = session.snapshot.imports.status();
    session
        .send_line(
            200,
            format!(
                "Import {}: {} dir(s) scanned, {} release(s) imported from {}",
                phase_label(status.phase),
                status.scanned_dirs,
                status.imported_releases,
                if status.source.is_empty() { "(none)" } else { &status.source }
            ),
        )
        .await
}

pub async fn site_importstatusjson(session: &mut Session, _arg: String) -> FtpResult<()> {
    let status = session.snapshot.imports.status();
    let json = serde_json::to_string(&status).map_err(|e| FtpError::Store(e.to_string()))?;
    session.send_line(200, json).await
}

/// Writes the whole dupe store as JSON into the data directory.
pub async fn site_dupeexport(session: &mut Session, _arg: String) -> FtpResult<()> {
    let snapshot = session.snapshot.clone();
    let entries = snapshot.dupes.all();
    let dir = std::path::PathBuf::from(&snapshot.config.storage.data_dir);
    std::fs::create_dir_all(&dir)?;
    let target = dir.join("dupes.export.json");
    let json = serde_json::to_string_pretty(&entries)
        .map_err(|e| FtpError::Store(e.to_string()))?;
    std::fs::write(&target, json)?;
    session
        .send_line(200, format!("{} entr(ies) exported to {}.", entries.len(), target.display()))
        .await
}

/// Prints matching dupe entries as JSON over the control channel.
pub async fn site_dupejson(session: &mut Session, arg: String) -> FtpResult<()> {
    let pattern = if arg.trim().is_empty() { "*" } else { arg.trim() };
    let hits = session.snapshot.dupes.search(pattern, None, 50);
    let json = serde_json::to_string(&hits).map_err(|e| FtpError::Store(e.to_string()))?;
    session.send_line(200, json).await
}

/// Moves every dupe entry from one section to another.
pub async fn site_dupemigrate(session: &mut Session, arg: String) -> FtpResult<()> {
    let words: Vec<&str> = arg.split_whitespace().collect();
    let [from, to] = words.as_slice() else {
        return Err(FtpError::bad_arg("usage: SITE DUPEMIGRATE <from-section> <to-section>"));
    };
    let snapshot = session.snapshot.clone();
    let mut moved = 0;
    for entry in snapshot.dupes.all() {
        if !entry.section.eq_ignore_ascii_case(from) {
            continue;
        }
        snapshot.dupes.remove(&entry.section, &entry.release_name);
        let mut entry = entry;
        entry.section = to.to_string();
        snapshot.dupes.upsert(entry);
        moved += 1;
    }
    session.send_line(200, format!("{moved} entr(ies) migrated from {from} to {to}.")).await
}

pub async fn site_sqlproviders(session: &mut Session, _arg: String) -> FtpResult<()> {
    session
        .send(Reply::multi(200, vec![
            "SQL providers:".to_string(),
            " (none configured; the bundled stores are in-memory)".to_string(),
            "End".to_string(),
        ]))
        .await
}

pub async fn site_sqltest(session: &mut Session, _arg: String) -> FtpResult<()> {
    session.send_line(500, "No SQL provider configured, nothing to test.").await
}
