//! SITE zipscript verbs: SFV state, rescans and nuke listings.

use crate::error::{FtpError, FtpResult};
use crate::events::Event;
use crate::protocol::reply::Reply;
use crate::session::Session;
use crate::users::User;
use crate::vfs::{Lookup, NodeKind};
use crate::zipscript::{FileState, ReleaseState};

fn state_label(state: FileState) -> &'static str {
    match state {
        FileState::Pending => "pending",
        FileState::Ok => "ok",
        FileState::BadCrc => "BAD CRC",
        FileState::Missing => "MISSING",
        FileState::Extra => "extra",
        FileState::Nuked => "nuked",
    }
}

async fn release_target(
    session: &Session,
    user: &User,
    arg: &str,
) -> FtpResult<(String, String, std::path::PathBuf)> {
    let target = if arg.trim().is_empty() { session.cwd.clone() } else { arg.trim().to_string() };
    let virtual_path = session.resolve_path(&target);
    let snapshot = &session.snapshot;
    let release = snapshot
        .sections
        .release_dir(&virtual_path)
        .ok_or_else(|| FtpError::bad_arg(format!("{virtual_path} is not a release directory")))?;
    match snapshot.vfs.resolve(&virtual_path, user).await {
        Lookup::Found(node) if node.kind == NodeKind::PhysicalDir => {
            let physical = node.physical_path.ok_or_else(|| {
                FtpError::Permission(format!("{virtual_path} has no physical backing"))
            })?;
            Ok((release.section_name, release.release_path, physical))
        }
        Lookup::Found(_) => Err(FtpError::Permission(format!("{virtual_path} is not a directory"))),
        Lookup::Denied => Err(FtpError::Permission(format!("{virtual_path}: access denied"))),
        Lookup::NotFound => Err(FtpError::NotFound(format!("{virtual_path}: no such directory"))),
    }
}

fn render_state(state: &ReleaseState) -> Vec<String> {
    let (done, listed) = state.progress();
    let mut lines = vec![format!(
        "{}: sfv={} complete={} [{}/{}]{}",
        state.release_path,
        state.has_sfv,
        state.complete,
        done,
        listed,
        if state.nuked { " NUKED" } else { "" }
    )];
    for entry in state.files.values() {
        let crc = entry
            .actual_crc
            .map(|c| format!("{c:08X}"))
            .unwrap_or_else(|| "--------".to_string());
        lines.push(format!(" {:<40} {} {}", entry.name, crc, state_label(entry.state)));
    }
    lines
}

pub async fn site_sfv(session: &mut Session, arg: String) -> FtpResult<()> {
    let user = session.require_user()?.clone();
    let (_, release_path, _) = release_target(session, &user, &arg).await?;
    let state = session
        .snapshot
        .zipscript
        .try_get(&release_path)
        .ok_or_else(|| FtpError::NotFound(format!("no zipscript state for {release_path}")))?;
    let mut lines = render_state(&state);
    lines.push("End".to_string());
    session.send(Reply::multi(200, lines)).await
}

pub async fn site_rescan(session: &mut Session, arg: String) -> FtpResult<()> {
    if !session.snapshot.zipscript.is_enabled() {
        return Err(FtpError::Permission("zipscript is disabled".to_string()));
    }
    let user = session.require_user()?.clone();
    let (section, release_path, physical) = release_target(session, &user, &arg).await?;
    let snapshot = session.snapshot.clone();
    let state = snapshot.zipscript.on_rescan_dir(&section, &release_path, &physical)?;

    let (done, listed) = state.progress();
    snapshot.events.publish(Event::ZipscriptStatus {
        release_path: state.release_path.clone(),
        complete: state.complete,
        done,
        listed,
    });
    let mut lines = render_state(&state);
    lines.push("End".to_string());
    session.send(Reply::multi(200, lines)).await
}

pub async fn site_rescanstats(session: &mut Session, _arg: String) -> FtpResult<()> {
    let mut total = 0usize;
    let mut complete = 0usize;
    let mut nuked = 0usize;
    for (_, json) in session.snapshot.zipscript_db.iterate() {
        let Ok(state) = serde_json::from_str::<ReleaseState>(&json) else {
            continue;
        };
        total += 1;
        if state.complete {
            complete += 1;
        }
        if state.nuked {
            nuked += 1;
        }
    }
    session
        .send_line(
            200,
            format!(
                "{total} tracked release(s): {complete} complete, {} incomplete, {nuked} nuked.",
                total - complete
            ),
        )
        .await
}

/// Rescan plus a dupe-store refresh of the release's total size.
pub async fn site_rescandupe(session: &mut Session, arg: String) -> FtpResult<()> {
    let user = session.require_user()?.clone();
    let (section, release_path, physical) = release_target(session, &user, &arg).await?;
    let snapshot = session.snapshot.clone();
    snapshot.zipscript.on_rescan_dir(&section, &release_path, &physical)?;

    let release_name = crate::vfs::path::file_name(&release_path).unwrap_or_default().to_string();
    let mut bytes = 0u64;
    for dirent in std::fs::read_dir(&physical)? {
        let dirent = dirent?;
        if dirent.file_type()?.is_file() {
            bytes += dirent.metadata()?.len();
        }
    }
    let mut entry = snapshot
        .dupes
        .find(&section, &release_name)
        .unwrap_or_else(|| crate::dupe::DupeEntry::new(&section, &release_name, &release_path));
    entry.total_bytes = bytes;
    snapshot.dupes.upsert(entry);
    session.send_line(200, format!("{release_name} rescanned, {bytes} bytes on disk.")).await
}

pub async fn site_rescannukes(session: &mut Session, _arg: String) -> FtpResult<()> {
    let mut lines = vec!["Nuked releases:".to_string()];
    for (_, json) in session.snapshot.zipscript_db.iterate() {
        let Ok(state) = serde_json::from_str::<ReleaseState>(&json) else {
            continue;
        };
        if state.nuked {
            lines.push(format!(
                " {} x{} by {}: {}",
                state.release_path, state.nuke_multiplier, state.nuker, state.nuke_reason
            ));
        }
    }
    lines.push("End".to_string());
    session.send(Reply::multi(200, lines)).await
}
