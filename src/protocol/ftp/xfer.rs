//! Data transfers: `RETR`, `STOR`, `APPE`, `STOU`, `REST`, `ABOR`.
//!
//! A transfer opens the pending data endpoint, sends `150`, streams in a
//! spawned task and finishes with `226`. Completion side effects run in a
//! fixed order (race tracker, zipscript, credits, dupe store) and the
//! `TransferComplete` event is published before the `226` reply, so every
//! downstream consumer observes the transfer before the client sees
//! success.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::data::{
    self, protect_stream, DataStream, TransferOutcome, UploadDisposition,
};
use crate::dupe::DupeEntry;
use crate::error::{FtpError, FtpResult};
use crate::events::{Event, TransferComplete, TransferKind};
use crate::protocol::command::CommandLine;
use crate::rules::{Decision, TransferOp};
use crate::runtime::Snapshot;
use crate::session::Session;
use crate::users::{User, UserFlags};
use crate::vfs::{path, Lookup, NodeKind};
use crate::zipscript::UploadContext;

/// Opens, policies and protects the pending data connection.
pub(super) async fn open_data_stream(session: &mut Session) -> FtpResult<DataStream> {
    let endpoint = session.take_data_endpoint()?;
    let user = session.require_user()?;
    let fxp_ok = user.flag_set().contains(UserFlags::FXP);
    let stream = endpoint
        .open(session.client_addr.ip(), fxp_ok, &session.snapshot.config.fxp_policy)
        .await?;
    protect_stream(
        stream,
        session.protection.wraps_data(),
        session.snapshot.tls.as_ref(),
    )
    .await
}

/// Replies for a finished transfer: abort replies or the final `226`.
async fn reply_outcome(
    session: &mut Session,
    outcome: &TransferOutcome,
    success_text: String,
) -> FtpResult<()> {
    match outcome.abort_reason.as_deref() {
        Some("client abort") => {
            session.send_line(426, "Transfer aborted.").await?;
            session.send_line(226, "Abort successful.").await
        }
        Some(reason) => session.send_line(426, format!("Transfer aborted: {reason}.")).await,
        None => session.send_line(226, success_text).await,
    }
}

pub async fn cmd_rest(session: &mut Session, command: &CommandLine) -> FtpResult<()> {
    session.require_user()?;
    let offset: u64 = command
        .arg
        .parse()
        .map_err(|_| FtpError::bad_arg(format!("bad REST offset {:?}", command.arg)))?;
    session.rest_offset = offset;
    session.send_line(350, format!("Restarting at {offset}, send the transfer command.")).await
}

/// `ABOR` with no transfer running: nothing to cancel.
pub async fn cmd_abor(session: &mut Session) -> FtpResult<()> {
    session.require_user()?;
    session.send_line(226, "No transfer in progress.").await
}

pub async fn cmd_retr(session: &mut Session, command: &CommandLine) -> FtpResult<()> {
    if !command.has_arg() {
        return Err(FtpError::bad_arg("RETR needs a path"));
    }
    let user = session.require_user()?.clone();
    if !user.flag_set().contains(UserFlags::DOWNLOAD) {
        return Err(FtpError::Permission(format!("downloads are disabled for {}", user.name)));
    }

    let virtual_path = session.resolve_path(&command.arg);
    let snapshot = session.snapshot.clone();
    let node = match snapshot.vfs.resolve(&virtual_path, &user).await {
        Lookup::Found(node) if node.kind == NodeKind::PhysicalFile => node,
        Lookup::Found(_) => {
            return Err(FtpError::Permission(format!("{virtual_path} is not a file")))
        }
        Lookup::Denied => return Err(FtpError::Permission(format!("{virtual_path}: denied"))),
        Lookup::NotFound => return Err(FtpError::NotFound(format!("{virtual_path}: no such file"))),
    };

    let group = snapshot.group_of(&user);
    let terms = match snapshot.rules.evaluate(
        &snapshot.sections,
        &group,
        &virtual_path,
        TransferOp::Download,
    ) {
        Decision::Allow(terms) => terms,
        Decision::Deny(reason) => return Err(FtpError::Permission(reason)),
    };

    // Refuse before opening the data connection when the balance cannot
    // cover the whole file; the real debit uses the bytes actually sent.
    let rest_offset = session.take_rest_offset();
    let expected = node.size.unwrap_or(0).saturating_sub(rest_offset);
    let estimated = terms.cost_kb(expected);
    if estimated > 0 && !user.flag_set().contains(UserFlags::NO_RATIO) {
        let balance = snapshot.users.find(&user.name).map(|u| u.credits_kb).unwrap_or(0);
        if balance < estimated {
            return Err(FtpError::QuotaExhausted { need_kb: estimated, have_kb: balance });
        }
    }

    let source = node
        .physical_path
        .clone()
        .ok_or_else(|| FtpError::Permission(format!("{virtual_path} has no physical backing")))?;

    let stream = open_data_stream(session).await?;
    session
        .send_line(150, format!("Opening data connection for {} ({} bytes).", node.name(), expected))
        .await?;

    session.abort.reset();
    let abort = session.abort.clone();
    let rate = user.limits.max_download_kbps;
    let task = tokio::spawn(async move {
        data::run_download(stream, &source, rest_offset, rate, &abort).await
    });
    let outcome = session.wait_transfer(task).await?;

    let cost = terms.cost_kb(outcome.bytes);
    if !outcome.aborted() && cost > 0 {
        snapshot.credits.charge(&user.name, cost)?;
    }

    let section = snapshot.sections.section_for(&virtual_path).name.clone();
    snapshot.events.publish(Event::TransferComplete(TransferComplete {
        kind: TransferKind::Download,
        user: user.name.clone(),
        section,
        virtual_path: virtual_path.clone(),
        bytes: outcome.bytes,
        duration: outcome.duration,
        aborted: outcome.aborted(),
    }));

    let text = format!("Transfer complete ({} bytes, {} KiB debited).", outcome.bytes, cost);
    reply_outcome(session, &outcome, text).await
}

/// Shared upload path for `STOR`, `APPE` and `STOU`.
async fn run_store(
    session: &mut Session,
    virtual_path: String,
    disposition: UploadDisposition,
    delete_partial_on_abort: bool,
) -> FtpResult<()> {
    let user = session.require_user()?.clone();
    if !user.flag_set().contains(UserFlags::UPLOAD) {
        return Err(FtpError::Permission(format!("uploads are disabled for {}", user.name)));
    }

    let snapshot = session.snapshot.clone();
    let group = snapshot.group_of(&user);
    if let Decision::Deny(reason) =
        snapshot.rules.evaluate(&snapshot.sections, &group, &virtual_path, TransferOp::Upload)
    {
        return Err(FtpError::Permission(reason));
    }

    let zipscript_config = &snapshot.config.zipscript;
    if zipscript_config.enabled && zipscript_config.require_sfv_first {
        if let Some(release) = snapshot.sections.release_for(&virtual_path) {
            let is_sfv = virtual_path.to_ascii_lowercase().ends_with(".sfv");
            let has_sfv = snapshot
                .zipscript
                .try_get(&release.release_path)
                .map(|s| s.has_sfv)
                .unwrap_or(false);
            if !is_sfv && !has_sfv {
                return Err(FtpError::Permission(format!(
                    "upload the SFV for {} first",
                    release.release_name
                )));
            }
        }
    }

    // Synthetic trees are not writable; only physical targets store.
    let target = match snapshot.vfs.physical_target(&virtual_path, &user) {
        Ok(target) => target,
        Err(Lookup::Denied) => {
            return Err(FtpError::Permission(format!("{virtual_path}: denied")))
        }
        Err(_) => return Err(FtpError::NotFound(format!("{virtual_path}: not storable"))),
    };
    if let Some(parent) = target.parent() {
        if !parent.is_dir() {
            return Err(FtpError::NotFound(format!(
                "{}: parent directory missing",
                virtual_path
            )));
        }
    }

    let stream = open_data_stream(session).await?;
    session
        .send_line(
            150,
            format!("Opening data connection for {}.", path::file_name(&virtual_path).unwrap_or("file")),
        )
        .await?;

    session.abort.reset();
    let abort = session.abort.clone();
    let rate = user.limits.max_upload_kbps;
    let task_target = target.clone();
    let task = tokio::spawn(async move {
        data::run_upload(stream, &task_target, disposition, rate, &abort).await
    });
    let outcome = session.wait_transfer(task).await?;

    if outcome.aborted() {
        if delete_partial_on_abort {
            if let Err(e) = std::fs::remove_file(&target) {
                warn!("cannot remove partial {:?}: {}", target, e);
            }
        }
        let section = snapshot.sections.section_for(&virtual_path).name.clone();
        snapshot.events.publish(Event::TransferComplete(TransferComplete {
            kind: TransferKind::Upload,
            user: user.name.clone(),
            section,
            virtual_path: virtual_path.clone(),
            bytes: outcome.bytes,
            duration: outcome.duration,
            aborted: true,
        }));
        return reply_outcome(session, &outcome, String::new()).await;
    }

    let earned = apply_upload_side_effects(&snapshot, &user, &virtual_path, &target, &outcome)?;

    let text = format!("Transfer complete ({} bytes, {} KiB credited).", outcome.bytes, earned);
    reply_outcome(session, &outcome, text).await
}

/// Post-upload pipeline: race tracker, zipscript, credits, dupe store,
/// then the bus events. Returns the KiB credited.
pub fn apply_upload_side_effects(
    snapshot: &Arc<Snapshot>,
    user: &User,
    virtual_path: &str,
    physical_path: &Path,
    outcome: &TransferOutcome,
) -> FtpResult<u64> {
    let group = snapshot.group_of(user);
    let terms = match snapshot.rules.evaluate(
        &snapshot.sections,
        &group,
        virtual_path,
        TransferOp::Upload,
    ) {
        Decision::Allow(terms) => terms,
        Decision::Deny(_) => return Ok(0),
    };

    let release = snapshot.sections.release_for(virtual_path);
    let file_name = path::file_name(virtual_path).unwrap_or_default().to_string();

    if let Some(release) = &release {
        snapshot.races.on_bytes(
            &release.release_path,
            &release.section_name,
            &user.name,
            outcome.bytes,
        );
    }

    let mut zipscript_status = None;
    if snapshot.zipscript.is_enabled() {
        if let Some(release) = &release {
            match snapshot.zipscript.on_upload_complete(UploadContext {
                section: &release.section_name,
                release_path: &release.release_path,
                file_name: &file_name,
                physical_path,
                crc: outcome.crc,
            }) {
                Ok(state) => zipscript_status = Some(state),
                Err(e) => debug!("zipscript skipped {}: {}", virtual_path, e),
            }
        }
    }

    let earned = terms.earned_kb(outcome.bytes);
    if earned > 0 {
        snapshot.credits.earn(&user.name, earned)?;
    }

    if let Some(release) = &release {
        let mut entry = snapshot
            .dupes
            .find(&release.section_name, &release.release_name)
            .unwrap_or_else(|| {
                let mut entry = DupeEntry::new(
                    &release.section_name,
                    &release.release_name,
                    &release.release_path,
                );
                entry.uploader = user.name.clone();
                entry.uploader_group = user.primary_group.clone();
                entry
            });
        entry.total_bytes += outcome.bytes;
        snapshot.dupes.upsert(entry);
    }

    if let Some(state) = zipscript_status {
        let (done, listed) = state.progress();
        snapshot.events.publish(Event::ZipscriptStatus {
            release_path: state.release_path.clone(),
            complete: state.complete,
            done,
            listed,
        });
    }
    let section = snapshot.sections.section_for(virtual_path).name.clone();
    snapshot.events.publish(Event::TransferComplete(TransferComplete {
        kind: TransferKind::Upload,
        user: user.name.clone(),
        section,
        virtual_path: virtual_path.to_string(),
        bytes: outcome.bytes,
        duration: outcome.duration,
        aborted: false,
    }));

    Ok(earned)
}

pub async fn cmd_stor(session: &mut Session, command: &CommandLine) -> FtpResult<()> {
    if !command.has_arg() {
        return Err(FtpError::bad_arg("STOR needs a path"));
    }
    let virtual_path = session.resolve_path(&command.arg);
    let rest = session.take_rest_offset();
    let disposition =
        if rest > 0 { UploadDisposition::Offset(rest) } else { UploadDisposition::Truncate };
    run_store(session, virtual_path, disposition, false).await
}

pub async fn cmd_appe(session: &mut Session, command: &CommandLine) -> FtpResult<()> {
    if !command.has_arg() {
        return Err(FtpError::bad_arg("APPE needs a path"));
    }
    let virtual_path = session.resolve_path(&command.arg);
    session.take_rest_offset();
    run_store(session, virtual_path, UploadDisposition::Append, false).await
}

pub async fn cmd_stou(session: &mut Session, command: &CommandLine) -> FtpResult<()> {
    let user = session.require_user()?.clone();
    let base = if command.has_arg() { command.arg.clone() } else { "stou".to_string() };
    let dir = session.cwd.clone();
    let snapshot = session.snapshot.clone();

    let base_virtual = crate::vfs::path::normalize(&dir, &base);
    let unique_virtual = unique_name(&snapshot, &user, &base_virtual)?;
    let name = path::file_name(&unique_virtual).unwrap_or("stou").to_string();

    // The partial file of a failed STOU is removed (unlike STOR).
    run_store(session, unique_virtual, UploadDisposition::Truncate, true).await?;
    debug!("STOU stored {}", name);
    Ok(())
}

/// Appends `.1`, `.2`, … until the physical target does not exist.
fn unique_name(
    snapshot: &Arc<Snapshot>,
    user: &User,
    base_virtual: &str,
) -> FtpResult<String> {
    let exists = |vp: &str| -> FtpResult<(bool, PathBuf)> {
        match snapshot.vfs.physical_target(vp, user) {
            Ok(physical) => Ok((crate::fs_util::exists_no_traverse(&physical), physical)),
            Err(Lookup::Denied) => Err(FtpError::Permission(format!("{vp}: denied"))),
            Err(_) => Err(FtpError::NotFound(format!("{vp}: not storable"))),
        }
    };

    let (taken, _) = exists(base_virtual)?;
    if !taken {
        return Ok(base_virtual.to_string());
    }
    for counter in 1..10_000u32 {
        let candidate = format!("{base_virtual}.{counter}");
        let (taken, _) = exists(&candidate)?;
        if !taken {
            return Ok(candidate);
        }
    }
    Err(FtpError::ResourceExhausted("no unique name available".to_string()))
}
