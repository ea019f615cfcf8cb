//! Direct filesystem verbs: `DELE`, `MKD`, `RMD`, `RNFR`/`RNTO`, `SIZE`,
//! `MDTM`.
//!
//! Mutating verbs require the upload capability and pass through the rule
//! pipeline; `MKD` at release depth also consults the dupe store so a known
//! release cannot be recreated while its entry is live.

use tracing::info;

use crate::dupe::DupeEntry;
use crate::error::{FtpError, FtpResult};
use crate::fs_util;
use crate::protocol::command::CommandLine;
use crate::rules::{Decision, TransferOp};
use crate::session::Session;
use crate::users::{User, UserFlags};
use crate::vfs::{Lookup, Node, NodeKind};

fn require_write(session: &Session) -> FtpResult<User> {
    let user = session.require_user()?;
    if !user.flag_set().contains(UserFlags::UPLOAD) && !user.flag_set().is_siteop() {
        return Err(FtpError::Permission(format!(
            "filesystem changes are not enabled for {}",
            user.name
        )));
    }
    Ok(user.clone())
}

fn check_upload_rules(session: &Session, user: &User, virtual_path: &str) -> FtpResult<()> {
    let snapshot = &session.snapshot;
    let group = snapshot.group_of(user);
    match snapshot.rules.evaluate(&snapshot.sections, &group, virtual_path, TransferOp::Upload) {
        Decision::Allow(_) => Ok(()),
        Decision::Deny(reason) => Err(FtpError::Permission(reason)),
    }
}

async fn resolve_existing(session: &Session, user: &User, virtual_path: &str) -> FtpResult<Node> {
    match session.snapshot.vfs.resolve(virtual_path, user).await {
        Lookup::Found(node) => Ok(node),
        Lookup::Denied => Err(FtpError::Permission(format!("{virtual_path}: access denied"))),
        Lookup::NotFound => Err(FtpError::NotFound(format!("{virtual_path}: no such path"))),
    }
}

pub async fn cmd_dele(session: &mut Session, command: &CommandLine) -> FtpResult<()> {
    if !command.has_arg() {
        return Err(FtpError::bad_arg("DELE needs a path"));
    }
    let user = require_write(session)?;
    let virtual_path = session.resolve_path(&command.arg);
    check_upload_rules(session, &user, &virtual_path)?;

    let node = resolve_existing(session, &user, &virtual_path).await?;
    if node.kind != NodeKind::PhysicalFile {
        return Err(FtpError::Permission(format!("{virtual_path} is not a file")));
    }
    let physical = node
        .physical_path
        .ok_or_else(|| FtpError::Permission(format!("{virtual_path} has no physical backing")))?;
    tokio::fs::remove_file(&physical).await?;
    session.send_line(250, format!("{virtual_path} deleted.")).await
}

pub async fn cmd_mkd(session: &mut Session, command: &CommandLine) -> FtpResult<()> {
    if !command.has_arg() {
        return Err(FtpError::bad_arg("MKD needs a path"));
    }
    let user = require_write(session)?;
    let virtual_path = session.resolve_path(&command.arg);
    check_upload_rules(session, &user, &virtual_path)?;
    let snapshot = session.snapshot.clone();

    // Known releases stay known: refuse recreating a live dupe.
    if let Some(release) = snapshot.sections.release_dir(&virtual_path) {
        if let Some(entry) = snapshot.dupes.find(&release.section_name, &release.release_name) {
            if entry.nuked {
                return Err(FtpError::Permission(format!(
                    "{} was nuked: {}",
                    release.release_name, entry.nuke_reason
                )));
            }
            return Err(FtpError::Permission(format!(
                "dupe: {} already uploaded by {}",
                release.release_name, entry.uploader
            )));
        }
    }

    let physical = match snapshot.vfs.physical_target(&virtual_path, &user) {
        Ok(physical) => physical,
        Err(Lookup::Denied) => {
            return Err(FtpError::Permission(format!("{virtual_path}: denied")))
        }
        Err(_) => return Err(FtpError::NotFound(format!("{virtual_path}: not creatable"))),
    };
    tokio::fs::create_dir(&physical).await?;

    // Register fresh release directories in the dupe store right away.
    if let Some(release) = snapshot.sections.release_dir(&virtual_path) {
        let mut entry =
            DupeEntry::new(&release.section_name, &release.release_name, &virtual_path);
        entry.uploader = user.name.clone();
        entry.uploader_group = user.primary_group.clone();
        snapshot.dupes.upsert(entry);
        info!("release {} registered by {}", release.release_name, user.name);
    }

    session.send_line(257, format!("\"{virtual_path}\" created.")).await
}

pub async fn cmd_rmd(session: &mut Session, command: &CommandLine) -> FtpResult<()> {
    if !command.has_arg() {
        return Err(FtpError::bad_arg("RMD needs a path"));
    }
    let user = require_write(session)?;
    let virtual_path = session.resolve_path(&command.arg);
    check_upload_rules(session, &user, &virtual_path)?;

    let node = resolve_existing(session, &user, &virtual_path).await?;
    if node.kind != NodeKind::PhysicalDir {
        return Err(FtpError::Permission(format!("{virtual_path} is not a directory")));
    }
    let physical = node
        .physical_path
        .ok_or_else(|| FtpError::Permission(format!("{virtual_path} has no physical backing")))?;
    tokio::fs::remove_dir(&physical).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::DirectoryNotEmpty {
            FtpError::Permission(format!("{virtual_path} is not empty"))
        } else {
            FtpError::Io(e)
        }
    })?;
    session.send_line(250, format!("{virtual_path} removed.")).await
}

pub async fn cmd_rnfr(session: &mut Session, command: &CommandLine) -> FtpResult<()> {
    if !command.has_arg() {
        return Err(FtpError::bad_arg("RNFR needs a path"));
    }
    let user = require_write(session)?;
    let virtual_path = session.resolve_path(&command.arg);
    resolve_existing(session, &user, &virtual_path).await?;
    session.rename_from = Some(virtual_path);
    session.send_line(350, "Ready for RNTO.").await
}

pub async fn cmd_rnto(session: &mut Session, command: &CommandLine) -> FtpResult<()> {
    if !command.has_arg() {
        return Err(FtpError::bad_arg("RNTO needs a path"));
    }
    let Some(from_virtual) = session.rename_from.take() else {
        return Err(FtpError::BadSequence("send RNFR first".to_string()));
    };
    let user = require_write(session)?;
    let to_virtual = session.resolve_path(&command.arg);
    check_upload_rules(session, &user, &to_virtual)?;
    let snapshot = session.snapshot.clone();

    let from_node = resolve_existing(session, &user, &from_virtual).await?;
    let from_physical = from_node
        .physical_path
        .ok_or_else(|| FtpError::Permission(format!("{from_virtual} has no physical backing")))?;
    let to_physical = match snapshot.vfs.physical_target(&to_virtual, &user) {
        Ok(physical) => physical,
        Err(Lookup::Denied) => return Err(FtpError::Permission(format!("{to_virtual}: denied"))),
        Err(_) => return Err(FtpError::NotFound(format!("{to_virtual}: not creatable"))),
    };
    if fs_util::exists_no_traverse(&to_physical) {
        return Err(FtpError::Permission(format!("{to_virtual} already exists")));
    }
    tokio::fs::rename(&from_physical, &to_physical).await?;

    // Moving a release carries its race, zipscript and dupe state along.
    if let (Some(from_rel), Some(to_rel)) = (
        snapshot.sections.release_dir(&from_virtual),
        snapshot.sections.release_dir(&to_virtual),
    ) {
        snapshot.races.rename(&from_rel.release_path, &to_rel.release_path);
        snapshot.zipscript.rename(&from_rel.section_name, &from_rel.release_path, &to_rel.release_path);
        if let Some(mut entry) =
            snapshot.dupes.find(&from_rel.section_name, &from_rel.release_name)
        {
            snapshot.dupes.remove(&from_rel.section_name, &from_rel.release_name);
            entry.release_name = to_rel.release_name.clone();
            entry.section = to_rel.section_name.clone();
            entry.virtual_path = to_virtual.clone();
            snapshot.dupes.upsert(entry);
        }
    }

    session.send_line(250, format!("{from_virtual} renamed to {to_virtual}.")).await
}

pub async fn cmd_size(session: &mut Session, command: &CommandLine) -> FtpResult<()> {
    if !command.has_arg() {
        return Err(FtpError::bad_arg("SIZE needs a path"));
    }
    let user = session.require_user()?.clone();
    let virtual_path = session.resolve_path(&command.arg);
    let node = resolve_existing(session, &user, &virtual_path).await?;
    if node.kind != NodeKind::PhysicalFile {
        return Err(FtpError::Permission(format!("{virtual_path} is not a file")));
    }
    session.send_line(213, node.size.unwrap_or(0).to_string()).await
}

pub async fn cmd_mdtm(session: &mut Session, command: &CommandLine) -> FtpResult<()> {
    if !command.has_arg() {
        return Err(FtpError::bad_arg("MDTM needs a path"));
    }
    let user = session.require_user()?.clone();
    let virtual_path = session.resolve_path(&command.arg);
    let node = resolve_existing(session, &user, &virtual_path).await?;
    let mtime = node
        .mtime
        .ok_or_else(|| FtpError::NotFound(format!("{virtual_path}: no modification time")))?;
    session.send_line(213, fs_util::modify_stamp(mtime)).await
}
