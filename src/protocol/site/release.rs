//! SITE release lifecycle: PRE announcements, dupe queries, nukes, wipes
//! and moves.

use std::time::{SystemTime, UNIX_EPOCH};

use tracing::info;

use crate::dupe::DupeEntry;
use crate::error::{FtpError, FtpResult};
use crate::events::Event;
use crate::protocol::reply::Reply;
use crate::rules::{Decision, TransferOp};
use crate::session::Session;
use crate::users::User;
use crate::vfs::{path, Lookup, Node, NodeKind, PreEntry};

fn words(arg: &str) -> Vec<&str> {
    arg.split_whitespace().collect()
}

async fn resolve_dir(session: &Session, user: &User, virtual_path: &str) -> FtpResult<Node> {
    match session.snapshot.vfs.resolve(virtual_path, user).await {
        Lookup::Found(node) if node.kind == NodeKind::PhysicalDir => Ok(node),
        Lookup::Found(_) => {
            Err(FtpError::Permission(format!("{virtual_path} is not a physical directory")))
        }
        Lookup::Denied => Err(FtpError::Permission(format!("{virtual_path}: access denied"))),
        Lookup::NotFound => Err(FtpError::NotFound(format!("{virtual_path}: no such directory"))),
    }
}

fn age(seconds: u64) -> String {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
    let age = now.saturating_sub(seconds);
    if age < 3600 {
        format!("{}m", age / 60)
    } else if age < 86_400 {
        format!("{}h", age / 3600)
    } else {
        format!("{}d", age / 86_400)
    }
}

pub async fn site_pre(session: &mut Session, arg: String) -> FtpResult<()> {
    let words = words(&arg);
    let [section_name, release_name] = words.as_slice() else {
        return Err(FtpError::bad_arg("usage: SITE PRE <section> <release>"));
    };
    let user = session.require_user()?.clone();
    let snapshot = session.snapshot.clone();
    let section = snapshot
        .sections
        .by_name(section_name)
        .ok_or_else(|| FtpError::NotFound(format!("no such section {section_name}")))?
        .clone();

    let release_path = path::join(&section.virtual_root, release_name);
    resolve_dir(session, &user, &release_path).await?;

    snapshot.pre.announce(PreEntry {
        announced_at: SystemTime::now(),
        section: section.name.clone(),
        release_name: release_name.to_string(),
        user: user.name.clone(),
        virtual_path: release_path.clone(),
    });
    snapshot.events.publish(Event::Pre {
        section: section.name.clone(),
        release: release_name.to_string(),
        user: user.name.clone(),
    });
    info!("PRE {} in {} by {}", release_name, section.name, user.name);
    session.send_line(200, format!("{release_name} pre'd in {}.", section.name)).await
}

pub async fn site_prelist(session: &mut Session, _arg: String) -> FtpResult<()> {
    let mut lines = vec!["Current pres:".to_string()];
    for entry in session.snapshot.pre.live() {
        let when = entry
            .announced_at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        lines.push(format!(
            " {:<10} {:<40} by {:<12} {} ago",
            entry.section,
            entry.release_name,
            entry.user,
            age(when)
        ));
    }
    lines.push("End".to_string());
    session.send(Reply::multi(200, lines)).await
}

pub async fn site_delpre(session: &mut Session, arg: String) -> FtpResult<()> {
    let words = words(&arg);
    let [section, release] = words.as_slice() else {
        return Err(FtpError::bad_arg("usage: SITE DELPRE <section> <release>"));
    };
    let user = session.require_user()?.name.clone();
    let snapshot = session.snapshot.clone();
    if !snapshot.pre.withdraw(section, release) {
        return Err(FtpError::NotFound(format!("no live pre for {section}/{release}")));
    }
    snapshot.events.publish(Event::Unpre {
        section: section.to_string(),
        release: release.to_string(),
        user,
    });
    session.send_line(200, format!("Pre {release} withdrawn.")).await
}

/// Shared search for DUPE/DUPEFULL. S5 semantics: `-section=X` filters,
/// `-ok` keeps only non-nuked entries, output sorted, capped at 50.
fn dupe_search(session: &Session, arg: &str) -> FtpResult<Vec<DupeEntry>> {
    let mut pattern = String::new();
    let mut section: Option<String> = None;
    let mut only_ok = false;
    for word in arg.split_whitespace() {
        if let Some(value) = word.strip_prefix("-section=") {
            section = Some(value.to_string());
        } else if word == "-ok" {
            only_ok = true;
        } else if pattern.is_empty() {
            pattern = word.to_string();
        }
    }
    if pattern.is_empty() {
        return Err(FtpError::bad_arg("usage: SITE DUPE <pattern> [-section=X] [-ok]"));
    }

    let mut hits =
        session.snapshot.dupes.search(&pattern, section.as_deref(), usize::MAX);
    if only_ok {
        hits.retain(|e| !e.nuked);
    }
    hits.sort_by(|a, b| {
        (a.section.to_ascii_lowercase(), a.release_name.to_ascii_lowercase())
            .cmp(&(b.section.to_ascii_lowercase(), b.release_name.to_ascii_lowercase()))
    });
    hits.truncate(50);
    Ok(hits)
}

pub async fn site_dupe(session: &mut Session, arg: String) -> FtpResult<()> {
    let hits = dupe_search(session, &arg)?;
    let mut lines = vec![format!("{} dupe(s):", hits.len())];
    for entry in hits {
        let marker = if entry.nuked { "NUKED " } else { "" };
        lines.push(format!(" {:<10} {}{}", entry.section, marker, entry.release_name));
    }
    lines.push("End".to_string());
    session.send(Reply::multi(200, lines)).await
}

pub async fn site_dupefull(session: &mut Session, arg: String) -> FtpResult<()> {
    let hits = dupe_search(session, &arg)?;
    let mut lines = vec![format!("{} dupe(s):", hits.len())];
    for entry in hits {
        lines.push(format!(
            " {:<10} {:<40} {:>12} bytes by {}/{} first {} nuked={}",
            entry.section,
            entry.release_name,
            entry.total_bytes,
            entry.uploader,
            entry.uploader_group,
            age(entry.first_seen),
            entry.nuked
        ));
    }
    lines.push("End".to_string());
    session.send(Reply::multi(200, lines)).await
}

pub async fn site_undupe(session: &mut Session, arg: String) -> FtpResult<()> {
    let pattern = arg.trim();
    if pattern.is_empty() {
        return Err(FtpError::bad_arg("usage: SITE UNDUPE <pattern>"));
    }
    let snapshot = session.snapshot.clone();
    let hits = snapshot.dupes.search(pattern, None, usize::MAX);
    let mut removed = 0;
    for entry in hits {
        if snapshot.dupes.remove(&entry.section, &entry.release_name) {
            removed += 1;
        }
    }
    session.send_line(200, format!("{removed} dupe entr(ies) removed.")).await
}

/// Callers with only a path derive the section through the resolver.
pub async fn site_undupedir(session: &mut Session, arg: String) -> FtpResult<()> {
    if arg.trim().is_empty() {
        return Err(FtpError::bad_arg("usage: SITE UNDUPEDIR <path>"));
    }
    let virtual_path = session.resolve_path(arg.trim());
    let snapshot = session.snapshot.clone();
    let release = snapshot
        .sections
        .release_dir(&virtual_path)
        .ok_or_else(|| FtpError::bad_arg(format!("{virtual_path} is not a release directory")))?;
    if snapshot.dupes.remove(&release.section_name, &release.release_name) {
        session.send_line(200, format!("Dupe entry for {} removed.", release.release_name)).await
    } else {
        Err(FtpError::NotFound(format!("no dupe entry for {}", release.release_name)))
    }
}

/// Suffix for a nuked directory, with a timestamp fallback when the plain
/// name is already taken.
fn nuked_name(physical: &std::path::Path, suffix: &str) -> (String, String) {
    let base = format!("{}{}", physical.display(), suffix);
    if !crate::fs_util::exists_no_traverse(std::path::Path::new(&base)) {
        return (base, suffix.to_string());
    }
    let ts = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
    let stamped = format!("{suffix}-{ts}");
    (format!("{}{}", physical.display(), stamped), stamped)
}

pub async fn site_nuke(session: &mut Session, arg: String) -> FtpResult<()> {
    let (raw_path, reason) = match arg.split_once(char::is_whitespace) {
        Some((path, reason)) => (path, reason.trim().to_string()),
        None => (arg.trim(), String::new()),
    };
    if raw_path.is_empty() || reason.is_empty() {
        return Err(FtpError::bad_arg("usage: SITE NUKE <path> <reason>"));
    }
    let user = session.require_user()?.clone();
    let virtual_path = session.resolve_path(raw_path);
    let snapshot = session.snapshot.clone();

    let release = snapshot
        .sections
        .release_dir(&virtual_path)
        .ok_or_else(|| FtpError::bad_arg(format!("{virtual_path} is not a release directory")))?;
    let section = snapshot.sections.section_for(&virtual_path).clone();
    let node = resolve_dir(session, &user, &virtual_path).await?;
    let physical = node
        .physical_path
        .ok_or_else(|| FtpError::Permission(format!("{virtual_path} has no physical backing")))?;

    // Rename first; a nuke that cannot touch the disk must not take credits.
    let suffix = &snapshot.config.compatibility.nuke_rename_suffix;
    let (new_physical, applied_suffix) = nuked_name(&physical, suffix);
    tokio::fs::rename(&physical, &new_physical).await?;
    let new_virtual = format!("{virtual_path}{applied_suffix}");

    let multiplier = section.nuke_multiplier;
    let upload_bonus = match snapshot.rules.evaluate(
        &snapshot.sections,
        &snapshot.group_of(&user),
        &virtual_path,
        TransferOp::Upload,
    ) {
        Decision::Allow(terms) => terms.effective_upload_bonus(),
        Decision::Deny(_) => 1.0,
    };

    let mut penalized = 0;
    if let Some(race) = snapshot.races.try_get(&release.release_path) {
        penalized = snapshot.credits.reverse_from_race(&race, upload_bonus, multiplier).len();
    }
    snapshot.races.rename(&release.release_path, &new_virtual);
    snapshot.zipscript.mark_nuked(
        &release.section_name,
        &release.release_path,
        &reason,
        multiplier,
        &user.name,
    );
    snapshot.zipscript.rename(&release.section_name, &release.release_path, &new_virtual);

    let mut entry = snapshot
        .dupes
        .find(&release.section_name, &release.release_name)
        .unwrap_or_else(|| {
            DupeEntry::new(&release.section_name, &release.release_name, &virtual_path)
        });
    entry.nuked = true;
    entry.nuke_reason = reason.clone();
    entry.nuke_multiplier = multiplier;
    entry.virtual_path = new_virtual.clone();
    snapshot.dupes.upsert(entry);

    snapshot.events.publish(Event::Nuke {
        section: release.section_name.clone(),
        release: release.release_name.clone(),
        reason: reason.clone(),
        multiplier,
        nuker: user.name.clone(),
    });
    info!("{} nuked {} ({}x): {}", user.name, release.release_name, multiplier, reason);
    session
        .send_line(
            200,
            format!(
                "{} nuked at x{multiplier}, {penalized} racer(s) penalized.",
                release.release_name
            ),
        )
        .await
}

pub async fn site_unnuke(session: &mut Session, arg: String) -> FtpResult<()> {
    if arg.trim().is_empty() {
        return Err(FtpError::bad_arg("usage: SITE UNNUKE <path>"));
    }
    let user = session.require_user()?.clone();
    let virtual_path = session.resolve_path(arg.trim());
    let snapshot = session.snapshot.clone();
    let suffix = snapshot.config.compatibility.nuke_rename_suffix.clone();

    // Accept both the original name and the renamed .NUKED directory.
    let (nuked_virtual, original_virtual) = match virtual_path.find(&suffix) {
        Some(idx) => (virtual_path.clone(), virtual_path[..idx].to_string()),
        None => (format!("{virtual_path}{suffix}"), virtual_path.clone()),
    };

    let release = snapshot
        .sections
        .release_dir(&original_virtual)
        .ok_or_else(|| FtpError::bad_arg(format!("{original_virtual} is not a release directory")))?;
    let node = resolve_dir(session, &user, &nuked_virtual).await?;
    let physical = node
        .physical_path
        .ok_or_else(|| FtpError::Permission(format!("{nuked_virtual} has no physical backing")))?;

    let entry = snapshot
        .dupes
        .find(&release.section_name, &release.release_name)
        .ok_or_else(|| FtpError::NotFound(format!("no dupe entry for {}", release.release_name)))?;
    if !entry.nuked {
        return Err(FtpError::Permission(format!("{} is not nuked", release.release_name)));
    }

    let original_physical = snapshot
        .vfs
        .physical_target(&original_virtual, &user)
        .map_err(|_| FtpError::Permission(format!("{original_virtual}: denied")))?;
    if crate::fs_util::exists_no_traverse(&original_physical) {
        return Err(FtpError::Permission(format!("{original_virtual} already exists")));
    }
    tokio::fs::rename(&physical, &original_physical).await?;

    // Give the reversed credits back with the same arithmetic.
    let upload_bonus = match snapshot.rules.evaluate(
        &snapshot.sections,
        &snapshot.group_of(&user),
        &original_virtual,
        TransferOp::Upload,
    ) {
        Decision::Allow(terms) => terms.effective_upload_bonus(),
        Decision::Deny(_) => 1.0,
    };
    if let Some(race) = snapshot.races.try_get(&nuked_virtual) {
        for (racer, bytes) in &race.user_bytes {
            let kb = bytes.div_ceil(1024) as f64;
            let refund = (kb * upload_bonus * entry.nuke_multiplier).ceil().max(0.0) as u64;
            let _ = snapshot.credits.earn(racer, refund);
        }
    }
    snapshot.races.rename(&nuked_virtual, &original_virtual);
    snapshot.zipscript.rename(&release.section_name, &nuked_virtual, &original_virtual);
    snapshot.zipscript.mark_unnuked(&release.section_name, &original_virtual);

    let mut entry = entry;
    entry.nuked = false;
    entry.nuke_reason.clear();
    entry.virtual_path = original_virtual.clone();
    snapshot.dupes.upsert(entry);

    snapshot.events.publish(Event::Unnuke {
        section: release.section_name.clone(),
        release: release.release_name.clone(),
        nuker: user.name.clone(),
    });
    session.send_line(200, format!("{} unnuked.", release.release_name)).await
}

pub async fn site_wipe(session: &mut Session, arg: String) -> FtpResult<()> {
    if arg.trim().is_empty() {
        return Err(FtpError::bad_arg("usage: SITE WIPE <path>"));
    }
    let user = session.require_user()?.clone();
    let virtual_path = session.resolve_path(arg.trim());
    let snapshot = session.snapshot.clone();

    let node = resolve_dir(session, &user, &virtual_path).await?;
    let physical = node
        .physical_path
        .ok_or_else(|| FtpError::Permission(format!("{virtual_path} has no physical backing")))?;
    tokio::fs::remove_dir_all(&physical).await?;

    if let Some(release) = snapshot.sections.release_dir(&virtual_path) {
        snapshot.races.remove(&release.release_path);
        snapshot.zipscript.forget(&release.section_name, &release.release_path);
        snapshot.dupes.remove(&release.section_name, &release.release_name);
    }
    info!("{} wiped {}", user.name, virtual_path);
    session.send_line(200, format!("{virtual_path} wiped.")).await
}

/// Removes store records without touching the disk.
pub async fn site_purge(session: &mut Session, arg: String) -> FtpResult<()> {
    let words = words(&arg);
    let [section, release] = words.as_slice() else {
        return Err(FtpError::bad_arg("usage: SITE PURGE <section> <release>"));
    };
    let snapshot = session.snapshot.clone();
    let release_path = snapshot
        .sections
        .by_name(section)
        .map(|s| path::join(&s.virtual_root, release))
        .unwrap_or_else(|| format!("/{section}/{release}"));
    let had_dupe = snapshot.dupes.remove(section, release);
    snapshot.races.remove(&release_path);
    snapshot.zipscript.forget(section, &release_path);
    if had_dupe {
        session.send_line(200, format!("{release} purged from the stores.")).await
    } else {
        Err(FtpError::NotFound(format!("no records for {section}/{release}")))
    }
}

pub async fn site_move(session: &mut Session, arg: String) -> FtpResult<()> {
    let words = words(&arg);
    let [source, dest_dir] = words.as_slice() else {
        return Err(FtpError::bad_arg("usage: SITE MOVE <path> <target-dir>"));
    };
    let user = session.require_user()?.clone();
    let from_virtual = session.resolve_path(source);
    let name = path::file_name(&from_virtual)
        .ok_or_else(|| FtpError::bad_arg("cannot move the root"))?
        .to_string();
    let to_virtual = path::join(&session.resolve_path(dest_dir), &name);
    let snapshot = session.snapshot.clone();

    let node = resolve_dir(session, &user, &from_virtual).await?;
    let from_physical = node
        .physical_path
        .ok_or_else(|| FtpError::Permission(format!("{from_virtual} has no physical backing")))?;
    let to_physical = snapshot
        .vfs
        .physical_target(&to_virtual, &user)
        .map_err(|_| FtpError::Permission(format!("{to_virtual}: denied")))?;
    if crate::fs_util::exists_no_traverse(&to_physical) {
        return Err(FtpError::Permission(format!("{to_virtual} already exists")));
    }
    tokio::fs::rename(&from_physical, &to_physical).await?;

    if let (Some(from_rel), Some(to_rel)) = (
        snapshot.sections.release_dir(&from_virtual),
        snapshot.sections.release_dir(&to_virtual),
    ) {
        snapshot.races.rename(&from_rel.release_path, &to_rel.release_path);
        snapshot.zipscript.rename(&from_rel.section_name, &from_rel.release_path, &to_rel.release_path);
        if let Some(mut entry) = snapshot.dupes.find(&from_rel.section_name, &from_rel.release_name)
        {
            snapshot.dupes.remove(&from_rel.section_name, &from_rel.release_name);
            entry.section = to_rel.section_name.clone();
            entry.release_name = to_rel.release_name.clone();
            entry.virtual_path = to_virtual.clone();
            snapshot.dupes.upsert(entry);
        }
    }
    session.send_line(250, format!("{from_virtual} moved to {to_virtual}.")).await
}

/// Like MKD but without the dupe check, for repairs.
pub async fn site_mkdir(session: &mut Session, arg: String) -> FtpResult<()> {
    if arg.trim().is_empty() {
        return Err(FtpError::bad_arg("usage: SITE MKDIR <path>"));
    }
    let user = session.require_user()?.clone();
    let virtual_path = session.resolve_path(arg.trim());
    let physical = session
        .snapshot
        .vfs
        .physical_target(&virtual_path, &user)
        .map_err(|_| FtpError::Permission(format!("{virtual_path}: denied")))?;
    tokio::fs::create_dir_all(&physical).await?;
    session.send_line(257, format!("\"{virtual_path}\" created.")).await
}

pub async fn site_chmod(session: &mut Session, arg: String) -> FtpResult<()> {
    let words = words(&arg);
    let [mode, raw_path] = words.as_slice() else {
        return Err(FtpError::bad_arg("usage: SITE CHMOD <octal> <path>"));
    };
    let mode = u32::from_str_radix(mode, 8)
        .map_err(|_| FtpError::bad_arg(format!("bad mode {mode:?}")))?;
    let user = session.require_user()?.clone();
    let virtual_path = session.resolve_path(raw_path);
    let snapshot = session.snapshot.clone();
    let node = match snapshot.vfs.resolve(&virtual_path, &user).await {
        Lookup::Found(node) => node,
        Lookup::Denied => return Err(FtpError::Permission(format!("{virtual_path}: denied"))),
        Lookup::NotFound => return Err(FtpError::NotFound(format!("{virtual_path}: no such path"))),
    };
    let physical = node
        .physical_path
        .ok_or_else(|| FtpError::Permission(format!("{virtual_path} has no physical backing")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&physical, std::fs::Permissions::from_mode(mode)).await?;
    }
    #[cfg(not(unix))]
    {
        let _ = (physical, mode);
        return Err(FtpError::Permission("CHMOD is unix-only".to_string()));
    }

    #[cfg(unix)]
    session.send_line(200, format!("Mode of {virtual_path} set to {mode:o}.")).await
}
