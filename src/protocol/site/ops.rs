//! SITE operator verbs: sessions, block list, rehash, stores, uptime.

use std::time::SystemTime;

use uuid::Uuid;

use crate::error::{FtpError, FtpResult};
use crate::events::Event;
use crate::protocol::reply::Reply;
use crate::session::Session;

pub async fn site_kick(session: &mut Session, arg: String) -> FtpResult<()> {
    let name = arg.trim();
    if name.is_empty() {
        return Err(FtpError::bad_arg("usage: SITE KICK <user>"));
    }
    let kicked_by = session.require_user()?.name.clone();
    let snapshot = session.snapshot.clone();
    let hit = snapshot.events.kick_user(name);
    if hit == 0 {
        return Err(FtpError::NotFound(format!("{name} is not online")));
    }
    snapshot.events.publish(Event::Kick { user: name.to_string(), kicked_by });
    session.send_line(200, format!("{hit} session(s) of {name} kicked.")).await
}

pub async fn site_kill(session: &mut Session, arg: String) -> FtpResult<()> {
    let id: Uuid = arg
        .trim()
        .parse()
        .map_err(|_| FtpError::bad_arg(format!("bad session id {:?}", arg.trim())))?;
    if session.snapshot.events.kill_session(id) {
        session.send_line(200, format!("Session {id} killed.")).await
    } else {
        Err(FtpError::NotFound(format!("no session {id}")))
    }
}

pub async fn site_block(session: &mut Session, arg: String) -> FtpResult<()> {
    let bucket = arg.trim();
    if bucket.is_empty() {
        return Err(FtpError::bad_arg("usage: SITE BLOCK <ip-bucket>"));
    }
    if session.snapshot.events.block(bucket) {
        session.send_line(200, format!("{bucket} blocked.")).await
    } else {
        session.send_line(200, format!("{bucket} was already blocked.")).await
    }
}

pub async fn site_unblock(session: &mut Session, arg: String) -> FtpResult<()> {
    let bucket = arg.trim();
    if bucket.is_empty() {
        return Err(FtpError::bad_arg("usage: SITE UNBLOCK <ip-bucket>"));
    }
    if session.snapshot.events.unblock(bucket) {
        session.send_line(200, format!("{bucket} unblocked.")).await
    } else {
        Err(FtpError::NotFound(format!("{bucket} is not blocked")))
    }
}

pub async fn site_blocklist(session: &mut Session, _arg: String) -> FtpResult<()> {
    let mut lines = vec!["Blocked buckets:".to_string()];
    for bucket in session.snapshot.events.blocked_buckets() {
        lines.push(format!(" {bucket}"));
    }
    lines.push("End".to_string());
    session.send(Reply::multi(200, lines)).await
}

fn session_age(connected_at: SystemTime) -> String {
    let secs = connected_at.elapsed().map(|d| d.as_secs()).unwrap_or(0);
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

pub async fn site_who(session: &mut Session, _arg: String) -> FtpResult<()> {
    let viewer_is_siteop = session.require_user()?.flag_set().is_siteop();
    let mut lines = vec!["Online:".to_string()];
    for info in session.snapshot.events.active_sessions() {
        if info.hidden && !viewer_is_siteop {
            continue;
        }
        let user = info.user.as_deref().unwrap_or("(connecting)");
        let command = if info.current_command.is_empty() { "idle" } else { &info.current_command };
        let mut line = format!(
            " {:<16} {:<15} {} {}",
            user,
            info.client_ip,
            session_age(info.connected_at),
            command
        );
        if viewer_is_siteop {
            line.push_str(&format!("  [{}]", info.id));
        }
        lines.push(line);
    }
    lines.push("End".to_string());
    session.send(Reply::multi(200, lines)).await
}

pub async fn site_whoip(session: &mut Session, arg: String) -> FtpResult<()> {
    let prefix = arg.trim();
    if prefix.is_empty() {
        return Err(FtpError::bad_arg("usage: SITE WHOIP <ip-prefix>"));
    }
    let mut lines = vec![format!("Sessions from {prefix}:")];
    for info in session.snapshot.events.active_sessions() {
        if !info.client_ip.to_string().starts_with(prefix) {
            continue;
        }
        lines.push(format!(
            " {:<16} {:<15} [{}]",
            info.user.as_deref().unwrap_or("(connecting)"),
            info.client_ip,
            info.id
        ));
    }
    lines.push("End".to_string());
    session.send(Reply::multi(200, lines)).await
}

pub async fn site_rehash(session: &mut Session, _arg: String) -> FtpResult<()> {
    match session.rehash() {
        Ok(changed) => {
            let summary = if changed.is_empty() {
                "no sections changed".to_string()
            } else {
                changed.join(", ").to_lowercase()
            };
            session.send_line(200, format!("Rehash complete, changed: {summary}.")).await
        }
        Err(e) => Err(FtpError::Store(format!("rehash failed: {e}"))),
    }
}

pub async fn site_dbbackup(session: &mut Session, _arg: String) -> FtpResult<()> {
    let report = session
        .snapshot
        .store_admin
        .backup()
        .map_err(|e| FtpError::Store(e.to_string()))?;
    session.send_line(200, format!("Backup done: {report}")).await
}

pub async fn site_dbfsck(session: &mut Session, _arg: String) -> FtpResult<()> {
    let findings = session
        .snapshot
        .store_admin
        .fsck()
        .map_err(|e| FtpError::Store(e.to_string()))?;
    if findings.is_empty() {
        return session.send_line(200, "Stores are consistent.").await;
    }
    let mut lines = vec![format!("{} finding(s):", findings.len())];
    lines.extend(findings.into_iter().map(|f| format!(" {f}")));
    lines.push("End".to_string());
    session.send(Reply::multi(200, lines)).await
}

pub async fn site_dbsummary(session: &mut Session, _arg: String) -> FtpResult<()> {
    let mut lines = vec!["Store summary:".to_string()];
    for line in session.snapshot.store_admin.summary() {
        lines.push(format!(" {line}"));
    }
    lines.push(format!(" dupes: {}", session.snapshot.dupes.all().len()));
    lines.push(format!(" races: {}", session.snapshot.races.len()));
    lines.push("End".to_string());
    session.send(Reply::multi(200, lines)).await
}

pub async fn site_uptime(session: &mut Session, _arg: String) -> FtpResult<()> {
    let up = session
        .snapshot
        .events
        .started_at()
        .elapsed()
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let loaded = session.snapshot.loaded_at.elapsed().map(|d| d.as_secs()).unwrap_or(0);
    session
        .send_line(
            200,
            format!(
                "Up {}d {:02}:{:02}, configuration loaded {}s ago.",
                up / 86_400,
                (up % 86_400) / 3600,
                (up % 3600) / 60,
                loaded
            ),
        )
        .await
}

pub async fn site_version(session: &mut Session, _arg: String) -> FtpResult<()> {
    session
        .send_line(200, format!("raceftpd {}", env!("CARGO_PKG_VERSION")))
        .await
}

pub async fn site_help(session: &mut Session, _arg: String) -> FtpResult<()> {
    let flags = session.require_user()?.flag_set();
    let mut lines = vec!["SITE commands:".to_string()];
    for verb in super::registry() {
        if verb.requires_admin && !flags.is_admin() {
            continue;
        }
        if verb.requires_siteop && !flags.is_siteop() {
            continue;
        }
        lines.push(format!(" {}", verb.help));
    }
    lines.dedup();
    lines.push("End".to_string());
    session.send(Reply::multi(214, lines)).await
}
