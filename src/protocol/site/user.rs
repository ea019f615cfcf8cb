//! SITE user lifecycle verbs.

use glob::{MatchOptions, Pattern};

use crate::error::{FtpError, FtpResult};
use crate::protocol::reply::Reply;
use crate::session::Session;
use crate::store::hash_password;
use crate::users::{User, UserFlags};

fn words(arg: &str) -> Vec<&str> {
    arg.split_whitespace().collect()
}

fn find_user(session: &Session, name: &str) -> FtpResult<User> {
    session
        .snapshot
        .users
        .find(name)
        .ok_or_else(|| FtpError::NotFound(format!("no such user {name}")))
}

fn update_user(session: &Session, user: User) -> FtpResult<()> {
    session
        .snapshot
        .users
        .try_update(user)
        .map_err(|e| FtpError::Store(e.to_string()))
}

pub async fn site_adduser(session: &mut Session, arg: String) -> FtpResult<()> {
    let words = words(&arg);
    let [name, password, rest @ ..] = words.as_slice() else {
        return Err(FtpError::bad_arg("usage: SITE ADDUSER <user> <password> [group]"));
    };
    let group = rest.first().copied().unwrap_or("STAFF");
    let mut user = User::new(name, &hash_password(password), group);
    user.credits_kb = session.snapshot.config.storage.default_credits_kb;
    session
        .snapshot
        .users
        .try_add(user)
        .map_err(|e| FtpError::Store(e.to_string()))?;
    session.send_line(200, format!("User {name} added to group {group}.")).await
}

/// Delete tombstones: the account is disabled, never removed.
pub async fn site_deluser(session: &mut Session, arg: String) -> FtpResult<()> {
    let name = arg.trim();
    if name.is_empty() {
        return Err(FtpError::bad_arg("usage: SITE DELUSER <user>"));
    }
    let mut user = find_user(session, name)?;
    user.flags = (user.flag_set() | UserFlags::DISABLED).to_raw();
    update_user(session, user)?;
    session.send_line(200, format!("User {name} disabled.")).await
}

pub async fn site_chpass(session: &mut Session, arg: String) -> FtpResult<()> {
    let words = words(&arg);
    let [name, password] = words.as_slice() else {
        return Err(FtpError::bad_arg("usage: SITE CHPASS <user> <password>"));
    };
    let mut user = find_user(session, name)?;
    user.password_hash = hash_password(password);
    update_user(session, user)?;
    session.send_line(200, format!("Password for {name} changed.")).await
}

pub async fn site_chgrp(session: &mut Session, arg: String) -> FtpResult<()> {
    let words = words(&arg);
    let [name, primary, secondaries @ ..] = words.as_slice() else {
        return Err(FtpError::bad_arg("usage: SITE CHGRP <user> <primary> [secondary...]"));
    };
    let mut user = find_user(session, name)?;
    user.primary_group = primary.to_string();
    for group in secondaries {
        let group = group.to_string();
        if !user.secondary_groups.remove(&group) {
            user.secondary_groups.insert(group);
        }
    }
    let summary = format!(
        "{} is now in {} (+{} secondary)",
        name,
        user.primary_group,
        user.secondary_groups.len()
    );
    update_user(session, user)?;
    session.send_line(200, summary).await
}

pub async fn site_flags(session: &mut Session, arg: String) -> FtpResult<()> {
    let name = arg.trim();
    if name.is_empty() {
        return Err(FtpError::bad_arg("usage: SITE FLAGS <user>"));
    }
    let user = find_user(session, name)?;
    session.send_line(200, format!("Flags for {}: {}", user.name, user.flags)).await
}

pub async fn site_setflags(session: &mut Session, arg: String) -> FtpResult<()> {
    let words = words(&arg);
    let [name, flags] = words.as_slice() else {
        return Err(FtpError::bad_arg("usage: SITE SETFLAGS <user> <flags>"));
    };
    let mut user = find_user(session, name)?;
    user.flags = UserFlags::from_raw(flags).to_raw();
    let applied = user.flags.clone();
    update_user(session, user)?;
    session.send_line(200, format!("Flags for {name} set to {applied}.")).await
}

pub async fn site_limits(session: &mut Session, arg: String) -> FtpResult<()> {
    let name = arg.trim();
    if name.is_empty() {
        return Err(FtpError::bad_arg("usage: SITE LIMITS <user>"));
    }
    let user = find_user(session, name)?;
    let l = user.limits;
    session
        .send_line(
            200,
            format!(
                "Limits for {}: up {} KiB/s, down {} KiB/s, logins {}, idle {}s",
                user.name,
                l.max_upload_kbps,
                l.max_download_kbps,
                l.max_concurrent_logins,
                l.idle_timeout_secs
            ),
        )
        .await
}

pub async fn site_setlimits(session: &mut Session, arg: String) -> FtpResult<()> {
    let words = words(&arg);
    let [name, up, down, logins, idle] = words.as_slice() else {
        return Err(FtpError::bad_arg(
            "usage: SITE SETLIMITS <user> <upKbps> <downKbps> <logins> <idleSecs>",
        ));
    };
    let parse = |v: &str| -> FtpResult<u32> {
        v.parse().map_err(|_| FtpError::bad_arg(format!("bad number {v:?}")))
    };
    let mut user = find_user(session, name)?;
    user.limits.max_upload_kbps = parse(up)?;
    user.limits.max_download_kbps = parse(down)?;
    user.limits.max_concurrent_logins = parse(logins)?;
    user.limits.idle_timeout_secs = parse(idle)?;
    update_user(session, user)?;
    session.send_line(200, format!("Limits for {name} updated.")).await
}

pub async fn site_noratio(session: &mut Session, arg: String) -> FtpResult<()> {
    let name = arg.trim();
    if name.is_empty() {
        return Err(FtpError::bad_arg("usage: SITE NORATIO <user>"));
    }
    let mut user = find_user(session, name)?;
    let flags = user.flag_set() ^ UserFlags::NO_RATIO;
    user.flags = flags.to_raw();
    let state = if flags.contains(UserFlags::NO_RATIO) { "exempt from" } else { "subject to" };
    update_user(session, user)?;
    session.send_line(200, format!("{name} is now {state} ratio.")).await
}

pub async fn site_sysop(session: &mut Session, arg: String) -> FtpResult<()> {
    let name = arg.trim();
    if name.is_empty() {
        return Err(FtpError::bad_arg("usage: SITE SYSOP <user>"));
    }
    let mut user = find_user(session, name)?;
    let flags = user.flag_set() ^ UserFlags::MASTER;
    user.flags = flags.to_raw();
    let state = if flags.contains(UserFlags::MASTER) { "granted" } else { "revoked" };
    update_user(session, user)?;
    session.send_line(200, format!("Master rights {state} for {name}.")).await
}

pub async fn site_addip(session: &mut Session, arg: String) -> FtpResult<()> {
    let words = words(&arg);
    let [name, mask] = words.as_slice() else {
        return Err(FtpError::bad_arg("usage: SITE ADDIP <user> <mask>"));
    };
    let mut user = find_user(session, name)?;
    user.allowed_ip_mask = mask.to_string();
    update_user(session, user)?;
    session.send_line(200, format!("IP mask for {name} set to {mask}.")).await
}

pub async fn site_delip(session: &mut Session, arg: String) -> FtpResult<()> {
    let name = arg.trim();
    if name.is_empty() {
        return Err(FtpError::bad_arg("usage: SITE DELIP <user>"));
    }
    let mut user = find_user(session, name)?;
    user.allowed_ip_mask.clear();
    update_user(session, user)?;
    session.send_line(200, format!("IP mask for {name} cleared.")).await
}

pub async fn site_ident(session: &mut Session, arg: String) -> FtpResult<()> {
    let words = words(&arg);
    let [name, ident] = words.as_slice() else {
        return Err(FtpError::bad_arg("usage: SITE IDENT <user> <ident>"));
    };
    let mut user = find_user(session, name)?;
    user.required_ident = ident.to_string();
    update_user(session, user)?;
    session.send_line(200, format!("Required ident for {name} set to {ident}.")).await
}

pub async fn site_reqident(session: &mut Session, arg: String) -> FtpResult<()> {
    let words = words(&arg);
    let [name, state] = words.as_slice() else {
        return Err(FtpError::bad_arg("usage: SITE REQIDENT <user> on|off"));
    };
    let required = match state.to_ascii_lowercase().as_str() {
        "on" | "1" | "true" => true,
        "off" | "0" | "false" => false,
        other => return Err(FtpError::bad_arg(format!("bad state {other:?}"))),
    };
    let mut user = find_user(session, name)?;
    user.require_ident_match = required;
    update_user(session, user)?;
    session
        .send_line(200, format!("Ident check for {name}: {}.", if required { "on" } else { "off" }))
        .await
}

pub async fn site_showuser(session: &mut Session, arg: String) -> FtpResult<()> {
    let name = arg.trim();
    if name.is_empty() {
        return Err(FtpError::bad_arg("usage: SITE SHOWUSER <user>"));
    }
    let user = find_user(session, name)?;
    let secondaries: Vec<&str> = user.secondary_groups.iter().map(String::as_str).collect();
    let lines = vec![
        format!("User {}", user.name),
        format!(" Groups: {} [{}]", user.primary_group, secondaries.join(", ")),
        format!(" Flags: {}", user.flags),
        format!(" Credits: {} KiB", user.credits_kb),
        format!(" Home: {}", user.home_dir),
        format!(
            " IP mask: {}",
            if user.allowed_ip_mask.is_empty() { "(any)" } else { &user.allowed_ip_mask }
        ),
        format!(
            " Ident: {} (required: {})",
            if user.required_ident.is_empty() { "(none)" } else { &user.required_ident },
            user.require_ident_match
        ),
        "End".to_string(),
    ];
    session.send(Reply::multi(200, lines)).await
}

pub async fn site_users(session: &mut Session, arg: String) -> FtpResult<()> {
    let pattern = arg.trim();
    let matcher = if pattern.is_empty() {
        None
    } else {
        Some(Pattern::new(pattern).map_err(|e| FtpError::bad_arg(format!("bad pattern: {e}")))?)
    };
    let options = MatchOptions { case_sensitive: false, ..MatchOptions::default() };

    let mut users = session.snapshot.users.all();
    users.sort_by(|a, b| a.name.to_ascii_lowercase().cmp(&b.name.to_ascii_lowercase()));
    let mut lines = vec!["Users:".to_string()];
    for user in users {
        if let Some(matcher) = &matcher {
            if !matcher.matches_with(&user.name, options) {
                continue;
            }
        }
        lines.push(format!(
            " {:<16} {:<12} {:>12} KiB  {}",
            user.name, user.primary_group, user.credits_kb, user.flags
        ));
    }
    lines.push("End".to_string());
    session.send(Reply::multi(200, lines)).await
}
