//! Login sequence: `USER`, `PASS`, the TLS upgrade and data protection.

use tracing::{debug, info};

use crate::access::{self, LoginAttempt};
use crate::config::ProtectionLevel;
use crate::error::{FtpError, FtpResult};
use crate::events::Event;
use crate::protocol::command::CommandLine;
use crate::protocol::reply::Reply;
use crate::session::Session;
use crate::users::{User, UserFlags};

pub async fn cmd_user(session: &mut Session, command: &CommandLine) -> FtpResult<()> {
    if !command.has_arg() {
        return Err(FtpError::bad_arg("USER needs a name"));
    }
    let name = command.arg.clone();
    session.user = None;
    let snapshot = session.snapshot.clone();
    let server = &snapshot.config.server;
    let is_anonymous =
        server.allow_anonymous && name.eq_ignore_ascii_case(&server.anonymous_user);
    session.pending_user = Some(name.clone());
    if is_anonymous {
        session.send_line(331, "Anonymous access granted, send any password.").await
    } else {
        session.send_line(331, format!("Password required for {name}.")).await
    }
}

pub async fn cmd_pass(session: &mut Session, command: &CommandLine) -> FtpResult<()> {
    let Some(name) = session.pending_user.take() else {
        return Err(FtpError::BadSequence("send USER first".to_string()));
    };

    let snapshot = session.snapshot.clone();
    let server = &snapshot.config.server;
    let is_anonymous =
        server.allow_anonymous && name.eq_ignore_ascii_case(&server.anonymous_user);

    let account = if is_anonymous {
        Some(snapshot.users.find(&name).unwrap_or_else(|| anonymous_account(&name)))
    } else {
        snapshot.users.try_authenticate(&name, &command.arg)
    };
    let Some(account) = account else {
        debug!("bad credentials for {:?} from {}", name, session.client_addr);
        session.note_login_failure();
        return Err(FtpError::Auth("login incorrect".to_string()));
    };

    let attempt = LoginAttempt {
        client_ip: session.client_addr.ip(),
        client_port: session.client_addr.port(),
        server_port: session.server_port,
        control_is_tls: session.channel.is_tls(),
    };
    if let Err(e) = access::check_login(
        &account,
        &attempt,
        server,
        &snapshot.config.ident,
        &snapshot.events,
    )
    .await
    {
        session.note_login_failure();
        let code = e.auth_reply_code();
        return session.send_line(code, e.to_string()).await;
    }

    session.cwd = crate::vfs::path::normalize("/", &account.home_dir);
    session.protection = snapshot.protection_default;
    info!("{} logged in from {}", account.name, session.client_addr);
    snapshot.events.publish(Event::Login {
        user: account.name.clone(),
        client_addr: session.client_addr.to_string(),
    });
    let text = format!("User {} logged in.", account.name);
    session.user = Some(account);
    session.failed_logins = 0;
    session.send_line(230, text).await
}

/// Guest account synthesized when no stored account backs the anonymous
/// user name.
fn anonymous_account(name: &str) -> User {
    let mut user = User::new(name, "", "anonymous");
    user.flags = (UserFlags::ANONYMOUS | UserFlags::DOWNLOAD | UserFlags::ACTIVE).to_raw();
    user
}

pub async fn cmd_auth(session: &mut Session, command: &CommandLine) -> FtpResult<()> {
    if !command.arg.eq_ignore_ascii_case("TLS") {
        return session
            .send_line(504, format!("AUTH {} not supported, use AUTH TLS.", command.arg))
            .await;
    }
    if session.channel.is_tls() {
        return Err(FtpError::BadSequence("control channel is already TLS".to_string()));
    }
    let Some(acceptor) = session.snapshot.tls.clone() else {
        return session.send_line(534, "TLS is not configured on this server.").await;
    };

    session.send(Reply::new(234, "AUTH TLS successful, proceed with handshake.")).await?;
    session.channel.upgrade_tls(&acceptor).await?;
    debug!("control channel for {} upgraded to TLS", session.client_addr);
    Ok(())
}

pub async fn cmd_pbsz(session: &mut Session, command: &CommandLine) -> FtpResult<()> {
    if !session.channel.is_tls() {
        return session.send_line(503, "PBSZ requires AUTH TLS first.").await;
    }
    if command.arg.trim() != "0" {
        return Err(FtpError::bad_arg("PBSZ must be 0 on TLS"));
    }
    session.pbsz_done = true;
    session.send_line(200, "PBSZ 0 accepted.").await
}

pub async fn cmd_prot(session: &mut Session, command: &CommandLine) -> FtpResult<()> {
    if !session.pbsz_done {
        return session.send_line(503, "PROT requires PBSZ first.").await;
    }
    let Some(level) = ProtectionLevel::parse_label(&command.arg) else {
        return Err(FtpError::bad_arg(format!("unknown protection level {:?}", command.arg)));
    };
    if level.wraps_data() && session.snapshot.tls.is_none() {
        return session.send_line(534, "No TLS context for protected data channels.").await;
    }
    session.protection = level;
    // Safe and Confidential are accepted but the data stream stays clear.
    session.send_line(200, format!("Protection level set to {}.", level.letter())).await
}
