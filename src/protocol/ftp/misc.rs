//! Session-level verbs: `TYPE`, `MODE`, `STRU`, `SYST`, `FEAT`, `OPTS`,
//! `NOOP`, `ALLO`, `CLNT`, `STAT`, `HELP`, `QUIT`.

use crate::error::{FtpError, FtpResult};
use crate::protocol::command::CommandLine;
use crate::protocol::ftp::listing;
use crate::protocol::reply::Reply;
use crate::session::{Session, TransferMode};

pub async fn cmd_type(session: &mut Session, command: &CommandLine) -> FtpResult<()> {
    match command.arg.to_ascii_uppercase().as_str() {
        "A" | "A N" => {
            session.transfer_mode = TransferMode::Ascii;
            session.send_line(200, "Type set to A.").await
        }
        "I" | "L 8" => {
            session.transfer_mode = TransferMode::Binary;
            session.send_line(200, "Type set to I.").await
        }
        other => session.send_line(504, format!("Type {other:?} not supported.")).await,
    }
}

pub async fn cmd_mode(session: &mut Session, command: &CommandLine) -> FtpResult<()> {
    if command.arg.eq_ignore_ascii_case("S") {
        session.send_line(200, "Mode set to S.").await
    } else {
        session.send_line(504, "Only stream mode is supported.").await
    }
}

pub async fn cmd_stru(session: &mut Session, command: &CommandLine) -> FtpResult<()> {
    if command.arg.eq_ignore_ascii_case("F") {
        session.send_line(200, "Structure set to F.").await
    } else {
        session.send_line(504, "Only file structure is supported.").await
    }
}

pub async fn cmd_syst(session: &mut Session) -> FtpResult<()> {
    session.send_line(215, "UNIX Type: L8").await
}

pub async fn cmd_feat(session: &mut Session) -> FtpResult<()> {
    let mut lines = vec!["Features:".to_string()];
    if session.snapshot.tls.is_some() {
        lines.push(" AUTH TLS".to_string());
        lines.push(" PBSZ".to_string());
        lines.push(" PROT".to_string());
    }
    lines.push(" EPSV".to_string());
    lines.push(" EPRT".to_string());
    lines.push(" MDTM".to_string());
    lines.push(" SIZE".to_string());
    lines.push(" REST STREAM".to_string());
    lines.push(" MLST type*;size*;modify*;perm*;unique*;".to_string());
    lines.push(" MLSD".to_string());
    lines.push(" UTF8".to_string());
    lines.push("End".to_string());
    session.send(Reply::multi(211, lines)).await
}

pub async fn cmd_opts(session: &mut Session, command: &CommandLine) -> FtpResult<()> {
    let words = command.arg_words();
    match words.first().map(|w| w.to_ascii_uppercase()).as_deref() {
        Some("UTF8") => session.send_line(200, "UTF8 is always on.").await,
        _ => Err(FtpError::bad_arg(format!("OPTS {:?} not understood", command.arg))),
    }
}

pub async fn cmd_noop(session: &mut Session) -> FtpResult<()> {
    session.send_line(200, "NOOP ok.").await
}

pub async fn cmd_allo(session: &mut Session) -> FtpResult<()> {
    session.send_line(202, "ALLO is obsolete.").await
}

pub async fn cmd_clnt(session: &mut Session, command: &CommandLine) -> FtpResult<()> {
    tracing::debug!("client identifies as {:?}", command.arg);
    session.send_line(200, "Noted.").await
}

pub async fn cmd_stat(session: &mut Session, command: &CommandLine) -> FtpResult<()> {
    if command.has_arg() {
        let raw = command.arg.clone();
        return listing::stat_listing(session, &raw).await;
    }
    let user = session
        .user
        .as_ref()
        .map(|u| u.name.clone())
        .unwrap_or_else(|| "(not logged in)".to_string());
    let mode = match session.transfer_mode {
        TransferMode::Ascii => "ASCII",
        TransferMode::Binary => "binary",
    };
    let lines = vec![
        "raceftpd status:".to_string(),
        format!(" Connected from {}", session.client_addr),
        format!(" Logged in as {user}"),
        format!(" Control channel {}", if session.channel.is_tls() { "TLS" } else { "plaintext" }),
        format!(" Transfer type {mode}, protection {}", session.protection.letter()),
        format!(" Working directory {}", session.cwd),
        "End of status".to_string(),
    ];
    session.send(Reply::multi(211, lines)).await
}

pub async fn cmd_help(session: &mut Session) -> FtpResult<()> {
    let lines = vec![
        "Recognized commands:".to_string(),
        " USER PASS AUTH PBSZ PROT QUIT SYST FEAT OPTS NOOP STAT HELP CLNT".to_string(),
        " TYPE MODE STRU PASV EPSV PORT EPRT REST ABOR ALLO".to_string(),
        " CWD CDUP PWD LIST NLST MLSD MLST SIZE MDTM".to_string(),
        " RETR STOR APPE STOU DELE MKD RMD RNFR RNTO SITE".to_string(),
        "Use SITE HELP for the administrative commands".to_string(),
    ];
    session.send(Reply::multi(214, lines)).await
}

pub async fn cmd_quit(session: &mut Session) -> FtpResult<()> {
    session.quitting = true;
    session.send_line(221, "Goodbye.").await
}
