//! Directory listings: `LIST`, `NLST`, `MLSD`, `MLST`.

use crate::data::{self, list};
use crate::error::{FtpError, FtpResult};
use crate::events::{Event, TransferComplete, TransferKind};
use crate::protocol::command::CommandLine;
use crate::protocol::ftp::xfer::open_data_stream;
use crate::protocol::reply::Reply;
use crate::rules::{Decision, TransferOp};
use crate::session::Session;
use crate::vfs::{Lookup, Node};

/// Strips `ls`-style flag words clients put in front of the path.
fn listing_path(command: &CommandLine) -> String {
    command
        .arg_words()
        .into_iter()
        .find(|w| !w.starts_with('-'))
        .unwrap_or("")
        .to_string()
}

/// Resolves the target and collects the nodes to render.
async fn collect_nodes(session: &mut Session, raw_path: &str) -> FtpResult<(String, Vec<Node>)> {
    let user = session.require_user()?.clone();
    let target = if raw_path.is_empty() { session.cwd.clone() } else { raw_path.to_string() };
    let virtual_path = session.resolve_path(&target);
    let snapshot = session.snapshot.clone();

    let group = snapshot.group_of(&user);
    if let Decision::Deny(reason) =
        snapshot.rules.evaluate(&snapshot.sections, &group, &virtual_path, TransferOp::List)
    {
        return Err(FtpError::Permission(reason));
    }

    match snapshot.vfs.resolve(&virtual_path, &user).await {
        Lookup::Found(node) if node.is_dir() => {
            let nodes = snapshot
                .vfs
                .enumerate(&node.virtual_path, &user)
                .await
                .unwrap_or_default();
            Ok((node.virtual_path, nodes))
        }
        Lookup::Found(node) => Ok((virtual_path, vec![node])),
        Lookup::Denied => Err(FtpError::Permission(format!("{virtual_path}: access denied"))),
        Lookup::NotFound => Err(FtpError::NotFound(format!("{virtual_path}: no such path"))),
    }
}

/// Runs one listing transfer over the data channel.
async fn send_listing(session: &mut Session, rendered: String, what: &str) -> FtpResult<()> {
    let user = session.require_user()?.name.clone();
    let stream = open_data_stream(session).await?;
    session.send_line(150, format!("Opening data connection for {what}.")).await?;

    session.abort.reset();
    let abort = session.abort.clone();
    let task = tokio::spawn(async move { data::run_listing(stream, rendered, &abort).await });
    let outcome = session.wait_transfer(task).await?;

    let snapshot = session.snapshot.clone();
    snapshot.events.publish(Event::TransferComplete(TransferComplete {
        kind: TransferKind::List,
        user,
        section: String::new(),
        virtual_path: session.cwd.clone(),
        bytes: outcome.bytes,
        duration: outcome.duration,
        aborted: outcome.aborted(),
    }));

    if outcome.aborted() {
        session.send_line(426, "Listing aborted.").await?;
        return session.send_line(226, "Abort successful.").await;
    }
    session.send_line(226, "Directory listing sent.").await
}

pub async fn cmd_list(session: &mut Session, command: &CommandLine) -> FtpResult<()> {
    let raw = listing_path(command);
    let (_, nodes) = collect_nodes(session, &raw).await?;
    send_listing(session, list::render_long(&nodes), "directory listing").await
}

pub async fn cmd_nlst(session: &mut Session, command: &CommandLine) -> FtpResult<()> {
    let raw = listing_path(command);
    let (_, nodes) = collect_nodes(session, &raw).await?;
    send_listing(session, list::render_names(&nodes), "name listing").await
}

pub async fn cmd_mlsd(session: &mut Session, command: &CommandLine) -> FtpResult<()> {
    let raw = listing_path(command);
    let user = session.require_user()?.clone();
    let target = if raw.is_empty() { session.cwd.clone() } else { raw };
    let virtual_path = session.resolve_path(&target);
    let snapshot = session.snapshot.clone();

    match snapshot.vfs.resolve(&virtual_path, &user).await {
        Lookup::Found(node) if node.is_dir() => {
            let nodes =
                snapshot.vfs.enumerate(&node.virtual_path, &user).await.unwrap_or_default();
            send_listing(session, list::render_mlsd(&nodes), "machine listing").await
        }
        Lookup::Found(_) => Err(FtpError::Permission(format!("{virtual_path} is not a directory"))),
        Lookup::Denied => Err(FtpError::Permission(format!("{virtual_path}: access denied"))),
        Lookup::NotFound => Err(FtpError::NotFound(format!("{virtual_path}: no such directory"))),
    }
}

/// `MLST` answers over the control channel, one fact line.
pub async fn cmd_mlst(session: &mut Session, command: &CommandLine) -> FtpResult<()> {
    let user = session.require_user()?.clone();
    let target = if command.has_arg() { command.arg.clone() } else { session.cwd.clone() };
    let virtual_path = session.resolve_path(&target);
    let snapshot = session.snapshot.clone();

    match snapshot.vfs.resolve(&virtual_path, &user).await {
        Lookup::Found(node) => {
            session
                .send(Reply::multi(250, vec![
                    format!("Listing {virtual_path}"),
                    format!(" {}", list::mlst_line(&node)),
                    "End".to_string(),
                ]))
                .await
        }
        Lookup::Denied => Err(FtpError::Permission(format!("{virtual_path}: access denied"))),
        Lookup::NotFound => Err(FtpError::NotFound(format!("{virtual_path}: no such path"))),
    }
}

/// Listing over the control channel for `STAT <path>`.
pub async fn stat_listing(session: &mut Session, raw_path: &str) -> FtpResult<()> {
    let (virtual_path, nodes) = collect_nodes(session, raw_path).await?;
    let mut lines = vec![format!("Status of {virtual_path}:")];
    for node in &nodes {
        lines.push(format!(" {}", node.name()));
    }
    lines.push("End of status".to_string());
    session.send(Reply::multi(213, lines)).await
}
