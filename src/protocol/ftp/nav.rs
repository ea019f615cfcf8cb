//! Directory navigation: `CWD`, `CDUP`, `PWD`.

use crate::error::{FtpError, FtpResult};
use crate::protocol::command::CommandLine;
use crate::session::Session;
use crate::vfs::Lookup;

async fn change_dir(session: &mut Session, target: &str) -> FtpResult<()> {
    let user = session.require_user()?.clone();
    let virtual_path = session.resolve_path(target);
    let snapshot = session.snapshot.clone();
    match snapshot.vfs.resolve(&virtual_path, &user).await {
        Lookup::Found(node) if node.is_dir() => {
            // Shortcuts and PRE entries resolve to the directory they
            // point at; follow the resolved path.
            session.cwd = node.virtual_path;
            session.send_line(250, format!("Directory changed to {}.", session.cwd)).await
        }
        Lookup::Found(_) => {
            Err(FtpError::Permission(format!("{virtual_path} is not a directory")))
        }
        Lookup::Denied => Err(FtpError::Permission(format!("{virtual_path}: access denied"))),
        Lookup::NotFound => Err(FtpError::NotFound(format!("{virtual_path}: no such directory"))),
    }
}

pub async fn cmd_cwd(session: &mut Session, command: &CommandLine) -> FtpResult<()> {
    if !command.has_arg() {
        return Err(FtpError::bad_arg("CWD needs a path"));
    }
    let target = command.arg.clone();
    change_dir(session, &target).await
}

pub async fn cmd_cdup(session: &mut Session) -> FtpResult<()> {
    change_dir(session, "..").await
}

pub async fn cmd_pwd(session: &mut Session) -> FtpResult<()> {
    session.require_user()?;
    let cwd = session.cwd.clone();
    session.send_line(257, format!("\"{cwd}\" is the current directory.")).await
}
