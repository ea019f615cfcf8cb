//! FTP verb dispatcher.
//!
//! Routes a parsed command line to its handler. Each verb lives in a module
//! grouped by concern: authentication, data endpoints, navigation,
//! transfers, listings, filesystem operations and the session-level
//! miscellany. `SITE` hands off to the administrative registry.

use tracing::warn;

use crate::error::FtpResult;
use crate::protocol::command::CommandLine;
use crate::protocol::site;
use crate::session::Session;

mod auth;
mod endpoints;
mod fsops;
mod listing;
mod misc;
mod nav;
mod xfer;

/// Routes one command to its handler; unknown verbs get `500`.
pub async fn dispatch(session: &mut Session, command: CommandLine) -> FtpResult<()> {
    let accept_x = session.snapshot.config.compatibility.accept_x_verbs;
    let verb: &str = match command.verb.as_str() {
        v @ ("XPWD" | "XCWD" | "XCUP" | "XMKD" | "XRMD") if accept_x => &v[1..],
        v => v,
    };

    match verb {
        "USER" => auth::cmd_user(session, &command).await,
        "PASS" => auth::cmd_pass(session, &command).await,
        "AUTH" => auth::cmd_auth(session, &command).await,
        "PBSZ" => auth::cmd_pbsz(session, &command).await,
        "PROT" => auth::cmd_prot(session, &command).await,

        "PASV" => endpoints::cmd_pasv(session).await,
        "EPSV" => endpoints::cmd_epsv(session, &command).await,
        "PORT" => endpoints::cmd_port(session, &command).await,
        "EPRT" => endpoints::cmd_eprt(session, &command).await,

        "CWD" => nav::cmd_cwd(session, &command).await,
        "CDUP" => nav::cmd_cdup(session).await,
        "PWD" => nav::cmd_pwd(session).await,

        "LIST" => listing::cmd_list(session, &command).await,
        "NLST" => listing::cmd_nlst(session, &command).await,
        "MLSD" => listing::cmd_mlsd(session, &command).await,
        "MLST" => listing::cmd_mlst(session, &command).await,

        "RETR" => xfer::cmd_retr(session, &command).await,
        "STOR" => xfer::cmd_stor(session, &command).await,
        "APPE" => xfer::cmd_appe(session, &command).await,
        "STOU" => xfer::cmd_stou(session, &command).await,
        "REST" => xfer::cmd_rest(session, &command).await,
        "ABOR" => xfer::cmd_abor(session).await,

        "DELE" => fsops::cmd_dele(session, &command).await,
        "MKD" => fsops::cmd_mkd(session, &command).await,
        "RMD" => fsops::cmd_rmd(session, &command).await,
        "RNFR" => fsops::cmd_rnfr(session, &command).await,
        "RNTO" => fsops::cmd_rnto(session, &command).await,
        "SIZE" => fsops::cmd_size(session, &command).await,
        "MDTM" => fsops::cmd_mdtm(session, &command).await,

        "SITE" => site::dispatch(session, &command).await,

        "TYPE" => misc::cmd_type(session, &command).await,
        "MODE" => misc::cmd_mode(session, &command).await,
        "STRU" => misc::cmd_stru(session, &command).await,
        "SYST" => misc::cmd_syst(session).await,
        "FEAT" => misc::cmd_feat(session).await,
        "OPTS" => misc::cmd_opts(session, &command).await,
        "NOOP" => misc::cmd_noop(session).await,
        "ALLO" => misc::cmd_allo(session).await,
        "CLNT" => misc::cmd_clnt(session, &command).await,
        "STAT" => misc::cmd_stat(session, &command).await,
        "HELP" => misc::cmd_help(session).await,
        "QUIT" => misc::cmd_quit(session).await,

        unknown => {
            warn!("unknown verb {:?} from {}", unknown, session.client_addr);
            session.send_line(500, format!("Command {unknown} not understood.")).await
        }
    }
}
