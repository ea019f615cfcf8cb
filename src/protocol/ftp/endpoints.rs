//! Data endpoint setup: `PASV`, `EPSV`, `PORT`, `EPRT`.

use std::net::IpAddr;

use crate::data::{self, DataEndpoint};
use crate::error::{FtpError, FtpResult};
use crate::protocol::command::CommandLine;
use crate::session::Session;
use crate::users::UserFlags;

/// Address advertised in PASV/EPSV replies.
fn advertise_ip(session: &Session) -> IpAddr {
    let configured = &session.snapshot.config.server.passive_advertise_ip;
    configured.parse().unwrap_or(session.server_ip)
}

pub async fn cmd_pasv(session: &mut Session) -> FtpResult<()> {
    session.require_user()?;
    // Any previous endpoint (and its port lease) is discarded.
    session.data_endpoint = None;

    let bind_ip = match session.server_ip {
        IpAddr::V4(_) => IpAddr::from([0u8, 0, 0, 0]),
        IpAddr::V6(_) => return Err(FtpError::Protocol("PASV is IPv4-only, use EPSV".to_string())),
    };
    let (endpoint, port) = DataEndpoint::passive(&session.pool, bind_ip).await?;
    let tuple = data::format_pasv_tuple(advertise_ip(session), port)?;
    session.data_endpoint = Some(endpoint);
    session.send_line(227, format!("Entering Passive Mode ({tuple}).")).await
}

pub async fn cmd_epsv(session: &mut Session, command: &CommandLine) -> FtpResult<()> {
    session.require_user()?;
    if command.arg.eq_ignore_ascii_case("ALL") {
        return session.send_line(200, "EPSV ALL accepted.").await;
    }
    session.data_endpoint = None;

    let bind_ip = match session.server_ip {
        IpAddr::V4(_) => IpAddr::from([0u8, 0, 0, 0]),
        IpAddr::V6(_) => IpAddr::from([0u16; 8]),
    };
    let (endpoint, port) = DataEndpoint::passive(&session.pool, bind_ip).await?;
    session.data_endpoint = Some(endpoint);
    session.send_line(229, format!("Entering Extended Passive Mode (|||{port}|)")).await
}

fn check_active_allowed(session: &Session) -> FtpResult<()> {
    let user = session.require_user()?;
    if !user.flag_set().contains(UserFlags::ACTIVE) {
        return Err(FtpError::Permission(format!(
            "active-mode transfers are not enabled for {}",
            user.name
        )));
    }
    Ok(())
}

pub async fn cmd_port(session: &mut Session, command: &CommandLine) -> FtpResult<()> {
    check_active_allowed(session)?;
    let addr = data::parse_port_arg(&command.arg)?;
    session.data_endpoint = Some(DataEndpoint::active(addr));
    session.send_line(200, "PORT command successful.").await
}

pub async fn cmd_eprt(session: &mut Session, command: &CommandLine) -> FtpResult<()> {
    check_active_allowed(session)?;
    let addr = data::parse_eprt_arg(&command.arg)?;
    session.data_endpoint = Some(DataEndpoint::active(addr));
    session.send_line(200, "EPRT command successful.").await
}
