//! Best-effort RFC 1413 (IDENT) lookup.
//!
//! The server connects back to port 113 on the client host, sends
//! `client_port , server_port` and expects a `USERID` response naming the
//! remote user. Everything is bounded by one timeout; any failure is
//! reported as `None` and the caller treats it as a mismatch.

use std::net::IpAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Queries the client's IDENT daemon; `None` on refusal, error or timeout.
pub async fn lookup(
    client_ip: IpAddr,
    client_port: u16,
    server_port: u16,
    ident_port: u16,
    wait: Duration,
) -> Option<String> {
    match timeout(wait, query(client_ip, client_port, server_port, ident_port)).await {
        Ok(Ok(user)) => user,
        Ok(Err(e)) => {
            debug!("ident query to {} failed: {}", client_ip, e);
            None
        }
        Err(_) => {
            debug!("ident query to {} timed out", client_ip);
            None
        }
    }
}

async fn query(
    client_ip: IpAddr,
    client_port: u16,
    server_port: u16,
    ident_port: u16,
) -> std::io::Result<Option<String>> {
    let mut stream = TcpStream::connect((client_ip, ident_port)).await?;
    stream
        .write_all(format!("{client_port} , {server_port}\r\n").as_bytes())
        .await?;

    let mut buf = Vec::with_capacity(256);
    let mut chunk = [0u8; 256];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.contains(&b'\n') || buf.len() > 1024 {
            break;
        }
    }
    Ok(parse_response(&String::from_utf8_lossy(&buf)))
}

/// Extracts the user id from `ports : USERID : opsys : user-id`.
fn parse_response(line: &str) -> Option<String> {
    let mut fields = line.splitn(4, ':');
    let _ports = fields.next()?;
    let kind = fields.next()?.trim();
    if !kind.eq_ignore_ascii_case("USERID") {
        return None;
    }
    let _opsys = fields.next()?;
    let user = fields.next()?.trim();
    if user.is_empty() {
        None
    } else {
        Some(user.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn userid_response_parses() {
        assert_eq!(
            parse_response("6193, 23 : USERID : UNIX : stjohns\r\n"),
            Some("stjohns".to_string())
        );
    }

    #[test]
    fn error_response_is_none() {
        assert_eq!(parse_response("6195, 23 : ERROR : NO-USER\r\n"), None);
        assert_eq!(parse_response("garbage"), None);
    }
}
