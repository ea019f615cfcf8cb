//! Data-channel management: passive and active endpoints, TLS wrapping and
//! the transfer task.
//!
//! A session owns at most one pending data endpoint at a time. `PASV`/`EPSV`
//! allocate a port from the shared pool and bind a listener immediately;
//! `PORT`/`EPRT` record the client endpoint. The endpoint is consumed by the
//! next transfer, which accepts or connects under a handshake timeout,
//! optionally wraps the socket in TLS (`PROT P`) and hands it to the
//! transfer task.

pub mod list;
mod pool;
mod transfer;

pub use pool::{PassivePortPool, PortLease};
pub use transfer::{
    run_download, run_listing, run_upload, AbortSignal, TransferOutcome, UploadDisposition,
    INACTIVITY_TIMEOUT,
};

use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use crate::config::FxpPolicyConfig;
use crate::error::{FtpError, FtpResult};

/// Seconds allowed between PASV/PORT and the data connection appearing.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Data socket, plain or TLS-wrapped.
pub enum DataStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for DataStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            DataStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            DataStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for DataStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            DataStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            DataStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            DataStream::Plain(s) => Pin::new(s).poll_flush(cx),
            DataStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            DataStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            DataStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Pending endpoint set up by the last PASV/EPSV/PORT/EPRT.
pub enum DataEndpoint {
    /// Bound listener plus its port lease.
    Passive { listener: TcpListener, _lease: PortLease },
    /// Client-advertised address to connect to.
    Active { addr: SocketAddr },
}

impl DataEndpoint {
    /// Binds a passive listener on a pooled port.
    pub async fn passive(
        pool: &std::sync::Arc<PassivePortPool>,
        bind_ip: IpAddr,
    ) -> FtpResult<(DataEndpoint, u16)> {
        // A port may linger in TIME_WAIT; try a few pool slots.
        for _ in 0..8 {
            let Some(lease) = pool.allocate() else {
                return Err(FtpError::ResourceExhausted("no passive port free".to_string()));
            };
            let port = lease.port();
            match TcpListener::bind(SocketAddr::new(bind_ip, port)).await {
                Ok(listener) => {
                    debug!("passive listener on port {}", port);
                    return Ok((DataEndpoint::Passive { listener, _lease: lease }, port));
                }
                Err(e) => {
                    debug!("cannot bind passive port {}: {}", port, e);
                    continue;
                }
            }
        }
        Err(FtpError::ResourceExhausted("cannot bind a passive port".to_string()))
    }

    /// Records an active endpoint after policy has been checked.
    pub fn active(addr: SocketAddr) -> DataEndpoint {
        DataEndpoint::Active { addr }
    }

    /// Produces the connected data socket, honoring the handshake timeout
    /// and the FXP policy on foreign addresses.
    pub async fn open(
        self,
        client_ip: IpAddr,
        fxp_allowed_for_user: bool,
        fxp: &FxpPolicyConfig,
    ) -> FtpResult<TcpStream> {
        match self {
            DataEndpoint::Passive { listener, _lease } => {
                let (stream, peer) = timeout(HANDSHAKE_TIMEOUT, listener.accept())
                    .await
                    .map_err(|_| FtpError::DataTimeout("passive handshake".to_string()))??;
                let foreign = peer.ip() != client_ip;
                if foreign && !(fxp_allowed_for_user && fxp.allow_fxp && fxp.allow_foreign_pasv) {
                    return Err(FtpError::Permission(format!(
                        "data connection from foreign address {}",
                        peer.ip()
                    )));
                }
                Ok(stream)
            }
            DataEndpoint::Active { addr } => {
                let foreign = addr.ip() != client_ip;
                if foreign && !(fxp_allowed_for_user && fxp.allow_fxp && fxp.allow_foreign_port) {
                    return Err(FtpError::Permission(format!(
                        "active endpoint {} is not the client",
                        addr.ip()
                    )));
                }
                let stream = timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(addr))
                    .await
                    .map_err(|_| FtpError::DataTimeout("active connect".to_string()))??;
                Ok(stream)
            }
        }
    }
}

/// Wraps the accepted data socket according to the protection level.
pub async fn protect_stream(
    stream: TcpStream,
    wrap_tls: bool,
    acceptor: Option<&TlsAcceptor>,
) -> FtpResult<DataStream> {
    if !wrap_tls {
        return Ok(DataStream::Plain(stream));
    }
    let acceptor = acceptor
        .ok_or_else(|| FtpError::TlsRequired("no TLS context for protected data".to_string()))?;
    let tls = acceptor.accept(stream).await?;
    Ok(DataStream::Tls(Box::new(tls)))
}

/// Parses `PORT h1,h2,h3,h4,p1,p2`.
pub fn parse_port_arg(arg: &str) -> FtpResult<SocketAddr> {
    let parts: Vec<&str> = arg.split(',').map(str::trim).collect();
    if parts.len() != 6 {
        return Err(FtpError::bad_arg("PORT takes six comma-separated numbers"));
    }
    let mut nums = [0u8; 6];
    for (i, part) in parts.iter().enumerate() {
        nums[i] = part
            .parse::<u8>()
            .map_err(|_| FtpError::bad_arg(format!("bad PORT number {part:?}")))?;
    }
    let ip = IpAddr::from([nums[0], nums[1], nums[2], nums[3]]);
    let port = (u16::from(nums[4]) << 8) | u16::from(nums[5]);
    Ok(SocketAddr::new(ip, port))
}

/// Parses `EPRT |proto|addr|port|` (RFC 2428), any delimiter.
pub fn parse_eprt_arg(arg: &str) -> FtpResult<SocketAddr> {
    let mut chars = arg.chars();
    let delim = chars.next().ok_or_else(|| FtpError::bad_arg("empty EPRT argument"))?;
    let fields: Vec<&str> = arg[delim.len_utf8()..].split(delim).collect();
    if fields.len() < 3 {
        return Err(FtpError::bad_arg("EPRT needs |proto|addr|port|"));
    }
    let ip: IpAddr = fields[1]
        .parse()
        .map_err(|_| FtpError::bad_arg(format!("bad EPRT address {:?}", fields[1])))?;
    let port: u16 = fields[2]
        .parse()
        .map_err(|_| FtpError::bad_arg(format!("bad EPRT port {:?}", fields[2])))?;
    Ok(SocketAddr::new(ip, port))
}

/// Renders the `227 Entering Passive Mode` host/port tuple.
pub fn format_pasv_tuple(ip: IpAddr, port: u16) -> FtpResult<String> {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            Ok(format!("{},{},{},{},{},{}", o[0], o[1], o[2], o[3], port >> 8, port & 0xff))
        }
        IpAddr::V6(_) => {
            Err(FtpError::Protocol("PASV is IPv4-only, use EPSV".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_argument_round_trip() {
        let addr = parse_port_arg("192,168,1,2,195,149").unwrap();
        assert_eq!(addr, "192.168.1.2:50069".parse().unwrap());
        assert!(parse_port_arg("1,2,3").is_err());
        assert!(parse_port_arg("a,b,c,d,e,f").is_err());
    }

    #[test]
    fn eprt_argument_parses_both_families() {
        assert_eq!(
            parse_eprt_arg("|1|132.235.1.2|6275|").unwrap(),
            "132.235.1.2:6275".parse().unwrap()
        );
        assert_eq!(
            parse_eprt_arg("|2|1080::8:800:200C:417A|5282|").unwrap(),
            "[1080::8:800:200C:417A]:5282".parse().unwrap()
        );
        assert!(parse_eprt_arg("||").is_err());
    }

    #[test]
    fn pasv_tuple_formats_ipv4() {
        let tuple = format_pasv_tuple("10.0.0.1".parse().unwrap(), 50069).unwrap();
        assert_eq!(tuple, "10,0,0,1,195,149");
        assert!(format_pasv_tuple("::1".parse().unwrap(), 50069).is_err());
    }

    #[tokio::test]
    async fn passive_endpoint_accepts_the_client() {
        let pool = PassivePortPool::new(55000, 55063);
        let (endpoint, port) =
            DataEndpoint::passive(&pool, "127.0.0.1".parse().unwrap()).await.unwrap();

        let client = tokio::spawn(async move {
            TcpStream::connect(("127.0.0.1", port)).await.unwrap()
        });
        let stream = endpoint
            .open("127.0.0.1".parse().unwrap(), false, &FxpPolicyConfig::default())
            .await
            .unwrap();
        assert!(stream.peer_addr().is_ok());
        client.await.unwrap();
        // The lease was dropped with the endpoint.
        assert_eq!(pool.allocated(), 0);
    }
}
