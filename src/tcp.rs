//! The TCP module provides the control-connection listener.
//!
//! One accept loop admits clients, applies the operator block list and the
//! per-IP-bucket connection cap, and spawns a session task per accepted
//! socket. Shutdown stops the loop, grants live sessions a grace period
//! and then kicks whatever is left.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::data::PassivePortPool;
use crate::events::ip_bucket;
use crate::runtime::SnapshotCell;
use crate::session::Session;

/// FTP control listener bound to the configured address.
pub struct FtpServer {
    listener: TcpListener,
    snapshots: Arc<SnapshotCell>,
    pool: Arc<PassivePortPool>,
    shutdown: Arc<Notify>,
}

impl FtpServer {
    /// Binds the control socket and sizes the passive port pool from the
    /// active snapshot.
    pub async fn bind(snapshots: Arc<SnapshotCell>) -> io::Result<FtpServer> {
        let snapshot = snapshots.current();
        let addr = &snapshot.config.server.listen_addr;
        let listener = TcpListener::bind(addr).await?;
        info!("Listening on {}", listener.local_addr()?);
        let pool = PassivePortPool::new(
            snapshot.config.server.passive_port_start,
            snapshot.config.server.passive_port_end,
        );
        Ok(FtpServer { listener, snapshots, pool, shutdown: Arc::new(Notify::new()) })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle used to stop the accept loop.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Accepts and admits connections until shutdown is signalled.
    pub async fn handle_forever(&self) -> io::Result<()> {
        loop {
            let (socket, peer) = tokio::select! {
                accepted = self.listener.accept() => accepted?,
                _ = self.shutdown.notified() => {
                    info!("listener shutting down");
                    return Ok(());
                }
            };
            self.admit(socket, peer).await;
        }
    }

    /// Admission control: block list first, then the per-bucket cap.
    async fn admit(&self, mut socket: TcpStream, peer: SocketAddr) {
        let snapshot = self.snapshots.current();
        let server = &snapshot.config.server;
        let bucket = ip_bucket(peer.ip(), server.ip_bucket_octets);

        if snapshot.events.is_blocked(&bucket) {
            debug!("refused blocked bucket {} ({})", bucket, peer);
            reject(&mut socket, "421 Service not available.\r\n").await;
            return;
        }

        let cap = server.max_connections_per_ip as usize;
        if cap > 0 && snapshot.events.session_count_for_ip_bucket(&bucket, server.ip_bucket_octets) >= cap
        {
            warn!("too many connections from {} ({})", bucket, peer);
            reject(&mut socket, "421 Too many connections from your address.\r\n").await;
            return;
        }

        let server_addr = match socket.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                debug!("cannot read local addr for {}: {}", peer, e);
                return;
            }
        };
        let _ = socket.set_nodelay(true);
        info!("Accepting connection from {}", peer);

        let session =
            Session::new(socket, peer, server_addr, self.snapshots.clone(), self.pool.clone());
        tokio::spawn(session.run());
    }
}

async fn reject(socket: &mut TcpStream, line: &str) {
    let _ = socket.write_all(line.as_bytes()).await;
    let _ = socket.shutdown().await;
}

/// Orderly shutdown: stop accepting, wait out the grace period, then kick
/// the remaining sessions.
pub async fn shutdown(server: &FtpServer, grace: Duration) {
    server.shutdown.notify_waiters();
    let snapshot = server.snapshots.current();
    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if snapshot.events.active_sessions().is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    let kicked = snapshot.events.kick_all();
    if kicked > 0 {
        warn!("shutdown deadline reached, kicked {} session(s)", kicked);
    }
}
