//! Per-connection session: the control-channel state machine.
//!
//! A session owns its control socket, samples the runtime snapshot at each
//! command boundary and dispatches parsed commands to the protocol
//! handlers. While a transfer task is running the session keeps reading the
//! control channel, answers `ABOR`/`STAT`/`NOOP` immediately and queues
//! every other verb until the transfer ends.

pub mod channel;

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;

use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ProtectionLevel;
use crate::data::{AbortSignal, DataEndpoint, PassivePortPool, TransferOutcome};
use crate::error::{FtpError, FtpResult};
use crate::events::{Event, SessionHandle, SessionInfo};
use crate::protocol::command::CommandLine;
use crate::protocol::ftp;
use crate::protocol::reply::Reply;
use crate::runtime::{Snapshot, SnapshotCell};
use crate::users::{User, UserFlags};
use channel::ControlChannel;

/// ASCII or binary transfer mode (`TYPE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferMode {
    Ascii,
    #[default]
    Binary,
}

/// Standing of the connection after repeated failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reputation {
    #[default]
    Good,
    Suspect,
    Blocked,
}

/// One live control connection.
pub struct Session {
    pub id: Uuid,
    pub channel: ControlChannel,
    pub snapshot: Arc<Snapshot>,
    snapshots: Arc<SnapshotCell>,
    pub client_addr: SocketAddr,
    pub server_ip: std::net::IpAddr,
    pub server_port: u16,
    pub pool: Arc<PassivePortPool>,

    /// Name proposed by `USER`, awaiting `PASS`.
    pub pending_user: Option<String>,
    /// Authenticated account.
    pub user: Option<User>,
    pub cwd: String,
    pub transfer_mode: TransferMode,
    pub protection: ProtectionLevel,
    pub pbsz_done: bool,
    pub rest_offset: u64,
    pub rename_from: Option<String>,
    pub data_endpoint: Option<DataEndpoint>,
    pub abort: AbortSignal,
    pub reputation: Reputation,
    pub failed_logins: u32,
    pub quitting: bool,

    handle: SessionHandle,
    /// Verbs received during a transfer, replayed afterwards.
    deferred: VecDeque<String>,
}

impl Session {
    /// Builds a session for an accepted socket and registers it.
    pub fn new(
        socket: TcpStream,
        client_addr: SocketAddr,
        server_addr: SocketAddr,
        snapshots: Arc<SnapshotCell>,
        pool: Arc<PassivePortPool>,
    ) -> Session {
        let id = Uuid::new_v4();
        let snapshot = snapshots.current();
        let handle = snapshot.events.register_session(SessionInfo {
            id,
            user: None,
            client_ip: client_addr.ip(),
            connected_at: SystemTime::now(),
            current_command: String::new(),
            hidden: false,
        });
        Session {
            id,
            channel: ControlChannel::new(socket),
            snapshot,
            snapshots,
            client_addr,
            server_ip: server_addr.ip(),
            server_port: server_addr.port(),
            pool,
            pending_user: None,
            user: None,
            cwd: "/".to_string(),
            transfer_mode: TransferMode::default(),
            protection: ProtectionLevel::Clear,
            pbsz_done: false,
            rest_offset: 0,
            rename_from: None,
            data_endpoint: None,
            abort: AbortSignal::new(),
            reputation: Reputation::Good,
            failed_logins: 0,
            quitting: false,
            handle,
            deferred: VecDeque::new(),
        }
    }

    /// Drives the session to completion. Always unregisters on return.
    pub async fn run(mut self) {
        let banner = Reply::new(220, "raceftpd ready.");
        if self.channel.send(&banner).await.is_err() {
            self.finish().await;
            return;
        }

        loop {
            if self.quitting || self.handle.is_kicked() {
                break;
            }

            // Replay verbs queued while a transfer was running.
            let line = match self.deferred.pop_front() {
                Some(line) => Some(line),
                None => match self.read_with_idle_timeout().await {
                    ReadOutcome::Line(line) => Some(line),
                    ReadOutcome::Eof | ReadOutcome::Error => break,
                    ReadOutcome::IdleTimeout => {
                        let _ = self
                            .channel
                            .send(&Reply::new(421, "Idle timeout, closing control connection."))
                            .await;
                        break;
                    }
                    ReadOutcome::Kicked => break,
                },
            };
            let Some(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }

            // Sample the snapshot at the command boundary.
            self.snapshot = self.snapshots.current();
            let command = CommandLine::parse(&line);
            self.publish_activity(&command.verb);

            if let Err(e) = ftp::dispatch(&mut self, command).await {
                let reply = Reply::new(e.reply_code(), e.to_string());
                if self.channel.send(&reply).await.is_err() {
                    break;
                }
            }
        }

        if self.handle.is_kicked() {
            let _ = self.channel.send(&Reply::new(421, "Kicked by an operator.")).await;
        }
        self.finish().await;
    }

    async fn read_with_idle_timeout(&mut self) -> ReadOutcome {
        let idle = self
            .user
            .as_ref()
            .map(|u| u.limits.idle_timeout(self.snapshot.idle_timeout()))
            .unwrap_or_else(|| self.snapshot.idle_timeout());
        let interrupted = self.handle.interrupted();

        tokio::select! {
            _ = interrupted.notified() => ReadOutcome::Kicked,
            read = timeout(idle, self.channel.read_line()) => match read {
                Ok(Ok(Some(line))) => ReadOutcome::Line(line),
                Ok(Ok(None)) => ReadOutcome::Eof,
                Ok(Err(e)) => {
                    debug!("control read failed: {}", e);
                    ReadOutcome::Error
                }
                Err(_) => ReadOutcome::IdleTimeout,
            },
        }
    }

    async fn finish(mut self) {
        if let Some(user) = self.user.take() {
            self.snapshot.users.on_logout(&user);
            self.snapshot.events.publish(Event::Logout {
                user: user.name.clone(),
                client_addr: self.client_addr.to_string(),
            });
            info!("{} logged out from {}", user.name, self.client_addr);
        }
        self.snapshot.events.unregister_session(self.id);
    }

    fn publish_activity(&self, verb: &str) {
        let hidden = self
            .user
            .as_ref()
            .map(|u| u.flag_set().contains(UserFlags::HIDDEN))
            .unwrap_or(false);
        // PASS arguments never reach the registry.
        self.snapshot.events.update_session(
            self.id,
            self.user.as_ref().map(|u| u.name.clone()),
            verb,
            hidden,
        );
    }

    /// Sends one reply on the control channel.
    pub async fn send(&mut self, reply: Reply) -> FtpResult<()> {
        self.channel.send(&reply).await?;
        Ok(())
    }

    /// Shorthand for a single-line reply.
    pub async fn send_line(&mut self, code: u16, text: impl Into<String>) -> FtpResult<()> {
        self.send(Reply::new(code, text)).await
    }

    /// The authenticated account, or the 530 the client deserves.
    pub fn require_user(&self) -> FtpResult<&User> {
        self.user
            .as_ref()
            .ok_or_else(|| FtpError::Auth("not logged in".to_string()))
    }

    /// Normalizes a client path against the working directory.
    pub fn resolve_path(&self, input: &str) -> String {
        crate::vfs::path::normalize(&self.cwd, input)
    }

    /// Consumes the pending data endpoint or complains with 425.
    pub fn take_data_endpoint(&mut self) -> FtpResult<DataEndpoint> {
        self.data_endpoint
            .take()
            .ok_or_else(|| FtpError::BadSequence("use PASV or PORT first".to_string()))
    }

    /// Consumes the REST offset armed for the next transfer.
    pub fn take_rest_offset(&mut self) -> u64 {
        std::mem::take(&mut self.rest_offset)
    }

    /// Waits for a spawned transfer task while keeping the control channel
    /// responsive: `ABOR`, `STAT`, `NOOP` are answered immediately, all
    /// other verbs wait in the deferred queue.
    pub async fn wait_transfer(
        &mut self,
        mut task: JoinHandle<FtpResult<TransferOutcome>>,
    ) -> FtpResult<TransferOutcome> {
        enum Step {
            Done(Result<FtpResult<TransferOutcome>, tokio::task::JoinError>),
            Line(Option<String>),
        }

        let mut control_dead = false;
        loop {
            let step = if control_dead {
                Step::Done((&mut task).await)
            } else {
                tokio::select! {
                    joined = &mut task => Step::Done(joined),
                    line = self.channel.read_line() => Step::Line(line.unwrap_or(None)),
                }
            };

            match step {
                Step::Done(joined) => {
                    let outcome = joined
                        .map_err(|e| FtpError::Store(format!("transfer task panicked: {e}")))??;
                    return Ok(outcome);
                }
                Step::Line(None) => {
                    // Control connection went away; stop the transfer.
                    self.abort.trigger();
                    self.quitting = true;
                    control_dead = true;
                }
                Step::Line(Some(line)) => {
                    let command = CommandLine::parse(&line);
                    match command.verb.as_str() {
                        "ABOR" => {
                            debug!("ABOR while transferring");
                            self.abort.trigger();
                        }
                        "STAT" if !command.has_arg() => {
                            let user =
                                self.user.as_ref().map(|u| u.name.clone()).unwrap_or_default();
                            self.send(Reply::multi(211, vec![
                                "Status:".to_string(),
                                format!(" user {user}, transfer in progress"),
                                "End of status".to_string(),
                            ]))
                            .await?;
                        }
                        "NOOP" => self.send_line(200, "NOOP ok.").await?,
                        _ => self.deferred.push_back(line),
                    }
                }
            }
        }
    }

    /// Reloads the configuration and swaps the server-wide snapshot.
    ///
    /// The calling session adopts the new snapshot immediately; other
    /// sessions pick it up at their next command boundary.
    pub fn rehash(&mut self) -> Result<Vec<&'static str>, crate::config::ConfigError> {
        let config_path = self.snapshot.config_path.clone();
        let (next, changed) = crate::runtime::reload(&config_path, &self.snapshot)?;
        let next = Arc::new(next);
        self.snapshots.swap(next.clone());
        self.snapshot = next;
        Ok(changed)
    }

    /// Counts a failed login and downgrades the connection's standing.
    pub fn note_login_failure(&mut self) {
        self.failed_logins += 1;
        self.reputation = match self.failed_logins {
            0..=2 => Reputation::Good,
            3..=4 => Reputation::Suspect,
            _ => Reputation::Blocked,
        };
        if self.reputation == Reputation::Blocked {
            warn!("{} blocked after {} failed logins", self.client_addr, self.failed_logins);
            self.quitting = true;
        }
    }
}

enum ReadOutcome {
    Line(String),
    Eof,
    Error,
    IdleTimeout,
    Kicked,
}
