//! Shared fixture for the integration tests: a daemon bound to a loopback
//! port over a temporary site tree, and a minimal line-based FTP client.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use raceftpd::config::{Config, SectionConfig};
use raceftpd::runtime::{self, Snapshot, SnapshotCell};
use raceftpd::store::hash_password;
use raceftpd::tcp::FtpServer;
use raceftpd::users::User;

/// A running daemon instance for one test.
pub struct TestSite {
    pub addr: SocketAddr,
    pub snapshot: Arc<Snapshot>,
    pub snapshots: Arc<SnapshotCell>,
    pub config_path: PathBuf,
    pub site_root: PathBuf,
    _tmp: tempfile::TempDir,
}

/// Disjoint passive ranges so parallel tests never fight over a port.
fn passive_range() -> (u16, u16) {
    static NEXT: AtomicU16 = AtomicU16::new(0);
    let slot = NEXT.fetch_add(1, Ordering::SeqCst) % 128;
    let pid_lane = (std::process::id() % 8) as u16;
    let base = 40_000 + pid_lane * 1024 + slot * 8;
    (base, base + 7)
}

/// Standard test configuration: an `/mp3` 1:3 section over a temp tree.
pub fn test_config(site_root: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.server.listen_addr = "127.0.0.1:0".to_string();
    config.server.passive_advertise_ip = "127.0.0.1".to_string();
    let (start, end) = passive_range();
    config.server.passive_port_start = start;
    config.server.passive_port_end = end;
    config.vfs.home_root = site_root.display().to_string();
    config.storage.data_dir = site_root.join("data").display().to_string();
    config.sections.insert("MP3".to_string(), SectionConfig {
        virtual_root: "/mp3".to_string(),
        ratio_up: 1,
        ratio_down: 3,
        nuke_multiplier: 3.0,
        aliases: vec!["music".to_string()],
        ..SectionConfig::default()
    });
    config
}

/// Boots a daemon on a loopback port with `alice` (plain user, 100 MiB of
/// credits) and `admin` (master) accounts.
pub async fn start_site() -> TestSite {
    let tmp = tempfile::tempdir().unwrap();
    let site_root = tmp.path().join("site");
    std::fs::create_dir_all(site_root.join("mp3")).unwrap();
    std::fs::create_dir_all(site_root.join("pub")).unwrap();

    let config = test_config(&site_root);
    let config_path = tmp.path().join("config.json");
    std::fs::write(&config_path, serde_json::to_string_pretty(&config).unwrap()).unwrap();

    let snapshot = Arc::new(runtime::load(&config_path).unwrap());

    let mut alice = User::new("alice", &hash_password("secret"), "STAFF");
    alice.flags = "DUV".to_string();
    alice.credits_kb = 100 * 1024;
    snapshot.users.try_add(alice).unwrap();

    let mut admin = User::new("admin", &hash_password("secret"), "STAFF");
    admin.flags = "MSDUV".to_string();
    admin.credits_kb = 100 * 1024;
    snapshot.users.try_add(admin).unwrap();

    let snapshots = Arc::new(SnapshotCell::new(snapshot.clone()));
    let server = FtpServer::bind(snapshots.clone()).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server.handle_forever().await;
    });

    TestSite { addr, snapshot, snapshots, config_path, site_root, _tmp: tmp }
}

/// Line-based control-channel client.
pub struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    /// Connects and consumes the 220 greeting.
    pub async fn connect(addr: SocketAddr) -> Client {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, write) = stream.into_split();
        let mut client = Client { reader: BufReader::new(read), writer: write };
        let greeting = client.read_reply().await;
        assert_eq!(code(&greeting), 220, "greeting: {greeting}");
        client
    }

    pub async fn send(&mut self, line: &str) {
        self.writer.write_all(format!("{line}\r\n").as_bytes()).await.unwrap();
    }

    /// Reads one complete (possibly multi-line) reply.
    pub async fn read_reply(&mut self) -> String {
        let mut first = String::new();
        assert!(self.reader.read_line(&mut first).await.unwrap() > 0, "connection closed");
        let mut reply = first.clone();
        if first.len() >= 4 && first.as_bytes()[3] == b'-' {
            let terminator = format!("{} ", &first[..3]);
            loop {
                let mut line = String::new();
                assert!(self.reader.read_line(&mut line).await.unwrap() > 0, "eof in multiline");
                reply.push_str(&line);
                if line.starts_with(&terminator) {
                    break;
                }
            }
        }
        reply
    }

    /// Sends a command and returns the full reply text.
    pub async fn cmd(&mut self, line: &str) -> String {
        self.send(line).await;
        self.read_reply().await
    }

    /// Sends a command and asserts the reply code.
    pub async fn expect(&mut self, line: &str, expected: u16) -> String {
        let reply = self.cmd(line).await;
        assert_eq!(code(&reply), expected, "{line} -> {reply}");
        reply
    }
}

/// Three-digit code of a reply.
pub fn code(reply: &str) -> u16 {
    reply[..3].parse().expect("reply code")
}

/// Port from a `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)` reply.
pub fn pasv_port(reply: &str) -> u16 {
    let open = reply.find('(').expect("pasv tuple");
    let close = reply.find(')').expect("pasv tuple");
    let nums: Vec<u16> =
        reply[open + 1..close].split(',').map(|n| n.trim().parse().unwrap()).collect();
    assert_eq!(nums.len(), 6, "pasv tuple: {reply}");
    (nums[4] << 8) | nums[5]
}

pub async fn login(client: &mut Client, user: &str, pass: &str) {
    client.expect(&format!("USER {user}"), 331).await;
    client.expect(&format!("PASS {pass}"), 230).await;
}

/// Uploads `payload` via PASV + STOR and waits for the 226.
pub async fn upload(client: &mut Client, path: &str, payload: &[u8]) {
    let pasv = client.expect("PASV", 227).await;
    let port = pasv_port(&pasv);
    let mut data = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client.send(&format!("STOR {path}")).await;
    let opening = client.read_reply().await;
    assert_eq!(code(&opening), 150, "{opening}");
    data.write_all(payload).await.unwrap();
    data.shutdown().await.unwrap();
    drop(data);
    let done = client.read_reply().await;
    assert_eq!(code(&done), 226, "{done}");
}

/// Downloads a file via PASV + RETR, returning its bytes.
pub async fn download(client: &mut Client, path: &str) -> Vec<u8> {
    let pasv = client.expect("PASV", 227).await;
    let port = pasv_port(&pasv);
    let mut data = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client.send(&format!("RETR {path}")).await;
    let opening = client.read_reply().await;
    assert_eq!(code(&opening), 150, "{opening}");
    let mut payload = Vec::new();
    data.read_to_end(&mut payload).await.unwrap();
    let done = client.read_reply().await;
    assert_eq!(code(&done), 226, "{done}");
    payload
}
