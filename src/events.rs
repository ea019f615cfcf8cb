//! Event bus and live-session registry.
//!
//! Transfer, release and operator events fan out to every subscriber over
//! per-subscriber bounded queues; a slow subscriber only loses its own
//! oldest events (with a warning), it never blocks publishers or peers.
//! The bus also carries the registry of live sessions consumed by `WHO`,
//! `WHOIP` and `KICK`, and the operator block list checked at accept time.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use dashmap::DashMap;
use tokio::sync::{broadcast, Notify};
use tracing::warn;
use uuid::Uuid;

/// Everything downstream consumers can observe.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Login { user: String, client_addr: String },
    Logout { user: String, client_addr: String },
    TransferComplete(TransferComplete),
    Pre { section: String, release: String, user: String },
    Unpre { section: String, release: String, user: String },
    Nuke { section: String, release: String, reason: String, multiplier: f64, nuker: String },
    Unnuke { section: String, release: String, nuker: String },
    ZipscriptStatus { release_path: String, complete: bool, done: usize, listed: usize },
    Kick { user: String, kicked_by: String },
}

/// Direction of a finished transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Upload,
    Download,
    List,
}

/// Published after every data transfer, before the `226` reply.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferComplete {
    pub kind: TransferKind,
    pub user: String,
    pub section: String,
    pub virtual_path: String,
    pub bytes: u64,
    pub duration: std::time::Duration,
    pub aborted: bool,
}

/// Receiving side of one subscription.
pub struct EventSubscriber {
    receiver: broadcast::Receiver<Event>,
}

impl EventSubscriber {
    /// Next event; lagging drops the oldest backlog and keeps going.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("event subscriber lagged, dropped {} oldest events", missed);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// One live control connection as seen by WHO/KICK.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: Uuid,
    pub user: Option<String>,
    pub client_ip: IpAddr,
    pub connected_at: SystemTime,
    pub current_command: String,
    pub hidden: bool,
}

/// Handle the registry keeps per session so operators can interrupt it.
#[derive(Clone)]
pub struct SessionHandle {
    pub info: SessionInfo,
    kicked: Arc<AtomicBool>,
    interrupt: Arc<Notify>,
}

impl SessionHandle {
    pub fn kick(&self) {
        self.kicked.store(true, Ordering::SeqCst);
        self.interrupt.notify_waiters();
    }

    pub fn is_kicked(&self) -> bool {
        self.kicked.load(Ordering::SeqCst)
    }

    pub fn interrupted(&self) -> Arc<Notify> {
        self.interrupt.clone()
    }
}

/// Fan-out bus plus the registries that must survive reloads.
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    sessions: DashMap<Uuid, SessionHandle>,
    blocked: RwLock<HashSet<String>>,
    started_at: SystemTime,
}

impl EventBus {
    pub fn new(queue_capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(queue_capacity.max(1));
        EventBus {
            sender,
            sessions: DashMap::new(),
            blocked: RwLock::new(HashSet::new()),
            started_at: SystemTime::now(),
        }
    }

    /// Process start time; survives rehash because the bus is carried over.
    pub fn started_at(&self) -> SystemTime {
        self.started_at
    }

    pub fn publish(&self, event: Event) {
        // A send error only means there are no subscribers right now.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> EventSubscriber {
        EventSubscriber { receiver: self.sender.subscribe() }
    }

    /// Registers a connection, returning its kick/interrupt handle.
    pub fn register_session(&self, info: SessionInfo) -> SessionHandle {
        let handle = SessionHandle {
            info,
            kicked: Arc::new(AtomicBool::new(false)),
            interrupt: Arc::new(Notify::new()),
        };
        self.sessions.insert(handle.info.id, handle.clone());
        handle
    }

    pub fn update_session(&self, id: Uuid, user: Option<String>, command: &str, hidden: bool) {
        if let Some(mut entry) = self.sessions.get_mut(&id) {
            entry.info.user = user;
            entry.info.current_command = command.to_string();
            entry.info.hidden = hidden;
        }
    }

    pub fn unregister_session(&self, id: Uuid) {
        self.sessions.remove(&id);
    }

    pub fn active_sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> =
            self.sessions.iter().map(|e| e.info.clone()).collect();
        sessions.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));
        sessions
    }

    /// Sessions currently authenticated as `user`, case-insensitive.
    pub fn sessions_for_user(&self, user: &str) -> Vec<SessionHandle> {
        self.sessions
            .iter()
            .filter(|e| {
                e.info.user.as_deref().map(|u| u.eq_ignore_ascii_case(user)).unwrap_or(false)
            })
            .map(|e| e.clone())
            .collect()
    }

    /// Kicks every session of `user`; returns how many were hit.
    pub fn kick_user(&self, user: &str) -> usize {
        let handles = self.sessions_for_user(user);
        for handle in &handles {
            handle.kick();
        }
        handles.len()
    }

    /// Kicks every live session (shutdown deadline expiry).
    pub fn kick_all(&self) -> usize {
        let mut hit = 0;
        for entry in self.sessions.iter() {
            entry.kick();
            hit += 1;
        }
        hit
    }

    /// Kicks one session by id.
    pub fn kill_session(&self, id: Uuid) -> bool {
        match self.sessions.get(&id) {
            Some(handle) => {
                handle.kick();
                true
            }
            None => false,
        }
    }

    pub fn session_count_for_ip_bucket(&self, bucket: &str, bucket_octets: u8) -> usize {
        self.sessions
            .iter()
            .filter(|e| ip_bucket(e.info.client_ip, bucket_octets) == bucket)
            .count()
    }

    pub fn block(&self, bucket: &str) -> bool {
        self.blocked.write().expect("block list lock").insert(bucket.to_string())
    }

    pub fn unblock(&self, bucket: &str) -> bool {
        self.blocked.write().expect("block list lock").remove(bucket)
    }

    pub fn is_blocked(&self, bucket: &str) -> bool {
        self.blocked.read().expect("block list lock").contains(bucket)
    }

    pub fn blocked_buckets(&self) -> Vec<String> {
        let mut list: Vec<String> =
            self.blocked.read().expect("block list lock").iter().cloned().collect();
        list.sort();
        list
    }
}

/// Admission bucket key: the first `octets` octets of the address.
pub fn ip_bucket(ip: IpAddr, octets: u8) -> String {
    match ip {
        IpAddr::V4(v4) => {
            let parts = v4.octets();
            let n = usize::from(octets.clamp(1, 4));
            parts[..n].iter().map(|o| o.to_string()).collect::<Vec<_>>().join(".")
        }
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            let n = usize::from(octets.clamp(1, 4));
            segments[..n].iter().map(|s| format!("{s:x}")).collect::<Vec<_>>().join(":")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: Uuid, user: Option<&str>, ip: &str) -> SessionInfo {
        SessionInfo {
            id,
            user: user.map(|u| u.to_string()),
            client_ip: ip.parse().unwrap(),
            connected_at: SystemTime::now(),
            current_command: String::new(),
            hidden: false,
        }
    }

    #[tokio::test]
    async fn publish_reaches_every_subscriber() {
        let bus = EventBus::new(16);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.publish(Event::Login { user: "alice".to_string(), client_addr: "1.2.3.4".to_string() });
        assert!(matches!(a.recv().await, Some(Event::Login { .. })));
        assert!(matches!(b.recv().await, Some(Event::Login { .. })));
    }

    #[tokio::test]
    async fn slow_subscriber_drops_oldest_only() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe();
        for i in 0..5u8 {
            bus.publish(Event::Kick { user: format!("u{i}"), kicked_by: "op".to_string() });
        }
        // Capacity 2: the three oldest were dropped, u3 survives.
        let first = sub.recv().await.unwrap();
        assert_eq!(first, Event::Kick { user: "u3".to_string(), kicked_by: "op".to_string() });
    }

    #[test]
    fn registry_tracks_and_kicks_sessions() {
        let bus = EventBus::new(16);
        let id = Uuid::new_v4();
        let handle = bus.register_session(info(id, None, "10.0.0.1"));
        bus.update_session(id, Some("alice".to_string()), "RETR x", false);

        assert_eq!(bus.active_sessions().len(), 1);
        assert_eq!(bus.kick_user("ALICE"), 1);
        assert!(handle.is_kicked());

        bus.unregister_session(id);
        assert!(bus.active_sessions().is_empty());
    }

    #[test]
    fn ip_buckets_take_leading_octets() {
        assert_eq!(ip_bucket("192.168.4.7".parse().unwrap(), 2), "192.168");
        assert_eq!(ip_bucket("192.168.4.7".parse().unwrap(), 4), "192.168.4.7");
    }

    #[test]
    fn block_list_round_trip() {
        let bus = EventBus::new(16);
        assert!(bus.block("192.168"));
        assert!(bus.is_blocked("192.168"));
        assert!(!bus.block("192.168"));
        assert!(bus.unblock("192.168"));
        assert!(!bus.is_blocked("192.168"));
    }
}
