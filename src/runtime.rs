//! Runtime snapshot: the immutable bundle a session works against.
//!
//! `load` builds every engine from the configuration; `reload` builds a new
//! snapshot while carrying over the long-lived state (stores, race tracker,
//! dupe store, PRE registry, event bus and the zipscript database handle)
//! and reports which configuration sections changed, by structural JSON
//! comparison. The server swaps snapshots atomically; sessions sample at
//! command boundaries, so a mid-transfer session keeps its old snapshot
//! until the command finishes.

use std::io::BufReader;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, Context};
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

use crate::config::{Config, ConfigError, ProtectionLevel};
use crate::credit::CreditEngine;
use crate::dupe::{DupeStore, MemoryDupeStore};
use crate::events::EventBus;
use crate::race::RaceTracker;
use crate::rules::RatioPipeline;
use crate::section::SectionResolver;
use crate::store::{
    hash_password, GroupStore, MemoryGroupStore, MemoryStoreAdmin, MemoryUserStore,
    MemoryZipscriptDb, StoreAdmin, UserStore, ZipscriptDb,
};
use crate::users::{Group, User, UserFlags};
use crate::vfs::{
    GroupsProvider, PhysicalProvider, PreProvider, PreRegistry, ShortcutProvider, VfsResolver,
};
use crate::zipscript::ZipscriptEngine;

/// Immutable bundle of configuration and engine handles.
pub struct Snapshot {
    pub config: Config,
    pub config_path: std::path::PathBuf,
    pub loaded_at: SystemTime,
    pub sections: Arc<SectionResolver>,
    pub rules: Arc<RatioPipeline>,
    pub vfs: Arc<VfsResolver>,
    pub users: Arc<dyn UserStore>,
    pub groups: Arc<dyn GroupStore>,
    pub store_admin: Arc<dyn StoreAdmin>,
    pub dupes: Arc<dyn DupeStore>,
    pub races: Arc<RaceTracker>,
    pub zipscript: Arc<ZipscriptEngine>,
    pub zipscript_db: Arc<dyn ZipscriptDb>,
    pub credits: Arc<CreditEngine>,
    pub pre: Arc<PreRegistry>,
    pub events: Arc<EventBus>,
    pub imports: Arc<crate::import::ImportRegistry>,
    pub tls: Option<TlsAcceptor>,
    pub protection_default: ProtectionLevel,
}

impl Snapshot {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.config.server.idle_timeout_secs.max(1))
    }

    /// Group for an account, falling back to a neutral one.
    pub fn group_of(&self, user: &User) -> Group {
        self.groups
            .find(&user.primary_group)
            .unwrap_or_else(|| crate::users::fallback_group(&user.primary_group))
    }
}

/// Atomically swappable snapshot cell; sessions sample at command
/// boundaries via `current()`.
pub struct SnapshotCell {
    inner: RwLock<Arc<Snapshot>>,
}

impl SnapshotCell {
    pub fn new(snapshot: Arc<Snapshot>) -> Self {
        SnapshotCell { inner: RwLock::new(snapshot) }
    }

    pub fn current(&self) -> Arc<Snapshot> {
        self.inner.read().expect("snapshot cell lock").clone()
    }

    pub fn swap(&self, snapshot: Arc<Snapshot>) {
        *self.inner.write().expect("snapshot cell lock") = snapshot;
    }
}

/// Long-lived pieces carried from one snapshot into the next.
struct CarriedState {
    users: Arc<dyn UserStore>,
    groups: Arc<dyn GroupStore>,
    store_admin: Arc<dyn StoreAdmin>,
    dupes: Arc<dyn DupeStore>,
    races: Arc<RaceTracker>,
    zipscript_db: Arc<dyn ZipscriptDb>,
    pre: Arc<PreRegistry>,
    events: Arc<EventBus>,
    imports: Arc<crate::import::ImportRegistry>,
}

/// Builds the first snapshot of a process.
pub fn load(config_path: &Path) -> Result<Snapshot, ConfigError> {
    let config = Config::load_or_create(config_path)?;
    let users = Arc::new(MemoryUserStore::new());
    let groups = Arc::new(MemoryGroupStore::new());
    let store_admin = Arc::new(MemoryStoreAdmin {
        data_dir: std::path::PathBuf::from(&config.storage.data_dir),
        users: users.clone(),
        groups: groups.clone(),
    });
    seed_default_account(users.as_ref(), &config);
    let carried = CarriedState {
        users,
        groups,
        store_admin,
        dupes: Arc::new(MemoryDupeStore::new()),
        races: Arc::new(RaceTracker::new()),
        zipscript_db: Arc::new(MemoryZipscriptDb::new()),
        pre: Arc::new(PreRegistry::new(Duration::from_secs(
            config.server.pre_ttl_hours.max(1) * 3600,
        ))),
        events: Arc::new(EventBus::new(config.server.event_queue_capacity)),
        imports: crate::import::ImportRegistry::new(),
    };
    build(config, config_path.to_path_buf(), carried)
        .map_err(|e| ConfigError::Invalid(e.to_string()))
}

/// Loads a new snapshot for `SITE REHASH`, reusing `current`'s long-lived
/// state, and reports the set of changed top-level sections.
pub fn reload(
    config_path: &Path,
    current: &Snapshot,
) -> Result<(Snapshot, Vec<&'static str>), ConfigError> {
    let config = Config::load_or_create(config_path)?;

    let before = current.config.section_values();
    let after = config.section_values();
    let changed: Vec<&'static str> = after
        .iter()
        .filter(|(name, value)| before.get(*name) != Some(value))
        .map(|(name, _)| *name)
        .collect();

    let carried = CarriedState {
        users: current.users.clone(),
        groups: current.groups.clone(),
        store_admin: current.store_admin.clone(),
        dupes: current.dupes.clone(),
        races: current.races.clone(),
        zipscript_db: current.zipscript_db.clone(),
        pre: current.pre.clone(),
        events: current.events.clone(),
        imports: current.imports.clone(),
    };
    let snapshot = build(config, config_path.to_path_buf(), carried)
        .map_err(|e| ConfigError::Invalid(e.to_string()))?;
    info!("rehash complete, changed sections: {:?}", changed);
    Ok((snapshot, changed))
}

fn build(
    config: Config,
    config_path: std::path::PathBuf,
    carried: CarriedState,
) -> anyhow::Result<Snapshot> {
    seed_groups(carried.groups.as_ref(), &config);

    let sections = Arc::new(SectionResolver::new(config.sections.iter()));
    let rules = Arc::new(RatioPipeline::new(&config.directory_rules, &config.ratio_rules));

    let physical = Arc::new(PhysicalProvider::new(&config.vfs));
    let vfs = Arc::new(VfsResolver::new(
        Arc::new(ShortcutProvider::new(sections.clone())),
        Arc::new(PreProvider::new(carried.pre.clone())),
        Arc::new(GroupsProvider::new(carried.dupes.clone())),
        physical,
    ));

    let zipscript =
        Arc::new(ZipscriptEngine::new(carried.zipscript_db.clone(), config.zipscript.enabled));
    let credits = Arc::new(CreditEngine::new(carried.users.clone()));

    let tls = if config.tls.enabled {
        Some(build_tls_acceptor(
            Path::new(&config.tls.cert_path),
            Path::new(&config.tls.key_path),
        )?)
    } else {
        None
    };

    let protection_default = config.server.protection_default();

    Ok(Snapshot {
        loaded_at: SystemTime::now(),
        config_path,
        sections,
        rules,
        vfs,
        users: carried.users,
        groups: carried.groups,
        store_admin: carried.store_admin,
        dupes: carried.dupes,
        races: carried.races,
        zipscript,
        zipscript_db: carried.zipscript_db,
        credits,
        pre: carried.pre,
        events: carried.events,
        imports: carried.imports,
        tls,
        protection_default,
        config,
    })
}

/// Ensures every configured group exists in the store.
fn seed_groups(store: &dyn GroupStore, config: &Config) {
    for (name, group_config) in &config.groups {
        if store.find(name).is_some() {
            continue;
        }
        let group = Group {
            name: name.clone(),
            description: group_config.description.clone(),
            ratio_multiply: group_config.ratio_multiply,
            upload_bonus: group_config.upload_bonus,
            flags: group_config.flags.clone(),
        };
        if let Err(e) = store.try_add(group) {
            warn!("cannot seed group {}: {}", name, e);
        }
    }
}

/// Creates the bootstrap siteop when the user store is empty.
fn seed_default_account(store: &dyn UserStore, config: &Config) {
    if !store.all().is_empty() {
        return;
    }
    let mut sysop = User::new("sysop", &hash_password("sysop"), "STAFF");
    sysop.flags = (UserFlags::MASTER
        | UserFlags::SITEOP
        | UserFlags::DOWNLOAD
        | UserFlags::UPLOAD
        | UserFlags::ACTIVE)
        .to_raw();
    sysop.credits_kb = config.storage.default_credits_kb;
    if store.try_add(sysop).is_ok() {
        warn!("user store was empty; created default account 'sysop' (change its password)");
    }
}

/// Builds the shared TLS acceptor from PEM cert/key files.
pub fn build_tls_acceptor(cert_path: &Path, key_path: &Path) -> anyhow::Result<TlsAcceptor> {
    let cert_bytes = std::fs::read(cert_path)
        .with_context(|| format!("cannot read certificate {}", cert_path.display()))?;
    let mut cert_reader = BufReader::new(&cert_bytes[..]);
    let cert_chain: Vec<rustls::pki_types::CertificateDer<'static>> =
        rustls_pemfile::certs(&mut cert_reader)
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("cannot parse certificate {}", cert_path.display()))?
            .into_iter()
            .map(|c| c.into_owned())
            .collect();
    if cert_chain.is_empty() {
        return Err(anyhow!("no certificates found in {}", cert_path.display()));
    }

    let key_bytes = std::fs::read(key_path)
        .with_context(|| format!("cannot read key {}", key_path.display()))?;
    let mut key_reader = BufReader::new(&key_bytes[..]);
    let key: rustls::pki_types::PrivateKeyDer<'static> =
        rustls_pemfile::private_key(&mut key_reader)
            .with_context(|| format!("cannot parse key {}", key_path.display()))?
            .ok_or_else(|| anyhow!("no private key found in {}", key_path.display()))?;

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .context("cannot build TLS server config")?;
    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &Path, config: &Config) -> std::path::PathBuf {
        let path = dir.join("config.json");
        std::fs::write(&path, serde_json::to_string_pretty(config).unwrap()).unwrap();
        path
    }

    #[test]
    fn load_generates_missing_config() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        let snapshot = load(&path).unwrap();
        assert!(path.exists());
        assert_eq!(snapshot.protection_default, ProtectionLevel::Clear);
        // Bootstrap account exists.
        assert!(snapshot.users.find("sysop").is_some());
    }

    #[test]
    fn reload_reports_exactly_the_changed_sections() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.sections.insert("MP3".to_string(), crate::config::SectionConfig {
            virtual_root: "/mp3".to_string(),
            ..crate::config::SectionConfig::default()
        });
        let path = write_config(tmp.path(), &config);
        let first = load(&path).unwrap();

        config.sections.get_mut("MP3").unwrap().free_leech = true;
        config.server.idle_timeout_secs = 123;
        write_config(tmp.path(), &config);

        let (second, changed) = reload(&path, &first).unwrap();
        assert_eq!(changed, vec!["Sections", "Server"]);
        assert!(second.sections.section_for("/mp3/x").free_leech);
        // Long-lived state is the same object.
        assert!(Arc::ptr_eq(&first.races, &second.races));
        assert!(Arc::ptr_eq(&first.pre, &second.pre));
        assert!(Arc::ptr_eq(&first.events, &second.events));
    }

    #[test]
    fn snapshot_cell_swaps_atomically() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        let first = Arc::new(load(&path).unwrap());
        let cell = SnapshotCell::new(first.clone());
        assert!(Arc::ptr_eq(&cell.current(), &first));

        let (second, _) = reload(&path, &first).unwrap();
        let second = Arc::new(second);
        cell.swap(second.clone());
        assert!(Arc::ptr_eq(&cell.current(), &second));
    }
}
