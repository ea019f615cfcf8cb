//! JSON configuration file handling.
//!
//! The file is a single object with one member per subsystem (`Server`,
//! `Tls`, `Storage`, …). Loading is strict about shape but forgiving about
//! omissions: every field carries a default so a partial file is usable and
//! a missing file is generated with the defaults. The reload coordinator
//! compares the raw section values structurally to report what changed.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Data-channel protection level negotiated via `PROT` (RFC 4217).
///
/// `Safe` and `Confidential` are accepted on the wire and treated as
/// `Clear` for the data stream; only `Private` wraps data in TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum ProtectionLevel {
    #[default]
    Clear,
    Safe,
    Confidential,
    Private,
}

impl ProtectionLevel {
    /// Parses both the long names and the RFC 2228 single-letter codes.
    pub fn parse_label(label: &str) -> Option<ProtectionLevel> {
        match label.trim().to_ascii_uppercase().as_str() {
            "C" | "CLEAR" => Some(ProtectionLevel::Clear),
            "S" | "SAFE" => Some(ProtectionLevel::Safe),
            "E" | "CONFIDENTIAL" => Some(ProtectionLevel::Confidential),
            "P" | "PRIVATE" => Some(ProtectionLevel::Private),
            _ => None,
        }
    }

    pub fn letter(self) -> char {
        match self {
            ProtectionLevel::Clear => 'C',
            ProtectionLevel::Safe => 'S',
            ProtectionLevel::Confidential => 'E',
            ProtectionLevel::Private => 'P',
        }
    }

    /// Whether the data socket must be wrapped in TLS at this level.
    pub fn wraps_data(self) -> bool {
        self == ProtectionLevel::Private
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ServerConfig {
    /// Control listener, `ip:port`.
    pub listen_addr: String,
    /// Inclusive passive data port range.
    pub passive_port_start: u16,
    pub passive_port_end: u16,
    /// Address advertised in PASV replies; empty uses the control socket's.
    pub passive_advertise_ip: String,
    /// Sessions allowed per IP bucket; 0 disables the check.
    pub max_connections_per_ip: u32,
    /// Leading octets forming the admission bucket key.
    pub ip_bucket_octets: u8,
    pub allow_anonymous: bool,
    pub anonymous_user: String,
    /// Refuse PASS on a plaintext control channel.
    pub require_tls_for_auth: bool,
    pub idle_timeout_secs: u64,
    /// Seconds granted to live sessions during shutdown.
    pub shutdown_grace_secs: u64,
    /// `Clear`/`Safe`/`Confidential`/`Private` or `C`/`S`/`E`/`P`.
    pub data_channel_protection_default: String,
    /// Per-subscriber event queue depth.
    pub event_queue_capacity: usize,
    /// Hours a PRE announcement stays visible.
    pub pre_ttl_hours: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen_addr: "0.0.0.0:2121".to_string(),
            passive_port_start: 50000,
            passive_port_end: 50999,
            passive_advertise_ip: String::new(),
            max_connections_per_ip: 10,
            ip_bucket_octets: 2,
            allow_anonymous: false,
            anonymous_user: "anonymous".to_string(),
            require_tls_for_auth: false,
            idle_timeout_secs: 600,
            shutdown_grace_secs: 30,
            data_channel_protection_default: "Clear".to_string(),
            event_queue_capacity: 1024,
            pre_ttl_hours: 48,
        }
    }
}

impl ServerConfig {
    /// Resolved protection default; invalid labels warn and fall back to Clear.
    pub fn protection_default(&self) -> ProtectionLevel {
        match ProtectionLevel::parse_label(&self.data_channel_protection_default) {
            Some(level) => level,
            None => {
                warn!(
                    "Invalid DataChannelProtectionDefault {:?}, using Clear",
                    self.data_channel_protection_default
                );
                ProtectionLevel::Clear
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub cert_path: String,
    pub key_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct StorageConfig {
    /// Directory holding the store implementations' files.
    pub data_dir: String,
    /// Credits granted to accounts created by SITE ADDUSER.
    pub default_credits_kb: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig { data_dir: "./data".to_string(), default_credits_kb: 100 * 1024 }
    }
}

/// One virtual-to-physical mount.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct MountConfig {
    pub virtual_path: String,
    pub physical_path: String,
    /// Restricts the mount to these users; empty means global.
    pub users: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct VfsConfig {
    pub mounts: Vec<MountConfig>,
    /// Physical root under which user home directories live.
    pub home_root: String,
}

impl Default for VfsConfig {
    fn default() -> Self {
        VfsConfig { mounts: Vec::new(), home_root: "./site".to_string() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct IdentConfig {
    pub enabled: bool,
    pub timeout_secs: u64,
    pub port: u16,
}

impl Default for IdentConfig {
    fn default() -> Self {
        IdentConfig { enabled: false, timeout_secs: 5, port: 113 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SectionConfig {
    pub virtual_root: String,
    pub allow_upload: bool,
    pub allow_download: bool,
    pub free_leech: bool,
    pub ratio_up: u32,
    pub ratio_down: u32,
    pub upload_multiplier: f64,
    pub download_multiplier: f64,
    pub nuke_multiplier: f64,
    pub aliases: Vec<String>,
}

impl Default for SectionConfig {
    fn default() -> Self {
        SectionConfig {
            virtual_root: "/".to_string(),
            allow_upload: true,
            allow_download: true,
            free_leech: false,
            ratio_up: 1,
            ratio_down: 1,
            upload_multiplier: 1.0,
            download_multiplier: 1.0,
            nuke_multiplier: 3.0,
            aliases: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DirectoryRuleConfig {
    pub enabled: bool,
    pub allow_upload: bool,
    pub allow_download: bool,
    pub allow_list: bool,
    pub free: Option<bool>,
    /// `(up, down)` ratio override.
    pub ratio: Option<(u32, u32)>,
    pub cost_multiplier: Option<f64>,
    pub upload_bonus: Option<f64>,
}

impl Default for DirectoryRuleConfig {
    fn default() -> Self {
        DirectoryRuleConfig {
            enabled: true,
            allow_upload: true,
            allow_download: true,
            allow_list: true,
            free: None,
            ratio: None,
            cost_multiplier: None,
            upload_bonus: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RatioRuleConfig {
    pub free: bool,
    pub ratio: Option<(u32, u32)>,
    pub cost_multiplier: Option<f64>,
    pub upload_bonus: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct GroupConfig {
    pub description: String,
    pub ratio_multiply: f64,
    pub upload_bonus: f64,
    pub flags: String,
}

impl Default for GroupConfig {
    fn default() -> Self {
        GroupConfig {
            description: String::new(),
            ratio_multiply: 1.0,
            upload_bonus: 1.0,
            flags: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct FxpPolicyConfig {
    /// Data endpoints on foreign addresses allowed at all.
    pub allow_fxp: bool,
    /// PASV data connection may come from an address other than the client's.
    pub allow_foreign_pasv: bool,
    /// PORT/EPRT may name an address other than the client's.
    pub allow_foreign_port: bool,
}

impl Default for FxpPolicyConfig {
    fn default() -> Self {
        FxpPolicyConfig { allow_fxp: false, allow_foreign_pasv: false, allow_foreign_port: false }
    }
}

/// IRC announcer endpoint; the announcer itself subscribes to the event bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct IrcConfig {
    pub enabled: bool,
    pub server: String,
    pub port: u16,
    pub nick: String,
    pub channels: Vec<String>,
}

impl Default for IrcConfig {
    fn default() -> Self {
        IrcConfig {
            enabled: false,
            server: String::new(),
            port: 6667,
            nick: "raceftpd".to_string(),
            channels: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ZipscriptConfig {
    pub enabled: bool,
    /// Refuse non-SFV uploads into releases that have no SFV yet.
    pub require_sfv_first: bool,
}

impl Default for ZipscriptConfig {
    fn default() -> Self {
        ZipscriptConfig { enabled: true, require_sfv_first: false }
    }
}

/// HTTP status endpoint; served by an external collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct StatusConfig {
    pub enabled: bool,
    pub listen_addr: String,
}

impl Default for StatusConfig {
    fn default() -> Self {
        StatusConfig { enabled: false, listen_addr: "127.0.0.1:8080".to_string() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CompatibilityConfig {
    /// Answer the RFC 775 X-prefixed verbs (XPWD, XCWD, …).
    pub accept_x_verbs: bool,
    /// Append `.NUKED` (with timestamp fallback) when nuking renames.
    pub nuke_rename_suffix: String,
}

impl Default for CompatibilityConfig {
    fn default() -> Self {
        CompatibilityConfig { accept_x_verbs: true, nuke_rename_suffix: ".NUKED".to_string() }
    }
}

/// The whole configuration file.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Config {
    pub server: ServerConfig,
    pub tls: TlsConfig,
    pub storage: StorageConfig,
    pub vfs: VfsConfig,
    pub ident: IdentConfig,
    pub sections: BTreeMap<String, SectionConfig>,
    pub directory_rules: BTreeMap<String, DirectoryRuleConfig>,
    pub ratio_rules: BTreeMap<String, RatioRuleConfig>,
    pub groups: BTreeMap<String, GroupConfig>,
    pub fxp_policy: FxpPolicyConfig,
    pub irc: IrcConfig,
    pub zipscript: ZipscriptConfig,
    pub status: StatusConfig,
    pub compatibility: CompatibilityConfig,
}

/// Configuration failures are fatal at startup (exit code 2).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read { path: String, source: std::io::Error },
    #[error("cannot write {path}: {source}")]
    Write { path: String, source: std::io::Error },
    #[error("invalid JSON in {path}: {source}")]
    Parse { path: String, source: serde_json::Error },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl Config {
    /// Loads the file at `path`, generating a default file if it is missing.
    pub fn load_or_create(path: &Path) -> Result<Config, ConfigError> {
        if !path.exists() {
            let config = Config::default();
            let text = serde_json::to_string_pretty(&config).expect("default config serializes");
            std::fs::write(path, text).map_err(|e| ConfigError::Write {
                path: path.display().to_string(),
                source: e,
            })?;
            info!("Generated default configuration at {}", path.display());
            return Ok(config);
        }
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        let config: Config = serde_json::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Structural sanity checks beyond what serde enforces.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.passive_port_start > self.server.passive_port_end {
            return Err(ConfigError::Invalid(format!(
                "passive port range {}..{} is empty",
                self.server.passive_port_start, self.server.passive_port_end
            )));
        }
        if self.server.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "Server.ListenAddr {:?} is not ip:port",
                self.server.listen_addr
            )));
        }
        if !(1..=4).contains(&self.server.ip_bucket_octets) {
            return Err(ConfigError::Invalid(format!(
                "Server.IpBucketOctets must be 1..=4, got {}",
                self.server.ip_bucket_octets
            )));
        }
        for (name, section) in &self.sections {
            if !section.virtual_root.starts_with('/') {
                return Err(ConfigError::Invalid(format!(
                    "section {name}: VirtualRoot {:?} must start with '/'",
                    section.virtual_root
                )));
            }
            if section.ratio_up == 0 {
                return Err(ConfigError::Invalid(format!("section {name}: RatioUp must be > 0")));
            }
        }
        for (name, group) in &self.groups {
            if group.ratio_multiply < 0.0 || group.upload_bonus < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "group {name}: multipliers must be non-negative"
                )));
            }
        }
        if self.tls.enabled && (self.tls.cert_path.is_empty() || self.tls.key_path.is_empty()) {
            return Err(ConfigError::Invalid(
                "Tls.Enabled requires CertPath and KeyPath".to_string(),
            ));
        }
        Ok(())
    }

    /// Raw top-level section values for reload diffing.
    pub fn section_values(&self) -> BTreeMap<&'static str, serde_json::Value> {
        let mut map = BTreeMap::new();
        let mut put = |name: &'static str, value: serde_json::Value| {
            map.insert(name, value);
        };
        put("Server", serde_json::to_value(&self.server).unwrap_or_default());
        put("Tls", serde_json::to_value(&self.tls).unwrap_or_default());
        put("Storage", serde_json::to_value(&self.storage).unwrap_or_default());
        put("Vfs", serde_json::to_value(&self.vfs).unwrap_or_default());
        put("Ident", serde_json::to_value(&self.ident).unwrap_or_default());
        put("Sections", serde_json::to_value(&self.sections).unwrap_or_default());
        put("DirectoryRules", serde_json::to_value(&self.directory_rules).unwrap_or_default());
        put("RatioRules", serde_json::to_value(&self.ratio_rules).unwrap_or_default());
        put("Groups", serde_json::to_value(&self.groups).unwrap_or_default());
        put("FxpPolicy", serde_json::to_value(&self.fxp_policy).unwrap_or_default());
        put("Irc", serde_json::to_value(&self.irc).unwrap_or_default());
        put("Zipscript", serde_json::to_value(&self.zipscript).unwrap_or_default());
        put("Status", serde_json::to_value(&self.status).unwrap_or_default());
        put("Compatibility", serde_json::to_value(&self.compatibility).unwrap_or_default());
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protection_labels_parse_both_forms() {
        assert_eq!(ProtectionLevel::parse_label("P"), Some(ProtectionLevel::Private));
        assert_eq!(ProtectionLevel::parse_label("private"), Some(ProtectionLevel::Private));
        assert_eq!(ProtectionLevel::parse_label("E"), Some(ProtectionLevel::Confidential));
        assert_eq!(ProtectionLevel::parse_label("Clear"), Some(ProtectionLevel::Clear));
        assert_eq!(ProtectionLevel::parse_label("bogus"), None);
    }

    #[test]
    fn invalid_protection_default_falls_back_to_clear() {
        let mut server = ServerConfig::default();
        server.data_channel_protection_default = "QUANTUM".to_string();
        assert_eq!(server.protection_default(), ProtectionLevel::Clear);
    }

    #[test]
    fn default_config_validates() {
        Config::default().validate().expect("defaults are valid");
    }

    #[test]
    fn empty_passive_range_is_rejected() {
        let mut config = Config::default();
        config.server.passive_port_start = 51000;
        config.server.passive_port_end = 50000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn section_roots_must_be_absolute() {
        let mut config = Config::default();
        config.sections.insert("MP3".to_string(), SectionConfig {
            virtual_root: "MP3".to_string(),
            ..SectionConfig::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn section_values_cover_every_top_level_member() {
        let values = Config::default().section_values();
        for name in [
            "Server", "Tls", "Storage", "Vfs", "Ident", "Sections", "DirectoryRules",
            "RatioRules", "Groups", "FxpPolicy", "Irc", "Zipscript", "Status", "Compatibility",
        ] {
            assert!(values.contains_key(name), "missing section {name}");
        }
    }
}
