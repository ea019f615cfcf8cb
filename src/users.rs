//! User and group account model.
//!
//! Accounts are produced by the user-store contract and consumed read-mostly
//! by sessions. The legacy flag string (one character per capability) is kept
//! as the serialized form; in memory the flags live in a [`UserFlags`] bitset
//! so permission checks are plain bit tests instead of substring scans.

use std::collections::BTreeSet;
use std::time::Duration;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Capability bits carried by every account.
    ///
    /// Each bit corresponds to one character of the legacy flag string.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct UserFlags: u16 {
        /// `M`: master, full administrative rights.
        const MASTER = 1 << 0;
        /// `S`: siteop, operational SITE commands.
        const SITEOP = 1 << 1;
        /// `1`: staff, legacy marker, informational.
        const STAFF = 1 << 2;
        /// `H`: hidden from WHO listings for non-staff.
        const HIDDEN = 1 << 3;
        /// `R`: exempt from ratio accounting.
        const NO_RATIO = 1 << 4;
        /// `Z`: FXP (site-to-site data endpoints) permitted.
        const FXP = 1 << 5;
        /// `V`: active-mode (PORT/EPRT) data connections permitted.
        const ACTIVE = 1 << 6;
        /// `B`: account disabled; login is refused.
        const DISABLED = 1 << 7;
        /// `A`: anonymous/guest account.
        const ANONYMOUS = 1 << 8;
        /// `D`: downloads permitted.
        const DOWNLOAD = 1 << 9;
        /// `U`: uploads permitted.
        const UPLOAD = 1 << 10;
    }
}

/// Character assigned to each flag in the serialized string, canonical order.
const FLAG_CHARS: &[(char, UserFlags)] = &[
    ('M', UserFlags::MASTER),
    ('S', UserFlags::SITEOP),
    ('1', UserFlags::STAFF),
    ('H', UserFlags::HIDDEN),
    ('R', UserFlags::NO_RATIO),
    ('Z', UserFlags::FXP),
    ('V', UserFlags::ACTIVE),
    ('B', UserFlags::DISABLED),
    ('A', UserFlags::ANONYMOUS),
    ('D', UserFlags::DOWNLOAD),
    ('U', UserFlags::UPLOAD),
];

impl UserFlags {
    /// Parses the legacy flag string. Unknown characters are ignored.
    pub fn from_raw(raw: &str) -> UserFlags {
        let mut flags = UserFlags::empty();
        for ch in raw.chars() {
            let upper = ch.to_ascii_uppercase();
            if let Some((_, f)) = FLAG_CHARS.iter().find(|(c, _)| *c == upper) {
                flags |= *f;
            }
        }
        flags
    }

    /// Serializes back to the legacy flag string in canonical order.
    pub fn to_raw(self) -> String {
        FLAG_CHARS
            .iter()
            .filter(|(_, f)| self.contains(*f))
            .map(|(c, _)| *c)
            .collect()
    }

    /// Master rights imply siteop rights for command gating.
    pub fn is_siteop(self) -> bool {
        self.intersects(UserFlags::MASTER | UserFlags::SITEOP)
    }

    pub fn is_admin(self) -> bool {
        self.contains(UserFlags::MASTER)
    }
}

/// Per-user transfer and session limits. Zero means unlimited / server default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UserLimits {
    /// Upload cap in KiB per second.
    pub max_upload_kbps: u32,
    /// Download cap in KiB per second.
    pub max_download_kbps: u32,
    /// Maximum simultaneous logins for this account.
    pub max_concurrent_logins: u32,
    /// Idle timeout in seconds before the session is dropped.
    pub idle_timeout_secs: u32,
}

impl UserLimits {
    /// Effective idle timeout, falling back to the server default.
    pub fn idle_timeout(&self, server_default: Duration) -> Duration {
        if self.idle_timeout_secs == 0 {
            server_default
        } else {
            Duration::from_secs(u64::from(self.idle_timeout_secs))
        }
    }
}

/// A user account as stored and authenticated by the user-store contract.
///
/// Names compare case-insensitively; `name` preserves the case used at
/// creation. `credits_kb` never goes below zero; the credit engine checks
/// before debiting and clamps reversals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub name: String,
    /// Opaque digest produced by the store implementation.
    pub password_hash: String,
    /// Virtual home directory, absolute.
    pub home_dir: String,
    pub primary_group: String,
    pub secondary_groups: BTreeSet<String>,
    /// Serialized capability flags, see [`UserFlags`].
    pub flags: String,
    /// `a.b.c.*`-style wildcard or CIDR mask; empty accepts any address.
    pub allowed_ip_mask: String,
    /// Expected IDENT reply, compared case-insensitively when required.
    pub required_ident: String,
    pub require_ident_match: bool,
    pub limits: UserLimits,
    pub credits_kb: u64,
}

impl User {
    /// Creates an account with the defaults a fresh `SITE ADDUSER` produces.
    pub fn new(name: &str, password_hash: &str, group: &str) -> User {
        User {
            name: name.to_string(),
            password_hash: password_hash.to_string(),
            home_dir: "/".to_string(),
            primary_group: group.to_string(),
            secondary_groups: BTreeSet::new(),
            flags: (UserFlags::DOWNLOAD | UserFlags::UPLOAD | UserFlags::ACTIVE).to_raw(),
            allowed_ip_mask: String::new(),
            required_ident: String::new(),
            require_ident_match: false,
            limits: UserLimits::default(),
            credits_kb: 0,
        }
    }

    pub fn flag_set(&self) -> UserFlags {
        UserFlags::from_raw(&self.flags)
    }

    pub fn is_disabled(&self) -> bool {
        self.flag_set().contains(UserFlags::DISABLED)
    }

    /// Membership test across primary and secondary groups, case-insensitive.
    pub fn in_group(&self, group: &str) -> bool {
        self.primary_group.eq_ignore_ascii_case(group)
            || self.secondary_groups.iter().any(|g| g.eq_ignore_ascii_case(group))
    }
}

/// A user group with its credit multipliers.
///
/// `ratio_multiply` scales download cost, `upload_bonus` scales upload
/// earnings; both are non-negative, 1.0 is neutral.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    pub description: String,
    pub ratio_multiply: f64,
    pub upload_bonus: f64,
    pub flags: String,
}

impl Group {
    pub fn new(name: &str, description: &str) -> Group {
        Group {
            name: name.to_string(),
            description: description.to_string(),
            ratio_multiply: 1.0,
            upload_bonus: 1.0,
            flags: String::new(),
        }
    }
}

/// Neutral group applied when an account references a missing group.
pub fn fallback_group(name: &str) -> Group {
    Group::new(name, "unknown group")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_string_round_trip() {
        let flags = UserFlags::from_raw("MDU");
        assert!(flags.is_admin());
        assert!(flags.contains(UserFlags::DOWNLOAD | UserFlags::UPLOAD));
        assert_eq!(flags.to_raw(), "MDU");
    }

    #[test]
    fn unknown_flag_characters_are_dropped() {
        let flags = UserFlags::from_raw("Mx9U");
        assert_eq!(flags, UserFlags::MASTER | UserFlags::UPLOAD);
    }

    #[test]
    fn master_implies_siteop() {
        assert!(UserFlags::from_raw("M").is_siteop());
        assert!(UserFlags::from_raw("S").is_siteop());
        assert!(!UserFlags::from_raw("S").is_admin());
    }

    #[test]
    fn group_membership_is_case_insensitive() {
        let mut user = User::new("alice", "x", "STAFF");
        user.secondary_groups.insert("Couriers".to_string());
        assert!(user.in_group("staff"));
        assert!(user.in_group("COURIERS"));
        assert!(!user.in_group("nobody"));
    }
}
