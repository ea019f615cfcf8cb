//! Pre-login access gates.
//!
//! Applied in a fixed order once `PASS` has validated the password: TLS
//! requirement, IP mask, IDENT, concurrent-login cap, disabled flag. The
//! first gate that fails decides the rejection the client sees.

use std::net::IpAddr;

use tracing::debug;

use crate::config::{IdentConfig, ServerConfig};
use crate::error::{FtpError, FtpResult};
use crate::events::EventBus;
use crate::users::User;

/// Facts about the connection the gates need.
pub struct LoginAttempt {
    pub client_ip: IpAddr,
    pub client_port: u16,
    pub server_port: u16,
    pub control_is_tls: bool,
}

/// Matches `a.b.c.*`-style wildcard masks and `a.b.c.d/n` CIDR masks.
/// An empty mask accepts any address.
pub fn ip_mask_matches(mask: &str, ip: IpAddr) -> bool {
    let mask = mask.trim();
    if mask.is_empty() {
        return true;
    }
    if let Some((net, bits)) = mask.split_once('/') {
        return cidr_matches(net, bits, ip);
    }
    wildcard_matches(mask, ip)
}

fn wildcard_matches(mask: &str, ip: IpAddr) -> bool {
    let addr = ip.to_string();
    let mask_parts: Vec<&str> = mask.split('.').collect();
    let addr_parts: Vec<&str> = addr.split('.').collect();
    if mask_parts.len() != addr_parts.len() {
        return false;
    }
    mask_parts
        .iter()
        .zip(addr_parts.iter())
        .all(|(m, a)| *m == "*" || m.eq_ignore_ascii_case(a))
}

fn cidr_matches(net: &str, bits: &str, ip: IpAddr) -> bool {
    let Ok(bits) = bits.parse::<u32>() else {
        return false;
    };
    match (net.parse::<IpAddr>(), ip) {
        (Ok(IpAddr::V4(net)), IpAddr::V4(ip)) => {
            if bits > 32 {
                return false;
            }
            if bits == 0 {
                return true;
            }
            let shift = 32 - bits;
            (u32::from(net) >> shift) == (u32::from(ip) >> shift)
        }
        (Ok(IpAddr::V6(net)), IpAddr::V6(ip)) => {
            if bits > 128 {
                return false;
            }
            if bits == 0 {
                return true;
            }
            let shift = 128 - bits;
            (u128::from(net) >> shift) == (u128::from(ip) >> shift)
        }
        _ => false,
    }
}

/// Runs every gate in order; `Ok` means the login may proceed.
pub async fn check_login(
    user: &User,
    attempt: &LoginAttempt,
    server: &ServerConfig,
    ident: &IdentConfig,
    bus: &EventBus,
) -> FtpResult<()> {
    if server.require_tls_for_auth && !attempt.control_is_tls {
        return Err(FtpError::TlsRequired("control channel must be TLS before PASS".to_string()));
    }

    if !ip_mask_matches(&user.allowed_ip_mask, attempt.client_ip) {
        debug!("ip mask {:?} rejected {}", user.allowed_ip_mask, attempt.client_ip);
        return Err(FtpError::Auth(format!("address {} not permitted", attempt.client_ip)));
    }

    if ident.enabled && user.require_ident_match {
        let reply = crate::ident::lookup(
            attempt.client_ip,
            attempt.client_port,
            attempt.server_port,
            ident.port,
            std::time::Duration::from_secs(ident.timeout_secs.max(1)),
        )
        .await;
        // Lookup failure counts as a mismatch.
        let matched = reply
            .as_deref()
            .map(|id| id.eq_ignore_ascii_case(&user.required_ident))
            .unwrap_or(false);
        if !matched {
            return Err(FtpError::Auth(format!(
                "ident mismatch (got {:?})",
                reply.unwrap_or_default()
            )));
        }
    }

    let cap = user.limits.max_concurrent_logins;
    if cap > 0 && bus.sessions_for_user(&user.name).len() >= cap as usize {
        return Err(FtpError::ResourceExhausted(format!(
            "too many concurrent logins for {} (max {})",
            user.name, cap
        )));
    }

    if user.is_disabled() {
        return Err(FtpError::Auth(format!("account {} is disabled", user.name)));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_mask_accepts_everything() {
        assert!(ip_mask_matches("", "1.2.3.4".parse().unwrap()));
        assert!(ip_mask_matches("  ", "::1".parse().unwrap()));
    }

    #[test]
    fn wildcard_masks() {
        let ip: IpAddr = "192.168.4.7".parse().unwrap();
        assert!(ip_mask_matches("192.168.4.*", ip));
        assert!(ip_mask_matches("192.168.*.*", ip));
        assert!(ip_mask_matches("192.168.4.7", ip));
        assert!(!ip_mask_matches("192.168.5.*", ip));
        assert!(!ip_mask_matches("10.*.*.*", ip));
    }

    #[test]
    fn cidr_masks() {
        let ip: IpAddr = "192.168.4.7".parse().unwrap();
        assert!(ip_mask_matches("192.168.0.0/16", ip));
        assert!(ip_mask_matches("192.168.4.0/24", ip));
        assert!(!ip_mask_matches("192.169.0.0/16", ip));
        assert!(ip_mask_matches("0.0.0.0/0", ip));
        assert!(!ip_mask_matches("192.168.0.0/99", ip));
    }

    #[tokio::test]
    async fn disabled_account_is_rejected_last() {
        let mut user = User::new("alice", "x", "staff");
        user.flags = "BDU".to_string();
        let attempt = LoginAttempt {
            client_ip: "127.0.0.1".parse().unwrap(),
            client_port: 50000,
            server_port: 21,
            control_is_tls: true,
        };
        let bus = EventBus::new(8);
        let err = check_login(
            &user,
            &attempt,
            &ServerConfig::default(),
            &IdentConfig::default(),
            &bus,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, FtpError::Auth(_)));
    }

    #[tokio::test]
    async fn tls_requirement_gates_first() {
        let user = User::new("alice", "x", "staff");
        let attempt = LoginAttempt {
            client_ip: "127.0.0.1".parse().unwrap(),
            client_port: 50000,
            server_port: 21,
            control_is_tls: false,
        };
        let mut server = ServerConfig::default();
        server.require_tls_for_auth = true;
        let bus = EventBus::new(8);
        let err = check_login(&user, &attempt, &server, &IdentConfig::default(), &bus)
            .await
            .unwrap_err();
        assert!(matches!(err, FtpError::TlsRequired(_)));
    }
}
