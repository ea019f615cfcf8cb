//! Error taxonomy for the daemon.
//!
//! Every fallible operation in the command and transfer paths returns an
//! [`FtpError`]. The variant decides the three-digit reply code sent to the
//! client, so handlers can propagate with `?` and let the session loop
//! translate the failure into a wire response.

use std::io;

use thiserror::Error;

/// Convenient result alias used throughout the command and transfer paths.
pub type FtpResult<T> = Result<T, FtpError>;

/// Classified failure produced by the protocol runtime and engines.
#[derive(Debug, Error)]
pub enum FtpError {
    /// Login rejected: bad credentials, IP mask, IDENT or disabled account.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Operation denied by permission bits, directory rules or section flags.
    #[error("permission denied: {0}")]
    Permission(String),

    /// Virtual or physical path did not resolve.
    #[error("not found: {0}")]
    NotFound(String),

    /// The user's credit balance cannot cover the requested download.
    #[error("insufficient credits: need {need_kb} KiB, have {have_kb} KiB")]
    QuotaExhausted { need_kb: u64, have_kb: u64 },

    /// No passive port free, connection table full, or similar exhaustion.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Malformed argument or command issued out of sequence.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Command sequencing error (e.g. RNTO without RNFR).
    #[error("bad command sequence: {0}")]
    BadSequence(String),

    /// The server requires TLS before this command is acceptable.
    #[error("TLS required: {0}")]
    TlsRequired(String),

    /// Control-channel idle timeout.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Data-connection handshake never completed.
    #[error("data connection timed out: {0}")]
    DataTimeout(String),

    /// Transfer cancelled by ABOR or connection loss.
    #[error("transfer aborted")]
    Aborted,

    /// A store contract failed; surfaced to the user, logged at error level.
    #[error("store error: {0}")]
    Store(String),

    /// Underlying I/O failure on a file or socket.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl FtpError {
    /// Maps the error to the FTP reply code the session sends for it.
    ///
    /// `TlsRequired` is 534 during the command phase; the pre-login PASS
    /// rejection uses [`FtpError::auth_reply_code`] instead.
    pub fn reply_code(&self) -> u16 {
        match self {
            FtpError::Auth(_) => 530,
            FtpError::Permission(_) => 550,
            FtpError::NotFound(_) => 550,
            FtpError::QuotaExhausted { .. } => 550,
            FtpError::ResourceExhausted(_) => 421,
            FtpError::Protocol(_) => 501,
            FtpError::BadSequence(_) => 503,
            FtpError::TlsRequired(_) => 534,
            FtpError::Timeout(_) => 421,
            FtpError::DataTimeout(_) => 425,
            FtpError::Aborted => 426,
            FtpError::Store(_) => 550,
            FtpError::Io(_) => 550,
        }
    }

    /// Reply code when the failure happens during login (`PASS`).
    pub fn auth_reply_code(&self) -> u16 {
        match self {
            FtpError::TlsRequired(_) => 530,
            FtpError::ResourceExhausted(_) => 421,
            _ => 530,
        }
    }

    /// Short helper for argument-shape failures.
    pub fn bad_arg(msg: impl Into<String>) -> FtpError {
        FtpError::Protocol(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_codes_follow_taxonomy() {
        assert_eq!(FtpError::Auth("x".into()).reply_code(), 530);
        assert_eq!(FtpError::Permission("x".into()).reply_code(), 550);
        assert_eq!(FtpError::NotFound("x".into()).reply_code(), 550);
        assert_eq!(FtpError::QuotaExhausted { need_kb: 10, have_kb: 1 }.reply_code(), 550);
        assert_eq!(FtpError::ResourceExhausted("x".into()).reply_code(), 421);
        assert_eq!(FtpError::Protocol("x".into()).reply_code(), 501);
        assert_eq!(FtpError::BadSequence("x".into()).reply_code(), 503);
        assert_eq!(FtpError::TlsRequired("x".into()).reply_code(), 534);
        assert_eq!(FtpError::Aborted.reply_code(), 426);
    }

    #[test]
    fn tls_required_during_login_is_530() {
        assert_eq!(FtpError::TlsRequired("x".into()).auth_reply_code(), 530);
    }
}
