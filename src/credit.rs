//! Credit accounting in KiB.
//!
//! Balances live on the user account and are persisted through the
//! user-store contract on every change. Debits check the balance first and
//! reversals clamp at zero, so `credits_kb` never underflows.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{FtpError, FtpResult};
use crate::race::RaceSnapshot;
use crate::store::UserStore;
use crate::users::UserFlags;

/// Debit/credit engine bound to a user store.
pub struct CreditEngine {
    users: Arc<dyn UserStore>,
}

impl CreditEngine {
    pub fn new(users: Arc<dyn UserStore>) -> Self {
        CreditEngine { users }
    }

    /// Debits `kb` from the account, unless the account is ratio-exempt.
    ///
    /// Fails with `QuotaExhausted` when the balance cannot cover the debit;
    /// nothing is persisted in that case.
    pub fn charge(&self, name: &str, kb: u64) -> FtpResult<u64> {
        let mut user = self
            .users
            .find(name)
            .ok_or_else(|| FtpError::Store(format!("unknown user {name}")))?;
        if kb == 0 || user.flag_set().contains(UserFlags::NO_RATIO) {
            return Ok(user.credits_kb);
        }
        if user.credits_kb < kb {
            return Err(FtpError::QuotaExhausted { need_kb: kb, have_kb: user.credits_kb });
        }
        user.credits_kb -= kb;
        let balance = user.credits_kb;
        self.users.try_update(user).map_err(|e| FtpError::Store(e.to_string()))?;
        debug!("charged {} {} KiB, balance {}", name, kb, balance);
        Ok(balance)
    }

    /// Credits `kb` to the account.
    pub fn earn(&self, name: &str, kb: u64) -> FtpResult<u64> {
        let mut user = self
            .users
            .find(name)
            .ok_or_else(|| FtpError::Store(format!("unknown user {name}")))?;
        user.credits_kb = user.credits_kb.saturating_add(kb);
        let balance = user.credits_kb;
        self.users.try_update(user).map_err(|e| FtpError::Store(e.to_string()))?;
        debug!("credited {} {} KiB, balance {}", name, kb, balance);
        Ok(balance)
    }

    /// Reverses the earnings of every racer of a nuked release.
    ///
    /// Each contributor is debited `ceil(bytes/1024) * upload_bonus *
    /// multiplier`, clamped at zero. Missing accounts are skipped with a
    /// warning; a nuke must not fail halfway through.
    pub fn reverse_from_race(
        &self,
        race: &RaceSnapshot,
        upload_bonus: f64,
        multiplier: f64,
    ) -> Vec<(String, u64)> {
        let mut penalties = Vec::new();
        for (name, bytes) in &race.user_bytes {
            let kb = bytes.div_ceil(1024) as f64;
            let penalty = (kb * upload_bonus * multiplier).ceil().max(0.0) as u64;
            match self.users.find(name) {
                Some(mut user) => {
                    user.credits_kb = user.credits_kb.saturating_sub(penalty);
                    if let Err(e) = self.users.try_update(user) {
                        warn!("nuke reversal: cannot update {}: {}", name, e);
                        continue;
                    }
                    penalties.push((name.clone(), penalty));
                }
                None => warn!("nuke reversal: unknown racer {}", name),
            }
        }
        penalties
    }
}
