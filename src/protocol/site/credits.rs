//! SITE credit verbs.

use crate::error::{FtpError, FtpResult};
use crate::session::Session;

pub async fn site_credits(session: &mut Session, _arg: String) -> FtpResult<()> {
    let name = session.require_user()?.name.clone();
    let balance = session
        .snapshot
        .users
        .find(&name)
        .map(|u| u.credits_kb)
        .ok_or_else(|| FtpError::Store(format!("unknown user {name}")))?;
    session.send_line(200, format!("You have {balance} KiB of credit.")).await
}

fn parse_args(arg: &str, usage: &str) -> FtpResult<(String, u64)> {
    let words: Vec<&str> = arg.split_whitespace().collect();
    let [name, amount] = words.as_slice() else {
        return Err(FtpError::bad_arg(usage));
    };
    let kb: u64 =
        amount.parse().map_err(|_| FtpError::bad_arg(format!("bad amount {amount:?}")))?;
    Ok((name.to_string(), kb))
}

pub async fn site_givecred(session: &mut Session, arg: String) -> FtpResult<()> {
    let (name, kb) = parse_args(&arg, "usage: SITE GIVECRED <user> <kb>")?;
    let balance = session.snapshot.credits.earn(&name, kb)?;
    session.send_line(200, format!("{kb} KiB given to {name}, balance {balance} KiB.")).await
}

pub async fn site_takecred(session: &mut Session, arg: String) -> FtpResult<()> {
    let (name, kb) = parse_args(&arg, "usage: SITE TAKECRED <user> <kb>")?;
    let snapshot = session.snapshot.clone();
    let mut user = snapshot
        .users
        .find(&name)
        .ok_or_else(|| FtpError::NotFound(format!("no such user {name}")))?;
    user.credits_kb = user.credits_kb.saturating_sub(kb);
    let balance = user.credits_kb;
    snapshot.users.try_update(user).map_err(|e| FtpError::Store(e.to_string()))?;
    session.send_line(200, format!("{kb} KiB taken from {name}, balance {balance} KiB.")).await
}
