//! SITE racing and statistics verbs.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::error::{FtpError, FtpResult};
use crate::protocol::reply::Reply;
use crate::race::RaceSnapshot;
use crate::session::Session;

fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

fn render_race(race: &RaceSnapshot) -> Vec<String> {
    let mut lines = vec![format!(
        "Race {} [{}]: {} file(s), {}",
        race.release_path,
        race.section,
        race.file_count,
        human_bytes(race.total_bytes)
    )];
    for (position, (user, bytes)) in race.standings().into_iter().enumerate() {
        let share = if race.total_bytes > 0 {
            bytes as f64 * 100.0 / race.total_bytes as f64
        } else {
            0.0
        };
        lines.push(format!(
            " {:>2}. {:<16} {:>12} ({share:.1}%)",
            position + 1,
            user,
            human_bytes(bytes)
        ));
    }
    lines
}

pub async fn site_race(session: &mut Session, arg: String) -> FtpResult<()> {
    let target = if arg.trim().is_empty() { session.cwd.clone() } else { arg.trim().to_string() };
    let virtual_path = session.resolve_path(&target);
    let release_path = session
        .snapshot
        .sections
        .release_dir(&virtual_path)
        .map(|r| r.release_path)
        .unwrap_or(virtual_path);
    let race = session
        .snapshot
        .races
        .try_get(&release_path)
        .ok_or_else(|| FtpError::NotFound(format!("no race for {release_path}")))?;
    let mut lines = render_race(&race);
    lines.push("End".to_string());
    session.send(Reply::multi(200, lines)).await
}

pub async fn site_racestats(session: &mut Session, _arg: String) -> FtpResult<()> {
    let races = session.snapshot.races.recent(usize::MAX);
    let total_bytes: u64 = races.iter().map(|r| r.total_bytes).sum();
    let racers: std::collections::BTreeSet<&String> =
        races.iter().flat_map(|r| r.user_bytes.keys()).collect();
    session
        .send_line(
            200,
            format!(
                "{} race(s), {} moved by {} distinct racer(s).",
                races.len(),
                human_bytes(total_bytes),
                racers.len()
            ),
        )
        .await
}

pub async fn site_racelog(session: &mut Session, arg: String) -> FtpResult<()> {
    let count = arg.trim().parse::<usize>().unwrap_or(10);
    let mut lines = vec!["Race log:".to_string()];
    for race in session.snapshot.races.recent(count) {
        lines.extend(render_race(&race));
    }
    lines.push("End".to_string());
    session.send(Reply::multi(200, lines)).await
}

pub async fn site_lastraces(session: &mut Session, arg: String) -> FtpResult<()> {
    let count = arg.trim().parse::<usize>().unwrap_or(10);
    let mut lines = vec![format!("Last {count} race(s):")];
    for race in session.snapshot.races.recent(count) {
        lines.push(format!(
            " {:<40} {:>10} {} racer(s)",
            race.release_path,
            human_bytes(race.total_bytes),
            race.user_bytes.len()
        ));
    }
    lines.push("End".to_string());
    session.send(Reply::multi(200, lines)).await
}

/// Per-user byte totals across races updated since `since` (0 = all time).
fn aggregate(session: &Session, since: u64) -> BTreeMap<String, u64> {
    let mut totals: BTreeMap<String, u64> = BTreeMap::new();
    for race in session.snapshot.races.recent(usize::MAX) {
        if race.last_updated < since {
            continue;
        }
        for (user, bytes) in &race.user_bytes {
            *totals.entry(user.clone()).or_insert(0) += bytes;
        }
    }
    totals
}

async fn send_aggregate(session: &mut Session, title: &str, since: u64) -> FtpResult<()> {
    let totals = aggregate(session, since);
    let mut rows: Vec<(String, u64)> = totals.into_iter().collect();
    rows.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    let mut lines = vec![format!("{title}:")];
    for (position, (user, bytes)) in rows.into_iter().take(20).enumerate() {
        lines.push(format!(" {:>2}. {:<16} {}", position + 1, user, human_bytes(bytes)));
    }
    lines.push("End".to_string());
    session.send(Reply::multi(200, lines)).await
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

pub async fn site_stats(session: &mut Session, arg: String) -> FtpResult<()> {
    let name = if arg.trim().is_empty() {
        session.require_user()?.name.clone()
    } else {
        arg.trim().to_string()
    };
    let user = session
        .snapshot
        .users
        .find(&name)
        .ok_or_else(|| FtpError::NotFound(format!("no such user {name}")))?;
    let uploaded = aggregate(session, 0).get(&user.name).copied().unwrap_or(0);
    let lines = vec![
        format!("Stats for {}:", user.name),
        format!(" Credits: {} KiB", user.credits_kb),
        format!(" Raced: {}", human_bytes(uploaded)),
        format!(" Group: {}", user.primary_group),
        "End".to_string(),
    ];
    session.send(Reply::multi(200, lines)).await
}

pub async fn site_statdaily(session: &mut Session, _arg: String) -> FtpResult<()> {
    send_aggregate(session, "Top uploaders, last 24h", now_secs().saturating_sub(86_400)).await
}

pub async fn site_statweekly(session: &mut Session, _arg: String) -> FtpResult<()> {
    send_aggregate(session, "Top uploaders, last 7d", now_secs().saturating_sub(7 * 86_400)).await
}

pub async fn site_statmonthly(session: &mut Session, _arg: String) -> FtpResult<()> {
    send_aggregate(session, "Top uploaders, last 30d", now_secs().saturating_sub(30 * 86_400))
        .await
}

#[derive(Serialize)]
struct StatsDump {
    races: usize,
    total_bytes: u64,
    per_user: BTreeMap<String, u64>,
}

pub async fn site_statsjson(session: &mut Session, _arg: String) -> FtpResult<()> {
    let races = session.snapshot.races.recent(usize::MAX);
    let dump = StatsDump {
        races: races.len(),
        total_bytes: races.iter().map(|r| r.total_bytes).sum(),
        per_user: aggregate(session, 0),
    };
    let json = serde_json::to_string(&dump).map_err(|e| FtpError::Store(e.to_string()))?;
    session.send_line(200, json).await
}
