//! SITE section verbs.

use crate::error::FtpResult;
use crate::protocol::reply::Reply;
use crate::rules::{Decision, TransferOp};
use crate::session::Session;

pub async fn site_sections(session: &mut Session, _arg: String) -> FtpResult<()> {
    let mut lines = vec!["Sections:".to_string()];
    for section in session.snapshot.sections.all() {
        let mut notes = Vec::new();
        if section.free_leech {
            notes.push("free".to_string());
        }
        if !section.allow_upload {
            notes.push("no-up".to_string());
        }
        if !section.allow_download {
            notes.push("no-down".to_string());
        }
        lines.push(format!(
            " {:<12} {:<24} {}:{} nuke x{} {}",
            section.name,
            section.virtual_root,
            section.ratio_up,
            section.ratio_down,
            section.nuke_multiplier,
            notes.join(",")
        ));
    }
    lines.push("End".to_string());
    session.send(Reply::multi(200, lines)).await
}

/// Shows the effective rule decision for a path.
pub async fn site_dirflags(session: &mut Session, arg: String) -> FtpResult<()> {
    let user = session.require_user()?.clone();
    let target = if arg.trim().is_empty() { session.cwd.clone() } else { arg.trim().to_string() };
    let virtual_path = session.resolve_path(&target);
    let snapshot = session.snapshot.clone();

    let section = snapshot.sections.section_for(&virtual_path).clone();
    let group = snapshot.group_of(&user);
    let mut lines = vec![
        format!("Rules for {virtual_path}:"),
        format!(" Section: {} (root {})", section.name, section.virtual_root),
    ];
    for (op, label) in [
        (TransferOp::Upload, "upload"),
        (TransferOp::Download, "download"),
        (TransferOp::List, "list"),
    ] {
        match snapshot.rules.evaluate(&snapshot.sections, &group, &virtual_path, op) {
            Decision::Allow(terms) => lines.push(format!(
                " {label}: allowed (free={}, ratio {}:{}, cost x{:.2}, bonus x{:.2})",
                terms.free, terms.ratio_up, terms.ratio_down, terms.cost_mul, terms.upload_bonus
            )),
            Decision::Deny(reason) => lines.push(format!(" {label}: denied ({reason})")),
        }
    }
    lines.push("End".to_string());
    session.send(Reply::multi(200, lines)).await
}
