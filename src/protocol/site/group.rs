//! SITE group verbs.

use crate::error::{FtpError, FtpResult};
use crate::protocol::reply::Reply;
use crate::session::Session;
use crate::users::Group;

pub async fn site_groups(session: &mut Session, _arg: String) -> FtpResult<()> {
    let mut groups = session.snapshot.groups.all();
    groups.sort_by(|a, b| a.name.to_ascii_lowercase().cmp(&b.name.to_ascii_lowercase()));
    let mut lines = vec!["Groups:".to_string()];
    for group in groups {
        lines.push(format!(
            " {:<16} ratio x{:<4} bonus x{:<4} {}",
            group.name, group.ratio_multiply, group.upload_bonus, group.description
        ));
    }
    lines.push("End".to_string());
    session.send(Reply::multi(200, lines)).await
}

pub async fn site_groupinfo(session: &mut Session, arg: String) -> FtpResult<()> {
    let name = arg.trim();
    if name.is_empty() {
        return Err(FtpError::bad_arg("usage: SITE GROUPINFO <group>"));
    }
    let group = session
        .snapshot
        .groups
        .find(name)
        .ok_or_else(|| FtpError::NotFound(format!("no such group {name}")))?;
    let members = member_count(session, &group.name);
    let lines = vec![
        format!("Group {}", group.name),
        format!(" Description: {}", group.description),
        format!(" Ratio multiplier: {}", group.ratio_multiply),
        format!(" Upload bonus: {}", group.upload_bonus),
        format!(" Members: {members}"),
        "End".to_string(),
    ];
    session.send(Reply::multi(200, lines)).await
}

fn member_count(session: &Session, group: &str) -> usize {
    session.snapshot.users.all().iter().filter(|u| u.in_group(group)).count()
}

pub async fn site_groupmembers(session: &mut Session, arg: String) -> FtpResult<()> {
    let name = arg.trim();
    if name.is_empty() {
        return Err(FtpError::bad_arg("usage: SITE GROUPMEMBERS <group>"));
    }
    let mut lines = vec![format!("Members of {name}:")];
    let mut members: Vec<String> = session
        .snapshot
        .users
        .all()
        .into_iter()
        .filter(|u| u.in_group(name))
        .map(|u| u.name)
        .collect();
    members.sort();
    for member in members {
        lines.push(format!(" {member}"));
    }
    lines.push("End".to_string());
    session.send(Reply::multi(200, lines)).await
}

pub async fn site_groupadd(session: &mut Session, arg: String) -> FtpResult<()> {
    let (name, description) = match arg.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (arg.trim(), ""),
    };
    if name.is_empty() {
        return Err(FtpError::bad_arg("usage: SITE GROUPADD <group> [description]"));
    }
    session
        .snapshot
        .groups
        .try_add(Group::new(name, description))
        .map_err(|e| FtpError::Store(e.to_string()))?;
    session.send_line(200, format!("Group {name} added.")).await
}

pub async fn site_groupdel(session: &mut Session, arg: String) -> FtpResult<()> {
    let name = arg.trim();
    if name.is_empty() {
        return Err(FtpError::bad_arg("usage: SITE GROUPDEL <group>"));
    }
    if member_count(session, name) > 0 {
        return Err(FtpError::Permission(format!("group {name} still has members")));
    }
    session
        .snapshot
        .groups
        .try_delete(name)
        .map_err(|e| FtpError::Store(e.to_string()))?;
    session.send_line(200, format!("Group {name} deleted.")).await
}
