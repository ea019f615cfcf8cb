//! SITE command registry and dispatcher.
//!
//! Every administrative verb is a record in one static table: name, the
//! admin/siteop gates, a help string and the handler. Dispatch uppercases
//! the verb, checks the gates (master rights imply siteop for gating) and
//! invokes the handler; failures are logged and surfaced as the error's
//! reply code.

mod credits;
mod group;
mod import;
mod ops;
mod release;
mod section;
mod stats;
mod user;
mod zipscript;

use std::sync::OnceLock;

use futures::future::BoxFuture;
use tracing::{debug, error};

use crate::error::{FtpError, FtpResult};
use crate::protocol::command::CommandLine;
use crate::session::Session;

type SiteHandler = for<'a> fn(&'a mut Session, String) -> BoxFuture<'a, FtpResult<()>>;

/// One SITE verb record.
pub struct SiteVerb {
    pub name: &'static str,
    pub requires_admin: bool,
    pub requires_siteop: bool,
    pub help: &'static str,
    pub execute: SiteHandler,
}

macro_rules! verb {
    ($name:literal, admin, $help:literal, $handler:path) => {
        verb!(@record $name, true, true, $help, $handler)
    };
    ($name:literal, siteop, $help:literal, $handler:path) => {
        verb!(@record $name, false, true, $help, $handler)
    };
    ($name:literal, user, $help:literal, $handler:path) => {
        verb!(@record $name, false, false, $help, $handler)
    };
    (@record $name:literal, $admin:expr, $siteop:expr, $help:literal, $handler:path) => {{
        fn boxed(session: &mut Session, arg: String) -> BoxFuture<'_, FtpResult<()>> {
            Box::pin($handler(session, arg))
        }
        SiteVerb {
            name: $name,
            requires_admin: $admin,
            requires_siteop: $siteop,
            help: $help,
            execute: boxed,
        }
    }};
}

/// The full verb table, built once.
pub fn registry() -> &'static [SiteVerb] {
    static REGISTRY: OnceLock<Vec<SiteVerb>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        vec![
            // User lifecycle.
            verb!("ADDUSER", admin, "ADDUSER <user> <password> [group]", user::site_adduser),
            verb!("DELUSER", admin, "DELUSER <user> (disables the account)", user::site_deluser),
            verb!("CHPASS", admin, "CHPASS <user> <password>", user::site_chpass),
            verb!("CHGRP", admin, "CHGRP <user> <primary> [secondary...]", user::site_chgrp),
            verb!("FLAGS", siteop, "FLAGS <user>", user::site_flags),
            verb!("SETFLAGS", admin, "SETFLAGS <user> <flags>", user::site_setflags),
            verb!("LIMITS", siteop, "LIMITS <user>", user::site_limits),
            verb!(
                "SETLIMITS",
                admin,
                "SETLIMITS <user> <upKbps> <downKbps> <logins> <idleSecs>",
                user::site_setlimits
            ),
            verb!("NORATIO", admin, "NORATIO <user> (toggles the R flag)", user::site_noratio),
            verb!("SYSOP", admin, "SYSOP <user> (toggles master rights)", user::site_sysop),
            verb!("ADDIP", admin, "ADDIP <user> <mask>", user::site_addip),
            verb!("DELIP", admin, "DELIP <user>", user::site_delip),
            verb!("IDENT", admin, "IDENT <user> <ident>", user::site_ident),
            verb!("REQIDENT", admin, "REQIDENT <user> on|off", user::site_reqident),
            verb!("SHOWUSER", siteop, "SHOWUSER <user>", user::site_showuser),
            verb!("USERS", siteop, "USERS [pattern]", user::site_users),
            // Groups.
            verb!("GROUPS", user, "GROUPS", group::site_groups),
            verb!("GROUPINFO", user, "GROUPINFO <group>", group::site_groupinfo),
            verb!("GROUPMEMBERS", siteop, "GROUPMEMBERS <group>", group::site_groupmembers),
            verb!("GROUPADD", admin, "GROUPADD <group> [description]", group::site_groupadd),
            verb!("GROUPDEL", admin, "GROUPDEL <group>", group::site_groupdel),
            // Sections.
            verb!("SECTIONS", user, "SECTIONS", section::site_sections),
            verb!("DIRFLAGS", siteop, "DIRFLAGS [path]", section::site_dirflags),
            // Release lifecycle.
            verb!("PRE", user, "PRE <section> <release>", release::site_pre),
            verb!("PRELIST", user, "PRELIST", release::site_prelist),
            verb!("DELPRE", siteop, "DELPRE <section> <release>", release::site_delpre),
            verb!("DUPE", user, "DUPE <pattern> [-section=X] [-ok]", release::site_dupe),
            verb!("DUPEFULL", user, "DUPEFULL <pattern>", release::site_dupefull),
            verb!("UNDUPE", siteop, "UNDUPE <pattern>", release::site_undupe),
            verb!("UNDUPEDIR", siteop, "UNDUPEDIR <path>", release::site_undupedir),
            verb!("NUKE", siteop, "NUKE <path> <reason>", release::site_nuke),
            verb!("UNNUKE", siteop, "UNNUKE <path>", release::site_unnuke),
            verb!("WIPE", siteop, "WIPE <path>", release::site_wipe),
            verb!("PURGE", admin, "PURGE <section> <release>", release::site_purge),
            verb!("MOVE", siteop, "MOVE <path> <target-dir>", release::site_move),
            verb!("MKDIR", siteop, "MKDIR <path> (skips dupe check)", release::site_mkdir),
            verb!("CHMOD", siteop, "CHMOD <octal> <path>", release::site_chmod),
            // Zipscript.
            verb!("SFV", user, "SFV [path]", zipscript::site_sfv),
            verb!("RESCAN", user, "RESCAN [path]", zipscript::site_rescan),
            verb!("RESCANSTATS", siteop, "RESCANSTATS", zipscript::site_rescanstats),
            verb!("RESCANDUPE", siteop, "RESCANDUPE [path]", zipscript::site_rescandupe),
            verb!("RESCANNUKES", siteop, "RESCANNUKES", zipscript::site_rescannukes),
            // Racing and statistics.
            verb!("RACE", user, "RACE [path]", stats::site_race),
            verb!("RACESTATS", user, "RACESTATS", stats::site_racestats),
            verb!("RACELOG", siteop, "RACELOG [n]", stats::site_racelog),
            verb!("LASTRACES", user, "LASTRACES [n]", stats::site_lastraces),
            verb!("STATS", user, "STATS [user]", stats::site_stats),
            verb!("STATDAILY", user, "STATDAILY", stats::site_statdaily),
            verb!("STATWEEKLY", user, "STATWEEKLY", stats::site_statweekly),
            verb!("STATMONTHLY", user, "STATMONTHLY", stats::site_statmonthly),
            verb!("STATSJSON", siteop, "STATSJSON", stats::site_statsjson),
            // Operations.
            verb!("KICK", siteop, "KICK <user>", ops::site_kick),
            verb!("KILL", siteop, "KILL <session-id>", ops::site_kill),
            verb!("BLOCK", admin, "BLOCK <ip-bucket>", ops::site_block),
            verb!("UNBLOCK", admin, "UNBLOCK <ip-bucket>", ops::site_unblock),
            verb!("BLOCKLIST", siteop, "BLOCKLIST", ops::site_blocklist),
            verb!("WHO", user, "WHO", ops::site_who),
            verb!("WHOIP", siteop, "WHOIP <ip-prefix>", ops::site_whoip),
            verb!("REHASH", admin, "REHASH (reloads the configuration)", ops::site_rehash),
            verb!("DBBACKUP", admin, "DBBACKUP", ops::site_dbbackup),
            verb!("DBFSCK", admin, "DBFSCK", ops::site_dbfsck),
            verb!("DBSUMMARY", admin, "DBSUMMARY", ops::site_dbsummary),
            verb!("UPTIME", user, "UPTIME", ops::site_uptime),
            verb!("VERS", user, "VERS", ops::site_version),
            verb!("VERSION", user, "VERSION", ops::site_version),
            verb!("HELP", user, "HELP", ops::site_help),
            // Credits.
            verb!("CREDITS", user, "CREDITS", credits::site_credits),
            verb!("GIVECRED", admin, "GIVECRED <user> <kb>", credits::site_givecred),
            verb!("TAKECRED", admin, "TAKECRED <user> <kb>", credits::site_takecred),
            // Import and export.
            verb!("IMPORT", admin, "IMPORT <physical-dir> <virtual-root>", import::site_import),
            verb!(
                "IMPORTDUPE",
                admin,
                "IMPORTDUPE <physical-dir> <virtual-root>",
                import::site_import
            ),
            verb!("IMPORTCANCEL", admin, "IMPORTCANCEL", import::site_importcancel),
            verb!("IMPORTSTATUS", siteop, "IMPORTSTATUS", import::site_importstatus),
            verb!("IMPORTSTATUSJSON", siteop, "IMPORTSTATUSJSON", import::site_importstatusjson),
            verb!("DUPEIMPORT", admin, "DUPEIMPORT <physical-dir> <virtual-root>", import::site_import),
            verb!("DUPEEXPORT", admin, "DUPEEXPORT", import::site_dupeexport),
            verb!("DUPEJSON", siteop, "DUPEJSON [pattern]", import::site_dupejson),
            verb!("DUPEMIGRATE", admin, "DUPEMIGRATE <from-section> <to-section>", import::site_dupemigrate),
            verb!("SQLPROVIDERS", admin, "SQLPROVIDERS", import::site_sqlproviders),
            verb!("SQLTEST", admin, "SQLTEST", import::site_sqltest),
        ]
    })
}

/// Dispatches `SITE <verb> [args]`.
pub async fn dispatch(session: &mut Session, command: &CommandLine) -> FtpResult<()> {
    let (verb, arg) = match command.arg.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb.to_ascii_uppercase(), rest.trim().to_string()),
        None => (command.arg.to_ascii_uppercase(), String::new()),
    };
    if verb.is_empty() {
        return Err(FtpError::bad_arg("SITE needs a command"));
    }

    let Some(record) = registry().iter().find(|v| v.name == verb) else {
        return session.send_line(500, format!("SITE {verb} not understood.")).await;
    };

    let flags = session.require_user()?.flag_set();
    if record.requires_admin && !flags.is_admin() {
        return Err(FtpError::Permission(format!("SITE {verb} requires admin rights")));
    }
    if record.requires_siteop && !flags.is_siteop() {
        return Err(FtpError::Permission(format!("SITE {verb} requires siteop rights")));
    }

    debug!("SITE {} {:?}", verb, arg);
    match (record.execute)(session, arg).await {
        Ok(()) => Ok(()),
        Err(e) => {
            error!("SITE {} failed: {}", verb, e);
            Err(e)
        }
    }
}
