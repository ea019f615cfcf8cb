//! Cross-cutting invariants exercised over adversarial input sweeps.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use raceftpd::config::SectionConfig;
use raceftpd::credit::CreditEngine;
use raceftpd::race::RaceTracker;
use raceftpd::section::SectionResolver;
use raceftpd::store::{hash_password, MemoryUserStore, UserStore};
use raceftpd::users::User;
use raceftpd::vfs::path;

/// Path safety: whatever the client sends, the physical mapping either
/// stays under the root or is refused. No input may escape.
#[test]
fn no_input_escapes_the_mount_root() {
    let root = Path::new("/srv/site");
    let inputs = [
        "a/b/c",
        "../../../../etc/passwd",
        "..\\..\\windows\\system32",
        "/abs/./../..",
        "a/./../../..//../b",
        "....//....//etc",
        "a/b/../../../../../../root",
        "trailing/..",
        ". ",
        "..",
        "/",
        "",
        "a//////b",
        "\\\\server\\share",
    ];
    for input in inputs {
        let normalized = path::normalize("/", input);
        assert!(normalized.starts_with('/'), "{input:?} -> {normalized:?}");
        match path::map_to_physical(root, &normalized) {
            Some(physical) => {
                assert!(
                    physical.starts_with(root),
                    "{input:?} escaped to {physical:?}"
                );
            }
            None => {} // refused is always safe
        }
    }
}

/// Section resolution monotonicity: extending a path never resolves to a
/// section with a shorter root than the prefix's.
#[test]
fn deeper_paths_resolve_to_equal_or_longer_roots() {
    let mut map = BTreeMap::new();
    for (name, root) in [
        ("A", "/x"),
        ("B", "/x/y"),
        ("C", "/x/y/z"),
        ("D", "/other"),
    ] {
        map.insert(name.to_string(), SectionConfig {
            virtual_root: root.to_string(),
            ..SectionConfig::default()
        });
    }
    let resolver = SectionResolver::new(map.iter());

    let paths = ["/x", "/x/y", "/x/y/z", "/x/y/z/deep/er", "/other/a/b", "/elsewhere"];
    for (i, shorter) in paths.iter().enumerate() {
        for longer in &paths[i..] {
            if !path::has_prefix(longer, shorter) {
                continue;
            }
            let short_root = resolver.section_for(shorter).virtual_root.len();
            let long_root = resolver.section_for(longer).virtual_root.len();
            assert!(
                long_root >= short_root,
                "{longer} resolved shallower ({long_root}) than {shorter} ({short_root})"
            );
        }
    }
}

/// Race additivity across an arbitrary interleaving of contributions.
#[test]
fn race_totals_match_the_per_user_sum() {
    let tracker = RaceTracker::new();
    let users = ["alice", "bob", "carol"];
    let releases = ["/mp3/a", "/mp3/b"];
    for step in 0u64..200 {
        let user = users[(step % 3) as usize];
        let release = releases[(step % 2) as usize];
        tracker.on_bytes(release, "MP3", user, step * 37 + 1);
    }
    for release in releases {
        let race = tracker.try_get(release).unwrap();
        assert_eq!(race.total_bytes, race.user_bytes.values().sum::<u64>());
    }
}

/// Credit non-negativity through any charge/earn/reverse sequence.
#[test]
fn credits_never_go_negative() {
    let mut user = User::new("alice", &hash_password("pw"), "staff");
    user.flags = "DU".to_string();
    user.credits_kb = 100;
    let store = Arc::new(MemoryUserStore::with_users([user]));
    let engine = CreditEngine::new(store.clone());

    let mut race = raceftpd::race::RaceSnapshot::default();
    race.user_bytes.insert("alice".to_string(), 1024 * 1024);

    for step in 0..50u64 {
        match step % 4 {
            0 => {
                let _ = engine.earn("alice", step * 3);
            }
            1 => {
                // May fail with QuotaExhausted; balance must be untouched then.
                let _ = engine.charge("alice", step * 7);
            }
            2 => {
                engine.reverse_from_race(&race, 1.0, 3.0);
            }
            _ => {
                let _ = engine.charge("alice", 1);
            }
        }
        let balance = store.find("alice").unwrap().credits_kb;
        assert!(balance < u64::MAX / 2, "balance wrapped: {balance}");
    }
}
