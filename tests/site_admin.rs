//! SITE command flows: administration, nukes, rehash.

mod support;

use support::{code, login, start_site, upload, Client};

#[tokio::test]
async fn user_and_group_administration() {
    let site = start_site().await;
    let mut client = Client::connect(site.addr).await;
    login(&mut client, "admin", "secret").await;

    client.expect("SITE ADDUSER bob hunter2 STAFF", 200).await;
    let users = client.expect("SITE USERS", 200).await;
    assert!(users.contains("bob"), "{users}");

    client.expect("SITE GIVECRED bob 500", 200).await;
    assert_eq!(site.snapshot.users.find("bob").unwrap().credits_kb, 500 + 100 * 1024);

    client.expect("SITE TAKECRED bob 200", 200).await;
    client.expect("SITE SETFLAGS bob DU", 200).await;
    let flags = client.expect("SITE FLAGS bob", 200).await;
    assert!(flags.contains("DU"), "{flags}");

    client.expect("SITE GROUPADD couriers fast people", 200).await;
    let groups = client.expect("SITE GROUPS", 200).await;
    assert!(groups.contains("couriers"), "{groups}");
    client.expect("SITE CHGRP bob couriers", 200).await;
    let members = client.expect("SITE GROUPMEMBERS couriers", 200).await;
    assert!(members.contains("bob"), "{members}");

    // DELUSER tombstones: the account stays but logins are refused.
    client.expect("SITE DELUSER bob", 200).await;
    let bob = site.snapshot.users.find("bob").unwrap();
    assert!(bob.is_disabled());
    let mut second = Client::connect(site.addr).await;
    second.expect("USER bob", 331).await;
    let reply = second.cmd("PASS hunter2").await;
    assert_eq!(code(&reply), 530);
}

#[tokio::test]
async fn siteop_gating_is_enforced() {
    let site = start_site().await;
    let mut client = Client::connect(site.addr).await;
    login(&mut client, "alice", "secret").await;

    let reply = client.cmd("SITE ADDUSER eve pw").await;
    assert_eq!(code(&reply), 550);
    let reply = client.cmd("SITE KICK admin").await;
    assert_eq!(code(&reply), 550);
    let reply = client.cmd("SITE NOSUCHVERB").await;
    assert_eq!(code(&reply), 500);

    // Plain verbs remain available to ordinary users.
    client.expect("SITE CREDITS", 200).await;
    client.expect("SITE SECTIONS", 200).await;
    client.expect("SITE WHO", 200).await;
    client.expect("SITE HELP", 214).await;
}

#[tokio::test]
async fn nuke_renames_penalizes_and_announces() {
    let site = start_site().await;

    let mut alice = Client::connect(site.addr).await;
    login(&mut alice, "alice", "secret").await;
    alice.expect("MKD /mp3/Artist-Album-2024-GRP", 257).await;
    let payload = vec![3u8; 900_000];
    upload(&mut alice, "/mp3/Artist-Album-2024-GRP/01-track.mp3", &payload).await;

    let credits_after_upload = site.snapshot.users.find("alice").unwrap().credits_kb;
    let mut events = site.snapshot.events.subscribe();

    let mut admin = Client::connect(site.addr).await;
    login(&mut admin, "admin", "secret").await;
    let reply = admin.expect("SITE NUKE /mp3/Artist-Album-2024-GRP bad.dupe", 200).await;
    assert!(reply.contains("nuked"), "{reply}");

    // The directory was renamed with the .NUKED suffix.
    assert!(!site.site_root.join("mp3").join("Artist-Album-2024-GRP").exists());
    assert!(site.site_root.join("mp3").join("Artist-Album-2024-GRP.NUKED").is_dir());

    // Dupe entry carries the nuke metadata.
    let dupe = site.snapshot.dupes.find("MP3", "Artist-Album-2024-GRP").unwrap();
    assert!(dupe.nuked);
    assert_eq!(dupe.nuke_reason, "bad.dupe");

    // Racers lose earned * nuke multiplier, clamped at zero.
    let credits_after_nuke = site.snapshot.users.find("alice").unwrap().credits_kb;
    let penalty = 879 * 3 * 3; // KiB uploaded at 1:3, times nuke x3
    assert_eq!(credits_after_upload.saturating_sub(penalty), credits_after_nuke);

    // A Nuke event reached the bus.
    let mut saw_nuke = false;
    for _ in 0..32 {
        match tokio::time::timeout(std::time::Duration::from_secs(1), events.recv()).await {
            Ok(Some(raceftpd::events::Event::Nuke { release, reason, .. })) => {
                assert_eq!(release, "Artist-Album-2024-GRP");
                assert_eq!(reason, "bad.dupe");
                saw_nuke = true;
                break;
            }
            Ok(Some(_)) => continue,
            _ => break,
        }
    }
    assert!(saw_nuke, "no Nuke event observed");

    // Unnuke restores the name and the flag, keeping was_nuked.
    admin.expect("SITE UNNUKE /mp3/Artist-Album-2024-GRP", 200).await;
    assert!(site.site_root.join("mp3").join("Artist-Album-2024-GRP").is_dir());
    let dupe = site.snapshot.dupes.find("MP3", "Artist-Album-2024-GRP").unwrap();
    assert!(!dupe.nuked);
    let state = site.snapshot.zipscript.try_get("/mp3/Artist-Album-2024-GRP").unwrap();
    assert!(state.was_nuked);
}

#[tokio::test]
async fn dupe_search_follows_the_flags() {
    let site = start_site().await;
    let mut client = Client::connect(site.addr).await;
    login(&mut client, "admin", "secret").await;

    client.expect("MKD /mp3/Artist-Album-2024-GRP", 257).await;
    client.expect("MKD /mp3/Other-Thing-2023-GRP", 257).await;
    client.expect("SITE NUKE /mp3/Other-Thing-2023-GRP stolen", 200).await;

    let hits = client.expect("SITE DUPE *2024* -section=MP3 -ok", 200).await;
    assert!(hits.contains("Artist-Album-2024-GRP"), "{hits}");
    assert!(!hits.contains("Other-Thing"), "{hits}");

    // Without -ok the nuked entry shows up, marked.
    let hits = client.expect("SITE DUPE *20* -section=MP3", 200).await;
    assert!(hits.contains("NUKED Other-Thing-2023-GRP"), "{hits}");

    client.expect("SITE UNDUPEDIR /mp3/Artist-Album-2024-GRP", 200).await;
    assert!(site.snapshot.dupes.find("MP3", "Artist-Album-2024-GRP").is_none());
}

#[tokio::test]
async fn pre_announces_and_expires_through_the_tree() {
    let site = start_site().await;
    let mut client = Client::connect(site.addr).await;
    login(&mut client, "alice", "secret").await;

    client.expect("MKD /mp3/Fresh-Rel-2024-GRP", 257).await;
    client.expect("SITE PRE MP3 Fresh-Rel-2024-GRP", 200).await;

    let list = client.expect("SITE PRELIST", 200).await;
    assert!(list.contains("Fresh-Rel-2024-GRP"), "{list}");

    // The synthetic tree leads to the real release directory.
    client.expect("CWD /PRE/MP3/Fresh-Rel-2024-GRP", 250).await;
    let pwd = client.expect("PWD", 257).await;
    assert!(pwd.contains("/mp3/Fresh-Rel-2024-GRP"), "{pwd}");

    let mut admin = Client::connect(site.addr).await;
    login(&mut admin, "admin", "secret").await;
    admin.expect("SITE DELPRE MP3 Fresh-Rel-2024-GRP", 200).await;
    let list = admin.expect("SITE PRELIST", 200).await;
    assert!(!list.contains("Fresh-Rel-2024-GRP"), "{list}");
}

#[tokio::test]
async fn rehash_reports_changed_sections_and_applies_them() {
    let site = start_site().await;

    // Flip the MP3 section to free leech on disk.
    let mut config = support::test_config(&site.site_root);
    config.sections.get_mut("MP3").unwrap().free_leech = true;
    std::fs::write(&site.config_path, serde_json::to_string_pretty(&config).unwrap()).unwrap();

    let mut admin = Client::connect(site.addr).await;
    login(&mut admin, "admin", "secret").await;
    let reply = admin.expect("SITE REHASH", 200).await;
    assert!(reply.to_lowercase().contains("sections"), "{reply}");

    // Post-rehash sessions see the free section: downloads cost nothing.
    std::fs::create_dir_all(site.site_root.join("mp3")).unwrap();
    std::fs::write(site.site_root.join("mp3").join("free.bin"), vec![0u8; 4096]).unwrap();
    let mut client = Client::connect(site.addr).await;
    login(&mut client, "alice", "secret").await;
    let before = site.snapshots.current().users.find("alice").unwrap().credits_kb;
    let payload = support::download(&mut client, "/mp3/free.bin").await;
    assert_eq!(payload.len(), 4096);
    let after = site.snapshots.current().users.find("alice").unwrap().credits_kb;
    assert_eq!(before, after);
}

#[tokio::test]
async fn zipscript_flow_over_the_wire() {
    let site = start_site().await;
    let mut client = Client::connect(site.addr).await;
    login(&mut client, "alice", "secret").await;

    client.expect("MKD /mp3/Crc-Rel-2024-GRP", 257).await;
    client.expect("CWD /mp3/Crc-Rel-2024-GRP", 250).await;

    let track = b"some audio bytes".to_vec();
    let crc = {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&track);
        hasher.finalize()
    };
    let sfv = format!("; checksums\r\n01-track.mp3 {crc:08X}\r\n02-track.mp3 00000001\r\n");

    upload(&mut client, "release.sfv", sfv.as_bytes()).await;
    upload(&mut client, "01-track.mp3", &track).await;

    let report = client.expect("SITE SFV", 200).await;
    assert!(report.contains("01-track.mp3"), "{report}");
    assert!(report.contains("ok"), "{report}");

    let state = site.snapshot.zipscript.try_get("/mp3/Crc-Rel-2024-GRP").unwrap();
    assert!(state.has_sfv);
    assert!(!state.complete);
    assert_eq!(state.progress(), (1, 2));

    // The second listed file is wrong on purpose: BadCrc, still incomplete.
    upload(&mut client, "02-track.mp3", b"does not match").await;
    let state = site.snapshot.zipscript.try_get("/mp3/Crc-Rel-2024-GRP").unwrap();
    assert!(!state.complete);
    let report = client.expect("SITE RESCAN", 200).await;
    assert!(report.contains("BAD CRC"), "{report}");
}

#[tokio::test]
async fn who_kick_and_blocklist() {
    let site = start_site().await;
    let mut alice = Client::connect(site.addr).await;
    login(&mut alice, "alice", "secret").await;

    let mut admin = Client::connect(site.addr).await;
    login(&mut admin, "admin", "secret").await;

    let who = admin.expect("SITE WHO", 200).await;
    assert!(who.contains("alice"), "{who}");
    assert!(who.contains("admin"), "{who}");

    admin.expect("SITE KICK alice", 200).await;
    // The kicked session drains to a 421 eventually.
    let mut saw_421 = false;
    for _ in 0..4 {
        let reply = alice.cmd("NOOP").await;
        if code(&reply) == 421 {
            saw_421 = true;
            break;
        }
    }
    assert!(saw_421, "kicked session never saw 421");

    admin.expect("SITE BLOCK 127.0", 200).await;
    let list = admin.expect("SITE BLOCKLIST", 200).await;
    assert!(list.contains("127.0"), "{list}");

    // New connections from the blocked bucket are turned away at accept.
    let mut refused = tokio::net::TcpStream::connect(site.addr).await.unwrap();
    let mut line = String::new();
    let mut reader = tokio::io::BufReader::new(&mut refused);
    tokio::io::AsyncBufReadExt::read_line(&mut reader, &mut line).await.unwrap();
    assert!(line.starts_with("421"), "{line}");

    admin.expect("SITE UNBLOCK 127.0", 200).await;
}
