//! End-to-end control-channel flows over a loopback daemon.

mod support;

use support::{code, download, login, start_site, upload, Client};

#[tokio::test]
async fn login_and_navigation() {
    let site = start_site().await;
    let mut client = Client::connect(site.addr).await;

    // Bad password first: 530 and the session survives.
    client.expect("USER alice", 331).await;
    let reply = client.cmd("PASS wrong").await;
    assert_eq!(code(&reply), 530);

    login(&mut client, "alice", "secret").await;
    let pwd = client.expect("PWD", 257).await;
    assert!(pwd.contains('/'), "{pwd}");

    client.expect("SYST", 215).await;
    client.expect("TYPE I", 200).await;
    client.expect("NOOP", 200).await;

    let feat = client.cmd("FEAT").await;
    assert_eq!(code(&feat), 211);
    assert!(feat.contains("REST STREAM"), "{feat}");
    assert!(feat.contains("MLSD"), "{feat}");

    // Section alias shortcut: CWD music lands in /mp3.
    client.expect("CWD music", 250).await;
    let pwd = client.expect("PWD", 257).await;
    assert!(pwd.contains("/mp3"), "{pwd}");

    client.expect("CDUP", 250).await;
    let reply = client.cmd("CWD /nowhere").await;
    assert_eq!(code(&reply), 550);

    let reply = client.cmd("BOGUS").await;
    assert_eq!(code(&reply), 500);

    client.expect("QUIT", 221).await;
}

#[tokio::test]
async fn upload_earns_credits_and_feeds_the_engines() {
    let site = start_site().await;
    let mut client = Client::connect(site.addr).await;
    login(&mut client, "alice", "secret").await;

    client.expect("MKD /mp3/Test-Rel-2024-GRP", 257).await;
    client.expect("CWD /mp3/Test-Rel-2024-GRP", 250).await;

    let before = site.snapshot.users.find("alice").unwrap().credits_kb;
    let payload = vec![7u8; 900_000];
    upload(&mut client, "track.mp3", &payload).await;

    // 900000 bytes is 879 KiB, times the 1:3 section ratio.
    let after = site.snapshot.users.find("alice").unwrap().credits_kb;
    assert_eq!(after - before, 879 * 3);

    // Race tracker attributes the bytes.
    let race = site.snapshot.races.try_get("/mp3/Test-Rel-2024-GRP").unwrap();
    assert_eq!(race.total_bytes, 900_000);
    assert_eq!(race.user_bytes["alice"], 900_000);

    // The dupe entry was registered at MKD and fed by the upload.
    let dupe = site.snapshot.dupes.find("MP3", "Test-Rel-2024-GRP").unwrap();
    assert_eq!(dupe.uploader, "alice");
    assert_eq!(dupe.total_bytes, 900_000);

    // A second MKD of the same release is refused as a dupe.
    let reply = client.cmd("MKD /mp3/Test-Rel-2024-GRP").await;
    assert_eq!(code(&reply), 550);
    assert!(reply.contains("dupe"), "{reply}");
}

#[tokio::test]
async fn download_debits_by_section_ratio() {
    let site = start_site().await;
    std::fs::write(site.site_root.join("mp3").join("sample.bin"), vec![1u8; 1_048_576]).unwrap();

    let mut client = Client::connect(site.addr).await;
    login(&mut client, "alice", "secret").await;
    client.expect("TYPE I", 200).await;

    let before = site.snapshot.users.find("alice").unwrap().credits_kb;
    let payload = download(&mut client, "/mp3/sample.bin").await;
    assert_eq!(payload.len(), 1_048_576);

    // 1024 KiB at 1:3 costs 3072 KiB.
    let after = site.snapshot.users.find("alice").unwrap().credits_kb;
    assert_eq!(before - after, 3072);

    let size = client.expect("SIZE /mp3/sample.bin", 213).await;
    assert!(size.contains("1048576"), "{size}");
}

#[tokio::test]
async fn download_without_credits_is_refused() {
    let site = start_site().await;
    std::fs::write(site.site_root.join("mp3").join("big.bin"), vec![1u8; 1_048_576]).unwrap();

    let mut broke = site.snapshot.users.find("alice").unwrap();
    broke.credits_kb = 10;
    site.snapshot.users.try_update(broke).unwrap();

    let mut client = Client::connect(site.addr).await;
    login(&mut client, "alice", "secret").await;
    client.expect("PASV", 227).await;
    let reply = client.cmd("RETR /mp3/big.bin").await;
    assert_eq!(code(&reply), 550);
    assert!(reply.contains("credits"), "{reply}");
}

#[tokio::test]
async fn rest_resumes_a_download() {
    let site = start_site().await;
    std::fs::write(site.site_root.join("pub").join("resume.bin"), b"0123456789").unwrap();

    let mut client = Client::connect(site.addr).await;
    login(&mut client, "alice", "secret").await;

    let pasv = client.expect("PASV", 227).await;
    let port = support::pasv_port(&pasv);
    client.expect("REST 6", 350).await;
    let mut data = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client.send("RETR /pub/resume.bin").await;
    assert_eq!(code(&client.read_reply().await), 150);
    let mut payload = Vec::new();
    tokio::io::AsyncReadExt::read_to_end(&mut data, &mut payload).await.unwrap();
    assert_eq!(code(&client.read_reply().await), 226);
    assert_eq!(payload, b"6789");
}

#[tokio::test]
async fn listings_are_served_over_the_data_channel() {
    let site = start_site().await;
    std::fs::write(site.site_root.join("pub").join("a.bin"), b"xx").unwrap();
    std::fs::write(site.site_root.join("pub").join("b.bin"), b"yy").unwrap();

    let mut client = Client::connect(site.addr).await;
    login(&mut client, "alice", "secret").await;
    client.expect("CWD /pub", 250).await;

    let pasv = client.expect("PASV", 227).await;
    let port = support::pasv_port(&pasv);
    let mut data = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client.send("LIST").await;
    assert_eq!(code(&client.read_reply().await), 150);
    let mut listing = String::new();
    tokio::io::AsyncReadExt::read_to_string(&mut data, &mut listing).await.unwrap();
    assert_eq!(code(&client.read_reply().await), 226);
    assert!(listing.contains("a.bin"), "{listing}");
    assert!(listing.contains("b.bin"), "{listing}");
    assert!(listing.contains("\r\n"), "{listing}");

    let mlst = client.expect("MLST /pub/a.bin", 250).await;
    assert!(mlst.contains("type=file"), "{mlst}");
    assert!(mlst.contains("size=2"), "{mlst}");
}

#[tokio::test]
async fn upload_permission_is_enforced() {
    let site = start_site().await;

    // Strip the upload flag.
    let mut user = site.snapshot.users.find("alice").unwrap();
    user.flags = "DV".to_string();
    site.snapshot.users.try_update(user).unwrap();

    let mut client = Client::connect(site.addr).await;
    login(&mut client, "alice", "secret").await;
    client.expect("PASV", 227).await;
    let reply = client.cmd("STOR /mp3/denied.bin").await;
    assert_eq!(code(&reply), 550);
}

#[tokio::test]
async fn deferred_commands_run_after_the_transfer() {
    let site = start_site().await;
    std::fs::write(site.site_root.join("pub").join("x.bin"), vec![0u8; 300 * 1024]).unwrap();

    // Slow the download so control commands land mid-transfer.
    let mut user = site.snapshot.users.find("alice").unwrap();
    user.limits.max_download_kbps = 600;
    site.snapshot.users.try_update(user).unwrap();

    let mut client = Client::connect(site.addr).await;
    login(&mut client, "alice", "secret").await;

    let pasv = client.expect("PASV", 227).await;
    let port = support::pasv_port(&pasv);
    let mut data = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client.send("RETR /pub/x.bin").await;
    assert_eq!(code(&client.read_reply().await), 150);

    // NOOP answers immediately while the transfer is still running; PWD is
    // deferred until after the 226.
    client.send("NOOP").await;
    client.send("PWD").await;
    assert_eq!(code(&client.read_reply().await), 200);

    let mut sink = Vec::new();
    tokio::io::AsyncReadExt::read_to_end(&mut data, &mut sink).await.unwrap();
    assert_eq!(sink.len(), 300 * 1024);

    assert_eq!(code(&client.read_reply().await), 226);
    let deferred = client.read_reply().await;
    assert_eq!(code(&deferred), 257, "{deferred}");
}
