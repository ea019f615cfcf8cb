//! The transfer task: moves bytes between the data socket and disk.
//!
//! One invocation serves one `RETR`, `STOR`/`APPE`/`STOU` or listing. The
//! loop observes the session's abort signal at every I/O boundary, enforces
//! the per-connection rate cap by pacing, and aborts on its own when no
//! bytes move for the inactivity window. Uploads accumulate a CRC-32 while
//! streaming so the zipscript never has to re-read fresh uploads.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Notify;
use tokio::time::{sleep, timeout};
use tracing::debug;

use crate::data::DataStream;
use crate::error::FtpResult;

/// No bytes for this long aborts the transfer.
pub const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(60);

const CHUNK: usize = 64 * 1024;

/// Result of one finished (or aborted) transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferOutcome {
    pub bytes: u64,
    pub duration: Duration,
    /// CRC-32 of the streamed bytes; uploads only.
    pub crc: Option<u32>,
    pub abort_reason: Option<String>,
}

impl TransferOutcome {
    pub fn aborted(&self) -> bool {
        self.abort_reason.is_some()
    }
}

/// Cooperative cancellation observed at I/O loop boundaries.
#[derive(Clone, Default)]
pub struct AbortSignal {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    async fn wait(&self) {
        while !self.is_triggered() {
            self.notify.notified().await;
        }
    }
}

/// How an upload positions itself in the target file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadDisposition {
    /// Plain `STOR`: truncate and write from the start.
    Truncate,
    /// `STOR` after `REST`: keep contents, write from the offset.
    Offset(u64),
    /// `APPE`: write after the existing contents.
    Append,
}

/// Sleeps long enough to keep the average rate at or under `rate_kbps`.
async fn pace(rate_kbps: u32, bytes_so_far: u64, started: Instant) {
    if rate_kbps == 0 {
        return;
    }
    let budget = Duration::from_secs_f64(bytes_so_far as f64 / (f64::from(rate_kbps) * 1024.0));
    let elapsed = started.elapsed();
    if budget > elapsed {
        sleep(budget - elapsed).await;
    }
}

/// Streams a file to the client (`RETR`).
pub async fn run_download(
    mut stream: DataStream,
    source: &Path,
    rest_offset: u64,
    rate_kbps: u32,
    abort: &AbortSignal,
) -> FtpResult<TransferOutcome> {
    let mut file = tokio::fs::File::open(source).await?;
    if rest_offset > 0 {
        file.seek(std::io::SeekFrom::Start(rest_offset)).await?;
    }

    let started = Instant::now();
    let mut sent: u64 = 0;
    let mut buf = vec![0u8; CHUNK];
    let mut abort_reason = None;

    loop {
        let read = tokio::select! {
            biased;
            _ = abort.wait() => {
                abort_reason = Some("client abort".to_string());
                break;
            }
            read = timeout(INACTIVITY_TIMEOUT, file.read(&mut buf)) => match read {
                Ok(result) => result?,
                Err(_) => {
                    abort_reason = Some("inactivity".to_string());
                    break;
                }
            },
        };
        if read == 0 {
            break;
        }
        match timeout(INACTIVITY_TIMEOUT, stream.write_all(&buf[..read])).await {
            Ok(result) => result?,
            Err(_) => {
                abort_reason = Some("inactivity".to_string());
                break;
            }
        }
        sent += read as u64;
        pace(rate_kbps, sent, started).await;
    }

    let _ = stream.shutdown().await;
    debug!("download of {:?} moved {} bytes", source, sent);
    Ok(TransferOutcome { bytes: sent, duration: started.elapsed(), crc: None, abort_reason })
}

/// Streams client data into a file (`STOR`/`APPE`/`STOU`).
pub async fn run_upload(
    mut stream: DataStream,
    target: &Path,
    disposition: UploadDisposition,
    rate_kbps: u32,
    abort: &AbortSignal,
) -> FtpResult<TransferOutcome> {
    let mut options = OpenOptions::new();
    options.write(true).create(true);
    match disposition {
        UploadDisposition::Truncate => {
            options.truncate(true);
        }
        UploadDisposition::Offset(_) => {}
        UploadDisposition::Append => {
            options.append(true);
        }
    }
    let mut file = options.open(target).await?;
    if let UploadDisposition::Offset(offset) = disposition {
        file.seek(std::io::SeekFrom::Start(offset)).await?;
    }

    let started = Instant::now();
    let mut received: u64 = 0;
    let mut buf = vec![0u8; CHUNK];
    let mut hasher = crc32fast::Hasher::new();
    let mut abort_reason = None;

    loop {
        let read = tokio::select! {
            biased;
            _ = abort.wait() => {
                abort_reason = Some("client abort".to_string());
                break;
            }
            read = timeout(INACTIVITY_TIMEOUT, stream.read(&mut buf)) => match read {
                Ok(result) => result?,
                Err(_) => {
                    abort_reason = Some("inactivity".to_string());
                    break;
                }
            },
        };
        if read == 0 {
            break;
        }
        file.write_all(&buf[..read]).await?;
        hasher.update(&buf[..read]);
        received += read as u64;
        pace(rate_kbps, received, started).await;
    }

    file.flush().await?;
    debug!("upload to {:?} moved {} bytes", target, received);
    Ok(TransferOutcome {
        bytes: received,
        duration: started.elapsed(),
        crc: Some(hasher.finalize()),
        abort_reason,
    })
}

/// Sends pre-rendered listing text (`LIST`/`NLST`/`MLSD`).
pub async fn run_listing(
    mut stream: DataStream,
    rendered: String,
    abort: &AbortSignal,
) -> FtpResult<TransferOutcome> {
    let started = Instant::now();
    let bytes = rendered.len() as u64;
    let mut abort_reason = None;

    tokio::select! {
        biased;
        _ = abort.wait() => {
            abort_reason = Some("client abort".to_string());
        }
        written = timeout(INACTIVITY_TIMEOUT, stream.write_all(rendered.as_bytes())) => match written {
            Ok(result) => result?,
            Err(_) => abort_reason = Some("inactivity".to_string()),
        },
    }

    let _ = stream.shutdown().await;
    let sent = if abort_reason.is_some() { 0 } else { bytes };
    Ok(TransferOutcome { bytes: sent, duration: started.elapsed(), crc: None, abort_reason })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DataStream;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tokio::net::{TcpListener, TcpStream};

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (server, _) = listener.accept().await.unwrap();
        (server, client.await.unwrap())
    }

    #[tokio::test]
    async fn upload_writes_file_and_computes_crc() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("up.bin");
        let (server, mut client) = socket_pair().await;

        let payload = b"zipscript checks this".to_vec();
        let expected_crc = {
            let mut h = crc32fast::Hasher::new();
            h.update(&payload);
            h.finalize()
        };
        let writer = tokio::spawn(async move {
            client.write_all(&payload).await.unwrap();
            client.shutdown().await.unwrap();
        });

        let abort = AbortSignal::new();
        let outcome = run_upload(
            DataStream::Plain(server),
            &target,
            UploadDisposition::Truncate,
            0,
            &abort,
        )
        .await
        .unwrap();
        writer.await.unwrap();

        assert_eq!(outcome.bytes, 21);
        assert_eq!(outcome.crc, Some(expected_crc));
        assert!(!outcome.aborted());
        assert_eq!(std::fs::read(&target).unwrap(), b"zipscript checks this");
    }

    #[tokio::test]
    async fn upload_at_offset_preserves_prefix() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("resume.bin");
        std::fs::write(&target, b"0123456789").unwrap();

        let (server, mut client) = socket_pair().await;
        let writer = tokio::spawn(async move {
            client.write_all(b"ABC").await.unwrap();
            client.shutdown().await.unwrap();
        });

        let abort = AbortSignal::new();
        run_upload(
            DataStream::Plain(server),
            &target,
            UploadDisposition::Offset(4),
            0,
            &abort,
        )
        .await
        .unwrap();
        writer.await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"0123ABC789");
    }

    #[tokio::test]
    async fn append_extends_the_file() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("log.txt");
        std::fs::write(&target, b"first,").unwrap();

        let (server, mut client) = socket_pair().await;
        let writer = tokio::spawn(async move {
            client.write_all(b"second").await.unwrap();
            client.shutdown().await.unwrap();
        });

        let abort = AbortSignal::new();
        run_upload(DataStream::Plain(server), &target, UploadDisposition::Append, 0, &abort)
            .await
            .unwrap();
        writer.await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"first,second");
    }

    #[tokio::test]
    async fn download_honors_rest_offset() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("dl.bin");
        std::fs::write(&source, b"0123456789").unwrap();

        let (server, mut client) = socket_pair().await;
        let reader = tokio::spawn(async move {
            let mut out = Vec::new();
            client.read_to_end(&mut out).await.unwrap();
            out
        });

        let abort = AbortSignal::new();
        let outcome =
            run_download(DataStream::Plain(server), &source, 6, 0, &abort).await.unwrap();
        assert_eq!(outcome.bytes, 4);
        assert_eq!(reader.await.unwrap(), b"6789");
    }

    #[tokio::test]
    async fn abort_signal_stops_a_download() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("big.bin");
        std::fs::write(&source, vec![0u8; 4 * 1024 * 1024]).unwrap();

        let (server, client) = socket_pair().await;
        let abort = AbortSignal::new();
        abort.trigger();

        // Keep the client readable so writes would not block anyway.
        let outcome = run_download(DataStream::Plain(server), &source, 0, 0, &abort)
            .await
            .unwrap();
        drop(client);
        assert!(outcome.aborted());
        assert!(outcome.bytes < 4 * 1024 * 1024);
    }

    #[tokio::test]
    async fn rate_cap_paces_the_stream() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("paced.bin");
        std::fs::write(&source, vec![7u8; 200 * 1024]).unwrap();

        let (server, mut client) = socket_pair().await;
        let reader = tokio::spawn(async move {
            let mut out = Vec::new();
            client.read_to_end(&mut out).await.unwrap();
            out.len()
        });

        let abort = AbortSignal::new();
        let started = Instant::now();
        // 200 KiB at 400 KiB/s is at least half a second.
        let outcome = run_download(DataStream::Plain(server), &source, 0, 400, &abort)
            .await
            .unwrap();
        assert_eq!(outcome.bytes, 200 * 1024);
        assert!(started.elapsed() >= Duration::from_millis(450));
        assert_eq!(reader.await.unwrap(), 200 * 1024);
    }
}
