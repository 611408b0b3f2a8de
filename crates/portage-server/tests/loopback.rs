//! End-to-end tests over a real KCP loopback session: server and client in
//! one process, talking through the full encrypt/mux/HTTP stack on 127.0.0.1.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use portage_client::{CancelFlag, Client, Error, PackConfig, TaskStatus};
use portage_server::Config;

const PASSPHRASE: &str = "loopback-test-passphrase";

fn free_udp_addr() -> SocketAddr {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").expect("bind probe socket");
    socket.local_addr().expect("probe addr")
}

/// Start a server on a fresh port and return a connected client plus the
/// served root.
async fn start() -> (tempfile::TempDir, Arc<Client>, SocketAddr) {
    let root = tempfile::tempdir().expect("server root");
    let addr = free_udp_addr();
    let config = Config {
        bind: addr,
        root: root.path().to_path_buf(),
        passphrase: PASSPHRASE.into(),
    };
    tokio::spawn(async move {
        let _ = portage_server::run(config).await;
    });

    let client = Arc::new(Client::new(addr, PASSPHRASE).expect("client"));
    for attempt in 0..10 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if client.connect().await.is_ok() {
            break;
        }
        assert!(attempt < 9, "could not connect to loopback server");
    }
    (root, client, addr)
}

/// Deterministic but non-repeating payload.
fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 + i / 251) as u8).collect()
}

async fn upload_bytes(client: &Arc<Client>, dir: &Path, remote: &str, data: &[u8]) {
    let local = dir.join("upload-src");
    tokio::fs::write(&local, data).await.unwrap();
    portage_client::upload_file(client, &local, remote, None, &CancelFlag::new())
        .await
        .unwrap();
}

async fn download_bytes(client: &Arc<Client>, dir: &Path, remote: &str) -> Vec<u8> {
    let local = dir.join("download-dst");
    let _ = tokio::fs::remove_file(&local).await;
    portage_client::download_file(client, remote, &local, None, &CancelFlag::new())
        .await
        .unwrap();
    tokio::fs::read(&local).await.unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn files_round_trip_byte_identical() {
    let (root, client, _) = start().await;
    let scratch = tempfile::tempdir().unwrap();

    // Empty, tiny, exactly at the chunk threshold, and multi-chunk.
    for (name, len) in [
        ("empty.bin", 0usize),
        ("one.bin", 1),
        ("threshold.bin", 4 * 1024 * 1024),
        ("big.bin", 5 * 1024 * 1024 + 137),
    ] {
        let data = payload(len);
        let remote = format!("/data/{name}");
        upload_bytes(&client, scratch.path(), &remote, &data).await;

        let on_disk = tokio::fs::read(root.path().join("data").join(name))
            .await
            .unwrap();
        assert_eq!(on_disk.len(), len, "{name} server copy");

        let back = download_bytes(&client, scratch.path(), &remote).await;
        assert_eq!(back, data, "{name} round trip");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn completed_download_is_not_refetched() {
    let (_root, client, _) = start().await;
    let scratch = tempfile::tempdir().unwrap();

    let data = payload(128 * 1024);
    upload_bytes(&client, scratch.path(), "/keep.bin", &data).await;

    let local = scratch.path().join("keep.bin");
    portage_client::download_file(&client, "/keep.bin", &local, None, &CancelFlag::new())
        .await
        .unwrap();
    let first_mtime = tokio::fs::metadata(&local).await.unwrap().modified().unwrap();

    // Second download sees a complete local copy and leaves it untouched.
    portage_client::download_file(&client, "/keep.bin", &local, None, &CancelFlag::new())
        .await
        .unwrap();
    let second_mtime = tokio::fs::metadata(&local).await.unwrap().modified().unwrap();
    assert_eq!(first_mtime, second_mtime);
    assert_eq!(tokio::fs::read(&local).await.unwrap(), data);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn truncated_download_resumes_to_a_correct_file() {
    let (_root, client, _) = start().await;
    let scratch = tempfile::tempdir().unwrap();

    let data = payload(512 * 1024);
    upload_bytes(&client, scratch.path(), "/resume.bin", &data).await;

    // Simulate an interrupted download: correct prefix, then stop.
    let local = scratch.path().join("resume.bin");
    tokio::fs::write(&local, &data[..100_000]).await.unwrap();

    portage_client::download_file(&client, "/resume.bin", &local, None, &CancelFlag::new())
        .await
        .unwrap();
    assert_eq!(tokio::fs::read(&local).await.unwrap(), data);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn wrong_passphrase_times_out_without_a_reply() {
    let (_root, _client, addr) = start().await;

    let imposter = Client::new(addr, "not-the-passphrase").unwrap();
    let started = std::time::Instant::now();
    let err = imposter.connect().await.unwrap_err();
    assert!(matches!(err, Error::Connection(_)), "got {err:?}");
    // Bounded by the handshake timeout, not hanging forever.
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!imposter.is_connected());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn escaping_paths_are_refused_without_side_effects() {
    let (root, client, _) = start().await;

    let outside = root.path().parent().unwrap().join("escape-marker");
    let _ = std::fs::remove_file(&outside);

    for op in [
        client.mkdir("../escape-marker").await,
        client.delete("/../escape-marker").await,
        client.stat("a/../../escape-marker").await.map(drop),
    ] {
        match op {
            Err(Error::PathSafety(_)) => {}
            other => panic!("expected PathSafety, got {other:?}"),
        }
    }
    assert!(!outside.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn file_management_actions_work_end_to_end() {
    let (_root, client, _) = start().await;

    client.mkdir("/docs/drafts").await.unwrap();
    client.save_file("/docs/drafts/note.txt", "first draft").await.unwrap();
    assert_eq!(client.read_file("/docs/drafts/note.txt").await.unwrap(), "first draft");

    let listing = client.list("/docs", true).await.unwrap();
    let paths: Vec<_> = listing.iter().map(|i| i.path.as_str()).collect();
    assert_eq!(paths, vec!["/docs/drafts", "/docs/drafts/note.txt"]);

    client
        .rename("/docs/drafts/note.txt", "/docs/note.txt")
        .await
        .unwrap();
    let stat = client.stat("/docs/note.txt").await.unwrap();
    assert!(!stat.is_dir);
    assert_eq!(stat.size, "first draft".len() as u64);

    #[cfg(unix)]
    {
        client.chmod("/docs/note.txt", 0o600).await.unwrap();
        let stat = client.stat("/docs/note.txt").await.unwrap();
        assert_eq!(stat.mode_num & 0o777, 0o600);
    }

    let sum = client.checksum("/docs/note.txt").await.unwrap();
    assert_eq!(sum.len(), 64);

    client.delete("/docs").await.unwrap();
    let err = client.stat("/docs/note.txt").await.unwrap_err();
    assert!(matches!(err, Error::Protocol { status: 404, .. }), "got {err:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn remote_compress_and_extract_round_trip() {
    let (root, client, _) = start().await;

    client.mkdir("/src").await.unwrap();
    client.save_file("/src/a.txt", "alpha").await.unwrap();
    client.save_file("/src/b.txt", "beta").await.unwrap();

    client
        .compress_remote(
            &["/src".to_string()],
            "/bundle.tar.gz",
            portage_client::ArchiveFormat::TarGz,
        )
        .await
        .unwrap();
    assert!(root.path().join("bundle.tar.gz").exists());

    client.extract_remote("/bundle.tar.gz", Some("/restored")).await.unwrap();
    assert_eq!(
        std::fs::read_to_string(root.path().join("restored/src/a.txt")).unwrap(),
        "alpha"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn packed_folder_upload_auto_extracts_on_the_server() {
    let (root, client, _) = start().await;
    let scratch = tempfile::tempdir().unwrap();

    let folder = scratch.path().join("album");
    std::fs::create_dir_all(folder.join("inner")).unwrap();
    std::fs::write(folder.join("cover.jpg"), payload(2048)).unwrap();
    std::fs::write(folder.join("inner/track.txt"), b"la la la").unwrap();

    let pack = PackConfig { enabled: true, threshold_bytes: 10 * 1024 * 1024 };
    portage_client::pack::upload_packed(
        &client,
        &folder,
        "/music/album",
        &pack,
        None,
        &CancelFlag::new(),
    )
    .await
    .unwrap();

    // The server extracts in the background after replying; poll for it.
    let extracted = root.path().join("music/album/cover.jpg");
    let archive = root.path().join("music/album.tar.gz");
    for _ in 0..100 {
        if extracted.exists() && !archive.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(extracted.exists(), "archive was not extracted");
    assert!(!archive.exists(), "archive was not cleaned up");
    assert_eq!(
        std::fs::read_to_string(root.path().join("music/album/inner/track.txt")).unwrap(),
        "la la la"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn canceled_download_task_leaves_no_partial_output() {
    let (_root, client, _) = start().await;
    let scratch = tempfile::tempdir().unwrap();

    // Big enough that the transfer is still in flight when the cancel lands.
    let data = payload(32 * 1024 * 1024);
    upload_bytes(&client, scratch.path(), "/doomed.bin", &data).await;

    let manager = portage_client::TaskManager::new(
        Arc::clone(&client),
        PackConfig::default(),
        3,
        None,
    );
    let local = scratch.path().join("doomed.bin");
    let task = manager.add_download_task("/doomed.bin", &local);

    for _ in 0..200 {
        if task.status() == TaskStatus::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(task.status(), TaskStatus::Running);
    assert!(manager.cancel_task(&task.id));

    for _ in 0..200 {
        if task.status().is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(task.status(), TaskStatus::Canceled);

    // Neither the destination nor any chunk scratch dir survives.
    assert!(!local.exists(), "partial download was left behind");
    let leftovers: Vec<_> = std::fs::read_dir(scratch.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with(".tmp_"))
        .collect();
    assert!(leftovers.is_empty(), "scratch dirs left behind: {leftovers:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn task_manager_runs_a_download_to_completion() {
    let (_root, client, _) = start().await;
    let scratch = tempfile::tempdir().unwrap();

    let data = payload(256 * 1024);
    upload_bytes(&client, scratch.path(), "/tasked.bin", &data).await;

    let done = Arc::new(tokio::sync::Notify::new());
    let on_complete: portage_client::CompletionFn = {
        let done = Arc::clone(&done);
        Arc::new(move |task| {
            assert!(task.status().is_terminal());
            done.notify_one();
        })
    };
    let manager = portage_client::TaskManager::new(
        Arc::clone(&client),
        PackConfig::default(),
        3,
        Some(on_complete),
    );

    let local = scratch.path().join("tasked.bin");
    let task = manager.add_download_task("/tasked.bin", &local);

    tokio::time::timeout(Duration::from_secs(30), done.notified())
        .await
        .expect("task did not finish in time");
    assert_eq!(task.status(), TaskStatus::Completed);
    assert_eq!(task.progress(), 1.0);
    assert!(task.error().is_none());
    assert_eq!(tokio::fs::read(&local).await.unwrap(), data);
}
