// Two real sessions over loopback: one seeds a file, the other downloads
// it through the full stack (hello exchange, file negotiation, hash set,
// part transfer, verification).

use std::net::SocketAddr;
use std::path::Path;
use std::time::{Duration, Instant};

use libed2k_core::constants::PIECE_SIZE;
use libed2k_core::filehash::hash_buffer;

use crate::alerts::Alert;
use crate::session::Session;
use crate::settings::SessionSettings;
use crate::transfer::{AddTransferParams, TransferStatus};

fn test_settings() -> SessionSettings {
    SessionSettings {
        // Ephemeral port so parallel tests don't collide.
        listen_port: 0,
        transfer_tick_interval: Duration::from_millis(100),
        ..Default::default()
    }
}

fn make_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

async fn wait_for<F: Fn() -> bool>(what: &str, timeout: Duration, f: F) {
    let deadline = Instant::now() + timeout;
    while !f() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn spawn_seeder(dir: &Path, data: &[u8]) -> (std::sync::Arc<Session>, SocketAddr) {
    let path = dir.join("seed.bin");
    std::fs::write(&path, data).unwrap();
    let hashes = hash_buffer(data);
    let session = Session::new(test_settings()).await.unwrap();
    let mut params = AddTransferParams::new(hashes.file_hash, path, data.len() as u64);
    params.seed_mode = true;
    let handle = session.add_transfer(params).unwrap();
    wait_for("seeder to finish checking", Duration::from_secs(30), || {
        handle.status().unwrap() == TransferStatus::Seeding
    })
    .await;
    wait_for("seeder listener", Duration::from_secs(10), || {
        session.listen_addr().is_some()
    })
    .await;
    let port = session.listen_addr().unwrap().port();
    (session, SocketAddr::from(([127, 0, 0, 1], port)))
}

async fn download(
    data: &[u8],
    dir: &Path,
    seeder_addr: SocketAddr,
) -> (std::sync::Arc<Session>, std::path::PathBuf) {
    let hashes = hash_buffer(data);
    let out_path = dir.join("out.bin");
    let session = Session::new(test_settings()).await.unwrap();
    let handle = session
        .add_transfer(AddTransferParams::new(
            hashes.file_hash,
            &out_path,
            data.len() as u64,
        ))
        .unwrap();
    wait_for("downloader to go live", Duration::from_secs(10), || {
        handle.status().unwrap() == TransferStatus::Downloading
    })
    .await;
    handle.add_peer(seeder_addr).unwrap();

    let deadline = Instant::now() + Duration::from_secs(60);
    loop {
        assert!(Instant::now() < deadline, "download did not finish in time");
        match tokio::time::timeout(
            Duration::from_secs(1),
            session.wait_for_alert(Duration::from_secs(1)),
        )
        .await
        {
            Ok(Some(Alert::TransferFinished { .. })) => break,
            Ok(Some(Alert::TransferError { error, .. })) => panic!("transfer error: {error}"),
            _ => {}
        }
        if handle.status().unwrap() == TransferStatus::Seeding {
            break;
        }
    }
    (session, out_path)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_download_single_piece_file() {
    let dir = tempfile::tempdir().unwrap();
    let data = make_data(500_000);
    let (seeder, addr) = spawn_seeder(dir.path(), &data).await;
    let (downloader, out_path) = download(&data, dir.path(), addr).await;

    let written = std::fs::read(&out_path).unwrap();
    assert_eq!(written.len(), data.len());
    assert_eq!(written, data);

    downloader.stop().await;
    seeder.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_download_multi_piece_file_with_hashset_exchange() {
    let dir = tempfile::tempdir().unwrap();
    // Two pieces; the second is a single byte, the worst tail case.
    let data = make_data(PIECE_SIZE as usize + 1);
    let (seeder, addr) = spawn_seeder(dir.path(), &data).await;
    let (downloader, out_path) = download(&data, dir.path(), addr).await;

    let written = std::fs::read(&out_path).unwrap();
    assert_eq!(written, data);

    downloader.stop().await;
    seeder.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_self_connection_is_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let data = make_data(100_000);
    let hashes = hash_buffer(&data);
    let session = Session::new(test_settings()).await.unwrap();
    let handle = session
        .add_transfer(AddTransferParams::new(
            hashes.file_hash,
            dir.path().join("self.bin"),
            data.len() as u64,
        ))
        .unwrap();
    wait_for("transfer to go live", Duration::from_secs(10), || {
        handle.status().unwrap() == TransferStatus::Downloading
    })
    .await;
    wait_for("listener", Duration::from_secs(10), || {
        session.listen_addr().is_some()
    })
    .await;
    let port = session.listen_addr().unwrap().port();
    // Point the transfer at our own listener.
    handle.add_peer(SocketAddr::from(([127, 0, 0, 1], port))).unwrap();

    let deadline = Instant::now() + Duration::from_secs(15);
    let mut saw_self_connection = false;
    while Instant::now() < deadline && !saw_self_connection {
        if let Some(Alert::PeerDisconnected { reason, .. }) =
            session.wait_for_alert(Duration::from_millis(200)).await
        {
            saw_self_connection = reason.contains("ourselves");
        }
    }
    assert!(saw_self_connection, "expected a self-connection disconnect");
    // Nothing may remain connected.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(handle.num_peers().unwrap(), 0);
    session.stop().await;
}
