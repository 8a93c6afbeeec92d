//! End-to-end: a real host, a TCP listener on loopback and thin clients.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sandbox_engine::ticker::ClockConfig;
use sandbox_engine::world::WorldConfig;
use sandbox_engine::world::block::Block;
use sandbox_engine::world::position::{BlockPos, ChunkPos};
use sandbox_server::block;
use sandbox_server::config::ServerConfig;
use sandbox_server::containers::{ContainerKey, PLAYER_SLOTS};
use sandbox_server::host::WorldHost;
use sandbox_server::net::client::RemoteClient;
use sandbox_server::net::listener;
use sandbox_server::remote::{Fetch, WaitOutcome};
use tokio::net::TcpListener;

fn config(dir: &Path) -> ServerConfig {
    ServerConfig {
        world_dir: dir.to_path_buf(),
        world: WorldConfig {
            view_distance: 1,
            ..WorldConfig::default()
        },
        clocks: ClockConfig::default(),
        autosave: None,
        ignore_lock: false,
        bind: None,
    }
}

async fn serve(dir: &Path) -> (Arc<WorldHost>, std::net::SocketAddr) {
    let host = Arc::new(WorldHost::open(config(dir)).unwrap());
    host.start().unwrap();
    let socket = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(listener::serve(Arc::clone(&host), socket));
    (host, addr)
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn repeated_fetches_send_one_request() {
    let dir = tempfile::tempdir().unwrap();
    let (host, addr) = serve(dir.path()).await;
    let client = RemoteClient::connect(addr, "ana", 1).await.unwrap();

    let pos = ChunkPos::new(0, 0);
    for _ in 0..5 {
        assert!(client.chunks().fetch(pos).is_pending());
    }
    let outcome = client.chunks().load(pos).await;
    let WaitOutcome::Resolved(Some(chunk)) = outcome else {
        panic!("spawn chunk should arrive, got a timeout or nothing");
    };
    assert_eq!(chunk.pos(), pos);
    assert!(matches!(client.chunks().fetch(pos), Fetch::Ready(Some(_))));

    let served = host.metrics().snapshot(0).requests_served;
    assert_eq!(served, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn clients_mirror_at_most_the_current_view_distance() {
    let dir = tempfile::tempdir().unwrap();
    let (host, addr) = serve(dir.path()).await;
    let before = RemoteClient::connect(addr, "ana", 3).await.unwrap();
    assert_eq!(before.view_distance(), 1);

    host.world().set_view_distance(2);
    let after = RemoteClient::connect(addr, "bo", 3).await.unwrap();
    assert_eq!(after.view_distance(), 2);
    assert_eq!(after.view().positions_nearest_first().len(), 25);
    assert_eq!(host.world().view_distance(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn listener_outlives_peers_that_hang_up_at_once() {
    let dir = tempfile::tempdir().unwrap();
    let (_host, addr) = serve(dir.path()).await;
    for _ in 0..20 {
        drop(tokio::net::TcpStream::connect(addr).await.unwrap());
    }
    let client = RemoteClient::connect(addr, "ana", 1).await.unwrap();
    assert!(client.is_connected());
}

#[tokio::test(flavor = "multi_thread")]
async fn edits_reach_other_viewers() {
    let dir = tempfile::tempdir().unwrap();
    let (host, addr) = serve(dir.path()).await;
    let ana = RemoteClient::connect(addr, "ana", 1).await.unwrap();
    let bo = RemoteClient::connect(addr, "bo", 1).await.unwrap();

    // High above the terrain, so the cell starts out as air.
    let target = BlockPos::new(5, 60);
    let pos = target.chunk();
    for client in [&ana, &bo] {
        assert!(matches!(client.chunks().load(pos).await, WaitOutcome::Resolved(Some(_))));
    }
    let resident = host.world().get_chunk(pos).unwrap();
    eventually("feature pass", || resident.is_decorated()).await;

    let log = Block::new(block::LOG);
    ana.set_block(target, log).unwrap();

    eventually("server to apply the edit", || host.world().get_block(target) == Some(log)).await;
    eventually("bo to see the edit", || bo.get_block(target) == Some(log)).await;
    assert_eq!(ana.get_block(target), Some(log));
}

#[tokio::test(flavor = "multi_thread")]
async fn containers_resolve_to_content_or_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let (_host, addr) = serve(dir.path()).await;
    let client = RemoteClient::connect(addr, "ana", 1).await.unwrap();

    let inventory = client.containers().load(&ContainerKey::player("ana")).await;
    let WaitOutcome::Resolved(Some(inventory)) = inventory else {
        panic!("own inventory should exist");
    };
    assert_eq!(inventory.slot_count(), PLAYER_SLOTS);
    assert!(inventory.is_empty());

    let chest = client
        .containers()
        .load(&ContainerKey::block(BlockPos::new(1, 1)))
        .await;
    assert_eq!(chest, WaitOutcome::Resolved(None));
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_persists_edits_and_releases_the_lock() {
    let dir = tempfile::tempdir().unwrap();
    let target = BlockPos::new(-3, 7);
    let placed = Block::new(block::LOG);

    {
        let host = WorldHost::open(config(dir.path())).unwrap();
        let world = Arc::clone(host.world());
        let chunk = tokio::task::spawn_blocking(move || world.ensure_loaded(target.chunk()))
            .await
            .unwrap()
            .unwrap();
        eventually("feature pass", || chunk.is_decorated()).await;
        host.world().set_block(target, placed).unwrap();

        assert!(host.shutdown().unwrap() >= 1);
        assert!(!dir.path().join("session.lock").exists());
    }

    let host = WorldHost::open(config(dir.path())).unwrap();
    let world = Arc::clone(host.world());
    tokio::task::spawn_blocking(move || world.ensure_loaded(target.chunk()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(host.world().get_block(target), Some(placed));
    host.shutdown().unwrap();
}

#[cfg(target_os = "linux")]
#[tokio::test(flavor = "multi_thread")]
async fn a_world_locked_by_a_live_process_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    // PID 1 always exists.
    std::fs::write(dir.path().join("session.lock"), "1").unwrap();
    assert!(WorldHost::open(config(dir.path())).is_err());

    let mut overridden = config(dir.path());
    overridden.ignore_lock = true;
    let host = WorldHost::open(overridden).unwrap();
    host.shutdown().unwrap();
    assert_eq!(std::fs::read_to_string(dir.path().join("session.lock")).unwrap(), "1");
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread")]
async fn a_stale_lock_is_taken_over() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("session.lock"), "999999999").unwrap();
    let host = WorldHost::open(config(dir.path())).unwrap();
    let holder = std::fs::read_to_string(dir.path().join("session.lock")).unwrap();
    assert_eq!(holder, std::process::id().to_string());
    host.shutdown().unwrap();
}
