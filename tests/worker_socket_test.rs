// Worker socket server tests over a real Unix socket.
// Run with: cargo test --test worker_socket_test

mod common;

use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use tokio::net::UnixStream;
use wallet_bridge::host::connect_with_retry;
use wallet_bridge::{FramedTransport, RpcProxy, TransportConfig, WalletClient, WorkerServer};

use common::{router, CountingBackend, CONTEXT};

async fn client(socket: &std::path::Path, app_id: &str) -> (Arc<FramedTransport>, WalletClient) {
    let stream = UnixStream::connect(socket).await.unwrap();
    let (reader, writer) = stream.into_split();
    let transport = Arc::new(FramedTransport::new(writer, TransportConfig::default()));
    let proxy = RpcProxy::attach(&transport, app_id, CONTEXT, Some(Duration::from_secs(5)));
    transport.spawn_reader(reader);
    (transport, WalletClient::new(proxy))
}

#[tokio::test]
async fn test_server_answers_calls_over_socket() {
    let tmp = TempDir::new().unwrap();
    let socket = tmp.path().join("worker.sock");
    let backend = Arc::new(CountingBackend::default());
    let server =
        WorkerServer::start(socket.clone(), router(&backend), TransportConfig::default()).unwrap();

    let (_transport, wallet) = client(&socket, "alpha").await;
    let accounts = wallet.get_accounts().await.unwrap();
    assert_eq!(accounts["method"], "getAccounts");
    assert_eq!(accounts["app"], "alpha");

    let sender = wallet.register_sender("0x1234", Some("bob")).await.unwrap();
    assert_eq!(sender["args"], json!(["0x1234", "bob"]));

    server.shutdown();
    assert!(!socket.exists(), "socket file should be removed on shutdown");
}

#[tokio::test]
async fn test_socket_is_owner_only_and_replaces_stale_file() {
    let tmp = TempDir::new().unwrap();
    let socket = tmp.path().join("nested").join("worker.sock");
    std::fs::create_dir_all(socket.parent().unwrap()).unwrap();
    std::fs::write(&socket, b"stale").unwrap();

    let backend = Arc::new(CountingBackend::default());
    let server =
        WorkerServer::start(socket.clone(), router(&backend), TransportConfig::default()).unwrap();

    let mode = std::fs::metadata(&socket).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode, 0o600);
    assert!(UnixStream::connect(&socket).await.is_ok());
    server.shutdown();
}

#[tokio::test]
async fn test_large_result_crosses_socket_in_chunks() {
    let tmp = TempDir::new().unwrap();
    let socket = tmp.path().join("worker.sock");
    let config = TransportConfig {
        chunk_threshold: 512,
        chunk_overhead: 200,
        ..TransportConfig::default()
    };
    let backend = Arc::new(CountingBackend::default());
    let _server = WorkerServer::start(socket.clone(), router(&backend), config.clone()).unwrap();

    let stream = connect_with_retry(&socket, 3, 10).await.unwrap();
    let (reader, writer) = stream.into_split();
    let transport = Arc::new(FramedTransport::new(writer, config));
    let proxy = RpcProxy::attach(&transport, "alpha", CONTEXT, Some(Duration::from_secs(5)));
    transport.spawn_reader(reader);

    let big = "z".repeat(10_000);
    let echoed = WalletClient::new(proxy)
        .get_contract_metadata(&big)
        .await
        .unwrap();
    assert_eq!(echoed["args"], json!([big]));
}

#[tokio::test]
async fn test_each_connection_gets_its_own_instance() {
    let tmp = TempDir::new().unwrap();
    let socket = tmp.path().join("worker.sock");
    let backend = Arc::new(CountingBackend::default());
    let _server =
        WorkerServer::start(socket.clone(), router(&backend), TransportConfig::default()).unwrap();

    let (_t1, alpha) = client(&socket, "alpha").await;
    let (_t2, beta) = client(&socket, "beta").await;
    let (a, b) = tokio::join!(alpha.get_address_book(), beta.get_address_book());

    assert_eq!(a.unwrap()["app"], "alpha");
    assert_eq!(b.unwrap()["app"], "beta");
    assert_eq!(
        backend
            .instances_built
            .load(std::sync::atomic::Ordering::SeqCst),
        2
    );
    assert_eq!(
        backend
            .resources_built
            .load(std::sync::atomic::Ordering::SeqCst),
        1
    );
}
