//! The control channel end to end over Unix sockets.

use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::watch;

use execguard::control::client::ControlClient;
use execguard::control::handshake::KeyMaterial;
use execguard::control::protocol::{Request, ServerFrame};
use execguard::control::server::ControlServer;
use execguard::control::session::SessionRegistry;
use execguard::control::ControlError;
use execguard::identity::Digest;
use execguard::notify::app::AppSink;
use execguard::notify::{BlockedNotice, NoticeSink};

use crate::support::engine;

fn server() -> Arc<ControlServer> {
    let (engine, _notices) = engine();
    Arc::new(ControlServer::new(
        engine,
        Arc::new(SessionRegistry::new()),
        KeyMaterial::generate(),
    ))
}

fn connect(server: &Arc<ControlServer>) -> ControlClient {
    let (ours, theirs) = UnixStream::pair().expect("should create socket pair");
    let server = Arc::clone(server);
    tokio::spawn(async move { server.handle_connection(theirs).await });
    ControlClient::from_stream(ours)
}

#[tokio::test]
async fn authenticated_client_can_change_policy() {
    let server = server();
    let mut client = connect(&server);

    client
        .authenticate(&KeyMaterial::generate())
        .await
        .expect("handshake should succeed");
    client
        .call(&Request::AllowTemporarily {
            digest: Digest::of_bytes(b"x"),
        })
        .await
        .expect("allow should be acknowledged");
}

#[tokio::test]
async fn unauthenticated_call_is_refused() {
    let server = server();
    let mut client = connect(&server);

    match client.call(&Request::GrantCallerAccess { pid: 3 }).await {
        Err(ControlError::Unauthorized) => {}
        other => panic!("expected unauthorized, got {other:?}"),
    }
}

#[tokio::test]
async fn garbage_before_handshake_closes_connection() {
    let server = server();
    let (ours, theirs) = UnixStream::pair().expect("should create socket pair");
    let handler = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.handle_connection(theirs).await })
    };

    let (reader, mut writer) = ours.into_split();
    writer
        .write_all(b"{not json}\n")
        .await
        .expect("should write");
    let mut lines = BufReader::new(reader).lines();

    let first = lines
        .next_line()
        .await
        .expect("should read")
        .expect("server should answer before closing");
    let frame: ServerFrame = serde_json::from_str(&first).expect("frame should parse");
    assert_eq!(frame, ServerFrame::Unauthorized);
    assert_eq!(lines.next_line().await.expect("should read"), None);

    tokio::time::timeout(Duration::from_secs(1), handler)
        .await
        .expect("handler should finish")
        .expect("handler should not panic");
    assert_eq!(server.sessions().authenticated_count(), 0);
}

#[tokio::test]
async fn notices_reach_authenticated_clients_only() {
    let server = server();
    let sink = AppSink::new(Arc::clone(server.sessions()));
    let mut watcher = connect(&server);
    let _bystander = connect(&server);

    watcher
        .authenticate(&KeyMaterial::generate())
        .await
        .expect("handshake should succeed");

    let notice = BlockedNotice {
        name: "Evil".to_owned(),
        path: "/Applications/Evil.app/Contents/MacOS/Evil".to_owned(),
        digest: Some(Digest::of_bytes(b"evil")),
        signing_id: None,
        parent_pid: 1,
        tty: None,
    };
    sink.deliver(&notice).await.expect("one session should receive");

    match watcher.next_frame().await {
        Ok(ServerFrame::BlockedNotice { name, digest, .. }) => {
            assert_eq!(name, "Evil");
            assert_eq!(digest, notice.digest);
        }
        other => panic!("expected blocked notice, got {other:?}"),
    }
}

#[tokio::test]
async fn session_ends_with_connection() {
    let server = server();
    let mut client = connect(&server);
    client
        .authenticate(&KeyMaterial::generate())
        .await
        .expect("handshake should succeed");
    assert_eq!(server.sessions().authenticated_count(), 1);

    drop(client);
    for _ in 0..100 {
        if server.sessions().authenticated_count() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session should be removed after disconnect");
}

#[tokio::test]
async fn bound_socket_is_owner_only_and_serves() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let path = dir.path().join("run/control.sock");
    let listener = ControlServer::bind(&path).expect("should bind");

    let mode = std::fs::metadata(&path)
        .expect("socket should exist")
        .permissions()
        .mode();
    assert_eq!(mode & 0o777, 0o600);

    let server = server();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let serving = tokio::spawn(Arc::clone(&server).serve(listener, shutdown_rx));

    let mut client = ControlClient::connect(&path).await.expect("should connect");
    client
        .authenticate(&KeyMaterial::generate())
        .await
        .expect("handshake should succeed");

    shutdown_tx.send(true).expect("server should be listening");
    tokio::time::timeout(Duration::from_secs(1), serving)
        .await
        .expect("server should stop")
        .expect("server should not panic");
}

#[tokio::test]
async fn rebinding_replaces_stale_socket() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let path = dir.path().join("control.sock");
    let first = ControlServer::bind(&path).expect("should bind");
    drop(first);
    ControlServer::bind(&path).expect("stale socket should be replaced");
}
