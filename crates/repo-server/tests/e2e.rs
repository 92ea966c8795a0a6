//! End-to-end tests for repo-server.
//!
//! Covers the HTTP bootstrap surface, the raw WebSocket join protocol and a
//! full authenticated sync from a client repo into server storage.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use futures::{SinkExt, StreamExt};
use repo_net::auth::{create_device, create_user, AuthProviderConfig, PublicIdentity};
use repo_net::protocol::{ChannelId, MessageEnvelope};
use repo_net::{AdapterEvent, AuthProvider, NetworkAdapter, PeerId, Repo, RepoConfig, ShareId};
use repo_server::{JoinMessage, Server, WebSocketClientAdapter, WebSocketServerAdapter};
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tower::ServiceExt;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ============================================================================
// Helpers
// ============================================================================

fn peer(s: &str) -> PeerId {
    s.parse().unwrap()
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

async fn request(server: &Server, req: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = server.router().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, json)
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn alice() -> Arc<AuthProvider> {
    AuthProvider::new(AuthProviderConfig::new(create_device("alice", "laptop")).with_user(create_user("alice")))
}

/// Share owned by `provider` that lists `server_keys`, as a `POST /teams` body.
fn registration(provider: &AuthProvider, share: &ShareId, server_keys: PublicIdentity) -> serde_json::Value {
    provider.add_server(share, server_keys).unwrap();
    serde_json::json!({
        "serializedGraph": serde_json::to_string(&provider.team(share).unwrap()).unwrap(),
        "teamKeyring": provider.keyring(share).unwrap(),
    })
}

async fn server_keys(server: &Server) -> PublicIdentity {
    let (status, json) = request(server, Request::get("/keys").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    serde_json::from_value(json).unwrap()
}

async fn listen() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

async fn join(addr: SocketAddr, peer_id: &str) -> (Client, JoinMessage) {
    let (mut ws, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
    let hello = JoinMessage::new(peer(peer_id)).to_json().unwrap();
    ws.send(Message::Text(hello.into())).await.unwrap();
    let reply = recv(&mut ws).await;
    (ws, JoinMessage::from_bytes(&reply).expect("expected a join reply"))
}

async fn recv(ws: &mut Client) -> Vec<u8> {
    let next = timeout(Duration::from_secs(2), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Binary(data))) => return data.to_vec(),
                Some(Ok(Message::Text(text))) => return text.as_bytes().to_vec(),
                Some(Ok(_)) => continue,
                other => panic!("connection ended: {:?}", other),
            }
        }
    });
    next.await.expect("timed out waiting for a frame")
}

// ============================================================================
// HTTP
// ============================================================================

#[tokio::test]
async fn test_liveness_and_keys() {
    let dir = TempDir::new().unwrap();
    let server = Server::open(dir.path(), "sync.test").unwrap();

    let response = server
        .router()
        .oneshot(Request::get("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let keys = server_keys(&server).await;
    assert_eq!(keys.id, "sync.test");
    assert_eq!(keys, server.provider().public_keys());
}

#[tokio::test]
async fn test_register_team_persists_share() {
    let dir = TempDir::new().unwrap();
    let share = {
        let server = Server::open(dir.path(), "sync.test").unwrap();
        let alice = alice();
        let share = alice.create_share(Vec::new()).unwrap();
        let body = registration(&alice, &share, server_keys(&server).await);

        let (status, json) = request(&server, post_json("/teams", body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["id"], "sync.test");
        assert_eq!(server.provider().share_ids(), vec![share.clone()]);
        share
    };
    assert!(dir.path().join("shares.json").exists());

    let restarted = Server::open(dir.path(), "sync.test").unwrap();
    assert_eq!(restarted.provider().share_ids(), vec![share.clone()]);
    assert!(restarted.provider().team(&share).unwrap().members.len() == 1);
}

#[tokio::test]
async fn test_register_team_rejects_bad_input() {
    let dir = TempDir::new().unwrap();
    let server = Server::open(dir.path(), "sync.test").unwrap();
    let alice = alice();
    let share = alice.create_share(Vec::new()).unwrap();

    // Team without this server on it.
    let unlisted = serde_json::json!({
        "serializedGraph": serde_json::to_string(&alice.team(&share).unwrap()).unwrap(),
        "teamKeyring": alice.keyring(&share).unwrap(),
    });
    let (status, json) = request(&server, post_json("/teams", unlisted)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("does not list"));

    let garbled = serde_json::json!({
        "serializedGraph": "{not json",
        "teamKeyring": alice.keyring(&share).unwrap(),
    });
    let (status, _) = request(&server, post_json("/teams", garbled)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = request(&server, post_json("/teams", serde_json::json!({ "nope": 1 }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(server.provider().share_ids().is_empty());
}

// ============================================================================
// WebSocket adapter
// ============================================================================

#[tokio::test]
async fn test_join_then_envelopes() {
    let adapter = WebSocketServerAdapter::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let _sub = {
        let seen = Arc::clone(&seen);
        adapter.events().subscribe(move |e| seen.lock().unwrap().push(e))
    };
    adapter.connect(peer("server"));
    let (listener, addr) = listen().await;
    tokio::spawn(Arc::clone(&adapter).serve(listener));

    let (mut ws, reply) = join(addr, "client-1").await;
    assert_eq!(reply.peer_id, peer("server"));
    assert!(eventually(|| adapter.clients() == vec![peer("client-1")]).await);

    let inbound = MessageEnvelope::sync(peer("client-1"), peer("server"), ChannelId::sync(), b"up".to_vec());
    let spoofed = MessageEnvelope::sync(peer("mallory"), peer("server"), ChannelId::sync(), b"x".to_vec());
    ws.send(Message::Binary(spoofed.to_json().unwrap().into())).await.unwrap();
    ws.send(Message::Binary(b"garbage".to_vec().into())).await.unwrap();
    ws.send(Message::Binary(inbound.to_json().unwrap().into())).await.unwrap();

    let delivered = || {
        seen.lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                AdapterEvent::Message(env) => Some(env.clone()),
                _ => None,
            })
            .collect::<Vec<_>>()
    };
    assert!(eventually(|| !delivered().is_empty()).await);
    assert_eq!(delivered(), vec![inbound]);

    let outbound = MessageEnvelope::sync(peer("server"), peer("client-1"), ChannelId::sync(), b"down".to_vec());
    adapter.send(outbound.clone()).unwrap();
    assert_eq!(MessageEnvelope::from_json(&recv(&mut ws).await).unwrap(), outbound);
    assert!(adapter
        .send(MessageEnvelope::sync(peer("server"), peer("nobody"), ChannelId::sync(), Vec::new()))
        .is_err());

    ws.close(None).await.unwrap();
    assert!(eventually(|| adapter.clients().is_empty()).await);
    let seen = seen.lock().unwrap();
    let kinds: Vec<_> = seen
        .iter()
        .filter(|e| !matches!(e, AdapterEvent::Message(_)))
        .map(|e| format!("{:?}", e))
        .collect();
    assert_eq!(
        kinds,
        vec![
            "Ready".to_string(),
            "PeerCandidate(client-1, sync_channel)".to_string(),
            "PeerDisconnected(client-1)".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_connection_without_join_is_closed() {
    let adapter = WebSocketServerAdapter::new();
    adapter.connect(peer("server"));
    let (listener, addr) = listen().await;
    tokio::spawn(Arc::clone(&adapter).serve(listener));

    let (mut ws, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
    let envelope = MessageEnvelope::sync(peer("c"), peer("server"), ChannelId::sync(), Vec::new());
    ws.send(Message::Binary(envelope.to_json().unwrap().into())).await.unwrap();

    let ended = timeout(Duration::from_secs(2), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(ended.is_ok());
    assert!(adapter.clients().is_empty());
}

// ============================================================================
// Full sync
// ============================================================================

#[tokio::test]
async fn test_client_document_reaches_server_storage() {
    let dir = TempDir::new().unwrap();
    let server = Server::open(dir.path(), "sync.test").unwrap();
    let (listener, addr) = listen().await;
    server.spawn_sync(listener);

    let alice_auth = alice();
    let share = alice_auth.create_share(Vec::new()).unwrap();
    let body = registration(&alice_auth, &share, server_keys(&server).await);
    let (status, _) = request(&server, post_json("/teams", body)).await;
    assert_eq!(status, StatusCode::OK);

    let alice = Repo::new(RepoConfig {
        peer_id: Some(peer("alice")),
        network: vec![WebSocketClientAdapter::new(format!("ws://{}", addr))],
        auth_provider: Some(Arc::clone(&alice_auth)),
        ..Default::default()
    });
    timeout(Duration::from_secs(5), alice_auth.authenticated(&peer("sync.test")))
        .await
        .unwrap()
        .unwrap();
    assert!(eventually(|| server.repo().peers() == vec![peer("alice")]).await);

    let doc = alice.create();
    doc.change(|root| root.insert("foo", "bar")).unwrap();

    let id = doc.id().clone();
    assert!(
        eventually(|| server
            .repo()
            .synchronizer()
            .document(&id)
            .is_some_and(|d| d.value() == serde_json::json!({ "foo": "bar" })))
        .await
    );
    let stored = dir.path().join("documents").join(format!("{}.loro", id));
    assert!(eventually(|| stored.exists()).await);

    alice.shutdown();
    assert!(eventually(|| server.repo().peers().is_empty()).await);
    server.shutdown();
}
