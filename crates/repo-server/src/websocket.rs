//! WebSocket transport adapters.
//!
//! `WebSocketServerAdapter` accepts clients on a `TcpListener`; each client
//! must open with a join frame naming its peer id and is answered with the
//! server's own. `WebSocketClientAdapter` is the other end, used by native
//! peers (and the tests) to reach a server.
//!
//! After the join exchange every frame is a JSON `MessageEnvelope`. Each
//! connection gets a writer task fed by an unbounded channel, so
//! `NetworkAdapter::send` never blocks.

use crate::message::{JoinMessage, MAX_MESSAGE_SIZE};
use futures::{SinkExt, StreamExt};
use repo_net::protocol::{ChannelId, MessageEnvelope};
use repo_net::transport::{self, AdapterEvent, NetworkAdapter, TransportError};
use repo_net::{EventBus, PeerId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, connect_async};
use tracing::{debug, error, info, warn};

/// How long a fresh connection may take to send its join frame.
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

type Outbound = mpsc::UnboundedSender<Message>;

/// Payload of a data frame. `None` ends the read loop.
fn frame_data(msg: Message) -> Option<Option<Vec<u8>>> {
    match msg {
        Message::Binary(data) => Some(Some(data.to_vec())),
        Message::Text(text) => Some(Some(text.as_bytes().to_vec())),
        Message::Close(_) => None,
        _ => Some(None),
    }
}

/// Forward queued frames to the socket until the queue is dropped.
async fn write_loop<S>(mut sink: S, mut queue: mpsc::UnboundedReceiver<Message>)
where
    S: futures::Sink<Message> + Unpin,
{
    while let Some(msg) = queue.recv().await {
        if sink.send(msg).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}

fn encode(envelope: &MessageEnvelope) -> transport::Result<Message> {
    let json = envelope
        .to_json()
        .map_err(|e| TransportError::SendFailed(e.to_string()))?;
    Ok(Message::Binary(json.into()))
}

// ============================================================================
// Server
// ============================================================================

struct Client {
    conn_id: u64,
    outbound: Outbound,
}

#[derive(Default)]
struct ServerState {
    local_peer: Option<PeerId>,
    clients: HashMap<PeerId, Client>,
    next_conn_id: u64,
    closed: bool,
}

pub struct WebSocketServerAdapter {
    events: Arc<EventBus<AdapterEvent>>,
    state: Mutex<ServerState>,
    shutdown: watch::Sender<bool>,
}

impl WebSocketServerAdapter {
    pub fn new() -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            events: Arc::new(EventBus::new()),
            state: Mutex::new(ServerState::default()),
            shutdown,
        })
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Peers with an open socket.
    pub fn clients(&self) -> Vec<PeerId> {
        let mut peers: Vec<_> = self.lock().clients.keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Accept connections until the adapter is disconnected.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown.subscribe();
        if let Ok(addr) = listener.local_addr() {
            info!("WebSocket server listening on {}", addr);
        }
        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, addr)) => {
                        let adapter = Arc::clone(&self);
                        tokio::spawn(async move { adapter.accept(stream, addr).await });
                    }
                    Err(e) => error!("Failed to accept connection: {}", e),
                },
                _ = shutdown.wait_for(|closed| *closed) => break,
            }
        }
        debug!("WebSocket server stopped accepting");
    }

    async fn accept(self: Arc<Self>, stream: tokio::net::TcpStream, addr: SocketAddr) {
        let ws = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                // Health checks connect and close without upgrading.
                debug!("WebSocket upgrade failed for {}: {}", addr, e);
                return;
            }
        };
        let (mut write, mut read) = ws.split();

        let join = match tokio::time::timeout(JOIN_TIMEOUT, read.next()).await {
            Ok(Some(Ok(msg))) => frame_data(msg).flatten().and_then(|d| JoinMessage::from_bytes(&d)),
            _ => None,
        };
        let Some(join) = join else {
            warn!("Connection from {} did not join, closing", addr);
            let _ = write.close().await;
            return;
        };
        let peer_id = join.peer_id;

        let local = self.lock().local_peer.clone();
        let Some(local) = local else {
            warn!("Rejecting {}: adapter is not connected", peer_id);
            let _ = write.close().await;
            return;
        };
        let reply = match JoinMessage::new(local).to_json() {
            Ok(reply) => reply,
            Err(e) => {
                error!("Failed to encode join reply: {}", e);
                return;
            }
        };
        if let Err(e) = write.send(Message::Text(reply.into())).await {
            debug!("Failed to answer join from {}: {}", peer_id, e);
            return;
        }

        let (outbound, queue) = mpsc::unbounded_channel();
        let (conn_id, replaced) = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.next_conn_id += 1;
            let conn_id = state.next_conn_id;
            let old = state.clients.insert(peer_id.clone(), Client { conn_id, outbound });
            (conn_id, old.is_some())
        };
        tokio::spawn(write_loop(write, queue));

        info!("Peer {} joined from {}", peer_id, addr);
        if replaced {
            debug!("Peer {} reconnected, dropping its previous socket", peer_id);
            self.events.emit(AdapterEvent::PeerDisconnected {
                peer_id: peer_id.clone(),
            });
        }
        self.events.emit(AdapterEvent::PeerCandidate {
            peer_id: peer_id.clone(),
            channel_id: ChannelId::sync(),
        });

        while let Some(frame) = read.next().await {
            let msg = match frame {
                Ok(msg) => msg,
                Err(e) => {
                    debug!("Connection to {} failed: {}", peer_id, e);
                    break;
                }
            };
            let data = match frame_data(msg) {
                None => break,
                Some(None) => continue,
                Some(Some(data)) => data,
            };
            if data.len() > MAX_MESSAGE_SIZE {
                warn!("Frame from {} exceeds max size ({} bytes), dropping", peer_id, data.len());
                continue;
            }
            match MessageEnvelope::from_json(&data) {
                Ok(envelope) if envelope.sender_id.as_ref() == Some(&peer_id) => {
                    self.events.emit(AdapterEvent::Message(envelope))
                }
                Ok(envelope) => warn!(
                    "Dropping frame from {} claiming sender {:?}",
                    peer_id, envelope.sender_id
                ),
                Err(e) => warn!("Dropping malformed frame from {}: {}", peer_id, e),
            }
        }

        let gone = {
            let mut state = self.lock();
            let ours = state.clients.get(&peer_id).map(|c| c.conn_id) == Some(conn_id);
            if ours {
                state.clients.remove(&peer_id);
            }
            ours
        };
        if gone {
            info!("Peer {} left", peer_id);
            self.events.emit(AdapterEvent::PeerDisconnected { peer_id });
        }
    }
}

impl NetworkAdapter for WebSocketServerAdapter {
    fn events(&self) -> &Arc<EventBus<AdapterEvent>> {
        &self.events
    }

    fn connect(&self, peer_id: PeerId) {
        self.lock().local_peer = Some(peer_id);
        self.events.emit(AdapterEvent::Ready);
    }

    fn send(&self, envelope: MessageEnvelope) -> transport::Result<()> {
        let target = envelope
            .target_id
            .clone()
            .ok_or_else(|| TransportError::PeerNotFound("envelope has no target".to_string()))?;
        let msg = encode(&envelope)?;
        let state = self.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        let client = state
            .clients
            .get(&target)
            .ok_or_else(|| TransportError::PeerNotFound(target.to_string()))?;
        client
            .outbound
            .send(msg)
            .map_err(|_| TransportError::SendFailed(format!("connection to {} is closed", target)))
    }

    fn disconnect(&self) {
        let clients = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            std::mem::take(&mut state.clients)
        };
        self.shutdown.send_replace(true);

        // Dropping each outbound queue closes its socket.
        for peer_id in clients.into_keys() {
            self.events.emit(AdapterEvent::PeerDisconnected { peer_id });
        }
        self.events.emit(AdapterEvent::Close);
    }
}

// ============================================================================
// Client
// ============================================================================

#[derive(Default)]
struct ClientState {
    outbound: Option<Outbound>,
    remote_peer: Option<PeerId>,
    closed: bool,
}

pub struct WebSocketClientAdapter {
    url: String,
    events: Arc<EventBus<AdapterEvent>>,
    state: Arc<Mutex<ClientState>>,
}

impl WebSocketClientAdapter {
    pub fn new(url: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            url: url.into(),
            events: Arc::new(EventBus::new()),
            state: Arc::new(Mutex::new(ClientState::default())),
        })
    }

    /// The server's peer id, once joined.
    pub fn remote_peer(&self) -> Option<PeerId> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remote_peer
            .clone()
    }

    async fn run(
        url: String,
        peer_id: PeerId,
        state: Arc<Mutex<ClientState>>,
        events: Arc<EventBus<AdapterEvent>>,
    ) -> transport::Result<()> {
        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let (mut write, mut read) = ws.split();

        let join = JoinMessage::new(peer_id)
            .to_json()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        write
            .send(Message::Text(join.into()))
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let server = match tokio::time::timeout(JOIN_TIMEOUT, read.next()).await {
            Ok(Some(Ok(msg))) => frame_data(msg).flatten().and_then(|d| JoinMessage::from_bytes(&d)),
            _ => None,
        }
        .ok_or_else(|| TransportError::ConnectionFailed(format!("{} did not answer the join", url)))?;
        let remote = server.peer_id;

        let (outbound, queue) = mpsc::unbounded_channel();
        {
            let mut s = state.lock().unwrap_or_else(|e| e.into_inner());
            if s.closed {
                return Ok(());
            }
            s.outbound = Some(outbound);
            s.remote_peer = Some(remote.clone());
        }
        tokio::spawn(write_loop(write, queue));

        info!("Joined {} as {}", remote, url);
        events.emit(AdapterEvent::Ready);
        events.emit(AdapterEvent::PeerCandidate {
            peer_id: remote.clone(),
            channel_id: ChannelId::sync(),
        });

        while let Some(Ok(msg)) = read.next().await {
            let data = match frame_data(msg) {
                None => break,
                Some(None) => continue,
                Some(Some(data)) => data,
            };
            match MessageEnvelope::from_json(&data) {
                Ok(envelope) => events.emit(AdapterEvent::Message(envelope)),
                Err(e) => warn!("Dropping malformed frame from {}: {}", remote, e),
            }
        }

        let gone = {
            let mut s = state.lock().unwrap_or_else(|e| e.into_inner());
            s.outbound = None;
            s.remote_peer.take()
        };
        if let Some(peer_id) = gone {
            info!("Connection to {} closed", peer_id);
            events.emit(AdapterEvent::PeerDisconnected { peer_id });
        }
        Ok(())
    }
}

impl NetworkAdapter for WebSocketClientAdapter {
    fn events(&self) -> &Arc<EventBus<AdapterEvent>> {
        &self.events
    }

    /// Dial the server. Requires a running tokio runtime.
    fn connect(&self, peer_id: PeerId) {
        let url = self.url.clone();
        let state = Arc::clone(&self.state);
        let events = Arc::clone(&self.events);
        tokio::spawn(async move {
            if let Err(e) = Self::run(url.clone(), peer_id, state, Arc::clone(&events)).await {
                warn!("WebSocket connection to {} failed: {}", url, e);
                events.emit(AdapterEvent::Error {
                    peer_id: None,
                    channel_id: None,
                    error: Arc::new(e),
                });
            }
        });
    }

    fn send(&self, envelope: MessageEnvelope) -> transport::Result<()> {
        let msg = encode(&envelope)?;
        let s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if s.closed {
            return Err(TransportError::Closed);
        }
        let outbound = s
            .outbound
            .as_ref()
            .ok_or_else(|| TransportError::SendFailed("not joined yet".to_string()))?;
        outbound
            .send(msg)
            .map_err(|_| TransportError::SendFailed("connection is closed".to_string()))
    }

    fn disconnect(&self) {
        let gone = {
            let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if s.closed {
                return;
            }
            s.closed = true;
            s.outbound = None;
            s.remote_peer.take()
        };
        if let Some(peer_id) = gone {
            self.events.emit(AdapterEvent::PeerDisconnected { peer_id });
        }
        self.events.emit(AdapterEvent::Close);
    }
}
