//! In-process adapter pair.
//!
//! `MemoryAdapter::pair()` returns two adapters wired to each other through
//! unbounded tokio channels. Each side runs a pump task (spawned on `connect`,
//! so a tokio runtime must be running) that turns frames into adapter events.
//!
//! Announcement: on connect a side sends `Arrive`; the receiver answers with
//! `Welcome`. Whichever frame arrives first emits the `PeerCandidate`, so each
//! side sees exactly one candidate regardless of connect order.

use super::{AdapterEvent, NetworkAdapter, Result, TransportError};
use crate::events::EventBus;
use crate::protocol::{ChannelId, MessageEnvelope};
use crate::PeerId;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug)]
enum Frame {
    Arrive(PeerId),
    Welcome(PeerId),
    Message(MessageEnvelope),
    Leave,
}

#[derive(Default)]
struct State {
    outbound: Option<mpsc::UnboundedSender<Frame>>,
    inbound: Option<mpsc::UnboundedReceiver<Frame>>,
    local_peer: Option<PeerId>,
    remote_peer: Option<PeerId>,
    closed: bool,
}

pub struct MemoryAdapter {
    events: Arc<EventBus<AdapterEvent>>,
    state: Arc<Mutex<State>>,
}

impl MemoryAdapter {
    /// Two adapters connected to each other.
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let a = Self::new(b_tx, a_rx);
        let b = Self::new(a_tx, b_rx);
        (Arc::new(a), Arc::new(b))
    }

    fn new(outbound: mpsc::UnboundedSender<Frame>, inbound: mpsc::UnboundedReceiver<Frame>) -> Self {
        Self {
            events: Arc::new(EventBus::new()),
            state: Arc::new(Mutex::new(State {
                outbound: Some(outbound),
                inbound: Some(inbound),
                ..Default::default()
            })),
        }
    }

    /// Peer on the other end, once it has announced itself.
    pub fn remote_peer(&self) -> Option<PeerId> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remote_peer
            .clone()
    }

    async fn pump(
        mut inbound: mpsc::UnboundedReceiver<Frame>,
        state: Arc<Mutex<State>>,
        events: Arc<EventBus<AdapterEvent>>,
    ) {
        while let Some(frame) = inbound.recv().await {
            let event = {
                let mut s = state.lock().unwrap_or_else(|e| e.into_inner());
                if s.closed {
                    break;
                }
                match frame {
                    Frame::Arrive(peer_id) => {
                        if let (Some(tx), Some(local)) = (&s.outbound, &s.local_peer) {
                            let _ = tx.send(Frame::Welcome(local.clone()));
                        }
                        Self::announce(&mut s, peer_id)
                    }
                    Frame::Welcome(peer_id) => Self::announce(&mut s, peer_id),
                    Frame::Message(envelope) => Some(AdapterEvent::Message(envelope)),
                    Frame::Leave => s
                        .remote_peer
                        .take()
                        .map(|peer_id| AdapterEvent::PeerDisconnected { peer_id }),
                }
            };
            if let Some(event) = event {
                events.emit(event);
            }
        }

        // Sender dropped without a Leave frame.
        let gone = state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remote_peer
            .take();
        if let Some(peer_id) = gone {
            debug!("Memory channel to {} closed", peer_id);
            events.emit(AdapterEvent::PeerDisconnected { peer_id });
        }
    }

    fn announce(s: &mut State, peer_id: PeerId) -> Option<AdapterEvent> {
        if s.remote_peer.is_some() {
            return None;
        }
        s.remote_peer = Some(peer_id.clone());
        Some(AdapterEvent::PeerCandidate {
            peer_id,
            channel_id: ChannelId::sync(),
        })
    }
}

impl NetworkAdapter for MemoryAdapter {
    fn events(&self) -> &Arc<EventBus<AdapterEvent>> {
        &self.events
    }

    fn connect(&self, peer_id: PeerId) {
        let inbound = {
            let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
            s.local_peer = Some(peer_id.clone());
            if let Some(tx) = &s.outbound {
                let _ = tx.send(Frame::Arrive(peer_id));
            }
            s.inbound.take()
        };

        if let Some(inbound) = inbound {
            tokio::spawn(Self::pump(
                inbound,
                Arc::clone(&self.state),
                Arc::clone(&self.events),
            ));
        }
        self.events.emit(AdapterEvent::Ready);
    }

    fn send(&self, envelope: MessageEnvelope) -> Result<()> {
        let s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if s.closed {
            return Err(TransportError::Closed);
        }
        let tx = s.outbound.as_ref().ok_or(TransportError::Closed)?;
        tx.send(Frame::Message(envelope))
            .map_err(|_| TransportError::SendFailed("remote end dropped".to_string()))
    }

    fn disconnect(&self) {
        let gone = {
            let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if s.closed {
                return;
            }
            s.closed = true;
            if let Some(tx) = s.outbound.take() {
                let _ = tx.send(Frame::Leave);
            }
            s.remote_peer.take()
        };

        if let Some(peer_id) = gone {
            self.events.emit(AdapterEvent::PeerDisconnected { peer_id });
        }
        self.events.emit(AdapterEvent::Close);
    }
}
