//! Ephemeral pub/sub: presence, cursors and other data that is never stored.
//!
//! `broadcast` fans a payload out to every known peer on an `m/<name>`
//! channel; the repo turns the resulting `Message` events into stamped
//! ephemeral envelopes. Inbound payloads surface as `Data` events.

use crate::events::EventBus;
use crate::protocol::ChannelId;
use crate::PeerId;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
pub enum EphemeralEvent {
    /// Bytes to hand to the network.
    Message {
        target_id: PeerId,
        channel_id: ChannelId,
        message: Vec<u8>,
        broadcast: bool,
    },
    /// Payload received from a peer.
    Data {
        sender_id: PeerId,
        channel_id: ChannelId,
        data: Vec<u8>,
    },
}

#[derive(Default)]
pub struct EphemeralData {
    peers: Mutex<BTreeSet<PeerId>>,
    events: Arc<EventBus<EphemeralEvent>>,
}

impl EphemeralData {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> &Arc<EventBus<EphemeralEvent>> {
        &self.events
    }

    pub fn add_peer(&self, peer_id: PeerId) {
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(peer_id);
    }

    pub fn remove_peer(&self, peer_id: &PeerId) {
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(peer_id);
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Send `data` to every peer on `channel` (a bare name gets the `m/`
    /// prefix).
    pub fn broadcast(&self, channel: &str, data: Vec<u8>) {
        let channel_id = ChannelId::ephemeral(channel);
        for target_id in self.peers() {
            self.events.emit(EphemeralEvent::Message {
                target_id,
                channel_id: channel_id.clone(),
                message: data.clone(),
                broadcast: true,
            });
        }
    }

    pub fn receive(&self, sender_id: &PeerId, channel_id: &ChannelId, data: &[u8]) {
        self.events.emit(EphemeralEvent::Data {
            sender_id: sender_id.clone(),
            channel_id: channel_id.clone(),
            data: data.to_vec(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(s: &str) -> PeerId {
        s.parse().unwrap()
    }

    #[test]
    fn test_broadcast_reaches_every_peer() {
        let bus = EphemeralData::new();
        bus.add_peer(peer("bob"));
        bus.add_peer(peer("carol"));
        bus.remove_peer(&peer("carol"));
        bus.add_peer(peer("dave"));

        let sent = Arc::new(Mutex::new(Vec::new()));
        let sent_clone = Arc::clone(&sent);
        let _sub = bus.events().subscribe(move |event| {
            if let EphemeralEvent::Message {
                target_id,
                channel_id,
                ..
            } = event
            {
                sent_clone.lock().unwrap().push((target_id, channel_id));
            }
        });

        bus.broadcast("presence", b"here".to_vec());
        assert_eq!(
            *sent.lock().unwrap(),
            vec![
                (peer("bob"), ChannelId::from("m/presence")),
                (peer("dave"), ChannelId::from("m/presence")),
            ]
        );
    }

    #[test]
    fn test_receive_emits_data() {
        let bus = EphemeralData::new();
        let got = Arc::new(Mutex::new(None));
        let got_clone = Arc::clone(&got);
        let _sub = bus.events().subscribe(move |event| {
            if let EphemeralEvent::Data { sender_id, data, .. } = event {
                *got_clone.lock().unwrap() = Some((sender_id, data));
            }
        });
        bus.receive(&peer("bob"), &ChannelId::ephemeral("cursor"), b"1,2");
        assert_eq!(*got.lock().unwrap(), Some((peer("bob"), b"1,2".to_vec())));
    }
}
