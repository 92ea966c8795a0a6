//! AuthChannel: a duplex byte pipe for handshake traffic.
//!
//! Filters one adapter's inbound stream down to a single channel id from a
//! single remote peer, so handshake messages share the physical connection
//! with application traffic without being mixed into it.

use super::AuthError;
use crate::events::{EventBus, Subscription};
use crate::protocol::{ChannelId, MessageEnvelope};
use crate::transport::{AdapterEvent, NetworkAdapter};
use crate::PeerId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub struct AuthChannel {
    adapter: Arc<dyn NetworkAdapter>,
    local_peer_id: PeerId,
    remote_peer_id: PeerId,
    channel_id: ChannelId,
    messages: Arc<EventBus<Vec<u8>>>,
    closed: Arc<AtomicBool>,
    subscription: Mutex<Option<Subscription<AdapterEvent>>>,
}

impl AuthChannel {
    /// Open on the shared `auth_channel`.
    pub fn open(adapter: Arc<dyn NetworkAdapter>, local_peer_id: PeerId, remote_peer_id: PeerId) -> Arc<Self> {
        Self::open_on(adapter, local_peer_id, remote_peer_id, ChannelId::auth())
    }

    /// Open on a specific channel, e.g. a per-share `a/<shareId>` channel.
    pub fn open_on(
        adapter: Arc<dyn NetworkAdapter>,
        local_peer_id: PeerId,
        remote_peer_id: PeerId,
        channel_id: ChannelId,
    ) -> Arc<Self> {
        let messages = Arc::new(EventBus::new());
        let closed = Arc::new(AtomicBool::new(false));

        let subscription = {
            let messages = Arc::clone(&messages);
            let closed = Arc::clone(&closed);
            let remote = remote_peer_id.clone();
            let channel = channel_id.clone();
            adapter.events().subscribe(move |event| {
                let AdapterEvent::Message(envelope) = event else {
                    return;
                };
                if closed.load(Ordering::Acquire)
                    || envelope.channel_id != channel
                    || envelope.sender_id.as_ref() != Some(&remote)
                {
                    return;
                }
                messages.emit(envelope.message);
            })
        };

        Arc::new(Self {
            adapter,
            local_peer_id,
            remote_peer_id,
            channel_id,
            messages,
            closed,
            subscription: Mutex::new(Some(subscription)),
        })
    }

    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    pub fn remote_peer_id(&self) -> &PeerId {
        &self.remote_peer_id
    }

    /// Subscribe to inbound payloads.
    pub fn on_message(&self, callback: impl Fn(Vec<u8>) + Send + Sync + 'static) -> Subscription<Vec<u8>> {
        self.messages.subscribe(callback)
    }

    pub fn send(&self, message: Vec<u8>) -> Result<(), AuthError> {
        if self.is_closed() {
            return Err(AuthError::ChannelClosed);
        }
        let envelope = MessageEnvelope::sync(
            self.local_peer_id.clone(),
            self.remote_peer_id.clone(),
            self.channel_id.clone(),
            message,
        );
        Ok(self.adapter.send(envelope)?)
    }

    /// Stop filtering and drop every listener. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let subscription = self
            .subscription
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        drop(subscription);
        self.messages.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for AuthChannel {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryAdapter;
    use std::time::Duration;

    fn peer(s: &str) -> PeerId {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_filters_channel_and_sender() {
        let (a, b) = MemoryAdapter::pair();
        a.connect(peer("alice"));
        b.connect(peer("bob"));

        let channel = AuthChannel::open(b.clone(), peer("bob"), peer("alice"));
        let got = Arc::new(Mutex::new(Vec::new()));
        let got_clone = Arc::clone(&got);
        let _sub = channel.on_message(move |m| got_clone.lock().unwrap().push(m));

        a.send(MessageEnvelope::sync(peer("alice"), peer("bob"), ChannelId::auth(), vec![1]))
            .unwrap();
        a.send(MessageEnvelope::sync(peer("alice"), peer("bob"), ChannelId::sync(), vec![2]))
            .unwrap();
        a.send(MessageEnvelope::sync(peer("carol"), peer("bob"), ChannelId::auth(), vec![3]))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(*got.lock().unwrap(), vec![vec![1]]);
    }

    #[tokio::test]
    async fn test_duplex() {
        let (a, b) = MemoryAdapter::pair();
        a.connect(peer("alice"));
        b.connect(peer("bob"));

        let to_bob = AuthChannel::open(a.clone(), peer("alice"), peer("bob"));
        let to_alice = AuthChannel::open(b.clone(), peer("bob"), peer("alice"));
        let got = Arc::new(Mutex::new(Vec::new()));
        let got_clone = Arc::clone(&got);
        let _sub = to_alice.on_message(move |m| got_clone.lock().unwrap().push(m));

        to_bob.send(b"hello".to_vec()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*got.lock().unwrap(), vec![b"hello".to_vec()]);
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (a, b) = MemoryAdapter::pair();
        a.connect(peer("alice"));
        b.connect(peer("bob"));

        let channel = AuthChannel::open(a.clone(), peer("alice"), peer("bob"));
        let listener = AuthChannel::open(b.clone(), peer("bob"), peer("alice"));
        let got = Arc::new(Mutex::new(0usize));
        let got_clone = Arc::clone(&got);
        let _sub = listener.on_message(move |_| *got_clone.lock().unwrap() += 1);

        listener.close();
        listener.close();
        assert!(matches!(channel.send(vec![1]), Ok(())));
        channel.close();
        assert!(matches!(channel.send(vec![2]), Err(AuthError::ChannelClosed)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*got.lock().unwrap(), 0);
    }
}
