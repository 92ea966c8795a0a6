//! Network subsystem and repo routing without authentication.

mod common;

use common::{peer, record, ScriptedAdapter};
use repo_net::ephemeral::EphemeralEvent;
use repo_net::ids::SessionId;
use repo_net::protocol::{ChannelId, EphemeralMessage, MessageContents, MessageEnvelope, RepoMessage};
use repo_net::{NetworkAdapter, NetworkEvent, NetworkSubsystem, Repo, RepoConfig};
use std::sync::Arc;
use std::time::Duration;

fn ephemeral_from(sender: &str, target: &str, count: u64, broadcast: bool) -> MessageEnvelope {
    EphemeralMessage {
        sender_id: peer(sender),
        target_id: peer(target),
        channel_id: ChannelId::ephemeral("presence"),
        message: vec![count as u8],
        broadcast,
        count,
        session_id: SessionId::from("session-1"),
    }
    .into()
}

fn message_counts(events: &[NetworkEvent]) -> Vec<u64> {
    events
        .iter()
        .filter_map(|e| match e {
            NetworkEvent::Message(RepoMessage::Ephemeral(m)) => Some(m.count),
            _ => None,
        })
        .collect()
}

// ============================================================================
// Routing
// ============================================================================

#[tokio::test]
async fn test_peer_is_announced_before_its_messages() {
    let network = NetworkSubsystem::new(peer("alice"));
    let (seen, _sub) = record(network.events());
    let adapter = ScriptedAdapter::new();
    network.add_network_adapter(adapter.clone());

    adapter.candidate(peer("bob"));
    adapter.deliver(MessageEnvelope::sync(
        peer("bob"),
        peer("alice"),
        ChannelId::sync(),
        b"hi".to_vec(),
    ));

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 3);
    assert!(matches!(seen[0], NetworkEvent::Ready));
    assert!(matches!(&seen[1], NetworkEvent::Peer { peer_id } if *peer_id == peer("bob")));
    match &seen[2] {
        NetworkEvent::Message(RepoMessage::Sync(m)) => {
            assert_eq!(m.sender_id, peer("bob"));
            assert_eq!(m.message, b"hi");
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_send_stamps_sender_and_uses_owning_adapter() {
    let network = NetworkSubsystem::new(peer("alice"));
    let first = ScriptedAdapter::new();
    let second = ScriptedAdapter::new();
    network.add_network_adapter(first.clone());
    network.add_network_adapter(second.clone());
    assert_eq!(first.local_peer(), Some(peer("alice")));

    second.candidate(peer("bob"));
    network.send(MessageContents::Sync {
        target_id: peer("bob"),
        channel_id: ChannelId::sync(),
        message: b"doc".to_vec(),
        broadcast: false,
    });

    assert!(first.sent().is_empty());
    let sent = second.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].sender_id, Some(peer("alice")));
    assert_eq!(sent[0].target_id, Some(peer("bob")));
}

#[tokio::test]
async fn test_send_to_unknown_peer_is_dropped() {
    let network = NetworkSubsystem::new(peer("alice"));
    let (seen, _sub) = record(network.events());
    let adapter = ScriptedAdapter::new();
    network.add_network_adapter(adapter.clone());

    network.send(MessageContents::Sync {
        target_id: peer("nobody"),
        channel_id: ChannelId::sync(),
        message: Vec::new(),
        broadcast: false,
    });

    assert!(adapter.sent().is_empty());
    assert!(!seen
        .lock()
        .unwrap()
        .iter()
        .any(|e| matches!(e, NetworkEvent::Error { .. })));
}

#[tokio::test]
async fn test_first_adapter_keeps_the_peer() {
    let network = NetworkSubsystem::new(peer("alice"));
    let (seen, _sub) = record(network.events());
    let first = ScriptedAdapter::new();
    let second = ScriptedAdapter::new();
    network.add_network_adapter(first.clone());
    network.add_network_adapter(second.clone());

    first.candidate(peer("bob"));
    second.candidate(peer("bob"));
    // Only the owning adapter can disconnect the peer.
    second.lose(peer("bob"));
    assert_eq!(network.peers(), vec![peer("bob")]);
    first.lose(peer("bob"));
    assert!(network.peers().is_empty());

    let seen = seen.lock().unwrap();
    let peers = seen.iter().filter(|e| matches!(e, NetworkEvent::Peer { .. })).count();
    let gone = seen
        .iter()
        .filter(|e| matches!(e, NetworkEvent::PeerDisconnected { .. }))
        .count();
    assert_eq!((peers, gone), (1, 1));
}

#[tokio::test]
async fn test_adapter_close_purges_its_peers() {
    let network = NetworkSubsystem::new(peer("alice"));
    let adapter = ScriptedAdapter::new();
    network.add_network_adapter(adapter.clone());
    adapter.candidate(peer("bob"));
    adapter.candidate(peer("carol"));
    assert_eq!(network.peers().len(), 2);

    adapter.disconnect();
    assert!(network.peers().is_empty());
    assert_eq!(network.adapter_count(), 0);
}

#[tokio::test]
async fn test_malformed_envelope_is_dropped() {
    let network = NetworkSubsystem::new(peer("alice"));
    let adapter = ScriptedAdapter::new();
    network.add_network_adapter(adapter.clone());
    adapter.candidate(peer("bob"));
    let (seen, _sub) = record(network.events());

    let mut unknown = MessageEnvelope::sync(peer("bob"), peer("alice"), ChannelId::sync(), Vec::new());
    unknown.msg_type = "gossip".to_string();
    let mut anonymous = MessageEnvelope::sync(peer("bob"), peer("alice"), ChannelId::sync(), Vec::new());
    anonymous.sender_id = None;
    let mut uncounted = ephemeral_from("bob", "alice", 1, false);
    uncounted.count = None;

    adapter.deliver(unknown);
    adapter.deliver(anonymous);
    adapter.deliver(uncounted);
    assert!(seen.lock().unwrap().is_empty());
}

// ============================================================================
// Ephemeral dedup
// ============================================================================

#[tokio::test]
async fn test_stale_ephemeral_messages_are_dropped() {
    let network = NetworkSubsystem::new(peer("alice"));
    let adapter = ScriptedAdapter::new();
    network.add_network_adapter(adapter.clone());
    adapter.candidate(peer("bob"));
    let (seen, _sub) = record(network.events());

    for count in [1, 3, 2, 4] {
        adapter.deliver(ephemeral_from("bob", "alice", count, false));
    }
    assert_eq!(message_counts(&seen.lock().unwrap()), vec![1, 3, 4]);
}

#[tokio::test]
async fn test_new_session_restarts_the_sequence() {
    let network = NetworkSubsystem::new(peer("alice"));
    let adapter = ScriptedAdapter::new();
    network.add_network_adapter(adapter.clone());
    adapter.candidate(peer("bob"));
    let (seen, _sub) = record(network.events());

    adapter.deliver(ephemeral_from("bob", "alice", 5, false));
    let mut restarted = ephemeral_from("bob", "alice", 1, false);
    restarted.session_id = Some(SessionId::from("session-2"));
    adapter.deliver(restarted);

    assert_eq!(message_counts(&seen.lock().unwrap()), vec![5, 1]);
}

// ============================================================================
// Readiness
// ============================================================================

#[tokio::test]
async fn test_ready_once_every_adapter_is_ready() {
    for order in [[0, 1, 2], [2, 0, 1], [1, 2, 0]] {
        let network = NetworkSubsystem::new(peer("alice"));
        let (seen, _sub) = record(network.events());
        let adapters: Vec<_> = (0..3).map(|_| ScriptedAdapter::slow()).collect();
        for adapter in &adapters {
            network.add_network_adapter(adapter.clone());
        }
        assert!(!network.is_ready());

        for (step, index) in order.iter().enumerate() {
            assert!(!network.is_ready(), "ready after {} adapters", step);
            adapters[*index].ready();
            // A repeated signal changes nothing.
            adapters[*index].ready();
        }

        assert!(network.is_ready());
        tokio::time::timeout(Duration::from_millis(10), network.when_ready())
            .await
            .unwrap();
        let ready = seen
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, NetworkEvent::Ready))
            .count();
        assert_eq!(ready, 1);
    }
}

#[tokio::test]
async fn test_when_ready_waits_for_late_adapter() {
    let network = NetworkSubsystem::new(peer("alice"));
    let adapter = ScriptedAdapter::slow();
    network.add_network_adapter(adapter.clone());

    let waiter = {
        let network = Arc::clone(&network);
        tokio::spawn(async move { network.when_ready().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    adapter.ready();
    tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .unwrap()
        .unwrap();
}

// ============================================================================
// Repo routing
// ============================================================================

#[tokio::test]
async fn test_repo_routes_ephemeral_channel_to_bus() {
    let adapter = ScriptedAdapter::new();
    let repo = Repo::new(RepoConfig {
        peer_id: Some(peer("alice")),
        network: vec![adapter.clone()],
        ..Default::default()
    });
    let (data, _sub) = record(repo.ephemeral().events());

    adapter.candidate(peer("bob"));
    adapter.deliver(MessageEnvelope::sync(
        peer("bob"),
        peer("alice"),
        ChannelId::ephemeral("cursor"),
        b"1,2".to_vec(),
    ));
    // Auth traffic never reaches the repo's consumers.
    adapter.deliver(MessageEnvelope::sync(
        peer("bob"),
        peer("alice"),
        ChannelId::auth(),
        b"hello".to_vec(),
    ));

    let data = data.lock().unwrap();
    assert_eq!(data.len(), 1);
    assert!(matches!(
        &data[0],
        EphemeralEvent::Data { sender_id, data, .. } if *sender_id == peer("bob") && data == b"1,2"
    ));
}

#[tokio::test]
async fn test_repo_broadcast_reaches_every_peer() {
    let adapter = ScriptedAdapter::new();
    let repo = Repo::new(RepoConfig {
        peer_id: Some(peer("alice")),
        network: vec![adapter.clone()],
        ..Default::default()
    });
    adapter.candidate(peer("bob"));
    adapter.candidate(peer("carol"));
    // Drop the sync requests sent on connect.
    let before = adapter.sent().len();

    repo.ephemeral().broadcast("presence", b"here".to_vec());

    let sent: Vec<_> = adapter.sent().into_iter().skip(before).collect();
    let mut targets: Vec<_> = sent.iter().filter_map(|e| e.target_id.clone()).collect();
    targets.sort();
    assert_eq!(targets, vec![peer("bob"), peer("carol")]);
    assert!(sent.iter().all(|e| e.is_ephemeral() && e.broadcast));
    assert_eq!(
        sent.iter().filter_map(|e| e.count).collect::<Vec<_>>(),
        vec![1, 2]
    );
}

#[tokio::test]
async fn test_relay_forwards_broadcasts_to_other_peers() {
    let first = ScriptedAdapter::new();
    let second = ScriptedAdapter::new();
    let _relay = Repo::new(RepoConfig {
        peer_id: Some(peer("server")),
        network: vec![first.clone(), second.clone()],
        relay: true,
        ..Default::default()
    });
    first.candidate(peer("bob"));
    second.candidate(peer("carol"));
    let (first_before, second_before) = (first.sent().len(), second.sent().len());

    first.deliver(ephemeral_from("bob", "server", 7, true));
    // Not a broadcast: consumed locally only.
    first.deliver(ephemeral_from("bob", "server", 8, false));

    let relayed: Vec<_> = second.sent().into_iter().skip(second_before).collect();
    assert_eq!(relayed.len(), 1);
    assert_eq!(relayed[0].sender_id, Some(peer("bob")));
    assert_eq!(relayed[0].target_id, Some(peer("carol")));
    assert_eq!(relayed[0].count, Some(7));
    assert_eq!(relayed[0].session_id, Some(SessionId::from("session-1")));
    assert_eq!(first.sent().len(), first_before);
}
