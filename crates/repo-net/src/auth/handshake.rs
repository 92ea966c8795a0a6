//! Handshake connection: authenticates one peer for one share.
//!
//! ```text
//! Start ──start()──▶ Authenticating ──▶ Connected ──▶ Disconnected
//!                          │                              ▲
//!                          └───── failure / Reject ───────┘
//! ```
//!
//! Both sides open with `Hello` (device identity, fresh nonce, claim). A
//! `Hello` also names the peer nonce its sender had already seen; a side that
//! receives a `Hello` which has not seen its own says hello again, so a
//! `Hello` dropped by a peer that did not know the share yet is recovered. A
//! member answering another member checks the device against the team and
//! sends `Prove`. A member answering an invitee validates the invitation,
//! admits it, sends `Admit` (team + keyring sealed under a Diffie-Hellman key
//! between the two devices) and then `Prove`. The invitee absorbs the team
//! (`Joined`) and sends its own `Prove`. `Prove` is a device signature over
//! the share id and both nonces. Once the local proof is out and the remote
//! proof verified, both sides derive the same session key (`Connected`).
//!
//! The connection is a pure state machine: `start`, `deliver` and `abort`
//! return the events they produced and outbound bytes go through the injected
//! send callback. It never retries on its own.

use super::crypto::{self, SymmetricKey};
use super::identity::{FullIdentity, IdentityKind, PublicIdentity};
use super::team::{now_ms, InvitationProof, InvitationSeed, Team, TeamKeyring};
use super::AuthError;
use crate::ids::{DocumentId, ShareId};
use crate::PeerId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Outbound byte sink for handshake messages.
pub type SendFn = Box<dyn Fn(Vec<u8>) -> Result<(), AuthError> + Send + Sync>;

/// What the sender claims to be.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Claim {
    Member { user_id: String },
    Server,
    InviteeMember { user: PublicIdentity, proof: InvitationProof },
    InviteeDevice { user_id: String, proof: InvitationProof },
}

/// Handshake wire messages (JSON).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum HandshakeMessage {
    Hello {
        share_id: ShareId,
        device: PublicIdentity,
        nonce: String,
        /// Nonce of the peer's `Hello`, if the sender had received it.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seen_nonce: Option<String>,
        claim: Claim,
        /// Members send their team graph and documents sealed under the team
        /// key so the other side can catch up on what it has not seen.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sealed_team: Option<String>,
    },
    Admit {
        sealed: String,
    },
    Prove {
        signature: String,
    },
    Reject {
        reason: String,
    },
}

impl HandshakeMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>, AuthError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, AuthError> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TeamSnapshot {
    team: Team,
    #[serde(default)]
    document_ids: Vec<DocumentId>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdmitPayload {
    team: Team,
    keyring: TeamKeyring,
    #[serde(default)]
    document_ids: Vec<DocumentId>,
    /// Full user identity, only for a device joining its own user.
    #[serde(default)]
    user: Option<FullIdentity>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Start,
    Authenticating,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The local invitee was admitted and now holds the team.
    Joined {
        team: Team,
        keyring: TeamKeyring,
        user: Option<FullIdentity>,
        document_ids: Vec<DocumentId>,
    },
    /// Mutual authentication succeeded.
    Connected { session_key: SymmetricKey },
    /// The team graph changed during the handshake.
    Change(Team),
    /// The peer's snapshot listed documents this side did not have.
    Documents(Vec<DocumentId>),
    LocalError(String),
    RemoteError(String),
    Disconnected,
}

/// Starting point of a connection.
pub enum InitialContext {
    /// Already on the team. `user` is the local user's full identity, if this
    /// device holds it; it is handed to devices the user invites.
    Member {
        device: FullIdentity,
        user: Option<FullIdentity>,
        team: Team,
        keyring: TeamKeyring,
    },
    /// New user joining with a member invitation.
    InviteeMember {
        user: FullIdentity,
        device: FullIdentity,
        share_id: ShareId,
        seed: InvitationSeed,
    },
    /// New device of an existing user joining with a device invitation.
    InviteeDevice {
        device: FullIdentity,
        user_id: String,
        share_id: ShareId,
        seed: InvitationSeed,
    },
}

/// Fields of an inbound `Hello` besides its share id.
struct RemoteHello {
    device: PublicIdentity,
    nonce: String,
    seen_nonce: Option<String>,
    claim: Claim,
    sealed_team: Option<String>,
}

enum Invitee {
    Member { user: FullIdentity, seed: InvitationSeed },
    Device { user_id: String, seed: InvitationSeed },
}

type Step = Result<(), String>;

pub struct Connection {
    share_id: ShareId,
    peer_id: PeerId,
    device: FullIdentity,
    user: Option<FullIdentity>,
    team: Option<Team>,
    keyring: Option<TeamKeyring>,
    document_ids: BTreeSet<DocumentId>,
    invitee: Option<Invitee>,
    state: ConnectionState,
    local_nonce: [u8; 32],
    remote_nonce: Option<[u8; 32]>,
    remote_device: Option<PublicIdentity>,
    proof_sent: bool,
    peer_verified: bool,
    pending_proof: Option<Vec<u8>>,
    send: SendFn,
}

impl Connection {
    pub fn new(share_id: ShareId, peer_id: PeerId, context: InitialContext, send: SendFn) -> Self {
        let (device, user, team, keyring, invitee) = match context {
            InitialContext::Member {
                device,
                user,
                team,
                keyring,
            } => (device, user, Some(team), Some(keyring), None),
            InitialContext::InviteeMember {
                user, device, seed, ..
            } => (
                device,
                Some(user.clone()),
                None,
                None,
                Some(Invitee::Member { user, seed }),
            ),
            InitialContext::InviteeDevice {
                device,
                user_id,
                seed,
                ..
            } => (device, None, None, None, Some(Invitee::Device { user_id, seed })),
        };

        Self {
            share_id,
            peer_id,
            device,
            user,
            team,
            keyring,
            document_ids: BTreeSet::new(),
            invitee,
            state: ConnectionState::Start,
            local_nonce: crypto::random_bytes(),
            remote_nonce: None,
            remote_device: None,
            proof_sent: false,
            peer_verified: false,
            pending_proof: None,
            send,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn share_id(&self) -> &ShareId {
        &self.share_id
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Team as currently known to this connection.
    pub fn team(&self) -> Option<&Team> {
        self.team.as_ref()
    }

    /// Documents authorized for the share, as known to this connection.
    pub fn document_ids(&self) -> &BTreeSet<DocumentId> {
        &self.document_ids
    }

    /// Catch up with the owner's copy of the share before handling traffic.
    /// Only a connection that already holds the team takes the update.
    pub fn refresh(&mut self, team: &Team, document_ids: &BTreeSet<DocumentId>) {
        if let Some(own) = self.team.as_mut() {
            own.merge(team);
            self.document_ids.extend(document_ids.iter().cloned());
        }
    }

    /// Send `Hello`. Calling it again is a no-op.
    pub fn start(&mut self) -> Vec<ConnectionEvent> {
        self.open(None)
    }

    fn open(&mut self, seen_nonce: Option<String>) -> Vec<ConnectionEvent> {
        if self.state != ConnectionState::Start {
            return Vec::new();
        }
        self.state = ConnectionState::Authenticating;
        debug!("Starting handshake with {} for share {}", self.peer_id, self.share_id);

        match self.hello(seen_nonce).and_then(|hello| self.transmit(&hello)) {
            Ok(()) => Vec::new(),
            Err(reason) => self.fail(reason),
        }
    }

    /// Feed one inbound handshake message. A connection that has not started
    /// yet answers with its own `Hello` first.
    pub fn deliver(&mut self, data: &[u8]) -> Vec<ConnectionEvent> {
        let parsed = HandshakeMessage::from_bytes(data);
        let fresh = self.state == ConnectionState::Start;
        let seen_nonce = match &parsed {
            Ok(HandshakeMessage::Hello { nonce, .. }) => Some(nonce.clone()),
            _ => None,
        };
        let mut events = self.open(seen_nonce);
        if self.state == ConnectionState::Disconnected {
            return events;
        }

        let message = match parsed {
            Ok(message) => message,
            Err(e) => {
                events.extend(self.fail(format!("malformed handshake message: {}", e)));
                return events;
            }
        };

        let step = match message {
            HandshakeMessage::Reject { reason } => {
                warn!("Peer {} rejected share {}: {}", self.peer_id, self.share_id, reason);
                self.state = ConnectionState::Disconnected;
                events.push(ConnectionEvent::RemoteError(reason));
                events.push(ConnectionEvent::Disconnected);
                return events;
            }
            HandshakeMessage::Hello {
                share_id,
                device,
                nonce,
                seen_nonce,
                claim,
                sealed_team,
            } => {
                let hello = RemoteHello {
                    device,
                    nonce,
                    seen_nonce,
                    claim,
                    sealed_team,
                };
                self.on_hello(share_id, hello, fresh, &mut events)
            }
            HandshakeMessage::Admit { sealed } => self.on_admit(&sealed, &mut events),
            HandshakeMessage::Prove { signature } => hex::decode(&signature)
                .map_err(|_| "proof is not hex".to_string())
                .and_then(|sig| self.on_prove(sig, &mut events)),
        };

        if let Err(reason) = step {
            events.extend(self.fail(reason));
        }
        events
    }

    /// Force the terminal state without notifying the peer (transport gone).
    pub fn abort(&mut self) -> Vec<ConnectionEvent> {
        if self.state == ConnectionState::Disconnected {
            return Vec::new();
        }
        self.state = ConnectionState::Disconnected;
        vec![ConnectionEvent::Disconnected]
    }

    fn fail(&mut self, reason: String) -> Vec<ConnectionEvent> {
        warn!(
            "Handshake with {} for share {} failed: {}",
            self.peer_id, self.share_id, reason
        );
        let reject = HandshakeMessage::Reject {
            reason: reason.clone(),
        };
        // Best effort; the channel may already be gone.
        let _ = self.transmit(&reject);
        self.state = ConnectionState::Disconnected;
        vec![
            ConnectionEvent::LocalError(reason),
            ConnectionEvent::Disconnected,
        ]
    }

    fn transmit(&self, message: &HandshakeMessage) -> Step {
        let bytes = message.to_bytes().map_err(|e| e.to_string())?;
        (self.send)(bytes).map_err(|e| e.to_string())
    }

    fn claim(&self) -> Result<Claim, String> {
        match &self.invitee {
            Some(Invitee::Member { user, seed }) => Ok(Claim::InviteeMember {
                user: user.redact(),
                proof: seed
                    .prove(&self.share_id, &user.id)
                    .map_err(|e| e.to_string())?,
            }),
            Some(Invitee::Device { user_id, seed }) => Ok(Claim::InviteeDevice {
                user_id: user_id.clone(),
                proof: seed
                    .prove(&self.share_id, &self.device.id)
                    .map_err(|e| e.to_string())?,
            }),
            None if self.device.kind == IdentityKind::Server => Ok(Claim::Server),
            None => {
                let user_id = self
                    .team
                    .as_ref()
                    .and_then(|t| t.device_owner(&self.device.id))
                    .map(|m| m.user.id.clone())
                    .ok_or_else(|| format!("device {} is not on the team", self.device.id))?;
                Ok(Claim::Member { user_id })
            }
        }
    }

    fn hello(&self, seen_nonce: Option<String>) -> Result<HandshakeMessage, String> {
        let sealed_team = match (&self.team, &self.keyring) {
            (Some(team), Some(keyring)) => {
                let snapshot = TeamSnapshot {
                    team: team.clone(),
                    document_ids: self.document_ids.iter().cloned().collect(),
                };
                let json = serde_json::to_vec(&snapshot).map_err(|e| e.to_string())?;
                Some(hex::encode(keyring.key.encrypt(&json).map_err(|e| e.to_string())?))
            }
            _ => None,
        };
        Ok(HandshakeMessage::Hello {
            share_id: self.share_id.clone(),
            device: self.device.redact(),
            nonce: hex::encode(self.local_nonce),
            seen_nonce,
            claim: self.claim()?,
            sealed_team,
        })
    }

    fn on_hello(
        &mut self,
        share_id: ShareId,
        hello: RemoteHello,
        fresh: bool,
        events: &mut Vec<ConnectionEvent>,
    ) -> Step {
        let RemoteHello {
            device,
            nonce,
            seen_nonce,
            claim,
            sealed_team,
        } = hello;
        if share_id != self.share_id {
            return Err(format!("hello for share {} on share {}", share_id, self.share_id));
        }
        let nonce: [u8; 32] = crypto::decode_hex_array(&nonce).map_err(|e| e.to_string())?;
        if let Some(known) = self.remote_nonce {
            if known == nonce {
                debug!("Ignoring repeated hello from {} for share {}", self.peer_id, self.share_id);
                return Ok(());
            }
            return Err("duplicate hello".to_string());
        }
        self.remote_nonce = Some(nonce);
        self.remote_device = Some(device.clone());

        let own_nonce = hex::encode(self.local_nonce);
        if !fresh && seen_nonce.as_deref() != Some(own_nonce.as_str()) {
            debug!("Saying hello again to {} for share {}", self.peer_id, self.share_id);
            let again = self.hello(Some(hex::encode(nonce)))?;
            self.transmit(&again)?;
        }

        if self.invitee.is_some() {
            // Wait for the member's Admit.
            return match claim {
                Claim::Member { .. } | Claim::Server => Ok(()),
                _ => Err("neither peer is a member of the share".to_string()),
            };
        }

        let (Some(team), Some(keyring)) = (self.team.as_mut(), self.keyring.as_ref()) else {
            return Err("no team state".to_string());
        };

        if let Some(sealed) = sealed_team {
            let opened = hex::decode(sealed)
                .ok()
                .and_then(|bytes| keyring.key.decrypt(&bytes).ok())
                .and_then(|json| serde_json::from_slice::<TeamSnapshot>(&json).ok())
                .ok_or_else(|| "could not open the peer's team snapshot".to_string())?;
            if team.merge(&opened.team) {
                debug!("Merged team {} version {} from {}", team.id, team.version, self.peer_id);
                events.push(ConnectionEvent::Change(team.clone()));
            }
            let unseen: Vec<DocumentId> = opened
                .document_ids
                .into_iter()
                .filter(|id| !self.document_ids.contains(id))
                .collect();
            if !unseen.is_empty() {
                self.document_ids.extend(unseen.iter().cloned());
                events.push(ConnectionEvent::Documents(unseen));
            }
        }

        let mut admit_user = None;
        match claim {
            Claim::Member { user_id } => {
                let known = team
                    .find_device(&device.id)
                    .is_some_and(|d| d.public_key == device.public_key);
                let owner = team.device_owner(&device.id).map(|m| m.user.id.as_str());
                if !known || owner != Some(user_id.as_str()) {
                    return Err(format!("device {} is not a member device", device.id));
                }
            }
            Claim::Server => {
                let known = team
                    .servers
                    .iter()
                    .any(|s| s.id == device.id && s.public_key == device.public_key);
                if !known {
                    return Err(format!("server {} is not on the team", device.id));
                }
            }
            Claim::InviteeMember { user, proof } => {
                team.admit_member(&proof, user, device.clone(), now_ms())
                    .map_err(|e| e.to_string())?;
                info!("Admitted new member via {} to share {}", self.peer_id, self.share_id);
                events.push(ConnectionEvent::Change(team.clone()));
                admit_user = Some(None);
            }
            Claim::InviteeDevice { user_id, proof } => {
                team.admit_device(&proof, device.clone(), now_ms())
                    .map_err(|e| e.to_string())?;
                if team.device_owner(&device.id).map(|m| m.user.id.as_str()) != Some(user_id.as_str()) {
                    return Err(format!("device invitation is not for user {}", user_id));
                }
                info!("Admitted device {} to share {}", device.id, self.share_id);
                events.push(ConnectionEvent::Change(team.clone()));
                admit_user = Some(self.user.clone().filter(|u| u.id == user_id));
            }
        }

        if let Some(user) = admit_user {
            self.send_admit(user)?;
        }
        self.send_prove(events)?;
        self.take_pending_proof(events)
    }

    fn admit_key(&self) -> Result<SymmetricKey, String> {
        let remote = self.remote_device.as_ref().ok_or("admit before hello")?;
        let shared = self.device.shared_secret(remote).map_err(|e| e.to_string())?;
        SymmetricKey::derive(
            &shared,
            &self.sorted_nonces()?,
            format!("admit|{}", self.share_id).as_bytes(),
        )
        .map_err(|e| e.to_string())
    }

    fn sorted_nonces(&self) -> Result<Vec<u8>, String> {
        let remote = self.remote_nonce.ok_or("no remote nonce")?;
        let (a, b) = if self.local_nonce <= remote {
            (self.local_nonce, remote)
        } else {
            (remote, self.local_nonce)
        };
        Ok([a, b].concat())
    }

    fn send_admit(&self, user: Option<FullIdentity>) -> Step {
        let (Some(team), Some(keyring)) = (&self.team, &self.keyring) else {
            return Err("no team state".to_string());
        };
        let payload = AdmitPayload {
            team: team.clone(),
            keyring: keyring.clone(),
            document_ids: self.document_ids.iter().cloned().collect(),
            user,
        };
        let json = serde_json::to_vec(&payload).map_err(|e| e.to_string())?;
        let sealed = self
            .admit_key()?
            .encrypt(&json)
            .map_err(|e| e.to_string())?;
        self.transmit(&HandshakeMessage::Admit {
            sealed: hex::encode(sealed),
        })
    }

    fn on_admit(&mut self, sealed: &str, events: &mut Vec<ConnectionEvent>) -> Step {
        let Some(invitee) = self.invitee.take() else {
            return Err("unexpected admit".to_string());
        };
        let bytes = hex::decode(sealed).map_err(|_| "admit is not hex".to_string())?;
        let json = self
            .admit_key()?
            .decrypt(&bytes)
            .map_err(|_| "could not open admit".to_string())?;
        let payload: AdmitPayload =
            serde_json::from_slice(&json).map_err(|e| format!("malformed admit: {}", e))?;

        if payload.team.id != self.share_id {
            return Err(format!("admitted to share {} instead of {}", payload.team.id, self.share_id));
        }
        let remote = self.remote_device.as_ref().ok_or("admit before hello")?;
        let admitter_known = payload
            .team
            .find_device(&remote.id)
            .is_some_and(|d| d.public_key == remote.public_key);
        if !admitter_known {
            return Err(format!("admitted by {} which is not on the team", remote.id));
        }
        if payload.team.find_device(&self.device.id).is_none() {
            return Err("admit does not include this device".to_string());
        }

        let user = match invitee {
            Invitee::Member { user, .. } => Some(user),
            Invitee::Device { user_id, .. } => payload.user.filter(|u| u.id == user_id),
        };
        if user.is_some() {
            self.user = user.clone();
        }
        self.team = Some(payload.team.clone());
        self.keyring = Some(payload.keyring.clone());
        self.document_ids = payload.document_ids.iter().cloned().collect();
        info!("Joined share {} via {}", self.share_id, self.peer_id);
        events.push(ConnectionEvent::Joined {
            team: payload.team,
            keyring: payload.keyring,
            user,
            document_ids: payload.document_ids,
        });

        self.send_prove(events)?;
        self.take_pending_proof(events)
    }

    fn send_prove(&mut self, events: &mut Vec<ConnectionEvent>) -> Step {
        let remote_nonce = self.remote_nonce.ok_or("prove before hello")?;
        let payload = prove_payload(&self.share_id, &self.device.id, &remote_nonce, &self.local_nonce);
        let signature = hex::encode(self.device.sign(&payload));
        self.transmit(&HandshakeMessage::Prove { signature })?;
        self.proof_sent = true;
        self.maybe_connect(events)
    }

    fn take_pending_proof(&mut self, events: &mut Vec<ConnectionEvent>) -> Step {
        match self.pending_proof.take() {
            Some(signature) => self.on_prove(signature, events),
            None => Ok(()),
        }
    }

    fn on_prove(&mut self, signature: Vec<u8>, events: &mut Vec<ConnectionEvent>) -> Step {
        // An invitee receives the member's proof right after the Admit; hold
        // it if we are not ready to check it yet.
        if self.team.is_none() || self.invitee.is_some() || !self.proof_sent {
            self.pending_proof = Some(signature);
            return Ok(());
        }
        let (Some(remote), Some(remote_nonce)) = (&self.remote_device, self.remote_nonce) else {
            return Err("prove before hello".to_string());
        };
        let payload = prove_payload(&self.share_id, &remote.id, &self.local_nonce, &remote_nonce);
        remote
            .verify(&payload, &signature)
            .map_err(|_| format!("invalid proof from {}", remote.id))?;
        self.peer_verified = true;
        self.maybe_connect(events)
    }

    fn maybe_connect(&mut self, events: &mut Vec<ConnectionEvent>) -> Step {
        if !(self.proof_sent && self.peer_verified) || self.state != ConnectionState::Authenticating {
            return Ok(());
        }
        let keyring = self.keyring.as_ref().ok_or("no keyring")?;
        let session_key = SymmetricKey::derive(
            keyring.key.as_bytes(),
            &self.sorted_nonces()?,
            format!("session|{}", self.share_id).as_bytes(),
        )
        .map_err(|e| e.to_string())?;
        self.state = ConnectionState::Connected;
        info!("Authenticated {} for share {}", self.peer_id, self.share_id);
        events.push(ConnectionEvent::Connected { session_key });
        Ok(())
    }
}

/// Bytes a device signs to prove itself: the verifier's nonce is the
/// challenge, the signer's nonce binds the proof to this session.
fn prove_payload(share_id: &ShareId, signer: &str, challenge: &[u8; 32], own: &[u8; 32]) -> Vec<u8> {
    let mut payload = format!("prove|{}|{}|", share_id, signer).into_bytes();
    payload.extend_from_slice(challenge);
    payload.extend_from_slice(own);
    payload
}
