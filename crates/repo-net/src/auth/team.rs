//! Team membership graph and invitations.
//!
//! A `Team` is safe to share with every member: it only holds public
//! identities and invitation public keys. The team secret lives separately in
//! a `TeamKeyring`.
//!
//! Invitations are seed based. The inviter keeps nothing secret: the team
//! records the invitation id and an Ed25519 public key, both derived from a
//! random seed that is handed to the invitee out of band. The invitee proves
//! possession of the seed by signing its own identity with the derived key.

use super::crypto::{self, CryptoError, SymmetricKey};
use super::identity::{FullIdentity, IdentityKind, PublicIdentity};
use crate::ids::ShareId;
use ed25519_dalek::{Signer, SigningKey};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TeamError {
    #[error("Invitation not found: {0}")]
    InvitationNotFound(String),

    #[error("Invitation {0} was revoked")]
    InvitationRevoked(String),

    #[error("Invitation {0} has expired")]
    InvitationExpired(String),

    #[error("Invitation {0} has no uses left")]
    InvitationExhausted(String),

    #[error("Invitation {0} is not valid for this kind of join")]
    WrongInvitationKind(String),

    #[error("Invalid invitation proof")]
    InvalidProof,

    #[error("Member not found: {0}")]
    MemberNotFound(String),

    #[error("{0} is already a member")]
    AlreadyMember(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

pub type Result<T> = std::result::Result<T, TeamError>;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    web_time::SystemTime::now()
        .duration_since(web_time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub user: PublicIdentity,
    pub devices: Vec<PublicIdentity>,
    pub admin: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InvitationKind {
    Member,
    Device {
        #[serde(rename = "userId")]
        user_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invitation {
    pub id: String,
    pub kind: InvitationKind,
    /// Hex-encoded verifying key derived from the seed.
    pub public_key: String,
    pub max_uses: u32,
    pub uses: u32,
    /// Milliseconds since the epoch; `None` never expires.
    pub expiration: Option<u64>,
    pub revoked: bool,
}

/// Options for `invite_member` / `invite_device`.
#[derive(Debug, Clone)]
pub struct InviteOptions {
    pub max_uses: u32,
    pub expiration: Option<Duration>,
}

impl Default for InviteOptions {
    fn default() -> Self {
        Self {
            max_uses: 1,
            expiration: None,
        }
    }
}

/// Team secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamKeyring {
    pub generation: u32,
    pub key: SymmetricKey,
}

impl TeamKeyring {
    pub fn generate() -> Self {
        Self {
            generation: 0,
            key: SymmetricKey::generate(),
        }
    }
}

/// Secret handed to an invitee out of band.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvitationSeed(String);

/// Invitee's proof that it holds a seed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvitationProof {
    pub id: String,
    pub signature: String,
}

impl InvitationSeed {
    pub fn generate() -> Self {
        Self(hex::encode(crypto::random_bytes::<16>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn expand(&self, info: &[u8]) -> crypto::Result<SymmetricKey> {
        SymmetricKey::derive(self.0.as_bytes(), b"repo-net/invitation", info)
    }

    /// Public invitation id derived from the seed.
    pub fn id(&self) -> crypto::Result<String> {
        Ok(hex::encode(&self.expand(b"id")?.as_bytes()[..16]))
    }

    fn signing_key(&self) -> crypto::Result<SigningKey> {
        Ok(SigningKey::from_bytes(self.expand(b"signing")?.as_bytes()))
    }

    pub fn public_key(&self) -> crypto::Result<String> {
        Ok(hex::encode(self.signing_key()?.verifying_key().to_bytes()))
    }

    pub fn prove(&self, share_id: &ShareId, invitee_id: &str) -> crypto::Result<InvitationProof> {
        let signature = self
            .signing_key()?
            .sign(&proof_payload(share_id, invitee_id));
        Ok(InvitationProof {
            id: self.id()?,
            signature: hex::encode(signature.to_bytes()),
        })
    }
}

impl std::fmt::Debug for InvitationSeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "InvitationSeed(..)")
    }
}

impl From<&str> for InvitationSeed {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

fn proof_payload(share_id: &ShareId, invitee_id: &str) -> Vec<u8> {
    format!("invitation|{}|{}", share_id, invitee_id).into_bytes()
}

/// Membership graph of one share.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Team {
    pub id: ShareId,
    pub name: String,
    pub members: Vec<Member>,
    pub servers: Vec<PublicIdentity>,
    pub invitations: Vec<Invitation>,
    /// Bumped on every mutation; merging keeps the higher one.
    pub version: u64,
}

impl Team {
    /// New team founded by `user` on `device`, with a fresh keyring.
    pub fn create(name: &str, user: &FullIdentity, device: &FullIdentity) -> (Self, TeamKeyring) {
        let team = Self {
            id: ShareId::generate(),
            name: name.to_string(),
            members: vec![Member {
                user: user.redact(),
                devices: vec![device.redact()],
                admin: true,
            }],
            servers: Vec::new(),
            invitations: Vec::new(),
            version: 1,
        };
        (team, TeamKeyring::generate())
    }

    pub fn member(&self, user_id: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.user.id == user_id)
    }

    pub fn add_member(&mut self, user: PublicIdentity, devices: Vec<PublicIdentity>, admin: bool) -> Result<()> {
        if self.member(&user.id).is_some() {
            return Err(TeamError::AlreadyMember(user.id));
        }
        self.members.push(Member { user, devices, admin });
        self.version += 1;
        Ok(())
    }

    pub fn add_device(&mut self, user_id: &str, device: PublicIdentity) -> Result<()> {
        let member = self
            .members
            .iter_mut()
            .find(|m| m.user.id == user_id)
            .ok_or_else(|| TeamError::MemberNotFound(user_id.to_string()))?;
        if member.devices.iter().any(|d| d.id == device.id) {
            return Err(TeamError::AlreadyMember(device.id));
        }
        member.devices.push(device);
        self.version += 1;
        Ok(())
    }

    /// Register a server. Re-adding a known server replaces its keys.
    pub fn add_server(&mut self, server: PublicIdentity) {
        self.servers.retain(|s| s.id != server.id);
        self.servers.push(server);
        self.version += 1;
    }

    /// Public identity allowed to authenticate as `device_id`: a member's
    /// device or a server.
    pub fn find_device(&self, device_id: &str) -> Option<&PublicIdentity> {
        self.members
            .iter()
            .flat_map(|m| m.devices.iter())
            .chain(self.servers.iter().filter(|s| s.kind == IdentityKind::Server))
            .find(|d| d.id == device_id)
    }

    /// Member owning `device_id`.
    pub fn device_owner(&self, device_id: &str) -> Option<&Member> {
        self.members
            .iter()
            .find(|m| m.devices.iter().any(|d| d.id == device_id))
    }

    pub fn invite_member(&mut self, options: &InviteOptions) -> Result<InvitationSeed> {
        self.invite(InvitationKind::Member, options)
    }

    pub fn invite_device(&mut self, user_id: &str, options: &InviteOptions) -> Result<InvitationSeed> {
        if self.member(user_id).is_none() {
            return Err(TeamError::MemberNotFound(user_id.to_string()));
        }
        self.invite(
            InvitationKind::Device {
                user_id: user_id.to_string(),
            },
            options,
        )
    }

    fn invite(&mut self, kind: InvitationKind, options: &InviteOptions) -> Result<InvitationSeed> {
        let seed = InvitationSeed::generate();
        self.invitations.push(Invitation {
            id: seed.id()?,
            kind,
            public_key: seed.public_key()?,
            max_uses: options.max_uses.max(1),
            uses: 0,
            expiration: options
                .expiration
                .map(|ttl| now_ms().saturating_add(ttl.as_millis() as u64)),
            revoked: false,
        });
        self.version += 1;
        Ok(seed)
    }

    pub fn revoke_invitation(&mut self, id: &str) -> Result<()> {
        let invitation = self
            .invitations
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or_else(|| TeamError::InvitationNotFound(id.to_string()))?;
        invitation.revoked = true;
        self.version += 1;
        Ok(())
    }

    /// Check that `proof` redeems a live invitation for `invitee_id`.
    pub fn validate_invitation(
        &self,
        proof: &InvitationProof,
        invitee_id: &str,
        now: u64,
    ) -> Result<&Invitation> {
        let invitation = self
            .invitations
            .iter()
            .find(|i| i.id == proof.id)
            .ok_or_else(|| TeamError::InvitationNotFound(proof.id.clone()))?;
        if invitation.revoked {
            return Err(TeamError::InvitationRevoked(proof.id.clone()));
        }
        if invitation.expiration.is_some_and(|exp| now > exp) {
            return Err(TeamError::InvitationExpired(proof.id.clone()));
        }
        if invitation.uses >= invitation.max_uses {
            return Err(TeamError::InvitationExhausted(proof.id.clone()));
        }

        let key = PublicIdentity {
            kind: IdentityKind::User,
            id: invitation.id.clone(),
            name: String::new(),
            public_key: invitation.public_key.clone(),
        };
        let signature = hex::decode(&proof.signature).map_err(|_| TeamError::InvalidProof)?;
        key.verify(&proof_payload(&self.id, invitee_id), &signature)
            .map_err(|_| TeamError::InvalidProof)?;
        Ok(invitation)
    }

    fn redeem(&mut self, id: &str) {
        if let Some(invitation) = self.invitations.iter_mut().find(|i| i.id == id) {
            invitation.uses += 1;
        }
    }

    /// Admit a new member (with its first device) using a member invitation.
    pub fn admit_member(
        &mut self,
        proof: &InvitationProof,
        user: PublicIdentity,
        device: PublicIdentity,
        now: u64,
    ) -> Result<()> {
        let invitation = self.validate_invitation(proof, &user.id, now)?;
        if invitation.kind != InvitationKind::Member {
            return Err(TeamError::WrongInvitationKind(proof.id.clone()));
        }
        self.redeem(&proof.id);
        self.add_member(user, vec![device], false)
    }

    /// Admit an additional device for an existing member.
    pub fn admit_device(&mut self, proof: &InvitationProof, device: PublicIdentity, now: u64) -> Result<()> {
        let invitation = self.validate_invitation(proof, &device.id, now)?;
        let InvitationKind::Device { user_id } = invitation.kind.clone() else {
            return Err(TeamError::WrongInvitationKind(proof.id.clone()));
        };
        self.redeem(&proof.id);
        self.add_device(&user_id, device)
    }

    /// Fold `other` into this team. Membership only grows, so two copies
    /// that admitted different people concurrently both keep everyone:
    /// members and devices are unioned, invitation use counts take the
    /// maximum and a revocation on either side sticks. Returns whether
    /// anything changed.
    pub fn merge(&mut self, other: &Team) -> bool {
        if other.id != self.id {
            return false;
        }
        let mut changed = false;

        for theirs in &other.members {
            match self.members.iter_mut().find(|m| m.user.id == theirs.user.id) {
                Some(ours) => {
                    for device in &theirs.devices {
                        if !ours.devices.iter().any(|d| d.id == device.id) {
                            ours.devices.push(device.clone());
                            changed = true;
                        }
                    }
                    if theirs.admin && !ours.admin {
                        ours.admin = true;
                        changed = true;
                    }
                }
                None => {
                    self.members.push(theirs.clone());
                    changed = true;
                }
            }
        }

        for server in &other.servers {
            if !self.servers.iter().any(|s| s.id == server.id) {
                self.servers.push(server.clone());
                changed = true;
            }
        }

        for theirs in &other.invitations {
            match self.invitations.iter_mut().find(|i| i.id == theirs.id) {
                Some(ours) => {
                    if theirs.uses > ours.uses {
                        ours.uses = theirs.uses;
                        changed = true;
                    }
                    if theirs.revoked && !ours.revoked {
                        ours.revoked = true;
                        changed = true;
                    }
                }
                None => {
                    self.invitations.push(theirs.clone());
                    changed = true;
                }
            }
        }

        if other.version > self.version {
            self.version = other.version;
            changed = true;
        }
        changed
    }
}
