//! Channel authorization with signed subscription credentials.
//!
//! Flow:
//! ```text
//! ┌────────┐  POST {socket_id, channel_name}  ┌───────────────────┐
//! │ client │ ───────────────────────────────► │ ChannelAuthorizer │
//! │        │ ◄─────────────────────────────── │ (signing key +    │
//! └───┬────┘    200 SubscriptionCredential    │  ScopeAccess)     │
//!     │         400 / 403 / 405              └───────────────────┘
//!     │
//!     │  Subscribe {channel, credential}      ┌────────────────────┐
//!     └─────────────────────────────────────► │ CredentialVerifier │
//!                                             │ (public key only)  │
//!                                             └────────────────────┘
//! ```
//!
//! The Ed25519 signature binds `socket_id + channel_name + expires_at`, so a
//! credential issued for one socket cannot admit another, cannot be replayed
//! on a different channel, and goes stale after the TTL. The verifier holds
//! only the public key; the signing key never leaves the authorizer.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

use crate::protocol::Channel;
use tabula_core::{epoch_secs, Scope};

/// Default credential lifetime: long enough for the subscribe round-trip,
/// short enough that a leaked credential is useless quickly.
pub const DEFAULT_CREDENTIAL_TTL_SECS: u64 = 300;

/// Admission ticket for one socket on one channel.
///
/// Created per authorization request, consumed at subscribe time, never
/// stored server-side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionCredential {
    pub channel_name: String,
    pub socket_id: Uuid,
    /// Seconds since the Unix epoch.
    pub expires_at: u64,
    pub signature: Signature,
}

impl SubscriptionCredential {
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }
}

/// Byte string the signature covers.
fn credential_message(socket_id: Uuid, channel_name: &str, expires_at: u64) -> Vec<u8> {
    let mut msg = Vec::with_capacity(16 + channel_name.len() + 8);
    msg.extend_from_slice(socket_id.as_bytes());
    msg.extend_from_slice(channel_name.as_bytes());
    msg.extend_from_slice(&expires_at.to_le_bytes());
    msg
}

/// Read-access policy for scopes.
///
/// Injected into the authorizer so embedders bring their own membership
/// source and tests substitute a fake.
pub trait ScopeAccess: Send + Sync {
    /// May `actor` observe `scope`'s channel?
    fn can_read(&self, actor: Uuid, scope: Scope) -> bool;
}

/// Explicit per-scope membership sets.
///
/// Keyed by scope id: granting a team id admits the team channel, granting
/// a list's item id admits that list's task channel.
#[derive(Default)]
pub struct MembershipPolicy {
    members: RwLock<HashMap<Uuid, HashSet<Uuid>>>,
}

impl MembershipPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant `actor` read access to the scope with `scope_id`.
    pub fn grant(&self, scope_id: Uuid, actor: Uuid) {
        if let Ok(mut members) = self.members.write() {
            members.entry(scope_id).or_default().insert(actor);
        }
    }

    pub fn revoke(&self, scope_id: Uuid, actor: Uuid) {
        if let Ok(mut members) = self.members.write() {
            if let Some(set) = members.get_mut(&scope_id) {
                set.remove(&actor);
            }
        }
    }
}

impl ScopeAccess for MembershipPolicy {
    fn can_read(&self, actor: Uuid, scope: Scope) -> bool {
        self.members
            .read()
            .map(|m| m.get(&scope.id).is_some_and(|set| set.contains(&actor)))
            .unwrap_or(false)
    }
}

/// Policy that admits everyone. Demos and tests only.
pub struct AllowAll;

impl ScopeAccess for AllowAll {
    fn can_read(&self, _actor: Uuid, _scope: Scope) -> bool {
        true
    }
}

/// Authorization failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Request is malformed: missing field or unparseable channel name.
    BadRequest(String),
    /// Policy denies the actor access to the channel's scope.
    Forbidden,
    /// Presented credential failed a binding, expiry, or signature check.
    InvalidCredential(&'static str),
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::BadRequest(reason) => write!(f, "Bad request: {reason}"),
            AuthError::Forbidden => write!(f, "Forbidden"),
            AuthError::InvalidCredential(reason) => write!(f, "Invalid credential: {reason}"),
        }
    }
}

impl std::error::Error for AuthError {}

/// Authorization request as the transport hands it over.
///
/// `actor` is the authenticated caller; session handling happens upstream.
#[derive(Debug, Clone)]
pub struct AuthRequest {
    pub method: String,
    pub actor: Uuid,
    pub socket_id: Option<Uuid>,
    pub channel_name: Option<String>,
}

/// Authorization response with HTTP status semantics.
#[derive(Debug, Clone)]
pub enum AuthResponse {
    /// 200 — credential issued.
    Granted(SubscriptionCredential),
    /// 400 — missing or malformed field.
    BadRequest(String),
    /// 403 — policy denied.
    Forbidden,
    /// 405 — only POST is accepted.
    MethodNotAllowed,
}

impl AuthResponse {
    pub fn status_code(&self) -> u16 {
        match self {
            AuthResponse::Granted(_) => 200,
            AuthResponse::BadRequest(_) => 400,
            AuthResponse::Forbidden => 403,
            AuthResponse::MethodNotAllowed => 405,
        }
    }
}

/// Issues signed subscription credentials for authorized actors.
pub struct ChannelAuthorizer {
    signing_key: SigningKey,
    policy: Arc<dyn ScopeAccess>,
    credential_ttl_secs: u64,
}

impl ChannelAuthorizer {
    pub fn new(signing_key: SigningKey, policy: Arc<dyn ScopeAccess>) -> Self {
        Self {
            signing_key,
            policy,
            credential_ttl_secs: DEFAULT_CREDENTIAL_TTL_SECS,
        }
    }

    pub fn with_ttl(signing_key: SigningKey, policy: Arc<dyn ScopeAccess>, ttl_secs: u64) -> Self {
        Self {
            signing_key,
            policy,
            credential_ttl_secs: ttl_secs,
        }
    }

    /// Fresh random key, admit-everyone policy, short TTL.
    pub fn for_testing() -> Self {
        let mut csprng = OsRng;
        Self::with_ttl(SigningKey::generate(&mut csprng), Arc::new(AllowAll), 60)
    }

    /// Verifier carrying this authorizer's public key.
    pub fn verifier(&self) -> CredentialVerifier {
        CredentialVerifier::new(self.signing_key.verifying_key())
    }

    /// Decide whether `actor` may subscribe `socket_id` to `channel_name`
    /// and issue the signed credential if so.
    pub fn authorize(
        &self,
        actor: Uuid,
        socket_id: Uuid,
        channel_name: &str,
    ) -> Result<SubscriptionCredential, AuthError> {
        let channel =
            Channel::parse(channel_name).map_err(|e| AuthError::BadRequest(e.to_string()))?;
        if !self.policy.can_read(actor, channel.scope) {
            log::info!("actor {actor} denied subscription to {channel_name}");
            return Err(AuthError::Forbidden);
        }
        let expires_at = epoch_secs() + self.credential_ttl_secs;
        Ok(self.sign(socket_id, channel_name, expires_at))
    }

    pub(crate) fn sign(
        &self,
        socket_id: Uuid,
        channel_name: &str,
        expires_at: u64,
    ) -> SubscriptionCredential {
        let message = credential_message(socket_id, channel_name, expires_at);
        let signature = self.signing_key.sign(&message);
        SubscriptionCredential {
            channel_name: channel_name.to_string(),
            socket_id,
            expires_at,
            signature,
        }
    }

    /// Map one authorization endpoint request to its response.
    ///
    /// Malformed requests fail before any policy check.
    pub fn handle(&self, request: &AuthRequest) -> AuthResponse {
        if !request.method.eq_ignore_ascii_case("POST") {
            return AuthResponse::MethodNotAllowed;
        }
        let socket_id = match request.socket_id {
            Some(id) => id,
            None => return AuthResponse::BadRequest("socket_id is required".to_string()),
        };
        let channel_name = match request.channel_name.as_deref() {
            Some(name) => name,
            None => return AuthResponse::BadRequest("channel_name is required".to_string()),
        };

        match self.authorize(request.actor, socket_id, channel_name) {
            Ok(credential) => AuthResponse::Granted(credential),
            Err(AuthError::BadRequest(reason)) => AuthResponse::BadRequest(reason),
            Err(_) => AuthResponse::Forbidden,
        }
    }
}

/// Verifies presented credentials at subscribe time.
///
/// Holds only the public key, so the transport side never sees the signing
/// secret.
#[derive(Debug, Clone)]
pub struct CredentialVerifier {
    verifying_key: VerifyingKey,
}

impl CredentialVerifier {
    pub fn new(verifying_key: VerifyingKey) -> Self {
        Self { verifying_key }
    }

    /// Check binding, expiry, and signature.
    ///
    /// `socket_id` and `channel_name` are what the connection actually is,
    /// never what the credential claims.
    pub fn verify(
        &self,
        credential: &SubscriptionCredential,
        socket_id: Uuid,
        channel_name: &str,
    ) -> Result<(), AuthError> {
        if credential.socket_id != socket_id {
            return Err(AuthError::InvalidCredential("socket binding mismatch"));
        }
        if credential.channel_name != channel_name {
            return Err(AuthError::InvalidCredential("channel binding mismatch"));
        }
        if credential.is_expired(epoch_secs()) {
            return Err(AuthError::InvalidCredential("credential expired"));
        }
        let message = credential_message(
            credential.socket_id,
            &credential.channel_name,
            credential.expires_at,
        );
        self.verifying_key
            .verify(&message, &credential.signature)
            .map_err(|_| AuthError::InvalidCredential("signature verification failed"))
    }
}
