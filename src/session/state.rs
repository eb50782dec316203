//! Per-browser session state: assurance levels, flow flags, party sessions.
//!
//! Level setters only elevate. Level reads apply the configured lifetime
//! lazily: an expired level is cleared at read time, never by a background
//! sweeper.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use openssl::hash::{hash, MessageDigest};
use openssl::rand::rand_bytes;
use openssl::symm::{decrypt_aead, encrypt_aead, Cipher};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::assurance::{self, AssuranceLevel};
use crate::error::{IdpError, IdpResult};
use crate::protocol::request::LoginRequest;

/// The identity this session is authenticated as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRef {
    pub subject_id: String,
    pub name: String,
    /// Registered proofing level of the identity itself.
    pub level: AssuranceLevel,
}

/// Record of a relying party this session has signed in to. Keyed by entity
/// id in [`SessionState::party_sessions`]; the ordered map gives single
/// logout a deterministic walk order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartySession {
    pub session_index: String,
    /// Attribute values released to the party when the session was
    /// established.
    pub attributes: Vec<(String, String)>,
    pub established_at: DateTime<Utc>,
}

/// Transient flags describing where in a login flow the session is. All of
/// them are cleared when a flow completes or is abandoned.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct FlowFlags {
    pub in_login_flow: bool,
    pub in_password_change: bool,
    pub in_mfa_selection: bool,
    pub approved_terms: bool,
    pub completed_activation: bool,
    pub declined_activation: bool,
    pub selected_claims: bool,
    pub dismissed_password_warning: bool,
}

/// A logout exchange this session is waiting on.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PendingLogout {
    /// Id of the LogoutRequest we received from the initiating party, if the
    /// chain was started by a party rather than the user.
    pub origin_request_id: Option<String>,
    pub origin_entity_id: Option<String>,
    pub origin_relay_state: Option<String>,
    /// Entity id of the party we most recently sent a LogoutRequest to.
    pub outbound_entity_id: Option<String>,
}

/// Result of a level read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelRead {
    pub level: Option<AssuranceLevel>,
    /// True when a previously held level lapsed during this read.
    pub expired: bool,
}

/// Result of pinning / re-checking the client address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpCheck {
    Ok,
    /// The address changed; authentication state was cleared.
    Changed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionState {
    pub id: String,
    pub identity: Option<IdentityRef>,

    password_level: Option<AssuranceLevel>,
    password_set_at: Option<DateTime<Utc>>,
    mfa_level: Option<AssuranceLevel>,
    mfa_set_at: Option<DateTime<Utc>>,

    client_ip: Option<String>,

    pub party_sessions: BTreeMap<String, PartySession>,
    pub flags: FlowFlags,

    /// This session authenticated through an external eID this time around.
    pub eid_authenticated: bool,

    /// Login request parked while the flow runs interactive steps.
    pub pending_login: Option<LoginRequest>,
    pub pending_logout: Option<PendingLogout>,

    /// Devices offered in the current MFA selection step, by device id.
    pub mfa_candidates: Vec<String>,

    /// Primary credential, encrypted at rest inside the session record.
    credential: Option<String>,
}

impl SessionState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            ..Self::default()
        }
    }

    /// Record a password-factor authentication. Lower-than-held levels are
    /// ignored; an equal or higher level refreshes the timestamp.
    pub fn set_password_level(&mut self, level: Option<AssuranceLevel>, now: DateTime<Utc>) {
        match assurance::elevate(self.password_level, level) {
            Some(new_level) => {
                self.password_level = Some(new_level);
                self.password_set_at = Some(now);
            }
            None => {
                self.password_level = None;
                self.password_set_at = None;
            }
        }
    }

    /// Record a second-factor authentication. Accepting a second factor also
    /// refreshes the password timestamp, so a completed MFA step never
    /// leaves the session with a lapsed first factor.
    pub fn set_mfa_level(&mut self, level: Option<AssuranceLevel>, now: DateTime<Utc>) {
        match assurance::elevate(self.mfa_level, level) {
            Some(new_level) => {
                self.mfa_level = Some(new_level);
                self.mfa_set_at = Some(now);
                if self.password_level.is_some() {
                    self.password_set_at = Some(now);
                }
            }
            None => {
                self.mfa_level = None;
                self.mfa_set_at = None;
            }
        }
    }

    pub fn password_level(&mut self, now: DateTime<Utc>, lifetime: Duration) -> LevelRead {
        Self::read_level(&mut self.password_level, &mut self.password_set_at, now, lifetime)
    }

    pub fn mfa_level(&mut self, now: DateTime<Utc>, lifetime: Duration) -> LevelRead {
        Self::read_level(&mut self.mfa_level, &mut self.mfa_set_at, now, lifetime)
    }

    fn read_level(
        level: &mut Option<AssuranceLevel>,
        set_at: &mut Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        lifetime: Duration,
    ) -> LevelRead {
        match (*level, *set_at) {
            (Some(_), Some(at)) if now - at > lifetime => {
                *level = None;
                *set_at = None;
                LevelRead { level: None, expired: true }
            }
            (held, _) => LevelRead { level: held, expired: false },
        }
    }

    /// Overall login state of the session, combining the identity's proofing
    /// level with both authentication factors. `None` means not logged in;
    /// `Some(AssuranceLevel::None)` means logged in without any assurance.
    /// Expired factors collapse to absent as a side effect of the read.
    pub fn login_state(
        &mut self,
        now: DateTime<Utc>,
        password_lifetime: Duration,
        mfa_lifetime: Duration,
    ) -> Option<AssuranceLevel> {
        let identity_level = self.identity.as_ref()?.level;
        let pw = self.password_level(now, password_lifetime).level?;
        let mfa = self.mfa_level(now, mfa_lifetime).level;

        let all_at_least = |level: AssuranceLevel| {
            identity_level >= level && pw >= level && mfa.is_some_and(|m| m >= level)
        };

        if all_at_least(AssuranceLevel::High) {
            Some(AssuranceLevel::High)
        } else if all_at_least(AssuranceLevel::Substantial) {
            Some(AssuranceLevel::Substantial)
        } else if identity_level >= AssuranceLevel::Low && pw >= AssuranceLevel::Low {
            Some(AssuranceLevel::Low)
        } else {
            Some(AssuranceLevel::None)
        }
    }

    /// Pin the session to a client address on first contact; on a later
    /// mismatch, clear all authentication state and re-pin.
    pub fn validate_ip(&mut self, ip: &str) -> IpCheck {
        match self.client_ip.as_deref() {
            None => {
                self.client_ip = Some(ip.to_string());
                IpCheck::Ok
            }
            Some(pinned) if pinned == ip => IpCheck::Ok,
            Some(_) => {
                self.clear_authentication();
                self.client_ip = Some(ip.to_string());
                IpCheck::Changed
            }
        }
    }

    /// Drop everything that makes this session authenticated. The session
    /// record itself survives so an in-flight logout chain can finish.
    pub fn clear_authentication(&mut self) {
        self.identity = None;
        self.password_level = None;
        self.password_set_at = None;
        self.mfa_level = None;
        self.mfa_set_at = None;
        self.party_sessions.clear();
        self.credential = None;
        self.mfa_candidates.clear();
        self.eid_authenticated = false;
        self.clear_flow_states();
    }

    pub fn clear_flow_states(&mut self) {
        self.flags = FlowFlags::default();
        self.pending_login = None;
    }

    /// Drop authentication levels and flow state while a logout chain is
    /// running. The identity reference and party sessions stay so remaining
    /// hops can still be addressed.
    pub fn logout_reset(&mut self) {
        self.password_level = None;
        self.password_set_at = None;
        self.mfa_level = None;
        self.mfa_set_at = None;
        self.credential = None;
        self.mfa_candidates.clear();
        self.eid_authenticated = false;
        self.clear_flow_states();
    }

    /// Reset the session to the state of a fresh browser contact, keeping
    /// only the id and the pinned client IP.
    pub fn clear(&mut self) {
        self.clear_authentication();
        self.pending_logout = None;
    }

    pub fn record_party_session(
        &mut self,
        entity_id: &str,
        session_index: &str,
        attributes: Vec<(String, String)>,
        now: DateTime<Utc>,
    ) {
        self.party_sessions.insert(
            entity_id.to_string(),
            PartySession {
                session_index: session_index.to_string(),
                attributes,
                established_at: now,
            },
        );
    }

    /// Store the primary credential encrypted with AES-256-GCM under a key
    /// derived from the deployment secret.
    pub fn protect_credential(&mut self, secret: &str, plaintext: &str) -> IdpResult<()> {
        let key = derive_key(secret)?;
        let mut nonce = [0u8; 12];
        rand_bytes(&mut nonce)
            .map_err(|e| IdpError::CredentialProtectionFailed(format!("nonce generation: {e}")))?;
        let mut tag = [0u8; 16];
        let ciphertext = encrypt_aead(
            Cipher::aes_256_gcm(),
            &key,
            Some(&nonce),
            &[],
            plaintext.as_bytes(),
            &mut tag,
        )
        .map_err(|e| IdpError::CredentialProtectionFailed(format!("encryption: {e}")))?;

        let mut blob = Vec::with_capacity(12 + 16 + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&tag);
        blob.extend_from_slice(&ciphertext);
        self.credential = Some(BASE64.encode(blob));
        Ok(())
    }

    pub fn reveal_credential(&self, secret: &str) -> IdpResult<Option<String>> {
        let Some(blob) = &self.credential else {
            return Ok(None);
        };
        let blob = BASE64.decode(blob).map_err(|e| {
            IdpError::CredentialProtectionFailed(format!("invalid stored credential: {e}"))
        })?;
        if blob.len() < 28 {
            return Err(IdpError::CredentialProtectionFailed(
                "stored credential too short".to_string(),
            ));
        }
        let key = derive_key(secret)?;
        let (nonce, rest) = blob.split_at(12);
        let (tag, ciphertext) = rest.split_at(16);
        let plaintext = decrypt_aead(Cipher::aes_256_gcm(), &key, Some(nonce), &[], ciphertext, tag)
            .map_err(|e| IdpError::CredentialProtectionFailed(format!("decryption: {e}")))?;
        String::from_utf8(plaintext).map(Some).map_err(|e| {
            IdpError::CredentialProtectionFailed(format!("credential not UTF-8: {e}"))
        })
    }
}

fn derive_key(secret: &str) -> IdpResult<Vec<u8>> {
    hash(MessageDigest::sha256(), secret.as_bytes())
        .map(|d| d.to_vec())
        .map_err(|e| IdpError::CredentialProtectionFailed(format!("key derivation: {e}")))
}
