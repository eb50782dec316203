//! Identity, MFA-device, and password-policy directories.
//!
//! The broker itself never stores identities; it consults these traits at
//! flow-evaluation time. In-memory implementations back the test suite.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::assurance::AssuranceLevel;
use crate::error::{IdpError, IdpResult};

/// A known end-user identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub subject_id: String,
    pub name: String,
    /// Highest level this identity is eligible to reach.
    pub max_assurance: AssuranceLevel,
    pub locked: bool,
    /// The lock was placed by the user themselves, not by an operator.
    pub locked_by_self: bool,
    /// Account exists but has not been through activation yet.
    pub needs_activation: bool,
    pub approved_terms: bool,
    pub has_password: bool,
    pub force_change_password: bool,
    pub password_changed_at: Option<DateTime<Utc>>,
    /// Attributes released to relying parties, keyed by claim name.
    pub attributes: HashMap<String, String>,
}

#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    async fn find(&self, subject_id: &str) -> IdpResult<Option<Identity>>;
}

/// A registered second-factor device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MfaDevice {
    pub device_id: String,
    pub name: String,
    pub level: AssuranceLevel,
    pub locked: bool,
    /// Preferred device, shown first in the picker.
    pub primary: bool,
}

#[async_trait]
pub trait MfaDirectory: Send + Sync {
    /// All devices registered to the identity, without level filtering.
    async fn devices_for(&self, subject_id: &str) -> IdpResult<Vec<MfaDevice>>;
}

/// Policy parameters governing password lifetime.
#[derive(Debug, Clone, Copy)]
pub struct PasswordPolicy {
    /// Passwords older than this are expired. None disables expiry.
    pub max_age_days: Option<i64>,
    /// Start warning this many days before expiry.
    pub warn_before_days: i64,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            max_age_days: Some(90),
            warn_before_days: 14,
        }
    }
}

pub trait PasswordPolicyProvider: Send + Sync {
    fn policy_for(&self, subject_id: &str) -> PasswordPolicy;
}

/// Fixed policy for every identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticPasswordPolicy(pub PasswordPolicy);

impl PasswordPolicyProvider for StaticPasswordPolicy {
    fn policy_for(&self, _subject_id: &str) -> PasswordPolicy {
        self.0
    }
}

/// In-memory identity directory for tests and development.
#[derive(Debug, Default)]
pub struct InMemoryIdentityDirectory {
    identities: Arc<RwLock<HashMap<String, Identity>>>,
}

impl InMemoryIdentityDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, identity: Identity) {
        self.identities
            .write()
            .await
            .insert(identity.subject_id.clone(), identity);
    }
}

#[async_trait]
impl IdentityDirectory for InMemoryIdentityDirectory {
    async fn find(&self, subject_id: &str) -> IdpResult<Option<Identity>> {
        Ok(self.identities.read().await.get(subject_id).cloned())
    }
}

/// In-memory MFA directory. Can be flagged unavailable to exercise the
/// degraded-dependency path.
#[derive(Debug, Default)]
pub struct InMemoryMfaDirectory {
    devices: Arc<RwLock<HashMap<String, Vec<MfaDevice>>>>,
    unavailable: Arc<RwLock<bool>>,
}

impl InMemoryMfaDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, subject_id: &str, device: MfaDevice) {
        self.devices
            .write()
            .await
            .entry(subject_id.to_string())
            .or_default()
            .push(device);
    }

    pub async fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.write().await = unavailable;
    }
}

#[async_trait]
impl MfaDirectory for InMemoryMfaDirectory {
    async fn devices_for(&self, subject_id: &str) -> IdpResult<Vec<MfaDevice>> {
        if *self.unavailable.read().await {
            return Err(IdpError::MfaDirectoryUnavailable(
                "directory flagged unavailable".to_string(),
            ));
        }
        Ok(self
            .devices
            .read()
            .await
            .get(subject_id)
            .cloned()
            .unwrap_or_default())
    }
}
