//! Broker configuration

use serde::Deserialize;

/// Static configuration for the broker.
///
/// Trust timers are given in minutes and checked lazily on read; there is
/// no background expiry task.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdpConfig {
    /// Entity id this broker presents as SAML Issuer / OIDC issuer.
    pub entity_id: String,
    /// External base URL, used to compute endpoint destinations.
    pub base_url: String,
    /// TTL for password-channel trust.
    pub password_expiry_minutes: i64,
    /// TTL for MFA-channel trust.
    pub mfa_expiry_minutes: i64,
    /// Global encrypt-assertions policy; a per-party policy can also
    /// enable encryption when this is off.
    pub encrypt_assertions: bool,
    /// Relying-party metadata cache refresh interval.
    pub metadata_refresh_secs: u64,
    /// Secret protecting transiently-held credentials inside the session.
    pub session_secret: String,
}

impl IdpConfig {
    /// Metadata refresh interval as a duration, for registry construction.
    #[must_use]
    pub fn metadata_refresh(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.metadata_refresh_secs as i64)
    }
}

impl Default for IdpConfig {
    fn default() -> Self {
        Self {
            entity_id: "https://idp.example.com/broker/metadata".to_string(),
            base_url: "https://idp.example.com".to_string(),
            password_expiry_minutes: 180,
            mfa_expiry_minutes: 60,
            encrypt_assertions: false,
            metadata_refresh_secs: 3 * 60 * 60,
            session_secret: String::new(),
        }
    }
}
