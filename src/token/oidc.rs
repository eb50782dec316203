//! OIDC authorization-code issuance.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use openssl::rand::rand_bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{IdpError, IdpResult};

/// Authorization codes are single-use and short-lived.
const CODE_VALIDITY_MINUTES: i64 = 10;

/// What an authorization code is bound to.
#[derive(Debug, Clone)]
pub struct AuthorizationCode {
    pub code: String,
    pub party_entity_id: String,
    pub subject_id: String,
    pub nonce: Option<String>,
    pub issued_at: DateTime<Utc>,
}

impl AuthorizationCode {
    fn expired(&self, now: DateTime<Utc>) -> bool {
        now - self.issued_at > Duration::minutes(CODE_VALIDITY_MINUTES)
    }
}

/// Issues and redeems opaque authorization codes. Redeeming consumes the
/// code; a second redemption fails.
#[derive(Debug, Default)]
pub struct AuthorizationCodeService {
    codes: Arc<RwLock<HashMap<String, AuthorizationCode>>>,
}

impl AuthorizationCodeService {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn issue(
        &self,
        party_entity_id: &str,
        subject_id: &str,
        nonce: Option<&str>,
    ) -> IdpResult<String> {
        let mut raw = [0u8; 32];
        rand_bytes(&mut raw)
            .map_err(|e| IdpError::TokenGenerationFailed(format!("code generation: {e}")))?;
        let code = URL_SAFE_NO_PAD.encode(raw);

        let grant = AuthorizationCode {
            code: code.clone(),
            party_entity_id: party_entity_id.to_string(),
            subject_id: subject_id.to_string(),
            nonce: nonce.map(ToString::to_string),
            issued_at: Utc::now(),
        };
        self.codes.write().await.insert(code.clone(), grant);
        Ok(code)
    }

    /// Redeem a code on behalf of a party. The party must match the one the
    /// code was issued to.
    pub async fn redeem(
        &self,
        code: &str,
        party_entity_id: &str,
    ) -> IdpResult<AuthorizationCode> {
        let grant = self
            .codes
            .write()
            .await
            .remove(code)
            .ok_or_else(|| IdpError::InvalidLoginRequest("unknown or used code".to_string()))?;
        if grant.party_entity_id != party_entity_id {
            return Err(IdpError::InvalidLoginRequest(
                "code issued to a different client".to_string(),
            ));
        }
        if grant.expired(Utc::now()) {
            return Err(IdpError::InvalidLoginRequest("code expired".to_string()));
        }
        Ok(grant)
    }
}
