//! Login-flow decision engine.
//!
//! Given the session, the resolved relying party and the normalized login
//! request, decide exactly one next action. Rules short-circuit in a fixed
//! order; every interactive step under a passive request is a Responder
//! error instead.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use crate::assurance::AssuranceLevel;
use crate::audit::{AuditAction, AuditEvent, AuditSink};
use crate::config::IdpConfig;
use crate::directory::{Identity, IdentityDirectory, MfaDirectory, PasswordPolicyProvider};
use crate::error::{IdpError, IdpResult};
use crate::flow::mfa::{self, MfaStep};
use crate::flow::password::{self, PasswordStatus};
use crate::party::RelyingParty;
use crate::protocol::LoginRequest;
use crate::session::{IdentityRef, IpCheck, SessionState};

/// The single next action a login flow takes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowStep {
    /// Start primary authentication (password or eID per the hint).
    PrimaryAuth { prefer_eid: bool },
    /// The session must step up through an external eID login.
    RequireEidLogin,
    MfaChallenge { device_id: String },
    MfaSelect { device_ids: Vec<String> },
    ApproveTerms,
    ActivateAccount,
    ChangePassword {
        forced: bool,
        days_left: Option<i64>,
    },
    SelectClaims { claims: Vec<String> },
    /// All requirements met; hand over to token issuance.
    Issue,
}

/// Per-request facts the engine needs beyond the parsed login request.
#[derive(Debug, Clone, Default)]
pub struct FlowContext {
    /// Observed client address, pinned to the session on first contact.
    pub client_ip: Option<String>,
    /// The request arrived from a network the deployment trusts.
    pub trusted_network: bool,
}

pub struct FlowEngine {
    identities: Arc<dyn IdentityDirectory>,
    mfa_directory: Arc<dyn MfaDirectory>,
    password_policy: Arc<dyn PasswordPolicyProvider>,
    audit: Arc<dyn AuditSink>,
    config: IdpConfig,
}

impl FlowEngine {
    pub fn new(
        identities: Arc<dyn IdentityDirectory>,
        mfa_directory: Arc<dyn MfaDirectory>,
        password_policy: Arc<dyn PasswordPolicyProvider>,
        audit: Arc<dyn AuditSink>,
        config: IdpConfig,
    ) -> Self {
        Self {
            identities,
            mfa_directory,
            password_policy,
            audit,
            config,
        }
    }

    pub async fn next_step(
        &self,
        session: &mut SessionState,
        party: &RelyingParty,
        request: &LoginRequest,
        ctx: &FlowContext,
    ) -> IdpResult<FlowStep> {
        let now = Utc::now();
        let pw_ttl = Duration::minutes(self.config.password_expiry_minutes);
        let mfa_ttl = Duration::minutes(self.config.mfa_expiry_minutes);

        let identity = match &session.identity {
            Some(identity_ref) => self.identities.find(&identity_ref.subject_id).await?,
            None => None,
        };

        if let Some(identity) = &identity {
            // Locked accounts are turned away, except a self-locked user
            // reaching the self-service portal through a fresh eID login.
            if identity.locked {
                let exempt =
                    identity.locked_by_self && party.self_service && session.eid_authenticated;
                if !exempt {
                    return Err(IdpError::AccountLocked);
                }
            }
        }

        let required = party.required_assurance_level(request);
        if required == Some(AssuranceLevel::High) {
            return Err(IdpError::UnsupportedAssuranceLevel(AssuranceLevel::High));
        }

        // A mid-session address change drops all trust; the flow falls
        // through to primary authentication below.
        if let Some(ip) = ctx.client_ip.as_deref() {
            let subject = session.identity.as_ref().map(|i| i.subject_id.clone());
            if session.validate_ip(ip) == IpCheck::Changed {
                let mut event = AuditEvent::new(
                    AuditAction::LogoutCausedByIpChange,
                    "client address changed mid-session",
                )
                .party(&party.entity_id);
                if let Some(subject) = &subject {
                    event = event.subject(subject);
                }
                self.audit.append(event).await;
            }
        }

        // A fresh ForceAuthn discards held factors; the identity reference
        // stays so locked-account and terms rules still apply.
        if request.force_authn && !session.flags.in_login_flow {
            session.set_password_level(None, now);
            session.set_mfa_level(None, now);
            session.flags.in_login_flow = true;
        }

        let password_read = session.password_level(now, pw_ttl);
        if password_read.expired {
            self.audit
                .append(self.event(AuditAction::SessionExpired, session, party, "password factor lapsed"))
                .await;
        }

        let Some(current) = session.login_state(now, pw_ttl, mfa_ttl) else {
            if request.is_passive {
                return Err(IdpError::PassiveLoginNotSatisfiable);
            }
            return Ok(FlowStep::PrimaryAuth {
                prefer_eid: party.prefer_eid,
            });
        };
        // login_state is Some only when an identity is present.
        let identity = identity.ok_or(IdpError::SessionNotFound)?;

        if let Err(reason) = party.meets_requirements(&identity) {
            self.audit
                .append(self.event(
                    AuditAction::LoginRejectedByConditions,
                    session,
                    party,
                    &reason,
                ))
                .await;
            return Err(IdpError::RequirementsNotMet(reason));
        }

        if !identity.approved_terms && !session.flags.approved_terms {
            if request.is_passive {
                return Err(IdpError::PassiveLoginNotSatisfiable);
            }
            return Ok(FlowStep::ApproveTerms);
        }

        if identity.needs_activation
            && !session.flags.completed_activation
            && !session.flags.declined_activation
            && !request.is_passive
        {
            return Ok(FlowStep::ActivateAccount);
        }

        if let Some(required) = required {
            match current {
                AssuranceLevel::Substantial | AssuranceLevel::High => {}
                AssuranceLevel::Low if required <= AssuranceLevel::Low => {}
                AssuranceLevel::Low => {
                    // Step up from a password-only session.
                    if identity.max_assurance < AssuranceLevel::Substantial {
                        return Err(IdpError::AssuranceTooLow(format!(
                            "identity is registered at {} but {} is required",
                            identity.max_assurance, required
                        )));
                    }
                    if request.is_passive {
                        return Err(IdpError::PassiveLoginNotSatisfiable);
                    }
                    if party.prefer_eid {
                        return Ok(FlowStep::RequireEidLogin);
                    }
                    return self.mfa_step(session, &identity, required).await;
                }
                AssuranceLevel::None => {
                    if identity.max_assurance < AssuranceLevel::Low {
                        return Err(IdpError::NotEligibleForAssurance);
                    }
                    if request.is_passive {
                        return Err(IdpError::PassiveLoginNotSatisfiable);
                    }
                    return Ok(FlowStep::RequireEidLogin);
                }
            }
        } else if let Some(floor) = party.mfa_floor(ctx.trusted_network) {
            let held = session.mfa_level(now, mfa_ttl).level;
            if held.is_none_or(|level| level < floor) {
                if request.is_passive {
                    return Err(IdpError::PassiveLoginNotSatisfiable);
                }
                return self.mfa_step(session, &identity, floor).await;
            }
        }

        let policy = self.password_policy.policy_for(&identity.subject_id);
        match password::evaluate(&identity, &policy, now) {
            PasswordStatus::Ok => {}
            PasswordStatus::NoPassword => {
                if request.is_passive {
                    return Err(IdpError::PassiveLoginNotSatisfiable);
                }
                return Ok(FlowStep::ActivateAccount);
            }
            PasswordStatus::ForceChange | PasswordStatus::Expired => {
                if request.is_passive {
                    return Err(IdpError::PassiveLoginNotSatisfiable);
                }
                session.flags.in_password_change = true;
                return Ok(FlowStep::ChangePassword {
                    forced: true,
                    days_left: None,
                });
            }
            PasswordStatus::AlmostExpired { days_left } => {
                if !session.flags.dismissed_password_warning && !request.is_passive {
                    session.flags.in_password_change = true;
                    return Ok(FlowStep::ChangePassword {
                        forced: false,
                        days_left: Some(days_left),
                    });
                }
            }
        }

        if party.claims_selectable
            && !session.flags.selected_claims
            && !request.is_passive
            && !party.released_claims.is_empty()
        {
            return Ok(FlowStep::SelectClaims {
                claims: party.released_claims.clone(),
            });
        }

        Ok(FlowStep::Issue)
    }

    /// Record a completed primary authentication: the identity reference,
    /// the password-channel level, and the credential held for later
    /// sub-flows such as password change.
    pub fn record_primary_authentication(
        &self,
        session: &mut SessionState,
        identity: &Identity,
        level: AssuranceLevel,
        credential: Option<&str>,
        now: DateTime<Utc>,
    ) -> IdpResult<()> {
        session.identity = Some(IdentityRef {
            subject_id: identity.subject_id.clone(),
            name: identity.name.clone(),
            level: identity.max_assurance,
        });
        session.set_password_level(Some(level), now);
        if let Some(credential) = credential {
            session.protect_credential(&self.config.session_secret, credential)?;
        }
        Ok(())
    }

    /// Resolve the device the user picked in an MFA selection step. The
    /// session must be in a selection step and the device must have been
    /// offered in it.
    pub fn select_mfa_device(
        &self,
        session: &mut SessionState,
        device_id: &str,
    ) -> IdpResult<FlowStep> {
        if !session.flags.in_mfa_selection {
            return Err(IdpError::FlowStateViolation(
                "no MFA selection in progress".to_string(),
            ));
        }
        if !session.mfa_candidates.iter().any(|d| d == device_id) {
            return Err(IdpError::FlowStateViolation(format!(
                "device {device_id} was not offered"
            )));
        }
        session.flags.in_mfa_selection = false;
        session.mfa_candidates = vec![device_id.to_string()];
        Ok(FlowStep::MfaChallenge {
            device_id: device_id.to_string(),
        })
    }

    /// Record a completed MFA challenge. Only devices offered in the
    /// current flow count.
    pub fn complete_mfa(
        &self,
        session: &mut SessionState,
        device_id: &str,
        level: AssuranceLevel,
        now: DateTime<Utc>,
    ) -> IdpResult<()> {
        if !session.mfa_candidates.iter().any(|d| d == device_id) {
            return Err(IdpError::FlowStateViolation(format!(
                "device {device_id} was not part of this flow"
            )));
        }
        session.set_mfa_level(Some(level), now);
        session.mfa_candidates.clear();
        Ok(())
    }

    /// Record a completed password change. Returns the credential held
    /// since primary authentication so the caller can replay (old, new)
    /// against the backing directory; the new credential replaces it.
    pub fn complete_password_change(
        &self,
        session: &mut SessionState,
        new_password: &str,
        now: DateTime<Utc>,
    ) -> IdpResult<String> {
        if !session.flags.in_password_change {
            return Err(IdpError::FlowStateViolation(
                "no password change in progress".to_string(),
            ));
        }
        let previous = session
            .reveal_credential(&self.config.session_secret)?
            .ok_or_else(|| {
                IdpError::FlowStateViolation("no primary credential held".to_string())
            })?;
        session.protect_credential(&self.config.session_secret, new_password)?;

        // A fresh change revalidates the password channel.
        let pw_ttl = Duration::minutes(self.config.password_expiry_minutes);
        if let Some(level) = session.password_level(now, pw_ttl).level {
            session.set_password_level(Some(level), now);
        }
        session.flags.in_password_change = false;
        session.flags.dismissed_password_warning = false;
        Ok(previous)
    }

    async fn mfa_step(
        &self,
        session: &mut SessionState,
        identity: &Identity,
        required: AssuranceLevel,
    ) -> IdpResult<FlowStep> {
        let devices = self.mfa_directory.devices_for(&identity.subject_id).await?;
        let step = mfa::select_devices(&devices, required)?;
        Ok(match step {
            MfaStep::Challenge { device_id } => {
                session.mfa_candidates = vec![device_id.clone()];
                FlowStep::MfaChallenge { device_id }
            }
            MfaStep::Select { device_ids } => {
                session.mfa_candidates = device_ids.clone();
                session.flags.in_mfa_selection = true;
                FlowStep::MfaSelect { device_ids }
            }
        })
    }

    fn event(
        &self,
        action: AuditAction,
        session: &SessionState,
        party: &RelyingParty,
        detail: &str,
    ) -> AuditEvent {
        let mut event = AuditEvent::new(action, detail).party(&party.entity_id);
        if let Some(identity) = &session.identity {
            event = event.subject(&identity.subject_id);
        }
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::directory::{
        InMemoryIdentityDirectory, InMemoryMfaDirectory, MfaDevice, PasswordPolicy,
        StaticPasswordPolicy,
    };
    use crate::party::{Binding, Endpoint, MfaPolicy, Protocol};
    use crate::session::IdentityRef;
    use std::collections::HashMap;

    fn party() -> RelyingParty {
        RelyingParty {
            entity_id: "https://sp.example.com".into(),
            name: "Example SP".into(),
            protocol: Protocol::Saml2,
            enabled: true,
            assertion_endpoints: vec![Endpoint {
                binding: Binding::Post,
                url: "https://sp.example.com/acs".into(),
            }],
            logout_endpoints: vec![],
            certificates: vec![],
            validate_signatures: false,
            encrypt_assertions: false,
            mfa_policy: MfaPolicy::default(),
            skip_mfa_on_trusted_network: false,
            required_level: None,
            prefer_eid: false,
            self_service: false,
            claims_selectable: false,
            required_claims: vec![],
            name_id_format: "urn:oasis:names:tc:SAML:2.0:nameid-format:persistent".into(),
            released_claims: vec![],
        }
    }

    fn identity() -> Identity {
        Identity {
            subject_id: "s-1".into(),
            name: "Test Person".into(),
            max_assurance: AssuranceLevel::Substantial,
            locked: false,
            locked_by_self: false,
            needs_activation: false,
            approved_terms: true,
            has_password: true,
            force_change_password: false,
            password_changed_at: Some(Utc::now() - Duration::days(5)),
            attributes: HashMap::from([("email".to_string(), "test@example.com".to_string())]),
        }
    }

    fn request(passive: bool) -> LoginRequest {
        LoginRequest {
            protocol: Protocol::Saml2,
            request_id: Some("_req1".into()),
            party_entity_id: "https://sp.example.com".into(),
            destination: None,
            relay_state: None,
            force_authn: false,
            is_passive: passive,
            requested_level: None,
            name_id_format: None,
            nonce: None,
            received_at: Utc::now(),
        }
    }

    struct Fixture {
        engine: FlowEngine,
        identities: Arc<InMemoryIdentityDirectory>,
        mfa: Arc<InMemoryMfaDirectory>,
        audit: Arc<MemoryAuditSink>,
    }

    fn fixture() -> Fixture {
        let identities = Arc::new(InMemoryIdentityDirectory::new());
        let mfa = Arc::new(InMemoryMfaDirectory::new());
        let audit = Arc::new(MemoryAuditSink::new());
        let engine = FlowEngine::new(
            identities.clone(),
            mfa.clone(),
            Arc::new(StaticPasswordPolicy(PasswordPolicy::default())),
            audit.clone(),
            IdpConfig::default(),
        );
        Fixture {
            engine,
            identities,
            mfa,
            audit,
        }
    }

    fn logged_in_session(level: AssuranceLevel) -> SessionState {
        let now = Utc::now();
        let mut session = SessionState::new();
        session.identity = Some(IdentityRef {
            subject_id: "s-1".into(),
            name: "Test Person".into(),
            level: AssuranceLevel::Substantial,
        });
        session.set_password_level(Some(level), now);
        session
    }

    #[tokio::test]
    async fn test_anonymous_session_starts_primary_auth() {
        let f = fixture();
        let mut session = SessionState::new();
        let step = f
            .engine
            .next_step(&mut session, &party(), &request(false), &FlowContext::default())
            .await
            .unwrap();
        assert_eq!(step, FlowStep::PrimaryAuth { prefer_eid: false });
    }

    #[tokio::test]
    async fn test_passive_without_session_fails() {
        let f = fixture();
        let mut session = SessionState::new();
        let err = f
            .engine
            .next_step(&mut session, &party(), &request(true), &FlowContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, IdpError::PassiveLoginNotSatisfiable));
    }

    #[tokio::test]
    async fn test_required_high_is_unsupported() {
        let f = fixture();
        let mut p = party();
        p.required_level = Some(AssuranceLevel::High);
        let mut session = SessionState::new();
        let err = f
            .engine
            .next_step(&mut session, &p, &request(false), &FlowContext::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            IdpError::UnsupportedAssuranceLevel(AssuranceLevel::High)
        ));
    }

    #[tokio::test]
    async fn test_locked_account_rejected() {
        let f = fixture();
        let mut id = identity();
        id.locked = true;
        f.identities.insert(id).await;
        let mut session = logged_in_session(AssuranceLevel::Substantial);
        let err = f
            .engine
            .next_step(&mut session, &party(), &request(false), &FlowContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, IdpError::AccountLocked));
    }

    #[tokio::test]
    async fn test_self_locked_reaches_self_service_via_eid() {
        let f = fixture();
        let mut id = identity();
        id.locked = true;
        id.locked_by_self = true;
        f.identities.insert(id).await;
        let mut p = party();
        p.self_service = true;
        let mut session = logged_in_session(AssuranceLevel::Substantial);
        session.set_mfa_level(Some(AssuranceLevel::Substantial), Utc::now());
        session.eid_authenticated = true;
        let step = f
            .engine
            .next_step(&mut session, &p, &request(false), &FlowContext::default())
            .await
            .unwrap();
        assert_eq!(step, FlowStep::Issue);
    }

    #[tokio::test]
    async fn test_requirements_failure_is_audited() {
        let f = fixture();
        f.identities.insert(identity()).await;
        let mut p = party();
        p.required_claims = vec!["employee_number".into()];
        let mut session = logged_in_session(AssuranceLevel::Substantial);
        let err = f
            .engine
            .next_step(&mut session, &p, &request(false), &FlowContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, IdpError::RequirementsNotMet(_)));
        assert_eq!(
            f.audit
                .count_of(AuditAction::LoginRejectedByConditions)
                .await,
            1
        );
    }

    #[tokio::test]
    async fn test_terms_not_approved() {
        let f = fixture();
        let mut id = identity();
        id.approved_terms = false;
        f.identities.insert(id).await;
        let mut session = logged_in_session(AssuranceLevel::Substantial);
        let step = f
            .engine
            .next_step(&mut session, &party(), &request(false), &FlowContext::default())
            .await
            .unwrap();
        assert_eq!(step, FlowStep::ApproveTerms);
    }

    #[tokio::test]
    async fn test_step_up_selects_mfa_device() {
        let f = fixture();
        f.identities.insert(identity()).await;
        f.mfa
            .insert(
                "s-1",
                MfaDevice {
                    device_id: "d1".into(),
                    name: "Authenticator".into(),
                    level: AssuranceLevel::Substantial,
                    locked: false,
                    primary: false,
                },
            )
            .await;
        let mut p = party();
        p.required_level = Some(AssuranceLevel::Substantial);
        // Password factor only: login state is Low, step-up needed.
        let mut session = logged_in_session(AssuranceLevel::Substantial);
        let step = f
            .engine
            .next_step(&mut session, &p, &request(false), &FlowContext::default())
            .await
            .unwrap();
        assert_eq!(
            step,
            FlowStep::MfaChallenge {
                device_id: "d1".into()
            }
        );
        assert_eq!(session.mfa_candidates, vec!["d1".to_string()]);
    }

    #[tokio::test]
    async fn test_step_up_without_devices_fails() {
        let f = fixture();
        f.identities.insert(identity()).await;
        let mut p = party();
        p.required_level = Some(AssuranceLevel::Substantial);
        let mut session = logged_in_session(AssuranceLevel::Substantial);
        let err = f
            .engine
            .next_step(&mut session, &p, &request(false), &FlowContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, IdpError::NoEligibleMfaDevice));
    }

    #[tokio::test]
    async fn test_full_session_issues() {
        let f = fixture();
        f.identities.insert(identity()).await;
        let mut p = party();
        p.required_level = Some(AssuranceLevel::Substantial);
        let mut session = logged_in_session(AssuranceLevel::Substantial);
        session.set_mfa_level(Some(AssuranceLevel::Substantial), Utc::now());
        let step = f
            .engine
            .next_step(&mut session, &p, &request(false), &FlowContext::default())
            .await
            .unwrap();
        assert_eq!(step, FlowStep::Issue);
    }

    #[tokio::test]
    async fn test_passive_succeeds_with_sufficient_session() {
        let f = fixture();
        f.identities.insert(identity()).await;
        let mut session = logged_in_session(AssuranceLevel::Substantial);
        session.set_mfa_level(Some(AssuranceLevel::Substantial), Utc::now());
        let step = f
            .engine
            .next_step(&mut session, &party(), &request(true), &FlowContext::default())
            .await
            .unwrap();
        assert_eq!(step, FlowStep::Issue);
    }

    #[tokio::test]
    async fn test_expired_password_prompts_change() {
        let f = fixture();
        let mut id = identity();
        id.password_changed_at = Some(Utc::now() - Duration::days(120));
        f.identities.insert(id).await;
        let mut session = logged_in_session(AssuranceLevel::Substantial);
        session.set_mfa_level(Some(AssuranceLevel::Substantial), Utc::now());
        let step = f
            .engine
            .next_step(&mut session, &party(), &request(false), &FlowContext::default())
            .await
            .unwrap();
        assert_eq!(
            step,
            FlowStep::ChangePassword {
                forced: true,
                days_left: None
            }
        );
    }

    #[tokio::test]
    async fn test_almost_expired_warning_is_dismissable() {
        let f = fixture();
        let mut id = identity();
        id.password_changed_at = Some(Utc::now() - Duration::days(85));
        f.identities.insert(id).await;
        let mut session = logged_in_session(AssuranceLevel::Substantial);
        session.set_mfa_level(Some(AssuranceLevel::Substantial), Utc::now());

        let step = f
            .engine
            .next_step(&mut session, &party(), &request(false), &FlowContext::default())
            .await
            .unwrap();
        assert!(matches!(
            step,
            FlowStep::ChangePassword {
                forced: false,
                days_left: Some(_)
            }
        ));

        session.flags.dismissed_password_warning = true;
        let step = f
            .engine
            .next_step(&mut session, &party(), &request(false), &FlowContext::default())
            .await
            .unwrap();
        assert_eq!(step, FlowStep::Issue);
    }

    #[tokio::test]
    async fn test_claims_selection_before_issue() {
        let f = fixture();
        f.identities.insert(identity()).await;
        let mut p = party();
        p.claims_selectable = true;
        p.released_claims = vec!["email".into(), "role".into()];
        let mut session = logged_in_session(AssuranceLevel::Substantial);
        session.set_mfa_level(Some(AssuranceLevel::Substantial), Utc::now());

        let step = f
            .engine
            .next_step(&mut session, &p, &request(false), &FlowContext::default())
            .await
            .unwrap();
        assert_eq!(
            step,
            FlowStep::SelectClaims {
                claims: vec!["email".into(), "role".into()]
            }
        );

        session.flags.selected_claims = true;
        let step = f
            .engine
            .next_step(&mut session, &p, &request(false), &FlowContext::default())
            .await
            .unwrap();
        assert_eq!(step, FlowStep::Issue);
    }

    #[tokio::test]
    async fn test_mfa_floor_policy_applies_without_required_level() {
        let f = fixture();
        f.identities.insert(identity()).await;
        f.mfa
            .insert(
                "s-1",
                MfaDevice {
                    device_id: "d1".into(),
                    name: "Authenticator".into(),
                    level: AssuranceLevel::Substantial,
                    locked: false,
                    primary: false,
                },
            )
            .await;
        let mut p = party();
        p.mfa_policy = MfaPolicy::Always(AssuranceLevel::Substantial);
        let mut session = logged_in_session(AssuranceLevel::Substantial);
        let step = f
            .engine
            .next_step(&mut session, &p, &request(false), &FlowContext::default())
            .await
            .unwrap();
        assert_eq!(
            step,
            FlowStep::MfaChallenge {
                device_id: "d1".into()
            }
        );
    }

    #[tokio::test]
    async fn test_ip_change_downgrades_session_and_audits() {
        let f = fixture();
        f.identities.insert(identity()).await;
        let mut session = logged_in_session(AssuranceLevel::Substantial);

        let ctx = FlowContext {
            client_ip: Some("10.0.0.1".into()),
            trusted_network: false,
        };
        let step = f
            .engine
            .next_step(&mut session, &party(), &request(false), &ctx)
            .await
            .unwrap();
        assert_eq!(step, FlowStep::Issue);

        let moved = FlowContext {
            client_ip: Some("10.0.0.2".into()),
            trusted_network: false,
        };
        let step = f
            .engine
            .next_step(&mut session, &party(), &request(false), &moved)
            .await
            .unwrap();
        assert_eq!(step, FlowStep::PrimaryAuth { prefer_eid: false });
        assert!(session.identity.is_none());
        assert_eq!(f.audit.count_of(AuditAction::LogoutCausedByIpChange).await, 1);
    }

    #[tokio::test]
    async fn test_locked_account_rejected_before_high_requirement() {
        let f = fixture();
        let mut id = identity();
        id.locked = true;
        f.identities.insert(id).await;
        let mut p = party();
        p.required_level = Some(AssuranceLevel::High);
        let mut session = logged_in_session(AssuranceLevel::Substantial);
        let err = f
            .engine
            .next_step(&mut session, &p, &request(false), &FlowContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, IdpError::AccountLocked));
    }

    #[tokio::test]
    async fn test_unproofed_session_requires_eid_for_low() {
        let f = fixture();
        f.identities.insert(identity()).await;
        let mut p = party();
        p.required_level = Some(AssuranceLevel::Low);
        // Password held, but the identity reference carries no proofing.
        let mut session = logged_in_session(AssuranceLevel::Substantial);
        session.identity.as_mut().unwrap().level = AssuranceLevel::None;
        let step = f
            .engine
            .next_step(&mut session, &p, &request(false), &FlowContext::default())
            .await
            .unwrap();
        assert_eq!(step, FlowStep::RequireEidLogin);
    }

    #[tokio::test]
    async fn test_unproofed_identity_not_eligible_for_assurance() {
        let f = fixture();
        let mut id = identity();
        id.max_assurance = AssuranceLevel::None;
        f.identities.insert(id).await;
        let mut p = party();
        p.required_level = Some(AssuranceLevel::Low);
        let mut session = logged_in_session(AssuranceLevel::Substantial);
        session.identity.as_mut().unwrap().level = AssuranceLevel::None;
        let err = f
            .engine
            .next_step(&mut session, &p, &request(false), &FlowContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, IdpError::NotEligibleForAssurance));
    }

    #[tokio::test]
    async fn test_low_session_satisfies_low_requirement() {
        let f = fixture();
        f.identities.insert(identity()).await;
        let mut p = party();
        p.required_level = Some(AssuranceLevel::Low);
        // Password factor only: login state is Low, no step-up needed.
        let mut session = logged_in_session(AssuranceLevel::Substantial);
        let step = f
            .engine
            .next_step(&mut session, &p, &request(false), &FlowContext::default())
            .await
            .unwrap();
        assert_eq!(step, FlowStep::Issue);
    }

    #[tokio::test]
    async fn test_trusted_network_skips_mfa_floor() {
        let f = fixture();
        f.identities.insert(identity()).await;
        f.mfa
            .insert(
                "s-1",
                MfaDevice {
                    device_id: "d1".into(),
                    name: "Authenticator".into(),
                    level: AssuranceLevel::Substantial,
                    locked: false,
                    primary: false,
                },
            )
            .await;
        let mut p = party();
        p.mfa_policy = MfaPolicy::Always(AssuranceLevel::Substantial);
        p.skip_mfa_on_trusted_network = true;
        let mut session = logged_in_session(AssuranceLevel::Substantial);

        let trusted = FlowContext {
            client_ip: None,
            trusted_network: true,
        };
        let step = f
            .engine
            .next_step(&mut session, &p, &request(false), &trusted)
            .await
            .unwrap();
        assert_eq!(step, FlowStep::Issue);

        let step = f
            .engine
            .next_step(&mut session, &p, &request(false), &FlowContext::default())
            .await
            .unwrap();
        assert!(matches!(step, FlowStep::MfaChallenge { .. }));
    }

    #[tokio::test]
    async fn test_mfa_selection_is_flag_gated() {
        let f = fixture();
        let mut session = logged_in_session(AssuranceLevel::Substantial);
        session.mfa_candidates = vec!["d1".into()];
        let err = f.engine.select_mfa_device(&mut session, "d1").unwrap_err();
        assert!(matches!(err, IdpError::FlowStateViolation(_)));
    }

    #[tokio::test]
    async fn test_mfa_selection_rejects_unoffered_device() {
        let f = fixture();
        let mut session = logged_in_session(AssuranceLevel::Substantial);
        session.flags.in_mfa_selection = true;
        session.mfa_candidates = vec!["d1".into(), "d2".into()];

        let err = f
            .engine
            .select_mfa_device(&mut session, "d-rogue")
            .unwrap_err();
        assert!(matches!(err, IdpError::FlowStateViolation(_)));

        let step = f.engine.select_mfa_device(&mut session, "d2").unwrap();
        assert_eq!(
            step,
            FlowStep::MfaChallenge {
                device_id: "d2".into()
            }
        );
        assert!(!session.flags.in_mfa_selection);
    }

    #[tokio::test]
    async fn test_mfa_completion_rejects_unoffered_device() {
        let f = fixture();
        let now = Utc::now();
        let mut session = logged_in_session(AssuranceLevel::Substantial);
        session.mfa_candidates = vec!["d1".into()];

        let err = f
            .engine
            .complete_mfa(&mut session, "d-rogue", AssuranceLevel::Substantial, now)
            .unwrap_err();
        assert!(matches!(err, IdpError::FlowStateViolation(_)));
        assert_eq!(session.mfa_level(now, Duration::minutes(60)).level, None);

        f.engine
            .complete_mfa(&mut session, "d1", AssuranceLevel::Substantial, now)
            .unwrap();
        assert_eq!(
            session.mfa_level(now, Duration::minutes(60)).level,
            Some(AssuranceLevel::Substantial)
        );
        assert!(session.mfa_candidates.is_empty());
    }

    #[tokio::test]
    async fn test_password_change_is_flag_gated() {
        let f = fixture();
        let now = Utc::now();
        let mut session = logged_in_session(AssuranceLevel::Substantial);
        let err = f
            .engine
            .complete_password_change(&mut session, "new-pass", now)
            .unwrap_err();
        assert!(matches!(err, IdpError::FlowStateViolation(_)));
    }

    #[tokio::test]
    async fn test_password_change_returns_held_credential() {
        let f = fixture();
        let now = Utc::now();
        let id = identity();
        f.identities.insert(id.clone()).await;

        let mut session = SessionState::new();
        f.engine
            .record_primary_authentication(
                &mut session,
                &id,
                AssuranceLevel::Substantial,
                Some("old-pass"),
                now,
            )
            .unwrap();
        session.flags.in_password_change = true;

        let previous = f
            .engine
            .complete_password_change(&mut session, "new-pass", now)
            .unwrap();
        assert_eq!(previous, "old-pass");
        assert!(!session.flags.in_password_change);
    }
}
