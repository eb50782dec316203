//! Password lifetime evaluation.

use chrono::{DateTime, Utc};

use crate::directory::{Identity, PasswordPolicy};

/// Outcome of evaluating the identity's password against policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordStatus {
    Ok,
    /// No password registered at all; routes to activation.
    NoPassword,
    /// An operator or the user flagged the password for replacement.
    ForceChange,
    Expired,
    /// Inside the warning window; prompting is skippable.
    AlmostExpired { days_left: i64 },
}

pub fn evaluate(identity: &Identity, policy: &PasswordPolicy, now: DateTime<Utc>) -> PasswordStatus {
    if !identity.has_password {
        return PasswordStatus::NoPassword;
    }
    if identity.force_change_password {
        return PasswordStatus::ForceChange;
    }
    let Some(max_age_days) = policy.max_age_days else {
        return PasswordStatus::Ok;
    };
    // A password with no change timestamp cannot be aged; treat it as due.
    let Some(changed_at) = identity.password_changed_at else {
        return PasswordStatus::Expired;
    };

    let age_days = (now - changed_at).num_days();
    if age_days >= max_age_days {
        return PasswordStatus::Expired;
    }
    let days_left = max_age_days - age_days;
    if days_left <= policy.warn_before_days {
        return PasswordStatus::AlmostExpired { days_left };
    }
    PasswordStatus::Ok
}
