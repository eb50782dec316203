//! Assurance levels and the elevate-only transition rule
//!
//! Every policy decision in the broker compares against this ordered
//! four-tier trust ranking. The ordering is total: NONE < LOW <
//! SUBSTANTIAL < HIGH.

use serde::{Deserialize, Serialize};

/// How strongly an identity or session channel has been verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AssuranceLevel {
    None,
    Low,
    Substantial,
    High,
}

impl AssuranceLevel {
    /// True if `self` is at or below `other` in the trust ordering.
    #[must_use]
    pub fn equal_or_lesser(self, other: Self) -> bool {
        self <= other
    }

    /// True if `self` is strictly above `other`.
    #[must_use]
    pub fn is_greater(self, other: Self) -> bool {
        self > other
    }
}

impl std::fmt::Display for AssuranceLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AssuranceLevel::None => "NONE",
            AssuranceLevel::Low => "LOW",
            AssuranceLevel::Substantial => "SUBSTANTIAL",
            AssuranceLevel::High => "HIGH",
        };
        f.write_str(s)
    }
}

/// Elevate-only transition for a held trust level.
///
/// A `None` candidate clears the held level. A candidate at or above the
/// held level replaces it (an equal candidate counts as a fresh
/// verification and is accepted so the caller can refresh its timestamp).
/// A candidate below the held level is a no-op.
#[must_use]
pub fn elevate(
    current: Option<AssuranceLevel>,
    candidate: Option<AssuranceLevel>,
) -> Option<AssuranceLevel> {
    match (current, candidate) {
        (_, None) => None,
        (None, Some(c)) => Some(c),
        (Some(held), Some(c)) => {
            if held.is_greater(c) {
                Some(held)
            } else {
                Some(c)
            }
        }
    }
}
