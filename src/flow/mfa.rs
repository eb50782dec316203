//! MFA device selection.

use crate::assurance::AssuranceLevel;
use crate::directory::MfaDevice;
use crate::error::{IdpError, IdpResult};

/// Next step of the MFA sub-flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MfaStep {
    /// One unlocked device; challenge it directly.
    Challenge { device_id: String },
    /// Show a device picker, in display order.
    Select { device_ids: Vec<String> },
}

/// Pick the next MFA step from the identity's devices.
///
/// Devices below the required level are invisible. A single unlocked device
/// skips the picker; a single locked device still gets a picker so the user
/// sees why they cannot proceed. With several devices the picker is sorted
/// by name with any primary device pinned first.
pub fn select_devices(devices: &[MfaDevice], required: AssuranceLevel) -> IdpResult<MfaStep> {
    let mut eligible: Vec<&MfaDevice> = devices.iter().filter(|d| d.level >= required).collect();

    match eligible.len() {
        0 => Err(IdpError::NoEligibleMfaDevice),
        1 if !eligible[0].locked => Ok(MfaStep::Challenge {
            device_id: eligible[0].device_id.clone(),
        }),
        1 => Ok(MfaStep::Select {
            device_ids: vec![eligible[0].device_id.clone()],
        }),
        _ => {
            eligible.sort_by(|a, b| {
                b.primary
                    .cmp(&a.primary)
                    .then_with(|| a.name.cmp(&b.name))
            });
            Ok(MfaStep::Select {
                device_ids: eligible.iter().map(|d| d.device_id.clone()).collect(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(id: &str, name: &str, level: AssuranceLevel, locked: bool, primary: bool) -> MfaDevice {
        MfaDevice {
            device_id: id.to_string(),
            name: name.to_string(),
            level,
            locked,
            primary,
        }
    }

    #[test]
    fn test_no_eligible_device() {
        let devices = vec![device("d1", "App", AssuranceLevel::Low, false, false)];
        assert!(matches!(
            select_devices(&devices, AssuranceLevel::Substantial),
            Err(IdpError::NoEligibleMfaDevice)
        ));
    }

    #[test]
    fn test_single_unlocked_goes_direct() {
        let devices = vec![device("d1", "App", AssuranceLevel::Substantial, false, false)];
        assert_eq!(
            select_devices(&devices, AssuranceLevel::Substantial).unwrap(),
            MfaStep::Challenge {
                device_id: "d1".into()
            }
        );
    }

    #[test]
    fn test_single_locked_still_shows_picker() {
        let devices = vec![device("d1", "App", AssuranceLevel::Substantial, true, false)];
        assert_eq!(
            select_devices(&devices, AssuranceLevel::Substantial).unwrap(),
            MfaStep::Select {
                device_ids: vec!["d1".into()]
            }
        );
    }

    #[test]
    fn test_picker_sorted_with_primary_first() {
        let devices = vec![
            device("d1", "Zebra key", AssuranceLevel::Substantial, false, false),
            device("d2", "App", AssuranceLevel::Substantial, false, false),
            device("d3", "Middle token", AssuranceLevel::Substantial, false, true),
        ];
        assert_eq!(
            select_devices(&devices, AssuranceLevel::Substantial).unwrap(),
            MfaStep::Select {
                device_ids: vec!["d3".into(), "d2".into(), "d1".into()]
            }
        );
    }

    #[test]
    fn test_level_filter_applies_before_count() {
        // Two devices, one below level: the remaining one goes direct.
        let devices = vec![
            device("d1", "App", AssuranceLevel::Low, false, false),
            device("d2", "Key", AssuranceLevel::High, false, false),
        ];
        assert_eq!(
            select_devices(&devices, AssuranceLevel::Substantial).unwrap(),
            MfaStep::Challenge {
                device_id: "d2".into()
            }
        );
    }
}
