use super::models::{AccountSnapshot, AccountStatus};

/// Disable reasons with this prefix mean the processor has permanently rejected the account.
const REJECTED_PREFIX: &str = "rejected.";

/// Pure function of the processor flags; the previously stored status never
/// participates.
pub fn derive_status(
    charges_enabled: bool,
    payouts_enabled: bool,
    details_submitted: bool,
    disabled_reason: Option<&str>,
) -> AccountStatus {
    if charges_enabled && payouts_enabled {
        return AccountStatus::Active;
    }

    if let Some(reason) = disabled_reason.map(str::trim).filter(|r| !r.is_empty()) {
        if reason.starts_with(REJECTED_PREFIX) {
            return AccountStatus::Disabled;
        }
        return AccountStatus::Restricted;
    }

    if details_submitted {
        return AccountStatus::Onboarding;
    }

    AccountStatus::Pending
}

pub fn derive_from_snapshot(snapshot: &AccountSnapshot) -> AccountStatus {
    derive_status(
        snapshot.charges_enabled,
        snapshot.payouts_enabled,
        snapshot.details_submitted,
        snapshot.disabled_reason.as_deref(),
    )
}

/// Onboarding is complete once details are in and the processor enabled charges.
pub fn onboarding_completed(snapshot: &AccountSnapshot) -> bool {
    snapshot.details_submitted && snapshot.charges_enabled
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_capabilities_enabled_is_active() {
        assert_eq!(derive_status(true, true, true, None), AccountStatus::Active);
        // processor still reporting a stale reason does not block an enabled account
        assert_eq!(
            derive_status(true, true, true, Some("requirements.past_due")),
            AccountStatus::Active
        );
    }

    #[test]
    fn details_submitted_without_capabilities_is_onboarding() {
        assert_eq!(derive_status(false, false, true, None), AccountStatus::Onboarding);
    }

    #[test]
    fn disable_reason_restricts() {
        assert_eq!(
            derive_status(false, false, true, Some("requirements.past_due")),
            AccountStatus::Restricted
        );
        assert_eq!(
            derive_status(true, false, true, Some("requirements.pending_verification")),
            AccountStatus::Restricted
        );
    }

    #[test]
    fn rejection_disables() {
        assert_eq!(
            derive_status(false, false, true, Some("rejected.fraud")),
            AccountStatus::Disabled
        );
    }

    #[test]
    fn blank_reason_is_ignored() {
        assert_eq!(derive_status(false, false, false, Some("  ")), AccountStatus::Pending);
    }

    #[test]
    fn nothing_reported_is_pending() {
        assert_eq!(derive_status(false, false, false, None), AccountStatus::Pending);
        assert_eq!(derive_status(true, false, false, None), AccountStatus::Pending);
    }

    #[test]
    fn derivation_is_exhaustively_deterministic() {
        let reasons = [None, Some("requirements.past_due"), Some("rejected.terms_of_service")];
        for charges in [false, true] {
            for payouts in [false, true] {
                for details in [false, true] {
                    for reason in reasons {
                        let first = derive_status(charges, payouts, details, reason);
                        let second = derive_status(charges, payouts, details, reason);
                        assert_eq!(first, second);
                    }
                }
            }
        }
    }
}
