//! Application status state machine (§4.5).
//!
//! Explicit transition table. Every call to [`transition`] enforces:
//!
//! 1. **Legal transitions only.** An illegal source/target pair returns
//!    [`StateTransitionError`], which callers MUST treat as a permanent
//!    failure (§7: `PermanentProcessing`), never retried.
//! 2. **Terminal states admit no further transition.** `APPROVED`,
//!    `REJECTED`, `CANCELLED`, `COMPLETED` are dead ends.
//!
//! This module is pure — it decides whether a transition is legal and what
//! it is, but performs no I/O. `cf-db` executes the decided transition
//! atomically with the persistence update (§4.5: "Every transition is
//! executed atomically with the persistence update").

use cf_schemas::ApplicationStatus;

/// Returned when a transition cannot legally be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTransitionError {
    pub from: ApplicationStatus,
    pub to: ApplicationStatus,
}

impl std::fmt::Display for StateTransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "illegal application state transition: {} -> {}",
            self.from, self.to
        )
    }
}

impl std::error::Error for StateTransitionError {}

/// Who/why a transition happened, attributed to the audit trigger via
/// session variables set by the caller (§4.1 audit trigger contract).
#[derive(Debug, Clone)]
pub struct TransitionAttribution {
    pub changed_by: String,
    pub change_reason: Option<String>,
}

impl TransitionAttribution {
    pub fn system(reason: impl Into<String>) -> Self {
        Self {
            changed_by: "system".to_string(),
            change_reason: Some(reason.into()),
        }
    }

    pub fn webhook(provider: &str, reason: impl Into<String>) -> Self {
        Self {
            changed_by: format!("webhook:{provider}"),
            change_reason: Some(reason.into()),
        }
    }

    pub fn worker(reason: impl Into<String>) -> Self {
        Self {
            changed_by: "worker".to_string(),
            change_reason: Some(reason.into()),
        }
    }
}

/// Validate that `from -> to` is a legal transition per §4.5's table.
///
/// | From | To |
/// |------|----|
/// | PENDING | VALIDATING, CANCELLED |
/// | VALIDATING | APPROVED, REJECTED, UNDER_REVIEW |
/// | UNDER_REVIEW | APPROVED, REJECTED |
pub fn validate_transition(
    from: ApplicationStatus,
    to: ApplicationStatus,
) -> Result<(), StateTransitionError> {
    use ApplicationStatus::*;

    let legal = matches!(
        (from, to),
        (Pending, Validating)
            | (Pending, Cancelled)
            | (Validating, Approved)
            | (Validating, Rejected)
            | (Validating, UnderReview)
            | (UnderReview, Approved)
            | (UnderReview, Rejected)
    );

    if legal {
        Ok(())
    } else {
        Err(StateTransitionError { from, to })
    }
}

/// A decided, not-yet-persisted transition: the target status plus the
/// attribution the audit trigger should read.
#[derive(Debug, Clone)]
pub struct DecidedTransition {
    pub from: ApplicationStatus,
    pub to: ApplicationStatus,
    pub attribution: TransitionAttribution,
}

/// Decide a transition, validating it against the table above.
pub fn transition(
    from: ApplicationStatus,
    to: ApplicationStatus,
    attribution: TransitionAttribution,
) -> Result<DecidedTransition, StateTransitionError> {
    validate_transition(from, to)?;
    Ok(DecidedTransition {
        from,
        to,
        attribution,
    })
}

/// Map a country strategy's recommendation (§4.2) to the status it drives
/// the application to from `VALIDATING` (§4.7 step 7).
pub fn status_for_recommendation(rec: cf_schemas::Recommendation) -> ApplicationStatus {
    match rec {
        cf_schemas::Recommendation::Approve => ApplicationStatus::Approved,
        cf_schemas::Recommendation::Reject => ApplicationStatus::Rejected,
        cf_schemas::Recommendation::Review => ApplicationStatus::UnderReview,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ApplicationStatus::*;

    #[test]
    fn pending_to_validating_is_legal() {
        assert!(validate_transition(Pending, Validating).is_ok());
    }

    #[test]
    fn pending_to_cancelled_is_legal() {
        assert!(validate_transition(Pending, Cancelled).is_ok());
    }

    #[test]
    fn validating_to_any_of_three_outcomes_is_legal() {
        assert!(validate_transition(Validating, Approved).is_ok());
        assert!(validate_transition(Validating, Rejected).is_ok());
        assert!(validate_transition(Validating, UnderReview).is_ok());
    }

    #[test]
    fn under_review_to_terminal_is_legal() {
        assert!(validate_transition(UnderReview, Approved).is_ok());
        assert!(validate_transition(UnderReview, Rejected).is_ok());
    }

    #[test]
    fn terminal_states_reject_every_transition() {
        for terminal in [Approved, Rejected, Cancelled, Completed] {
            for target in [Pending, Validating, UnderReview, Approved, Rejected, Cancelled, Completed]
            {
                let err = validate_transition(terminal, target);
                if terminal == target {
                    assert!(err.is_err(), "{terminal} -> {target} must be illegal (no self-loop)");
                } else {
                    assert!(err.is_err(), "{terminal} -> {target} must be illegal");
                }
            }
        }
    }

    #[test]
    fn undeclared_target_is_illegal() {
        let err = validate_transition(Pending, Approved).unwrap_err();
        assert_eq!(err.from, Pending);
        assert_eq!(err.to, Approved);
    }

    #[test]
    fn under_review_cannot_go_back_to_validating() {
        assert!(validate_transition(UnderReview, Validating).is_err());
    }

    #[test]
    fn recommendation_maps_to_expected_status() {
        assert_eq!(
            status_for_recommendation(cf_schemas::Recommendation::Approve),
            Approved
        );
        assert_eq!(
            status_for_recommendation(cf_schemas::Recommendation::Reject),
            Rejected
        );
        assert_eq!(
            status_for_recommendation(cf_schemas::Recommendation::Review),
            UnderReview
        );
    }
}
