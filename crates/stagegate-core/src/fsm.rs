//! Static pipeline transition table.

use stagegate_state::PipelineStatus;

use crate::error::StateViolation;

use PipelineStatus::*;

/// Statuses reachable from `status` in one hop.
///
/// Forward chain up to `verifying`, the `verifying -> building` back-edge
/// for repair and next-unit cycles, the verification outcomes, and the
/// `failed` escape from every non-terminal status.
pub fn allowed_next(status: PipelineStatus) -> &'static [PipelineStatus] {
    match status {
        Initialized => &[Documenting, Failed],
        Documenting => &[ScreenDesign, Failed],
        ScreenDesign => &[Planning, Failed],
        Planning => &[Building, Failed],
        Building => &[Verifying, Failed],
        Verifying => &[Building, Completed, VerificationFailed, Failed],
        Completed | VerificationFailed | Failed => &[],
    }
}

pub fn can_transition(from: PipelineStatus, to: PipelineStatus) -> bool {
    allowed_next(from).contains(&to)
}

/// `Ok` iff `from -> to` is an edge of the table.
pub fn check_edge(from: PipelineStatus, to: PipelineStatus) -> Result<(), StateViolation> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(StateViolation::InvalidTransition { from, to })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_have_no_edges() {
        for status in PipelineStatus::ALL {
            assert_eq!(status.is_terminal(), allowed_next(status).is_empty());
        }
    }

    #[test]
    fn test_every_non_terminal_can_fail() {
        for status in PipelineStatus::ALL.into_iter().filter(|s| !s.is_terminal()) {
            assert!(can_transition(status, Failed), "{status} -> failed");
        }
    }

    #[test]
    fn test_no_skipping_stages() {
        assert!(!can_transition(Initialized, ScreenDesign));
        assert!(!can_transition(Documenting, Building));
        assert!(!can_transition(Building, Completed));
        assert!(!can_transition(Verifying, Planning));
    }

    #[test]
    fn test_repair_back_edge() {
        assert!(can_transition(Verifying, Building));
        assert!(!can_transition(Building, Planning));
    }

    #[test]
    fn test_check_edge_reports_both_ends() {
        assert_eq!(
            check_edge(Completed, Building),
            Err(StateViolation::InvalidTransition {
                from: Completed,
                to: Building
            })
        );
    }
}
