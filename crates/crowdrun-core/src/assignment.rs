//! Assignment status: derived from the unit statuses, never stored.

use uuid::Uuid;

use crowdrun_db::models::{AssignmentStatus, UnitStatus};
use crowdrun_db::{Datastore, DatastoreResult};

/// Reduce unit statuses to the assignment status.
///
/// Rules, first match wins:
/// 1. no units: `created`
/// 2. every unit has the same status: that status
/// 3. any `created`, then any `launched`, then any `assigned`: that status
/// 4. every unit reviewed (`accepted`, `rejected`, `soft_rejected`): `mixed`
/// 5. otherwise every unit is final but some are unreviewed: `completed`
///
/// Every rule is a predicate over the set of statuses, so the result does
/// not depend on unit order, and rule 5 makes the reduction total.
pub fn derive_assignment_status(units: &[UnitStatus]) -> AssignmentStatus {
    let Some(first) = units.first() else {
        return AssignmentStatus::Created;
    };
    if units.iter().all(|s| s == first) {
        return (*first).into();
    }
    for live in [UnitStatus::Created, UnitStatus::Launched, UnitStatus::Assigned] {
        if units.contains(&live) {
            return live.into();
        }
    }
    let reviewed = |s: &UnitStatus| {
        matches!(
            s,
            UnitStatus::Accepted | UnitStatus::Rejected | UnitStatus::SoftRejected
        )
    };
    if units.iter().all(reviewed) {
        return AssignmentStatus::Mixed;
    }
    AssignmentStatus::Completed
}

/// Load an assignment's units and derive its status.
pub async fn assignment_status(
    datastore: &dyn Datastore,
    assignment_id: Uuid,
) -> DatastoreResult<AssignmentStatus> {
    let units = datastore.list_units_for_assignment(assignment_id).await?;
    let statuses: Vec<UnitStatus> = units.iter().map(|u| u.status).collect();
    Ok(derive_assignment_status(&statuses))
}

#[cfg(test)]
mod tests {
    use super::*;
    use UnitStatus::*;

    const ALL: [UnitStatus; 8] = [
        Created,
        Launched,
        Assigned,
        Completed,
        Expired,
        Accepted,
        Rejected,
        SoftRejected,
    ];

    #[test]
    fn empty_is_created() {
        assert_eq!(derive_assignment_status(&[]), AssignmentStatus::Created);
    }

    #[test]
    fn uniform_statuses_pass_through() {
        for status in ALL {
            assert_eq!(
                derive_assignment_status(&[status, status, status]),
                AssignmentStatus::from(status)
            );
        }
    }

    #[test]
    fn earliest_live_status_wins() {
        assert_eq!(
            derive_assignment_status(&[Completed, Created, Assigned]),
            AssignmentStatus::Created
        );
        assert_eq!(
            derive_assignment_status(&[Assigned, Launched, Completed]),
            AssignmentStatus::Launched
        );
        assert_eq!(
            derive_assignment_status(&[Assigned, Expired]),
            AssignmentStatus::Assigned
        );
    }

    #[test]
    fn reviewed_mix_is_mixed() {
        assert_eq!(
            derive_assignment_status(&[Accepted, Rejected]),
            AssignmentStatus::Mixed
        );
        assert_eq!(
            derive_assignment_status(&[SoftRejected, Accepted, Accepted]),
            AssignmentStatus::Mixed
        );
    }

    #[test]
    fn final_but_unreviewed_is_completed() {
        assert_eq!(
            derive_assignment_status(&[Completed, Expired]),
            AssignmentStatus::Completed
        );
        assert_eq!(
            derive_assignment_status(&[Accepted, Completed]),
            AssignmentStatus::Completed
        );
    }

    #[test]
    fn order_independent_over_all_pairs_and_triples() {
        for a in ALL {
            for b in ALL {
                assert_eq!(
                    derive_assignment_status(&[a, b]),
                    derive_assignment_status(&[b, a])
                );
                for c in ALL {
                    let expected = derive_assignment_status(&[a, b, c]);
                    for perm in [[a, c, b], [b, a, c], [b, c, a], [c, a, b], [c, b, a]] {
                        assert_eq!(derive_assignment_status(&perm), expected);
                    }
                }
            }
        }
    }

    #[test]
    fn terminal_only_when_no_live_units() {
        for a in ALL {
            for b in ALL {
                let derived = derive_assignment_status(&[a, b]);
                assert_eq!(derived.is_terminal(), a.is_final() && b.is_final());
            }
        }
    }
}
