use crate::model::*;

use super::conflict::{first_conflict, ScopeReader};
use super::error::Violation;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeasePolicy {
    /// Require `start` on the 1st and `end` on the last day of a month.
    pub enforce_month_alignment: bool,
}

/// A lease about to be created or updated.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    /// Set when revalidating a stored lease; its stored row is then left out
    /// of both scopes.
    pub id: Option<LeaseId>,
    pub tenant_id: TenantId,
    pub apartment_id: ApartmentId,
    pub occupancy: Occupancy,
}

impl Candidate {
    pub fn from_lease(lease: &Lease) -> Self {
        Self {
            id: Some(lease.id),
            tenant_id: lease.tenant_id,
            apartment_id: lease.apartment_id,
            occupancy: lease.occupancy,
        }
    }
}

/// Runs every lease rule in order and stops at the first failure:
///
/// 1. normalize `start`/`end` to day bounds (written back into `candidate`)
/// 2. month alignment, if the policy asks for it
/// 3. `end` not before `start`
/// 4. no overlap inside the tenant scope
/// 5. no overlap inside the apartment scope
///
/// Structural rules always run before the scope reads, and the tenant scope is
/// always read before the apartment scope.
pub fn validate_lease<R: ScopeReader + ?Sized>(
    candidate: &mut Candidate,
    policy: &LeasePolicy,
    scopes: &R,
) -> Result<(), Violation> {
    let raw = candidate.occupancy;
    candidate.occupancy = raw.normalized();

    if policy.enforce_month_alignment {
        if !raw.starts_on_first_of_month() {
            return Err(Violation::StartNotBeginningOfMonth);
        }
        if !raw.ends_on_last_of_month() {
            return Err(Violation::EndNotEndOfMonth);
        }
    }

    if candidate.occupancy.ends_before_start() {
        return Err(Violation::EndBeforeStart);
    }

    if let Some(conflicting) = first_conflict(
        scopes,
        Scope::Tenant(candidate.tenant_id),
        &candidate.occupancy,
        candidate.id,
    ) {
        return Err(Violation::UserOverlap { conflicting });
    }

    if let Some(conflicting) = first_conflict(
        scopes,
        Scope::Apartment(candidate.apartment_id),
        &candidate.occupancy,
        candidate.id,
    ) {
        return Err(Violation::ApartmentOverlap { conflicting });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY_OFF: LeasePolicy = LeasePolicy {
        enforce_month_alignment: false,
    };
    const MONTHLY: LeasePolicy = LeasePolicy {
        enforce_month_alignment: true,
    };

    /// Builds tenant/apartment scope indexes from `(id, tenant, apartment, start, end)` rows.
    fn stored(rows: &[(LeaseId, TenantId, ApartmentId, &str, Option<&str>)]) -> Vec<ScopeState> {
        let mut scopes: Vec<ScopeState> = Vec::new();
        for &(lease_id, tenant_id, apartment_id, start, end) in rows {
            let occupancy = Occupancy::new(day(start), end.map(day)).normalized();
            for scope in [Scope::Tenant(tenant_id), Scope::Apartment(apartment_id)] {
                let idx = match scopes.iter().position(|s| s.scope == scope) {
                    Some(idx) => idx,
                    None => {
                        scopes.push(ScopeState::new(scope));
                        scopes.len() - 1
                    }
                };
                scopes[idx].insert_slot(LeaseSlot { lease_id, occupancy });
            }
        }
        scopes
    }

    fn candidate(tenant_id: TenantId, apartment_id: ApartmentId, start: &str, end: Option<&str>) -> Candidate {
        Candidate {
            id: None,
            tenant_id,
            apartment_id,
            occupancy: Occupancy::new(day(start), end.map(day)),
        }
    }

    fn run(c: &mut Candidate, policy: &LeasePolicy, scopes: &[ScopeState]) -> Result<(), Violation> {
        validate_lease(c, policy, scopes)
    }

    #[test]
    fn next_day_after_end_is_accepted() {
        let scopes = stored(&[(1, 1, 1, "2020-01-01", Some("2020-12-31"))]);
        let mut y = candidate(1, 2, "2021-01-01", None);
        assert_eq!(run(&mut y, &DAY_OFF, &scopes), Ok(()));
    }

    #[test]
    fn same_day_as_end_is_user_overlap() {
        let scopes = stored(&[(1, 1, 1, "2020-01-01", Some("2020-12-31"))]);
        let mut z = candidate(1, 2, "2020-12-31", None);
        assert_eq!(
            run(&mut z, &DAY_OFF, &scopes),
            Err(Violation::UserOverlap { conflicting: 1 })
        );
    }

    #[test]
    fn open_ended_apartment_leases_collide() {
        let scopes = stored(&[(5, 1, 9, "2030-01-01", None)]);
        let mut c = candidate(2, 9, "1990-06-15", None);
        assert_eq!(
            run(&mut c, &DAY_OFF, &scopes),
            Err(Violation::ApartmentOverlap { conflicting: 5 })
        );
    }

    #[test]
    fn covering_and_covered_candidates_collide() {
        let scopes = stored(&[(1, 1, 1, "2020-01-05", Some("2020-01-10"))]);

        let mut covering = candidate(1, 2, "2020-01-01", Some("2020-01-15"));
        assert_eq!(
            run(&mut covering, &DAY_OFF, &scopes),
            Err(Violation::UserOverlap { conflicting: 1 })
        );

        let mut covered = candidate(2, 1, "2020-01-06", Some("2020-01-09"));
        assert_eq!(
            run(&mut covered, &DAY_OFF, &scopes),
            Err(Violation::ApartmentOverlap { conflicting: 1 })
        );
    }

    #[test]
    fn end_before_start_wins_over_overlap() {
        let scopes = stored(&[(1, 1, 1, "2020-01-01", None)]);
        let mut c = candidate(1, 1, "2020-03-10", Some("2020-03-09"));
        assert_eq!(run(&mut c, &DAY_OFF, &scopes), Err(Violation::EndBeforeStart));
    }

    #[test]
    fn same_day_start_and_end_is_valid() {
        let mut c = candidate(1, 1, "2020-03-10", Some("2020-03-10"));
        assert_eq!(run(&mut c, &DAY_OFF, &[]), Ok(()));
    }

    #[test]
    fn tenant_scope_reported_before_apartment_scope() {
        let scopes = stored(&[
            (1, 1, 7, "2020-01-01", None),
            (2, 4, 2, "2020-01-01", None),
        ]);
        let mut c = candidate(1, 2, "2021-01-01", None);
        assert_eq!(
            run(&mut c, &DAY_OFF, &scopes),
            Err(Violation::UserOverlap { conflicting: 1 })
        );
    }

    #[test]
    fn update_excludes_own_row() {
        let scopes = stored(&[(3, 1, 1, "2020-01-01", Some("2020-06-30"))]);
        let mut unchanged = candidate(1, 1, "2020-01-01", Some("2020-06-30"));
        unchanged.id = Some(3);
        assert_eq!(run(&mut unchanged, &DAY_OFF, &scopes), Ok(()));

        let mut extended = candidate(1, 1, "2020-01-01", None);
        extended.id = Some(3);
        assert_eq!(run(&mut extended, &DAY_OFF, &scopes), Ok(()));

        let mut as_new = candidate(1, 1, "2020-01-01", Some("2020-06-30"));
        assert_eq!(
            run(&mut as_new, &DAY_OFF, &scopes),
            Err(Violation::UserOverlap { conflicting: 3 })
        );
    }

    #[test]
    fn candidate_is_normalized_in_place() {
        let mut c = Candidate {
            id: None,
            tenant_id: 1,
            apartment_id: 1,
            occupancy: Occupancy::new(
                day("2020-02-01") + chrono::TimeDelta::hours(15),
                Some(day("2020-02-29")),
            ),
        };
        run(&mut c, &MONTHLY, &[]).unwrap();
        assert_eq!(c.occupancy.start, day("2020-02-01"));
        assert_eq!(c.occupancy.end, Some(crate::model::end_of_day(day("2020-02-29"))));
    }

    #[test]
    fn month_alignment_only_when_enabled() {
        let mut mid_month = candidate(1, 1, "2020-02-02", None);
        assert_eq!(
            run(&mut mid_month, &MONTHLY, &[]),
            Err(Violation::StartNotBeginningOfMonth)
        );
        let mut mid_month = candidate(1, 1, "2020-02-02", None);
        assert_eq!(run(&mut mid_month, &DAY_OFF, &[]), Ok(()));

        let mut short_end = candidate(1, 1, "2020-02-01", Some("2020-02-28"));
        assert_eq!(run(&mut short_end, &MONTHLY, &[]), Err(Violation::EndNotEndOfMonth));

        let mut aligned = candidate(1, 1, "2020-02-01", Some("2020-02-29"));
        assert_eq!(run(&mut aligned, &MONTHLY, &[]), Ok(()));
    }

    #[test]
    fn month_alignment_checked_before_end_before_start() {
        let mut c = candidate(1, 1, "2020-03-01", Some("2020-01-15"));
        assert_eq!(run(&mut c, &MONTHLY, &[]), Err(Violation::EndNotEndOfMonth));
    }
}
