use chrono::{Datelike, NaiveDateTime};

use crate::model::*;

use super::EngineError;

pub(crate) fn now() -> NaiveDateTime {
    chrono::Utc::now().naive_utc()
}

pub(crate) fn validate_date(t: NaiveDateTime) -> Result<(), EngineError> {
    use crate::limits::*;
    if t.year() < MIN_YEAR || t.year() > MAX_YEAR {
        return Err(EngineError::LimitExceeded("date out of range"));
    }
    Ok(())
}

pub(crate) fn validate_occupancy(occupancy: &Occupancy) -> Result<(), EngineError> {
    validate_date(occupancy.start)?;
    if let Some(end) = occupancy.end {
        validate_date(end)?;
    }
    Ok(())
}

pub(crate) fn validate_amount(value: f64, what: &'static str) -> Result<(), EngineError> {
    if !value.is_finite() {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

/// Read side of the conflict scopes.
///
/// `candidates` may prune with an index but must return every stored lease of
/// `scope` that overlaps `window`, except the one with id `exclude`.
pub trait ScopeReader {
    fn candidates(&self, scope: Scope, window: &Occupancy, exclude: Option<LeaseId>) -> Vec<LeaseSlot>;
}

impl ScopeReader for ScopeState {
    fn candidates(&self, scope: Scope, window: &Occupancy, exclude: Option<LeaseId>) -> Vec<LeaseSlot> {
        if scope != self.scope {
            return Vec::new();
        }
        ScopeState::candidates(self, window)
            .filter(|slot| Some(slot.lease_id) != exclude)
            .copied()
            .collect()
    }
}

impl<R: ScopeReader> ScopeReader for [R] {
    fn candidates(&self, scope: Scope, window: &Occupancy, exclude: Option<LeaseId>) -> Vec<LeaseSlot> {
        self.iter()
            .flat_map(|r| r.candidates(scope, window, exclude))
            .collect()
    }
}

/// First stored lease in `scope` that collides with `window`.
pub(crate) fn first_conflict<R: ScopeReader + ?Sized>(
    reader: &R,
    scope: Scope,
    window: &Occupancy,
    exclude: Option<LeaseId>,
) -> Option<LeaseId> {
    reader
        .candidates(scope, window, exclude)
        .into_iter()
        .find(|slot| slot.occupancy.overlaps(window))
        .map(|slot| slot.lease_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(lease_id: LeaseId, start: &str, end: Option<&str>) -> LeaseSlot {
        LeaseSlot {
            lease_id,
            occupancy: Occupancy::new(day(start), end.map(day)).normalized(),
        }
    }

    fn window(start: &str, end: Option<&str>) -> Occupancy {
        Occupancy::new(day(start), end.map(day)).normalized()
    }

    #[test]
    fn exclusion_skips_own_row() {
        let mut scope = ScopeState::new(Scope::Tenant(1));
        scope.insert_slot(slot(10, "2020-01-01", Some("2020-12-31")));
        let w = window("2020-01-01", Some("2020-12-31"));

        assert_eq!(first_conflict(&scope, Scope::Tenant(1), &w, None), Some(10));
        assert_eq!(first_conflict(&scope, Scope::Tenant(1), &w, Some(10)), None);
    }

    #[test]
    fn other_scope_is_invisible() {
        let mut scope = ScopeState::new(Scope::Tenant(1));
        scope.insert_slot(slot(10, "2020-01-01", None));
        let w = window("2020-01-01", None);
        assert_eq!(first_conflict(&scope, Scope::Tenant(2), &w, None), None);
        assert_eq!(first_conflict(&scope, Scope::Apartment(1), &w, None), None);
    }

    #[test]
    fn pruned_candidates_match_full_scan() {
        let mut scope = ScopeState::new(Scope::Apartment(3));
        let stored = [
            slot(1, "2018-01-01", Some("2018-12-31")),
            slot(2, "2019-03-01", Some("2019-03-31")),
            slot(3, "2019-06-15", Some("2019-07-14")),
            slot(4, "2020-01-01", None),
        ];
        for s in stored {
            scope.insert_slot(s);
        }
        let windows = [
            window("2017-01-01", Some("2017-12-31")),
            window("2018-12-31", Some("2019-03-01")),
            window("2019-04-01", Some("2019-06-14")),
            window("2019-07-14", None),
            window("2025-01-01", Some("2025-01-31")),
        ];
        for w in &windows {
            let full_scan: Vec<_> = stored
                .iter()
                .filter(|s| s.occupancy.overlaps(w))
                .map(|s| s.lease_id)
                .collect();
            let indexed: Vec<_> = ScopeReader::candidates(&scope, Scope::Apartment(3), w, None)
                .into_iter()
                .filter(|s| s.occupancy.overlaps(w))
                .map(|s| s.lease_id)
                .collect();
            assert_eq!(indexed, full_scan, "window {w:?}");
        }
    }

    #[test]
    fn date_range_limits() {
        assert!(validate_date(day("1899-12-31")).is_err());
        assert!(validate_date(day("1900-01-01")).is_ok());
        assert!(validate_occupancy(&window("2020-01-01", None)).is_ok());
        assert!(validate_amount(f64::NAN, "rent must be a finite number").is_err());
        assert!(validate_amount(1200.0, "rent must be a finite number").is_ok());
    }
}
