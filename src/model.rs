use chrono::{Datelike, NaiveDateTime, NaiveTime, TimeDelta};
use serde::{Deserialize, Serialize};

pub type ApartmentId = i64;
pub type TenantId = i64;
pub type LeaseId = i64;
pub type PaymentId = i64;

const MS_PER_DAY: i64 = 86_400_000;

/// 00:00:00.000 of the same calendar day.
pub fn start_of_day(t: NaiveDateTime) -> NaiveDateTime {
    t.date().and_time(NaiveTime::MIN)
}

/// 23:59:59.999 of the same calendar day.
pub fn end_of_day(t: NaiveDateTime) -> NaiveDateTime {
    start_of_day(t) + TimeDelta::milliseconds(MS_PER_DAY - 1)
}

/// Occupancy period `[start, end]`, both bounds inclusive.
///
/// `end == None` means the occupancy never ends: every comparison against the
/// missing end treats it as `+∞`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Occupancy {
    pub start: NaiveDateTime,
    pub end: Option<NaiveDateTime>,
}

impl Occupancy {
    pub fn new(start: NaiveDateTime, end: Option<NaiveDateTime>) -> Self {
        Self { start, end }
    }

    /// Start pinned to the beginning of its day, end (if any) to the end of its day.
    /// Boundary behaviour of `overlaps` depends on this: a lease starting the day
    /// after another one ends does not collide, one starting on that same day does.
    pub fn normalized(&self) -> Self {
        Self {
            start: start_of_day(self.start),
            end: self.end.map(end_of_day),
        }
    }

    pub fn is_open_ended(&self) -> bool {
        self.end.is_none()
    }

    /// Closed-interval intersection test: `sA <= eB && sB <= eA`.
    pub fn overlaps(&self, other: &Occupancy) -> bool {
        let reaches_other = other.end.is_none_or(|end| self.start <= end);
        let other_reaches = self.end.is_none_or(|end| other.start <= end);
        reaches_other && other_reaches
    }

    pub fn ends_before_start(&self) -> bool {
        self.end.is_some_and(|end| end < self.start)
    }

    pub fn starts_on_first_of_month(&self) -> bool {
        self.start.day() == 1
    }

    /// True for open-ended occupancies.
    pub fn ends_on_last_of_month(&self) -> bool {
        self.end.is_none_or(|end| {
            end.date()
                .succ_opt()
                .is_none_or(|next| next.month() != end.month())
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Apartment {
    pub id: ApartmentId,
    pub name: String,
    pub address: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    pub email: String,
    pub is_rent_late: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub id: LeaseId,
    pub tenant_id: TenantId,
    pub apartment_id: ApartmentId,
    pub occupancy: Occupancy,
    pub rent: f64,
    pub deposit: f64,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Lease {
    /// The two scopes whose non-overlap invariant this lease participates in.
    pub fn scopes(&self) -> [Scope; 2] {
        [Scope::Tenant(self.tenant_id), Scope::Apartment(self.apartment_id)]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: PaymentId,
    pub tenant_id: TenantId,
    pub payment_date: NaiveDateTime,
    pub amount: f64,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

// ── Write inputs ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct ApartmentInput {
    pub name: String,
    pub address: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApartmentPatch {
    pub name: Option<String>,
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TenantInput {
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TenantPatch {
    pub name: Option<String>,
    pub email: Option<String>,
    pub is_rent_late: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LeaseInput {
    pub tenant_id: TenantId,
    pub apartment_id: ApartmentId,
    pub start: NaiveDateTime,
    pub end: Option<NaiveDateTime>,
    pub rent: f64,
    pub deposit: f64,
}

/// Fields left `None` keep their stored value. `end: Some(None)` clears the end date.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LeasePatch {
    pub tenant_id: Option<TenantId>,
    pub apartment_id: Option<ApartmentId>,
    pub start: Option<NaiveDateTime>,
    pub end: Option<Option<NaiveDateTime>>,
    pub rent: Option<f64>,
    pub deposit: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PaymentInput {
    pub tenant_id: TenantId,
    pub payment_date: NaiveDateTime,
    pub amount: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PaymentPatch {
    pub tenant_id: Option<TenantId>,
    pub payment_date: Option<NaiveDateTime>,
    pub amount: Option<f64>,
}

// ── Conflict scopes ──────────────────────────────────────────────

/// A grouping inside which no two leases may overlap.
///
/// The derived `Ord` is the lock order: all tenant scopes sort before all
/// apartment scopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
    Tenant(TenantId),
    Apartment(ApartmentId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseSlot {
    pub lease_id: LeaseId,
    pub occupancy: Occupancy,
}

/// Index of the leases inside one scope.
#[derive(Debug, Clone)]
pub struct ScopeState {
    pub scope: Scope,
    /// Sorted by `occupancy.start`.
    pub slots: Vec<LeaseSlot>,
}

impl ScopeState {
    pub fn new(scope: Scope) -> Self {
        Self {
            scope,
            slots: Vec::new(),
        }
    }

    pub fn insert_slot(&mut self, slot: LeaseSlot) {
        let pos = self
            .slots
            .partition_point(|s| s.occupancy.start <= slot.occupancy.start);
        self.slots.insert(pos, slot);
    }

    pub fn remove_slot(&mut self, lease_id: LeaseId) -> Option<LeaseSlot> {
        let pos = self.slots.iter().position(|s| s.lease_id == lease_id)?;
        Some(self.slots.remove(pos))
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Slots that may intersect `window`. Anything starting after `window.end`
    /// is cut off by binary search; the rest still has to go through
    /// `Occupancy::overlaps`.
    pub fn candidates(&self, window: &Occupancy) -> impl Iterator<Item = &LeaseSlot> {
        let right_bound = match window.end {
            Some(end) => self.slots.partition_point(|s| s.occupancy.start <= end),
            None => self.slots.len(),
        };
        self.slots[..right_bound].iter()
    }
}

/// WAL record format. Each variant carries the full row so replay never has
/// to recompute ids or timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    ApartmentCreated { apartment: Apartment },
    ApartmentUpdated { apartment: Apartment },
    ApartmentDeleted { id: ApartmentId },
    TenantCreated { tenant: Tenant },
    TenantUpdated { tenant: Tenant },
    TenantDeleted { id: TenantId },
    LeaseCreated { lease: Lease },
    LeaseUpdated { lease: Lease },
    LeaseDeleted { id: LeaseId },
    PaymentCreated { payment: Payment },
    PaymentUpdated { payment: Payment },
    PaymentDeleted { id: PaymentId },
    /// Written at the head of a compacted log so ids of deleted rows are
    /// never handed out again. Each field is the next id to assign.
    SequenceFloor {
        apartments: ApartmentId,
        tenants: TenantId,
        leases: LeaseId,
        payments: PaymentId,
    },
}

#[cfg(test)]
pub(crate) fn day(s: &str) -> NaiveDateTime {
    chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .unwrap()
        .and_time(NaiveTime::MIN)
}
