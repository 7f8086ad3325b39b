use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};

use crate::model::*;

use super::SharedScopeState;
use super::conflict::ScopeReader;

/// Monotonic id source. Ids seen during replay push the floor up.
#[derive(Debug)]
struct Sequence(AtomicI64);

impl Sequence {
    fn new() -> Self {
        Self(AtomicI64::new(1))
    }

    fn next(&self) -> i64 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }

    fn observe(&self, id: i64) {
        self.0.fetch_max(id + 1, Ordering::SeqCst);
    }

    fn peek(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Write guards over a set of scopes, acquired in `Scope` order.
pub struct ScopeLocks {
    guards: Vec<OwnedRwLockWriteGuard<ScopeState>>,
}

impl ScopeLocks {
    pub fn empty() -> Self {
        Self { guards: Vec::new() }
    }

    pub fn get(&self, scope: Scope) -> Option<&ScopeState> {
        self.guards.iter().find(|g| g.scope == scope).map(|g| &**g)
    }

    pub fn get_mut(&mut self, scope: Scope) -> Option<&mut ScopeState> {
        self.guards
            .iter_mut()
            .find(|g| g.scope == scope)
            .map(|g| &mut **g)
    }
}

impl ScopeReader for ScopeLocks {
    fn candidates(&self, scope: Scope, window: &Occupancy, exclude: Option<LeaseId>) -> Vec<LeaseSlot> {
        match self.get(scope) {
            Some(state) => ScopeReader::candidates(state, scope, window, exclude),
            None => {
                debug_assert!(false, "scope {scope:?} read without holding its lock");
                Vec::new()
            }
        }
    }
}

pub struct Store {
    apartments: DashMap<ApartmentId, Apartment>,
    tenants: DashMap<TenantId, Tenant>,
    leases: DashMap<LeaseId, Lease>,
    payments: DashMap<PaymentId, Payment>,
    scopes: DashMap<Scope, SharedScopeState>,
    apartment_ids: Sequence,
    tenant_ids: Sequence,
    lease_ids: Sequence,
    payment_ids: Sequence,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self {
            apartments: DashMap::new(),
            tenants: DashMap::new(),
            leases: DashMap::new(),
            payments: DashMap::new(),
            scopes: DashMap::new(),
            apartment_ids: Sequence::new(),
            tenant_ids: Sequence::new(),
            lease_ids: Sequence::new(),
            payment_ids: Sequence::new(),
        }
    }

    // ── Ids ──────────────────────────────────────────────────

    pub fn next_apartment_id(&self) -> ApartmentId {
        self.apartment_ids.next()
    }

    pub fn next_tenant_id(&self) -> TenantId {
        self.tenant_ids.next()
    }

    pub fn next_lease_id(&self) -> LeaseId {
        self.lease_ids.next()
    }

    pub fn next_payment_id(&self) -> PaymentId {
        self.payment_ids.next()
    }

    pub fn entity_count(&self) -> usize {
        self.apartments.len() + self.tenants.len() + self.leases.len() + self.payments.len()
    }

    // ── Rows ─────────────────────────────────────────────────

    pub fn apartment(&self, id: ApartmentId) -> Option<Apartment> {
        self.apartments.get(&id).map(|e| e.value().clone())
    }

    pub fn tenant(&self, id: TenantId) -> Option<Tenant> {
        self.tenants.get(&id).map(|e| e.value().clone())
    }

    pub fn lease(&self, id: LeaseId) -> Option<Lease> {
        self.leases.get(&id).map(|e| e.value().clone())
    }

    pub fn payment(&self, id: PaymentId) -> Option<Payment> {
        self.payments.get(&id).map(|e| e.value().clone())
    }

    pub fn has_apartment(&self, id: ApartmentId) -> bool {
        self.apartments.contains_key(&id)
    }

    pub fn has_tenant(&self, id: TenantId) -> bool {
        self.tenants.contains_key(&id)
    }

    pub fn apartments(&self) -> Vec<Apartment> {
        sorted_by_id(&self.apartments, |a| a.id)
    }

    pub fn tenants(&self) -> Vec<Tenant> {
        sorted_by_id(&self.tenants, |t| t.id)
    }

    pub fn leases(&self) -> Vec<Lease> {
        sorted_by_id(&self.leases, |l| l.id)
    }

    pub fn payments(&self) -> Vec<Payment> {
        sorted_by_id(&self.payments, |p| p.id)
    }

    /// Which unique apartment column `name`/`address` would collide on, ignoring `except`.
    pub fn apartment_collision(
        &self,
        name: &str,
        address: &str,
        except: Option<ApartmentId>,
    ) -> Option<&'static str> {
        for entry in self.apartments.iter() {
            let a = entry.value();
            if Some(a.id) == except {
                continue;
            }
            if a.name == name {
                return Some("name");
            }
            if a.address == address {
                return Some("address");
            }
        }
        None
    }

    pub fn tenant_email_taken(&self, email: &str, except: Option<TenantId>) -> bool {
        self.tenants
            .iter()
            .any(|e| Some(e.value().id) != except && e.value().email == email)
    }

    pub fn tenant_has_payments(&self, tenant_id: TenantId) -> bool {
        self.payments.iter().any(|e| e.value().tenant_id == tenant_id)
    }

    // ── Scope index ──────────────────────────────────────────

    /// Shared state for `scope`, created empty on first use.
    pub fn scope(&self, scope: Scope) -> SharedScopeState {
        self.scopes
            .entry(scope)
            .or_insert_with(|| Arc::new(RwLock::new(ScopeState::new(scope))))
            .value()
            .clone()
    }

    pub fn scope_count(&self) -> usize {
        self.scopes.len()
    }

    fn scope_owner_exists(&self, scope: Scope) -> bool {
        match scope {
            Scope::Tenant(id) => self.has_tenant(id),
            Scope::Apartment(id) => self.has_apartment(id),
        }
    }

    /// Drop empty registry entries whose tenant or apartment does not exist.
    /// Entries another writer currently holds are left alone.
    pub fn forget_orphan_scopes(&self, scopes: &[Scope]) {
        for &scope in scopes {
            self.scopes.remove_if(&scope, |_, state| {
                !self.scope_owner_exists(scope) && state.try_read().is_ok_and(|s| s.is_empty())
            });
        }
    }

    pub fn existing_scope(&self, scope: Scope) -> Option<SharedScopeState> {
        self.scopes.get(&scope).map(|e| e.value().clone())
    }

    /// Lock every scope in `scopes` for writing, in `Scope` order.
    ///
    /// An entry can be dropped from the registry between looking it up and
    /// locking it. Such a lock guards nothing, so it is released and the
    /// lookup repeated.
    pub async fn lock_scopes(&self, mut scopes: Vec<Scope>) -> ScopeLocks {
        scopes.sort();
        scopes.dedup();
        loop {
            let mut guards = Vec::with_capacity(scopes.len());
            let mut registered = true;
            for &scope in &scopes {
                let state = self.scope(scope);
                guards.push(state.clone().write_owned().await);
                registered &= self
                    .existing_scope(scope)
                    .is_some_and(|current| Arc::ptr_eq(&current, &state));
            }
            if registered {
                return ScopeLocks { guards };
            }
            tracing::debug!("scope entry replaced while locking, retrying");
        }
    }

    /// Non-blocking variant for replay, where nothing else holds a lock yet.
    pub fn try_lock_scopes(&self, mut scopes: Vec<Scope>) -> Option<ScopeLocks> {
        scopes.sort();
        scopes.dedup();
        let mut guards = Vec::with_capacity(scopes.len());
        for scope in scopes {
            guards.push(self.scope(scope).try_write_owned().ok()?);
        }
        Some(ScopeLocks { guards })
    }

    /// Scopes an event touches, including the ones a lease is leaving.
    pub fn event_scopes(&self, event: &Event) -> Vec<Scope> {
        match event {
            Event::LeaseCreated { lease } => lease.scopes().to_vec(),
            Event::LeaseUpdated { lease } => {
                let mut scopes = lease.scopes().to_vec();
                if let Some(old) = self.lease(lease.id) {
                    scopes.extend(old.scopes());
                }
                scopes
            }
            Event::LeaseDeleted { id } => self
                .lease(*id)
                .map(|old| old.scopes().to_vec())
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    // ── Event application ────────────────────────────────────

    /// Apply one committed event. Lease events need the write locks of every
    /// scope returned by `event_scopes`.
    pub fn apply_event(&self, event: &Event, locks: &mut ScopeLocks) {
        match event {
            Event::ApartmentCreated { apartment } | Event::ApartmentUpdated { apartment } => {
                self.apartment_ids.observe(apartment.id);
                self.apartments.insert(apartment.id, apartment.clone());
            }
            Event::ApartmentDeleted { id } => {
                self.apartments.remove(id);
                self.scopes.remove(&Scope::Apartment(*id));
            }
            Event::TenantCreated { tenant } | Event::TenantUpdated { tenant } => {
                self.tenant_ids.observe(tenant.id);
                self.tenants.insert(tenant.id, tenant.clone());
            }
            Event::TenantDeleted { id } => {
                self.tenants.remove(id);
                self.scopes.remove(&Scope::Tenant(*id));
            }
            Event::LeaseCreated { lease } | Event::LeaseUpdated { lease } => {
                self.lease_ids.observe(lease.id);
                if let Some(old) = self.lease(lease.id) {
                    unlink_lease(&old, locks);
                }
                link_lease(lease, locks);
                self.leases.insert(lease.id, lease.clone());
            }
            Event::LeaseDeleted { id } => {
                if let Some((_, old)) = self.leases.remove(id) {
                    unlink_lease(&old, locks);
                }
            }
            Event::PaymentCreated { payment } | Event::PaymentUpdated { payment } => {
                self.payment_ids.observe(payment.id);
                self.payments.insert(payment.id, payment.clone());
            }
            Event::PaymentDeleted { id } => {
                self.payments.remove(id);
            }
            Event::SequenceFloor {
                apartments,
                tenants,
                leases,
                payments,
            } => {
                self.apartment_ids.observe(apartments - 1);
                self.tenant_ids.observe(tenants - 1);
                self.lease_ids.observe(leases - 1);
                self.payment_ids.observe(payments - 1);
            }
        }
    }

    /// Minimal event list that recreates the current state, parents before children.
    pub fn snapshot_events(&self) -> Vec<Event> {
        let mut events = vec![Event::SequenceFloor {
            apartments: self.apartment_ids.peek(),
            tenants: self.tenant_ids.peek(),
            leases: self.lease_ids.peek(),
            payments: self.payment_ids.peek(),
        }];
        events.extend(
            self.apartments()
                .into_iter()
                .map(|apartment| Event::ApartmentCreated { apartment }),
        );
        events.extend(self.tenants().into_iter().map(|tenant| Event::TenantCreated { tenant }));
        events.extend(self.leases().into_iter().map(|lease| Event::LeaseCreated { lease }));
        events.extend(
            self.payments()
                .into_iter()
                .map(|payment| Event::PaymentCreated { payment }),
        );
        events
    }
}

fn link_lease(lease: &Lease, locks: &mut ScopeLocks) {
    for scope in lease.scopes() {
        match locks.get_mut(scope) {
            Some(state) => state.insert_slot(LeaseSlot {
                lease_id: lease.id,
                occupancy: lease.occupancy,
            }),
            None => tracing::error!("lease {} applied without lock on {scope:?}", lease.id),
        }
    }
}

fn unlink_lease(lease: &Lease, locks: &mut ScopeLocks) {
    for scope in lease.scopes() {
        match locks.get_mut(scope) {
            Some(state) => {
                state.remove_slot(lease.id);
            }
            None => tracing::error!("lease {} removed without lock on {scope:?}", lease.id),
        }
    }
}

fn sorted_by_id<K, V: Clone>(map: &DashMap<K, V>, id: impl Fn(&V) -> i64) -> Vec<V>
where
    K: Eq + std::hash::Hash,
{
    let mut rows: Vec<V> = map.iter().map(|e| e.value().clone()).collect();
    rows.sort_by_key(|v| id(v));
    rows
}
