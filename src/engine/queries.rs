use crate::model::*;

use super::{Engine, Store};

/// Conjunctive row filter for lease selects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeaseFilter {
    pub id: Option<LeaseId>,
    pub tenant_id: Option<TenantId>,
    pub apartment_id: Option<ApartmentId>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PaymentFilter {
    pub id: Option<PaymentId>,
    pub tenant_id: Option<TenantId>,
}

/// A lease with lazily loaded relations. Each relation is fetched on first
/// access and reused afterwards.
#[derive(Debug, Clone)]
pub struct LeaseDetails {
    pub lease: Lease,
    tenant: Option<Tenant>,
    apartment: Option<Apartment>,
}

impl LeaseDetails {
    pub fn new(lease: Lease) -> Self {
        Self {
            lease,
            tenant: None,
            apartment: None,
        }
    }

    pub fn tenant(&mut self, store: &Store) -> Option<&Tenant> {
        if self.tenant.is_none() {
            self.tenant = store.tenant(self.lease.tenant_id);
        }
        self.tenant.as_ref()
    }

    pub fn apartment(&mut self, store: &Store) -> Option<&Apartment> {
        if self.apartment.is_none() {
            self.apartment = store.apartment(self.lease.apartment_id);
        }
        self.apartment.as_ref()
    }
}

impl Engine {
    pub fn list_apartments(&self, id: Option<ApartmentId>) -> Vec<Apartment> {
        match id {
            Some(id) => self.store.apartment(id).into_iter().collect(),
            None => self.store.apartments(),
        }
    }

    pub fn list_tenants(&self, id: Option<TenantId>) -> Vec<Tenant> {
        match id {
            Some(id) => self.store.tenant(id).into_iter().collect(),
            None => self.store.tenants(),
        }
    }

    /// Lease ids currently indexed under `scope`, in start order.
    pub async fn leases_in_scope(&self, scope: Scope) -> Vec<LeaseId> {
        let Some(state) = self.store.existing_scope(scope) else {
            return Vec::new();
        };
        let guard = state.read().await;
        guard.slots.iter().map(|slot| slot.lease_id).collect()
    }

    pub async fn list_leases(&self, filter: LeaseFilter) -> Vec<LeaseDetails> {
        let mut leases = match (filter.id, filter.tenant_id, filter.apartment_id) {
            (Some(id), _, _) => self.store.lease(id).into_iter().collect(),
            (None, Some(tenant_id), _) => self.leases_by_scope(Scope::Tenant(tenant_id)).await,
            (None, None, Some(apartment_id)) => {
                self.leases_by_scope(Scope::Apartment(apartment_id)).await
            }
            (None, None, None) => self.store.leases(),
        };
        leases.retain(|l| {
            filter.tenant_id.is_none_or(|t| l.tenant_id == t)
                && filter.apartment_id.is_none_or(|a| l.apartment_id == a)
        });
        leases.into_iter().map(LeaseDetails::new).collect()
    }

    async fn leases_by_scope(&self, scope: Scope) -> Vec<Lease> {
        let mut leases: Vec<Lease> = self
            .leases_in_scope(scope)
            .await
            .into_iter()
            .filter_map(|id| self.store.lease(id))
            .collect();
        leases.sort_by_key(|l| l.id);
        leases
    }

    pub fn list_payments(&self, filter: PaymentFilter) -> Vec<Payment> {
        let mut payments = match filter.id {
            Some(id) => self.store.payment(id).into_iter().collect(),
            None => self.store.payments(),
        };
        payments.retain(|p| filter.tenant_id.is_none_or(|t| p.tenant_id == t));
        payments
    }
}
