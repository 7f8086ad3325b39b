use tokio::sync::oneshot;

use crate::limits::*;
use crate::model::*;

use super::conflict::{now, validate_amount, validate_date, validate_occupancy};
use super::{
    Candidate, Engine, EngineError, EntityKind, ScopeLocks, Violation, WalCommand, validate_lease,
};

fn check_len(value: &str, max: usize, what: &'static str) -> Result<(), EngineError> {
    if value.len() > max {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

/// Count and log a rejected lease write.
fn reject(v: Violation) -> EngineError {
    metrics::counter!(crate::observability::LEASE_VIOLATIONS_TOTAL, "reason" => v.code())
        .increment(1);
    tracing::debug!("lease rejected: {v}");
    EngineError::Rule(v)
}

impl Engine {
    fn check_capacity(&self) -> Result<(), EngineError> {
        if self.store.entity_count() >= MAX_ENTITIES {
            return Err(EngineError::LimitExceeded("too many rows"));
        }
        Ok(())
    }

    // ── Apartments ───────────────────────────────────────────

    pub async fn create_apartment(&self, input: ApartmentInput) -> Result<Apartment, EngineError> {
        check_len(&input.name, MAX_NAME_LEN, "apartment name too long")?;
        check_len(&input.address, MAX_ADDRESS_LEN, "apartment address too long")?;

        let _catalog = self.catalog.lock().await;
        self.check_capacity()?;
        if let Some(field) = self.store.apartment_collision(&input.name, &input.address, None) {
            return Err(EngineError::AlreadyExists {
                entity: EntityKind::Apartment,
                field,
            });
        }

        let ts = now();
        let apartment = Apartment {
            id: self.store.next_apartment_id(),
            name: input.name,
            address: input.address,
            created_at: ts,
            updated_at: ts,
        };
        let event = Event::ApartmentCreated {
            apartment: apartment.clone(),
        };
        self.persist_and_apply(event, &mut ScopeLocks::empty()).await?;
        Ok(apartment)
    }

    pub async fn update_apartment(
        &self,
        id: ApartmentId,
        patch: ApartmentPatch,
    ) -> Result<Apartment, EngineError> {
        let _catalog = self.catalog.lock().await;
        let mut apartment = self
            .store
            .apartment(id)
            .ok_or(EngineError::not_found(EntityKind::Apartment, id))?;

        if let Some(name) = patch.name {
            apartment.name = name;
        }
        if let Some(address) = patch.address {
            apartment.address = address;
        }
        check_len(&apartment.name, MAX_NAME_LEN, "apartment name too long")?;
        check_len(&apartment.address, MAX_ADDRESS_LEN, "apartment address too long")?;
        if let Some(field) =
            self.store
                .apartment_collision(&apartment.name, &apartment.address, Some(id))
        {
            return Err(EngineError::AlreadyExists {
                entity: EntityKind::Apartment,
                field,
            });
        }

        apartment.updated_at = now();
        let event = Event::ApartmentUpdated {
            apartment: apartment.clone(),
        };
        self.persist_and_apply(event, &mut ScopeLocks::empty()).await?;
        Ok(apartment)
    }

    /// Fails with `InUse` while any lease still points at the apartment.
    pub async fn delete_apartment(&self, id: ApartmentId) -> Result<Apartment, EngineError> {
        let _catalog = self.catalog.lock().await;
        let apartment = self
            .store
            .apartment(id)
            .ok_or(EngineError::not_found(EntityKind::Apartment, id))?;

        let scope = Scope::Apartment(id);
        let mut locks = self.store.lock_scopes(vec![scope]).await;
        if locks.get(scope).is_some_and(|s| !s.is_empty()) {
            return Err(EngineError::InUse {
                entity: EntityKind::Apartment,
                id,
            });
        }

        self.persist_and_apply(Event::ApartmentDeleted { id }, &mut locks)
            .await?;
        Ok(apartment)
    }

    // ── Tenants ──────────────────────────────────────────────

    pub async fn create_tenant(&self, input: TenantInput) -> Result<Tenant, EngineError> {
        check_len(&input.name, MAX_NAME_LEN, "tenant name too long")?;
        check_len(&input.email, MAX_EMAIL_LEN, "tenant email too long")?;

        let _catalog = self.catalog.lock().await;
        self.check_capacity()?;
        if self.store.tenant_email_taken(&input.email, None) {
            return Err(EngineError::AlreadyExists {
                entity: EntityKind::Tenant,
                field: "email",
            });
        }

        let ts = now();
        let tenant = Tenant {
            id: self.store.next_tenant_id(),
            name: input.name,
            email: input.email,
            is_rent_late: false,
            created_at: ts,
            updated_at: ts,
        };
        let event = Event::TenantCreated {
            tenant: tenant.clone(),
        };
        self.persist_and_apply(event, &mut ScopeLocks::empty()).await?;
        Ok(tenant)
    }

    /// Setting `is_rent_late` requires the tenant to hold at least one lease.
    pub async fn update_tenant(&self, id: TenantId, patch: TenantPatch) -> Result<Tenant, EngineError> {
        let _catalog = self.catalog.lock().await;
        let mut tenant = self
            .store
            .tenant(id)
            .ok_or(EngineError::not_found(EntityKind::Tenant, id))?;

        if let Some(name) = patch.name {
            tenant.name = name;
        }
        if let Some(email) = patch.email {
            tenant.email = email;
        }
        check_len(&tenant.name, MAX_NAME_LEN, "tenant name too long")?;
        check_len(&tenant.email, MAX_EMAIL_LEN, "tenant email too long")?;
        if self.store.tenant_email_taken(&tenant.email, Some(id)) {
            return Err(EngineError::AlreadyExists {
                entity: EntityKind::Tenant,
                field: "email",
            });
        }

        // Hold the tenant scope so its last lease can't be deleted underneath us.
        let mut locks = match patch.is_rent_late {
            Some(flag) => {
                let scope = Scope::Tenant(id);
                let locks = self.store.lock_scopes(vec![scope]).await;
                if locks.get(scope).is_none_or(|s| s.is_empty()) {
                    return Err(EngineError::NoLeases(id));
                }
                tenant.is_rent_late = flag;
                locks
            }
            None => ScopeLocks::empty(),
        };

        tenant.updated_at = now();
        let event = Event::TenantUpdated {
            tenant: tenant.clone(),
        };
        self.persist_and_apply(event, &mut locks).await?;
        Ok(tenant)
    }

    pub async fn set_rent_late(&self, id: TenantId, late: bool) -> Result<Tenant, EngineError> {
        let patch = TenantPatch {
            is_rent_late: Some(late),
            ..TenantPatch::default()
        };
        self.update_tenant(id, patch).await
    }

    /// Fails with `InUse` while the tenant has leases or payments.
    pub async fn delete_tenant(&self, id: TenantId) -> Result<Tenant, EngineError> {
        let _catalog = self.catalog.lock().await;
        let tenant = self
            .store
            .tenant(id)
            .ok_or(EngineError::not_found(EntityKind::Tenant, id))?;
        let in_use = EngineError::InUse {
            entity: EntityKind::Tenant,
            id,
        };
        if self.store.tenant_has_payments(id) {
            return Err(in_use);
        }

        let scope = Scope::Tenant(id);
        let mut locks = self.store.lock_scopes(vec![scope]).await;
        if locks.get(scope).is_some_and(|s| !s.is_empty()) {
            return Err(in_use);
        }

        self.persist_and_apply(Event::TenantDeleted { id }, &mut locks)
            .await?;
        Ok(tenant)
    }

    // ── Leases ───────────────────────────────────────────────

    /// Referenced rows exist and neither scope is full. Caller holds the locks.
    fn check_lease_refs(&self, lease_scopes: [Scope; 2], locks: &ScopeLocks) -> Result<(), EngineError> {
        for scope in lease_scopes {
            let missing = match scope {
                Scope::Tenant(id) if !self.store.has_tenant(id) => {
                    Some(Violation::InvalidId {
                        entity: EntityKind::Tenant,
                        id,
                    })
                }
                Scope::Apartment(id) if !self.store.has_apartment(id) => {
                    Some(Violation::InvalidId {
                        entity: EntityKind::Apartment,
                        id,
                    })
                }
                _ => None,
            };
            if let Some(v) = missing {
                return Err(reject(v));
            }
            if locks.get(scope).map_or(0, |s| s.len()) >= MAX_LEASES_PER_SCOPE {
                return Err(EngineError::LimitExceeded("too many leases in scope"));
            }
        }
        Ok(())
    }

    pub async fn create_lease(&self, input: LeaseInput) -> Result<Lease, EngineError> {
        let occupancy = Occupancy::new(input.start, input.end);
        validate_occupancy(&occupancy)?;
        validate_amount(input.rent, "rent must be a finite number")?;
        validate_amount(input.deposit, "deposit must be a finite number")?;
        self.check_capacity()?;

        let mut candidate = Candidate {
            id: None,
            tenant_id: input.tenant_id,
            apartment_id: input.apartment_id,
            occupancy,
        };
        let lease_scopes = [
            Scope::Tenant(input.tenant_id),
            Scope::Apartment(input.apartment_id),
        ];
        let mut locks = self.store.lock_scopes(lease_scopes.to_vec()).await;
        if let Err(e) = self.check_lease_refs(lease_scopes, &locks) {
            drop(locks);
            self.store.forget_orphan_scopes(&lease_scopes);
            return Err(e);
        }
        validate_lease(&mut candidate, &self.policy, &locks).map_err(reject)?;

        let ts = now();
        let lease = Lease {
            id: self.store.next_lease_id(),
            tenant_id: candidate.tenant_id,
            apartment_id: candidate.apartment_id,
            occupancy: candidate.occupancy,
            rent: input.rent,
            deposit: input.deposit,
            created_at: ts,
            updated_at: ts,
        };
        self.persist_and_apply(Event::LeaseCreated { lease: lease.clone() }, &mut locks)
            .await?;
        Ok(lease)
    }

    /// Merge `patch` onto the stored lease and revalidate. The lease's own row
    /// is excluded from both scopes.
    pub async fn update_lease(&self, id: LeaseId, patch: LeasePatch) -> Result<Lease, EngineError> {
        if let Some(start) = patch.start {
            validate_date(start)?;
        }
        if let Some(Some(end)) = patch.end {
            validate_date(end)?;
        }
        if let Some(rent) = patch.rent {
            validate_amount(rent, "rent must be a finite number")?;
        }
        if let Some(deposit) = patch.deposit {
            validate_amount(deposit, "deposit must be a finite number")?;
        }

        loop {
            let current = self
                .store
                .lease(id)
                .ok_or(EngineError::not_found(EntityKind::Lease, id))?;
            let tenant_id = patch.tenant_id.unwrap_or(current.tenant_id);
            let apartment_id = patch.apartment_id.unwrap_or(current.apartment_id);
            let new_scopes = [Scope::Tenant(tenant_id), Scope::Apartment(apartment_id)];

            let mut scopes = current.scopes().to_vec();
            scopes.extend(new_scopes);
            let mut locks = self.store.lock_scopes(scopes).await;

            let stored = self
                .store
                .lease(id)
                .ok_or(EngineError::not_found(EntityKind::Lease, id))?;
            if stored.scopes() != current.scopes() {
                tracing::debug!("lease {id} moved while waiting for locks, retrying");
                continue;
            }
            if let Err(e) = self.check_lease_refs(new_scopes, &locks) {
                drop(locks);
                self.store.forget_orphan_scopes(&new_scopes);
                return Err(e);
            }

            let mut candidate = Candidate::from_lease(&stored);
            candidate.tenant_id = tenant_id;
            candidate.apartment_id = apartment_id;
            candidate.occupancy = Occupancy::new(
                patch.start.unwrap_or(stored.occupancy.start),
                patch.end.unwrap_or(stored.occupancy.end),
            );
            validate_lease(&mut candidate, &self.policy, &locks).map_err(reject)?;

            let lease = Lease {
                id,
                tenant_id,
                apartment_id,
                occupancy: candidate.occupancy,
                rent: patch.rent.unwrap_or(stored.rent),
                deposit: patch.deposit.unwrap_or(stored.deposit),
                created_at: stored.created_at,
                updated_at: now(),
            };
            self.persist_and_apply(Event::LeaseUpdated { lease: lease.clone() }, &mut locks)
                .await?;
            return Ok(lease);
        }
    }

    pub async fn delete_lease(&self, id: LeaseId) -> Result<Lease, EngineError> {
        loop {
            let current = self
                .store
                .lease(id)
                .ok_or(EngineError::not_found(EntityKind::Lease, id))?;
            let mut locks = self.store.lock_scopes(current.scopes().to_vec()).await;
            let stored = self
                .store
                .lease(id)
                .ok_or(EngineError::not_found(EntityKind::Lease, id))?;
            if stored.scopes() != current.scopes() {
                continue;
            }
            self.persist_and_apply(Event::LeaseDeleted { id }, &mut locks)
                .await?;
            return Ok(stored);
        }
    }

    // ── Payments ─────────────────────────────────────────────

    pub async fn create_payment(&self, input: PaymentInput) -> Result<Payment, EngineError> {
        validate_date(input.payment_date)?;
        validate_amount(input.amount, "amount must be a finite number")?;

        let _catalog = self.catalog.lock().await;
        self.check_capacity()?;
        if !self.store.has_tenant(input.tenant_id) {
            return Err(EngineError::not_found(EntityKind::Tenant, input.tenant_id));
        }

        let ts = now();
        let payment = Payment {
            id: self.store.next_payment_id(),
            tenant_id: input.tenant_id,
            payment_date: input.payment_date,
            amount: input.amount,
            created_at: ts,
            updated_at: ts,
        };
        let event = Event::PaymentCreated {
            payment: payment.clone(),
        };
        self.persist_and_apply(event, &mut ScopeLocks::empty()).await?;
        Ok(payment)
    }

    pub async fn update_payment(
        &self,
        id: PaymentId,
        patch: PaymentPatch,
    ) -> Result<Payment, EngineError> {
        let _catalog = self.catalog.lock().await;
        let mut payment = self
            .store
            .payment(id)
            .ok_or(EngineError::not_found(EntityKind::Payment, id))?;

        if let Some(tenant_id) = patch.tenant_id {
            if !self.store.has_tenant(tenant_id) {
                return Err(EngineError::not_found(EntityKind::Tenant, tenant_id));
            }
            payment.tenant_id = tenant_id;
        }
        if let Some(date) = patch.payment_date {
            validate_date(date)?;
            payment.payment_date = date;
        }
        if let Some(amount) = patch.amount {
            validate_amount(amount, "amount must be a finite number")?;
            payment.amount = amount;
        }

        payment.updated_at = now();
        let event = Event::PaymentUpdated {
            payment: payment.clone(),
        };
        self.persist_and_apply(event, &mut ScopeLocks::empty()).await?;
        Ok(payment)
    }

    pub async fn delete_payment(&self, id: PaymentId) -> Result<Payment, EngineError> {
        let _catalog = self.catalog.lock().await;
        let payment = self
            .store
            .payment(id)
            .ok_or(EngineError::not_found(EntityKind::Payment, id))?;
        self.persist_and_apply(Event::PaymentDeleted { id }, &mut ScopeLocks::empty())
            .await?;
        Ok(payment)
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL as one creation event per live row. Returns the number
    /// of events written.
    pub async fn compact_wal(&self) -> Result<usize, EngineError> {
        let _gate = self.commit_gate.write().await;
        let events = self.store.snapshot_events();
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        Ok(count)
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
