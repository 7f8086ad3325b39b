use crate::model::{LeaseId, TenantId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Apartment,
    Tenant,
    Lease,
    Payment,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Apartment => "apartment",
            EntityKind::Tenant => "tenant",
            EntityKind::Lease => "lease",
            EntityKind::Payment => "payment",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationClass {
    /// The candidate interval itself is malformed.
    Structural,
    /// Well-formed, but collides with a stored lease in one scope.
    Conflict,
    /// The targeted or referenced row does not exist.
    NotFound,
}

/// A business-rule failure. `code()` is the stable identifier callers match on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    InvalidId { entity: EntityKind, id: i64 },
    UserOverlap { conflicting: LeaseId },
    ApartmentOverlap { conflicting: LeaseId },
    EndBeforeStart,
    StartNotBeginningOfMonth,
    EndNotEndOfMonth,
}

impl Violation {
    pub fn code(&self) -> &'static str {
        match self {
            Violation::InvalidId { .. } => "INVALID_ID",
            Violation::UserOverlap { .. } => "USER_OVERLAP",
            Violation::ApartmentOverlap { .. } => "APARTMENT_OVERLAP",
            Violation::EndBeforeStart => "END_BEFORE_START",
            Violation::StartNotBeginningOfMonth => "START_NOT_BEGINNING_OF_MONTH",
            Violation::EndNotEndOfMonth => "END_NOT_END_OF_MONTH",
        }
    }

    pub fn class(&self) -> ViolationClass {
        match self {
            Violation::InvalidId { .. } => ViolationClass::NotFound,
            Violation::UserOverlap { .. } | Violation::ApartmentOverlap { .. } => {
                ViolationClass::Conflict
            }
            Violation::EndBeforeStart
            | Violation::StartNotBeginningOfMonth
            | Violation::EndNotEndOfMonth => ViolationClass::Structural,
        }
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: ", self.code())?;
        match self {
            Violation::InvalidId { entity, id } => {
                write!(f, "Invalid {}Id ({id})", entity.as_str())
            }
            Violation::UserOverlap { conflicting } => write!(
                f,
                "Tenant has overlapping leases (conflicts with lease {conflicting})"
            ),
            Violation::ApartmentOverlap { conflicting } => write!(
                f,
                "Apartment has overlapping leases (conflicts with lease {conflicting})"
            ),
            Violation::EndBeforeStart => write!(f, "Lease end date must be after start date"),
            Violation::StartNotBeginningOfMonth => {
                write!(f, "Lease start date must be the first day of the month")
            }
            Violation::EndNotEndOfMonth => {
                write!(f, "Lease end date must be the last day of the month")
            }
        }
    }
}

impl std::error::Error for Violation {}

#[derive(Debug)]
pub enum EngineError {
    Rule(Violation),
    AlreadyExists {
        entity: EntityKind,
        field: &'static str,
    },
    InUse {
        entity: EntityKind,
        id: i64,
    },
    NoLeases(TenantId),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    pub fn not_found(entity: EntityKind, id: i64) -> Self {
        EngineError::Rule(Violation::InvalidId { entity, id })
    }
}

impl From<Violation> for EngineError {
    fn from(v: Violation) -> Self {
        EngineError::Rule(v)
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Rule(v) => write!(f, "{v}"),
            EngineError::AlreadyExists { entity, field } => {
                write!(f, "{} with this {field} already exists", entity.as_str())
            }
            EngineError::InUse { entity, id } => {
                write!(f, "{} {id} is still referenced", entity.as_str())
            }
            EngineError::NoLeases(id) => write!(f, "Tenant {id} doesn't have any leases"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
