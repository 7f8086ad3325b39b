//! Hard caps on input sizes, checked before anything is written to the WAL.

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_ADDRESS_LEN: usize = 512;
pub const MAX_EMAIL_LEN: usize = 320;

/// Earliest and latest calendar year a lease or payment date may fall in.
pub const MIN_YEAR: i32 = 1900;
pub const MAX_YEAR: i32 = 9999;

pub const MAX_LEASES_PER_SCOPE: usize = 10_000;
pub const MAX_ENTITIES: usize = 1_000_000;
