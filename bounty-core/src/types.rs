use crate::error::{MarketError, Result};

/// Currency in base units.
pub type Amount = u64;

/// Dense index of a bounty; also its permanent identifier.
pub type BountyId = u64;

/// Opaque caller identity.
pub type AccountId = String;

// SQLite stores INTEGER as i64; amounts above i64::MAX are refused at the edge.
pub(crate) fn to_sql_int(v: u64) -> Result<i64> {
    i64::try_from(v).map_err(|_| MarketError::AmountOverflow)
}

pub(crate) fn from_sql_int(v: i64) -> u64 {
    v.max(0) as u64
}

pub(crate) fn add_amount(a: Amount, b: Amount) -> Result<Amount> {
    a.checked_add(b).ok_or(MarketError::AmountOverflow)
}
