use fetch_wire::QueryError;
use thiserror::Error;

use crate::types::{Amount, BountyId};

#[derive(Error, Debug)]
pub enum MarketError {
    // authorization
    #[error("Unauthorized: caller {caller} is not the trusted fetch service")]
    Unauthorized { caller: String },

    #[error("Only the issuer of bounty {0} may change it")]
    NotIssuer(BountyId),

    #[error("Only the issuer or the market owner may close bounty {0}")]
    NotIssuerOrOwner(BountyId),

    #[error("Only the market owner may do this")]
    NotOwner,

    // administrative
    #[error("Market is paused")]
    Paused,

    #[error("Market has been destroyed")]
    Destroyed,

    // not-found / range
    #[error("Invalid bounty id: {0}")]
    InvalidBountyId(BountyId),

    #[error("Invalid fulfillment id: bounty {bounty_id} has no fulfillment #{seq}")]
    InvalidFulfillmentId { bounty_id: BountyId, seq: u64 },

    #[error("Unknown fetch request: {0}")]
    UnknownRequest(String),

    // state
    #[error("Fetch request {0} was already resolved")]
    RequestAlreadyResolved(String),

    #[error("Bounty {0} is closed")]
    BountyClosed(BountyId),

    #[error("Proof subject has no resolved post text yet")]
    UnresolvedProof,

    #[error("Proof was already used for bounty {0}")]
    ProofAlreadyUsed(BountyId),

    #[error("Fact subject is empty")]
    EmptySubject,

    #[error("Identity must not be empty")]
    EmptyIdentity,

    // funds
    #[error("Amount must be greater than zero")]
    ZeroAmount,

    #[error("Insufficient balance: needed {needed}, available {available}")]
    InsufficientBalance { needed: Amount, available: Amount },

    #[error("Insufficient fetch funds: price {price}, available {available}")]
    InsufficientFunds { price: Amount, available: Amount },

    #[error("No call credits left for {0}")]
    NoCredits(String),

    // business rules
    #[error("Insufficient followers: required {required}, got {actual}")]
    InsufficientFollowers { required: u64, actual: u64 },

    #[error("Post text does not match the bounty's required text")]
    TextMismatch,

    // overflow guards
    #[error("Capacity exceeded: {0} count would overflow")]
    CapacityExceeded(&'static str),

    #[error("Amount overflow")]
    AmountOverflow,

    // infrastructure
    #[error("Invalid fetch query: {0}")]
    InvalidQuery(QueryError),

    #[error("Fetch dispatch failed: {0}")]
    Dispatch(#[source] anyhow::Error),

    #[error("Persisting admin state failed: {0}")]
    AdminPersist(#[source] anyhow::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<QueryError> for MarketError {
    fn from(e: QueryError) -> Self {
        match e {
            QueryError::EmptySubject => MarketError::EmptySubject,
            other => MarketError::InvalidQuery(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, MarketError>;
