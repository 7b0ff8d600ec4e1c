// src/services/mod.rs

pub mod admin;
pub mod audit;
pub mod dispatch;   // outbound boundary to the fetch service
pub mod escrow;     // the ONLY writer of escrow.db
pub mod facts;      // the ONLY writer of facts.db

pub use admin::AdminState;
pub use audit::AuditLog;
pub use dispatch::{ChannelDispatcher, FetchDispatcher, FetchPrices, OutboxDispatcher};
pub use escrow::{Bounty, EscrowEngine, Fulfillment, NewBounty};
pub use facts::{FactRecord, FactSource, FactStore, FetchTicket, PendingRequest, SharedFactStore};
