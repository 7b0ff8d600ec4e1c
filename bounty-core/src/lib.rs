//! Bounty market core: an oracle fact store that correlates asynchronous
//! fetches with their results, and an escrow engine that pays bounties out
//! against those facts.

pub mod commands;
pub mod config;
pub mod error;
pub mod services;
pub mod types;
pub mod utils;

pub use commands::{DestroyReport, InitReport, Market, ensure_initialized, ensure_initialized_once};
pub use config::MarketConfig;
pub use error::{MarketError, Result};
pub use services::{Bounty, FetchTicket, Fulfillment, NewBounty};
pub use types::{AccountId, Amount, BountyId};

pub use fetch_wire::{Purpose, RequestId, SubjectHash};
