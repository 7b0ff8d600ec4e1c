// src/commands/mod.rs
pub mod init;
mod market;

pub use init::{InitReport, ensure_initialized, ensure_initialized_once, market_root};
pub use market::{DestroyReport, Market};
