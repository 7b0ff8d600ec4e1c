// src/services/admin.rs
//! Administrative state shared by both components.
//!
//! Persisted as a small JSON document (`admin.json`) and handed by reference
//! into every mutating operation, which checks `ensure_live()` first.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::MarketError;
use crate::types::AccountId;
use crate::utils::fsio::write_atomic;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminState {
    pub owner: AccountId,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub destroyed: bool,
}

impl AdminState {
    pub fn new(owner: impl Into<AccountId>) -> Self {
        Self {
            owner: owner.into(),
            paused: false,
            destroyed: false,
        }
    }

    /// Gate for state-mutating operations. Destroyed wins over paused.
    pub fn ensure_live(&self) -> Result<(), MarketError> {
        if self.destroyed {
            return Err(MarketError::Destroyed);
        }
        if self.paused {
            return Err(MarketError::Paused);
        }
        Ok(())
    }

    pub fn ensure_owner(&self, caller: &str) -> Result<(), MarketError> {
        if caller != self.owner {
            return Err(MarketError::NotOwner);
        }
        Ok(())
    }

    pub fn is_owner(&self, caller: &str) -> bool {
        caller == self.owner
    }

    pub fn pause(&mut self, caller: &str) -> Result<(), MarketError> {
        self.ensure_admin(caller)?;
        self.paused = true;
        Ok(())
    }

    pub fn unpause(&mut self, caller: &str) -> Result<(), MarketError> {
        self.ensure_admin(caller)?;
        self.paused = false;
        Ok(())
    }

    pub fn transfer_ownership(&mut self, caller: &str, new_owner: &str) -> Result<(), MarketError> {
        self.ensure_admin(caller)?;
        if new_owner.is_empty() {
            return Err(MarketError::EmptyIdentity);
        }
        self.owner = new_owner.to_string();
        Ok(())
    }

    /// Owner-only administrative ops still work while paused, never after destroy.
    pub fn ensure_admin(&self, caller: &str) -> Result<(), MarketError> {
        if self.destroyed {
            return Err(MarketError::Destroyed);
        }
        self.ensure_owner(caller)
    }

    /// Load persisted state, or start fresh with `default_owner`.
    pub fn load_or_init(path: &Path, default_owner: &str) -> Result<Self> {
        if !path.exists() {
            let state = Self::new(default_owner);
            state.save(path)?;
            return Ok(state);
        }
        let bytes = fs::read(path).with_context(|| format!("reading admin state {}", path.display()))?;
        serde_json::from_slice(&bytes).with_context(|| format!("parsing admin state {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_atomic(path, &serde_json::to_vec_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destroyed_takes_precedence_over_paused() {
        let mut a = AdminState::new("root");
        a.paused = true;
        assert!(matches!(a.ensure_live(), Err(MarketError::Paused)));
        a.destroyed = true;
        assert!(matches!(a.ensure_live(), Err(MarketError::Destroyed)));
        assert!(matches!(a.unpause("root"), Err(MarketError::Destroyed)));
    }

    #[test]
    fn only_owner_may_pause() {
        let mut a = AdminState::new("root");
        assert!(matches!(a.pause("mallory"), Err(MarketError::NotOwner)));
        a.pause("root").unwrap();
        assert!(a.paused);
        a.unpause("root").unwrap();
        assert!(a.ensure_live().is_ok());
    }

    #[test]
    fn state_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("admin.json");
        let mut a = AdminState::load_or_init(&p, "root").unwrap();
        a.transfer_ownership("root", "heir").unwrap();
        a.save(&p).unwrap();
        let b = AdminState::load_or_init(&p, "ignored").unwrap();
        assert_eq!(b.owner, "heir");
    }
}
