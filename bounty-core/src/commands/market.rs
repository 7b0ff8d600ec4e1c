// bounty-core/src/commands/market.rs
//! `Market`: the single entry point wiring admin state, the fact store and the
//! escrow engine together. Every operation threads the current `AdminState`
//! into the component that performs it.

use anyhow::{Context, Result as AnyResult};
use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::commands::init::ensure_initialized;
use crate::config::MarketConfig;
use crate::error::{MarketError, Result};
use crate::services::admin::AdminState;
use crate::services::audit::AuditLog;
use crate::services::dispatch::{FetchDispatcher, OutboxDispatcher};
use crate::services::escrow::{Bounty, EscrowEngine, Fulfillment, NewBounty};
use crate::services::facts::{FactRecord, FactSource, FactStore, FetchTicket, PendingRequest, SharedFactStore};
use crate::types::{Amount, BountyId};
use fetch_wire::Purpose;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DestroyReport {
    /// `(bounty_id, amount)` returned to each issuer.
    pub refunded: Vec<(BountyId, Amount)>,
    /// Fetch funds handed to the owner.
    pub fetch_funds: Amount,
}

pub struct Market {
    config: MarketConfig,
    admin: AdminState,
    /// `None` for in-memory markets: admin state is not persisted.
    admin_path: Option<PathBuf>,
    facts: SharedFactStore,
    escrow: EscrowEngine,
    audit: AuditLog,
}

impl Market {
    /// Initialize `root` if needed and open the market with the outbox dispatcher.
    pub fn open(root: &Path) -> AnyResult<Self> {
        ensure_initialized(root)?;
        let config = MarketConfig::load(root)?;
        let dispatcher = OutboxDispatcher::from_config(&config.fetch);
        Self::open_with(config, Box::new(dispatcher))
    }

    /// Open on-disk stores at the paths named by `config` (already rooted).
    pub fn open_with(config: MarketConfig, dispatcher: Box<dyn FetchDispatcher>) -> AnyResult<Self> {
        let audit = AuditLog::from_config(&config);
        let admin = AdminState::load_or_init(&config.storage.admin_state, &config.admin.owner)?;
        let store = FactStore::open(
            &config.storage.facts_db,
            dispatcher,
            config.fetch.trusted_identity.clone(),
            config.fetch.base_url.clone(),
            audit.clone(),
        )
        .with_context(|| format!("opening fact store {}", config.storage.facts_db.display()))?;
        let facts = SharedFactStore::new(store);
        let escrow = EscrowEngine::open(
            &config.storage.escrow_db,
            Arc::new(facts.clone()),
            config.credit_unit_cost(),
            audit.clone(),
        )
        .with_context(|| format!("opening escrow {}", config.storage.escrow_db.display()))?;

        tracing::info!(
            owner = %admin.owner,
            paused = admin.paused,
            destroyed = admin.destroyed,
            "market opened"
        );
        Ok(Self {
            admin_path: Some(config.storage.admin_state.clone()),
            config,
            admin,
            facts,
            escrow,
            audit,
        })
    }

    /// Fully in-memory market (no files touched unless the audit log is enabled).
    pub fn in_memory(config: MarketConfig, dispatcher: Box<dyn FetchDispatcher>) -> Result<Self> {
        let audit = AuditLog::from_config(&config);
        let mut store = FactStore::open_in_memory(dispatcher, config.fetch.trusted_identity.clone(), audit.clone())?;
        if config.fetch.base_url != fetch_wire::DEFAULT_BASE_URL {
            store = store.with_base_url(config.fetch.base_url.clone());
        }
        let facts = SharedFactStore::new(store);
        let escrow = EscrowEngine::open_in_memory(Arc::new(facts.clone()), config.credit_unit_cost(), audit.clone())?;
        Ok(Self {
            admin: AdminState::new(config.admin.owner.clone()),
            admin_path: None,
            config,
            facts,
            escrow,
            audit,
        })
    }

    pub fn config(&self) -> &MarketConfig {
        &self.config
    }

    pub fn admin(&self) -> &AdminState {
        &self.admin
    }

    /// Handle on the shared fact store, e.g. for a fetch worker.
    pub fn fact_store(&self) -> SharedFactStore {
        self.facts.clone()
    }

    // ---------- fact store ----------

    pub fn request_fetch(&mut self, caller: &str, purpose: Purpose, subject: &str) -> Result<FetchTicket> {
        self.facts.lock().request_fetch(&self.admin, caller, purpose, subject)
    }

    pub fn deliver_result(&mut self, caller: &str, request_id: &str, result: &str) -> Result<FactRecord> {
        self.facts.lock().deliver_result(&self.admin, caller, request_id, result)
    }

    pub fn get_fact(&self, purpose: Purpose, subject: &str) -> Result<String> {
        self.facts.lock().get_fact(purpose, subject)
    }

    pub fn fact_record(&self, purpose: Purpose, subject: &str) -> Result<Option<FactRecord>> {
        self.facts.lock().fact_record(purpose, subject)
    }

    pub fn fund(&mut self, caller: &str, amount: Amount) -> Result<Amount> {
        self.facts.lock().fund(&self.admin, caller, amount)
    }

    pub fn fetch_funds(&self) -> Result<Amount> {
        self.facts.lock().funds()
    }

    pub fn pending(&self, request_id: &str) -> Result<Option<PendingRequest>> {
        self.facts.lock().pending(request_id)
    }

    pub fn pending_count(&self) -> Result<u64> {
        self.facts.lock().pending_count()
    }

    // ---------- escrow ----------

    pub fn create_bounty(&mut self, caller: &str, new: NewBounty) -> Result<BountyId> {
        self.escrow.create_bounty(&self.admin, caller, new)
    }

    pub fn contribute(&mut self, caller: &str, bounty_id: BountyId, amount: Amount) -> Result<Amount> {
        self.escrow.contribute(&self.admin, caller, bounty_id, amount)
    }

    pub fn change_payout(
        &mut self,
        caller: &str,
        bounty_id: BountyId,
        new_reward: Amount,
        extra_deposit: Amount,
    ) -> Result<Bounty> {
        self.escrow
            .change_payout(&self.admin, caller, bounty_id, new_reward, extra_deposit)
    }

    pub fn fulfill(&mut self, caller: &str, bounty_id: BountyId, proof_subject: &str) -> Result<u64> {
        self.escrow.fulfill(&self.admin, caller, bounty_id, proof_subject)
    }

    pub fn close_bounty(&mut self, caller: &str, bounty_id: BountyId) -> Result<Amount> {
        self.escrow.close_bounty(&self.admin, caller, bounty_id)
    }

    pub fn buy_credits(&mut self, caller: &str, amount: Amount) -> Result<u64> {
        self.escrow.buy_credits(&self.admin, caller, amount)
    }

    pub fn withdraw(&mut self, caller: &str) -> Result<Amount> {
        self.escrow.withdraw(&self.admin, caller)
    }

    pub fn ledger_balance(&self, account: &str) -> Result<Amount> {
        self.escrow.ledger_balance(account)
    }

    pub fn credits_of(&self, account: &str) -> Result<u64> {
        self.escrow.credits_of(account)
    }

    pub fn get_bounty(&self, bounty_id: BountyId) -> Result<Bounty> {
        self.escrow.get_bounty(bounty_id)
    }

    pub fn get_fulfillment(&self, bounty_id: BountyId, seq: u64) -> Result<Fulfillment> {
        self.escrow.get_fulfillment(bounty_id, seq)
    }

    pub fn bounty_count(&self) -> Result<u64> {
        self.escrow.bounty_count()
    }

    pub fn fulfillment_count(&self, bounty_id: BountyId) -> Result<u64> {
        self.escrow.fulfillment_count(bounty_id)
    }

    pub fn is_proof_used(&self, bounty_id: BountyId, proof_subject: &str) -> Result<bool> {
        self.escrow.is_proof_used(bounty_id, proof_subject)
    }

    pub fn set_fact_source(&mut self, caller: &str, source: Arc<dyn FactSource>) -> Result<()> {
        self.escrow.set_fact_source(&self.admin, caller, source)
    }

    // ---------- administration ----------

    pub fn pause(&mut self, caller: &str) -> Result<()> {
        let mut next = self.admin.clone();
        next.pause(caller)?;
        self.commit_admin(next)?;
        self.audit.record_action("admin", "paused", &json!({"by": caller}), "high");
        Ok(())
    }

    pub fn unpause(&mut self, caller: &str) -> Result<()> {
        let mut next = self.admin.clone();
        next.unpause(caller)?;
        self.commit_admin(next)?;
        self.audit.record_action("admin", "unpaused", &json!({"by": caller}), "high");
        Ok(())
    }

    pub fn transfer_ownership(&mut self, caller: &str, new_owner: &str) -> Result<()> {
        let mut next = self.admin.clone();
        next.transfer_ownership(caller, new_owner)?;
        self.commit_admin(next)?;
        self.audit.record_action(
            "admin",
            "ownership_transferred",
            &json!({"from": caller, "to": new_owner}),
            "high",
        );
        Ok(())
    }

    /// Refund every open bounty to its issuer, hand the fetch funds to the
    /// owner, then mark the market destroyed. Irreversible.
    ///
    /// All or nothing: the admin state is saved and the fetch funds drained
    /// just before the escrow transaction commits, and both are put back if
    /// that commit fails.
    pub fn destroy(&mut self, caller: &str) -> Result<DestroyReport> {
        self.admin.ensure_admin(caller)?;
        let owner = self.admin.owner.clone();
        let previous = self.admin.clone();
        let mut next = self.admin.clone();
        next.destroyed = true;

        let mut store = self.facts.lock();
        let fetch_funds = store.funds()?;
        let admin_path = self.admin_path.as_deref();
        let mut applied = false;
        let settled = self.escrow.refund_all_open(Some((&owner, fetch_funds)), || {
            save_admin(admin_path, &next)?;
            if let Err(e) = store.drain_funds() {
                save_admin(admin_path, &previous)?;
                return Err(e);
            }
            applied = true;
            Ok(())
        });
        let refunded = match settled {
            Ok(refunded) => refunded,
            Err(e) => {
                if applied {
                    store.add_funds(fetch_funds)?;
                    save_admin(admin_path, &previous)?;
                }
                return Err(e);
            }
        };
        drop(store);
        self.admin = next;

        let report = DestroyReport { refunded, fetch_funds };
        self.audit.record_action(
            "admin",
            "destroyed",
            &json!({"by": caller, "refunded": report.refunded, "fetch_funds": fetch_funds}),
            "high",
        );
        Ok(report)
    }

    /// Persist first; only a saved state becomes the live one.
    fn commit_admin(&mut self, next: AdminState) -> Result<()> {
        save_admin(self.admin_path.as_deref(), &next)?;
        self.admin = next;
        Ok(())
    }
}

fn save_admin(path: Option<&Path>, state: &AdminState) -> Result<()> {
    match path {
        Some(path) => state.save(path).map_err(MarketError::AdminPersist),
        None => Ok(()),
    }
}
