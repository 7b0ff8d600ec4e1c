// src/services/escrow.rs
//! Bounty escrow engine.
//!
//! - Single writer of `escrow.db`: bounties, used proofs, fulfillments,
//!   call credits and the payout ledger.
//! - Reads facts only through the injected [`FactSource`]; never writes them.
//! - Every mutating call is one transaction. Any error drops the transaction,
//!   so a rejected call leaves no trace in the tables.

use chrono::Utc;
use fetch_wire::{Purpose, SubjectHash, parse_leading_numeral, profile_of};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeSet;
use std::num::NonZeroU64;
use std::path::Path;
use std::sync::Arc;

use crate::error::{MarketError, Result};
use crate::services::admin::AdminState;
use crate::services::audit::AuditLog;
use crate::services::facts::FactSource;
use crate::types::{AccountId, Amount, BountyId, add_amount, from_sql_int, to_sql_int};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Bounty {
    pub id: BountyId,
    pub issuer: AccountId,
    pub reward_amount: Amount,
    pub balance: Amount,
    pub required_text: String,
    pub topic: String,
    /// Minimum follower count, kept as entered; parsed as a leading numeral.
    pub min_followers: String,
    pub is_open: bool,
    pub created_at: String,
    pub closed_at: Option<String>,
    pub used_proofs: BTreeSet<SubjectHash>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Fulfillment {
    pub bounty_id: BountyId,
    pub seq: u64,
    pub reward_amount: Amount,
    pub fulfiller: AccountId,
    pub proof_subject: String,
    pub fulfilled_at: String,
}

/// Arguments of [`EscrowEngine::create_bounty`].
#[derive(Debug, Clone, Default)]
pub struct NewBounty {
    pub reward_amount: Amount,
    pub proof_subject: String,
    pub topic: String,
    pub min_followers: String,
    pub deposit: Amount,
}

pub struct EscrowEngine {
    db: Connection,
    facts: Arc<dyn FactSource>,
    credit_unit_cost: NonZeroU64,
    audit: AuditLog,
}

impl EscrowEngine {
    /// Open/create `escrow.db` and ensure schema.
    pub fn open(
        db_path: &Path,
        facts: Arc<dyn FactSource>,
        credit_unit_cost: NonZeroU64,
        audit: AuditLog,
    ) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::with_connection(Connection::open(db_path)?, facts, credit_unit_cost, audit)
    }

    pub fn open_in_memory(
        facts: Arc<dyn FactSource>,
        credit_unit_cost: NonZeroU64,
        audit: AuditLog,
    ) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, facts, credit_unit_cost, audit)
    }

    fn with_connection(
        db: Connection,
        facts: Arc<dyn FactSource>,
        credit_unit_cost: NonZeroU64,
        audit: AuditLog,
    ) -> Result<Self> {
        db.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;

            CREATE TABLE IF NOT EXISTS bounties (
              bounty_id      INTEGER PRIMARY KEY,           -- dense, 0..count
              issuer         TEXT NOT NULL,
              reward_amount  INTEGER NOT NULL,
              balance        INTEGER NOT NULL CHECK (balance >= 0),
              required_text  TEXT NOT NULL,                 -- post text of the creating proof
              topic          TEXT NOT NULL,
              min_followers  TEXT NOT NULL,                 -- raw, parsed at fulfill time
              is_open        INTEGER NOT NULL,
              created_at     TEXT NOT NULL,
              closed_at      TEXT
            );

            CREATE TABLE IF NOT EXISTS used_proofs (
              bounty_id   INTEGER NOT NULL,
              proof_hash  TEXT NOT NULL,                    -- blake3(subject) hex
              PRIMARY KEY (bounty_id, proof_hash)
            );

            CREATE TABLE IF NOT EXISTS fulfillments (
              bounty_id      INTEGER NOT NULL,
              seq            INTEGER NOT NULL,
              reward_amount  INTEGER NOT NULL,
              fulfiller      TEXT NOT NULL,
              proof_subject  TEXT NOT NULL,
              fulfilled_at   TEXT NOT NULL,
              PRIMARY KEY (bounty_id, seq)
            );

            CREATE TABLE IF NOT EXISTS call_credits (
              account    TEXT PRIMARY KEY,
              remaining  INTEGER NOT NULL CHECK (remaining >= 0)
            );

            CREATE TABLE IF NOT EXISTS ledger (
              account  TEXT PRIMARY KEY,
              balance  INTEGER NOT NULL CHECK (balance >= 0)
            );
            "#,
        )?;
        Ok(Self {
            db,
            facts,
            credit_unit_cost,
            audit,
        })
    }

    /// Open a bounty whose required text is the resolved post text of
    /// `proof_subject`. Costs the caller one call credit.
    pub fn create_bounty(&mut self, admin: &AdminState, caller: &str, new: NewBounty) -> Result<BountyId> {
        admin.ensure_live()?;
        if new.reward_amount == 0 {
            return Err(MarketError::ZeroAmount);
        }

        let tx = self.db.transaction()?;
        let credits = read_credits(&tx, caller)?;
        if credits == 0 {
            return Err(MarketError::NoCredits(caller.to_string()));
        }
        let required_text = self.facts.get_fact(Purpose::PostText, &new.proof_subject)?;
        if required_text.is_empty() {
            return Err(MarketError::UnresolvedProof);
        }

        let count = count_bounties(&tx)?;
        count.checked_add(1).ok_or(MarketError::CapacityExceeded("bounty"))?;
        let id = count;
        tx.execute(
            "INSERT INTO bounties(bounty_id, issuer, reward_amount, balance, required_text, topic, min_followers, is_open, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8)",
            (
                to_sql_int(id)?,
                caller,
                to_sql_int(new.reward_amount)?,
                to_sql_int(new.deposit)?,
                &required_text,
                &new.topic,
                &new.min_followers,
                Utc::now().to_rfc3339(),
            ),
        )?;
        tx.execute(
            "INSERT INTO used_proofs(bounty_id, proof_hash) VALUES (?1, ?2)",
            (to_sql_int(id)?, SubjectHash::of(&new.proof_subject).as_str()),
        )?;
        tx.execute(
            "UPDATE call_credits SET remaining = ?1 WHERE account = ?2",
            (to_sql_int(credits - 1)?, caller),
        )?;
        tx.commit()?;

        self.audit.record_action(
            "escrow",
            "bounty_created",
            &json!({
                "bounty_id": id,
                "issuer": caller,
                "reward": new.reward_amount,
                "deposit": new.deposit,
                "topic": self.audit.preview(&new.topic),
                "min_followers": new.min_followers,
            }),
            "low",
        );
        Ok(id)
    }

    /// Anyone may add to an open bounty's escrow. Returns the new balance.
    pub fn contribute(&mut self, admin: &AdminState, caller: &str, bounty_id: BountyId, amount: Amount) -> Result<Amount> {
        admin.ensure_live()?;
        let tx = self.db.transaction()?;
        let b = require_bounty(&tx, bounty_id)?;
        if !b.is_open {
            return Err(MarketError::BountyClosed(bounty_id));
        }
        let balance = add_amount(b.balance, amount)?;
        set_balance(&tx, bounty_id, balance)?;
        tx.commit()?;

        self.audit.record_action(
            "escrow",
            "bounty_contributed",
            &json!({"bounty_id": bounty_id, "contributor": caller, "amount": amount, "balance": balance}),
            "low",
        );
        Ok(balance)
    }

    /// Issuer-only reward change. `extra_deposit` lands first; the escrow must
    /// then cover the new reward or nothing changes.
    pub fn change_payout(
        &mut self,
        admin: &AdminState,
        caller: &str,
        bounty_id: BountyId,
        new_reward: Amount,
        extra_deposit: Amount,
    ) -> Result<Bounty> {
        admin.ensure_live()?;
        let tx = self.db.transaction()?;
        let mut b = require_bounty(&tx, bounty_id)?;
        if caller != b.issuer {
            return Err(MarketError::NotIssuer(bounty_id));
        }
        if !b.is_open {
            return Err(MarketError::BountyClosed(bounty_id));
        }
        if new_reward == 0 {
            return Err(MarketError::ZeroAmount);
        }
        let balance = add_amount(b.balance, extra_deposit)?;
        if balance < new_reward {
            return Err(MarketError::InsufficientBalance {
                needed: new_reward,
                available: balance,
            });
        }
        tx.execute(
            "UPDATE bounties SET balance = ?1, reward_amount = ?2 WHERE bounty_id = ?3",
            (to_sql_int(balance)?, to_sql_int(new_reward)?, to_sql_int(bounty_id)?),
        )?;
        tx.commit()?;

        let old_reward = b.reward_amount;
        b.balance = balance;
        b.reward_amount = new_reward;
        self.audit.record_action(
            "escrow",
            "payout_changed",
            &json!({
                "bounty_id": bounty_id,
                "old_reward": old_reward,
                "new_reward": new_reward,
                "extra_deposit": extra_deposit,
                "balance": balance,
            }),
            "low",
        );
        Ok(b)
    }

    /// Claim the reward with `proof_subject`. Returns the fulfillment's
    /// sequence number within the bounty.
    ///
    /// Checks run in a fixed order and the first failure wins: bounty id,
    /// open, escrow covers the reward, follower minimum, proof unused, text
    /// match.
    pub fn fulfill(&mut self, admin: &AdminState, caller: &str, bounty_id: BountyId, proof_subject: &str) -> Result<u64> {
        admin.ensure_live()?;
        match self.fulfill_inner(caller, bounty_id, proof_subject) {
            Ok(seq) => Ok(seq),
            Err(e) => {
                self.audit.record_action(
                    "escrow",
                    "fulfill_rejected",
                    &json!({
                        "bounty_id": bounty_id,
                        "caller": caller,
                        "proof": self.audit.preview(proof_subject),
                        "reason": e.to_string(),
                    }),
                    "medium",
                );
                Err(e)
            }
        }
    }

    fn fulfill_inner(&mut self, caller: &str, bounty_id: BountyId, proof_subject: &str) -> Result<u64> {
        let tx = self.db.transaction()?;
        let b = require_bounty(&tx, bounty_id)?;
        if !b.is_open {
            return Err(MarketError::BountyClosed(bounty_id));
        }
        if b.balance < b.reward_amount {
            return Err(MarketError::InsufficientBalance {
                needed: b.reward_amount,
                available: b.balance,
            });
        }

        let required = parse_leading_numeral(&b.min_followers, 0);
        let followers = self.facts.get_fact(Purpose::FollowerCount, profile_of(proof_subject))?;
        let actual = parse_leading_numeral(&followers, 0);
        if required > actual {
            return Err(MarketError::InsufficientFollowers { required, actual });
        }

        let proof_hash = SubjectHash::of(proof_subject);
        if proof_used(&tx, bounty_id, &proof_hash)? {
            return Err(MarketError::ProofAlreadyUsed(bounty_id));
        }
        if self.facts.get_fact(Purpose::PostText, proof_subject)? != b.required_text {
            return Err(MarketError::TextMismatch);
        }

        let seq = count_fulfillments(&tx, bounty_id)?;
        let balance = b.balance - b.reward_amount;
        tx.execute(
            "INSERT INTO used_proofs(bounty_id, proof_hash) VALUES (?1, ?2)",
            (to_sql_int(bounty_id)?, proof_hash.as_str()),
        )?;
        set_balance(&tx, bounty_id, balance)?;
        credit_account(&tx, caller, b.reward_amount)?;
        tx.execute(
            "INSERT INTO fulfillments(bounty_id, seq, reward_amount, fulfiller, proof_subject, fulfilled_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            (
                to_sql_int(bounty_id)?,
                to_sql_int(seq)?,
                to_sql_int(b.reward_amount)?,
                caller,
                proof_subject,
                Utc::now().to_rfc3339(),
            ),
        )?;
        tx.commit()?;

        self.audit.record_action(
            "escrow",
            "bounty_fulfilled",
            &json!({
                "bounty_id": bounty_id,
                "seq": seq,
                "fulfiller": caller,
                "reward": b.reward_amount,
                "balance": balance,
                "proof_hash": proof_hash,
            }),
            "low",
        );
        Ok(seq)
    }

    /// Close permanently and sweep the remaining escrow to the issuer.
    /// Returns the swept amount.
    pub fn close_bounty(&mut self, admin: &AdminState, caller: &str, bounty_id: BountyId) -> Result<Amount> {
        admin.ensure_live()?;
        let tx = self.db.transaction()?;
        let b = require_bounty(&tx, bounty_id)?;
        if caller != b.issuer && !admin.is_owner(caller) {
            return Err(MarketError::NotIssuerOrOwner(bounty_id));
        }
        if !b.is_open {
            return Err(MarketError::BountyClosed(bounty_id));
        }
        close_and_sweep(&tx, &b)?;
        tx.commit()?;

        self.audit.record_action(
            "escrow",
            "bounty_closed",
            &json!({"bounty_id": bounty_id, "closed_by": caller, "issuer": b.issuer, "swept": b.balance}),
            "low",
        );
        Ok(b.balance)
    }

    /// Buy `amount / unit_cost` bounty-creation credits. The whole payment is
    /// forwarded to the owner's ledger account. Returns the credits granted.
    pub fn buy_credits(&mut self, admin: &AdminState, caller: &str, amount: Amount) -> Result<u64> {
        admin.ensure_live()?;
        if amount == 0 {
            return Err(MarketError::ZeroAmount);
        }
        let granted = amount / self.credit_unit_cost.get();

        let tx = self.db.transaction()?;
        let remaining = add_amount(read_credits(&tx, caller)?, granted)?;
        tx.execute(
            "INSERT INTO call_credits(account, remaining) VALUES (?1, ?2)
             ON CONFLICT(account) DO UPDATE SET remaining = excluded.remaining",
            (caller, to_sql_int(remaining)?),
        )?;
        credit_account(&tx, &admin.owner, amount)?;
        tx.commit()?;

        self.audit.record_action(
            "escrow",
            "credits_bought",
            &json!({"buyer": caller, "paid": amount, "granted": granted, "remaining": remaining, "owner": admin.owner}),
            "low",
        );
        Ok(granted)
    }

    /// Zero the caller's ledger account and hand the amount out.
    pub fn withdraw(&mut self, admin: &AdminState, caller: &str) -> Result<Amount> {
        admin.ensure_live()?;
        let tx = self.db.transaction()?;
        let amount = read_ledger(&tx, caller)?;
        tx.execute("UPDATE ledger SET balance = 0 WHERE account = ?1", [caller])?;
        tx.commit()?;

        self.audit.record_action(
            "escrow",
            "withdrawn",
            &json!({"account": caller, "amount": amount}),
            "low",
        );
        Ok(amount)
    }

    pub fn ledger_balance(&self, account: &str) -> Result<Amount> {
        read_ledger(&self.db, account)
    }

    pub fn credits_of(&self, account: &str) -> Result<u64> {
        read_credits(&self.db, account)
    }

    /// Owner-only swap of the fact source the engine verifies against.
    pub fn set_fact_source(&mut self, admin: &AdminState, caller: &str, source: Arc<dyn FactSource>) -> Result<()> {
        admin.ensure_admin(caller)?;
        self.facts = source;
        self.audit
            .record_action("escrow", "fact_source_swapped", &json!({"by": caller}), "high");
        Ok(())
    }

    /// Close every open bounty, sweeping each balance back to its issuer, and
    /// credit `owner_credit`, all in one transaction. Returns
    /// `(bounty_id, refunded)` per closed bounty.
    ///
    /// `before_commit` runs last, inside the transaction: an error from it
    /// rolls back every refund and the owner credit.
    pub fn refund_all_open(
        &mut self,
        owner_credit: Option<(&str, Amount)>,
        before_commit: impl FnOnce() -> Result<()>,
    ) -> Result<Vec<(BountyId, Amount)>> {
        let tx = self.db.transaction()?;
        let open = {
            let mut stmt = tx.prepare(&format!("{BOUNTY_SELECT} WHERE is_open = 1 ORDER BY bounty_id"))?;
            let rows = stmt.query_map([], bounty_from_row)?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };
        for b in &open {
            close_and_sweep(&tx, b)?;
        }
        if let Some((account, amount)) = owner_credit {
            credit_account(&tx, account, amount)?;
        }
        before_commit()?;
        tx.commit()?;

        let refunds: Vec<(BountyId, Amount)> = open.iter().map(|b| (b.id, b.balance)).collect();
        tracing::info!(count = refunds.len(), "refunded open bounties");
        Ok(refunds)
    }

    pub fn get_bounty(&self, bounty_id: BountyId) -> Result<Bounty> {
        tracing::debug!(bounty_id, "get_bounty");
        let mut b = require_bounty(&self.db, bounty_id)?;
        let mut stmt = self
            .db
            .prepare("SELECT proof_hash FROM used_proofs WHERE bounty_id = ?1")?;
        let rows = stmt.query_map([to_sql_int(bounty_id)?], |r| r.get::<_, String>(0))?;
        for h in rows {
            b.used_proofs.insert(SubjectHash::from_hex(h?));
        }
        Ok(b)
    }

    pub fn get_fulfillment(&self, bounty_id: BountyId, seq: u64) -> Result<Fulfillment> {
        require_bounty(&self.db, bounty_id)?;
        let Ok(seq_key) = i64::try_from(seq) else {
            return Err(MarketError::InvalidFulfillmentId { bounty_id, seq });
        };
        let row = self
            .db
            .query_row(
                "SELECT reward_amount, fulfiller, proof_subject, fulfilled_at
                 FROM fulfillments WHERE bounty_id = ?1 AND seq = ?2",
                (to_sql_int(bounty_id)?, seq_key),
                |r| {
                    Ok(Fulfillment {
                        bounty_id,
                        seq,
                        reward_amount: from_sql_int(r.get(0)?),
                        fulfiller: r.get(1)?,
                        proof_subject: r.get(2)?,
                        fulfilled_at: r.get(3)?,
                    })
                },
            )
            .optional()?;
        row.ok_or(MarketError::InvalidFulfillmentId { bounty_id, seq })
    }

    pub fn bounty_count(&self) -> Result<u64> {
        count_bounties(&self.db)
    }

    pub fn fulfillment_count(&self, bounty_id: BountyId) -> Result<u64> {
        require_bounty(&self.db, bounty_id)?;
        count_fulfillments(&self.db, bounty_id)
    }

    pub fn is_proof_used(&self, bounty_id: BountyId, proof_subject: &str) -> Result<bool> {
        require_bounty(&self.db, bounty_id)?;
        proof_used(&self.db, bounty_id, &SubjectHash::of(proof_subject))
    }
}

const BOUNTY_SELECT: &str = "SELECT bounty_id, issuer, reward_amount, balance, required_text, topic, \
     min_followers, is_open, created_at, closed_at FROM bounties";

fn bounty_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Bounty> {
    Ok(Bounty {
        id: from_sql_int(r.get(0)?),
        issuer: r.get(1)?,
        reward_amount: from_sql_int(r.get(2)?),
        balance: from_sql_int(r.get(3)?),
        required_text: r.get(4)?,
        topic: r.get(5)?,
        min_followers: r.get(6)?,
        is_open: r.get::<_, i64>(7)? != 0,
        created_at: r.get(8)?,
        closed_at: r.get(9)?,
        used_proofs: BTreeSet::new(),
    })
}

/// Bounty row without its used-proof set.
fn require_bounty(db: &Connection, bounty_id: BountyId) -> Result<Bounty> {
    let Ok(key) = i64::try_from(bounty_id) else {
        return Err(MarketError::InvalidBountyId(bounty_id));
    };
    db.query_row(&format!("{BOUNTY_SELECT} WHERE bounty_id = ?1"), [key], bounty_from_row)
        .optional()?
        .ok_or(MarketError::InvalidBountyId(bounty_id))
}

fn set_balance(db: &Connection, bounty_id: BountyId, balance: Amount) -> Result<()> {
    db.execute(
        "UPDATE bounties SET balance = ?1 WHERE bounty_id = ?2",
        (to_sql_int(balance)?, to_sql_int(bounty_id)?),
    )?;
    Ok(())
}

fn close_and_sweep(db: &Connection, b: &Bounty) -> Result<()> {
    db.execute(
        "UPDATE bounties SET is_open = 0, balance = 0, closed_at = ?1 WHERE bounty_id = ?2",
        (Utc::now().to_rfc3339(), to_sql_int(b.id)?),
    )?;
    credit_account(db, &b.issuer, b.balance)?;
    Ok(())
}

fn credit_account(db: &Connection, account: &str, amount: Amount) -> Result<Amount> {
    let balance = add_amount(read_ledger(db, account)?, amount)?;
    db.execute(
        "INSERT INTO ledger(account, balance) VALUES (?1, ?2)
         ON CONFLICT(account) DO UPDATE SET balance = excluded.balance",
        (account, to_sql_int(balance)?),
    )?;
    Ok(balance)
}

fn read_ledger(db: &Connection, account: &str) -> Result<Amount> {
    let v: Option<i64> = db
        .query_row("SELECT balance FROM ledger WHERE account = ?1", [account], |r| r.get(0))
        .optional()?;
    Ok(v.map(from_sql_int).unwrap_or(0))
}

fn read_credits(db: &Connection, account: &str) -> Result<u64> {
    let v: Option<i64> = db
        .query_row("SELECT remaining FROM call_credits WHERE account = ?1", [account], |r| r.get(0))
        .optional()?;
    Ok(v.map(from_sql_int).unwrap_or(0))
}

fn proof_used(db: &Connection, bounty_id: BountyId, proof_hash: &SubjectHash) -> Result<bool> {
    let hit: Option<i64> = db
        .query_row(
            "SELECT 1 FROM used_proofs WHERE bounty_id = ?1 AND proof_hash = ?2",
            (to_sql_int(bounty_id)?, proof_hash.as_str()),
            |r| r.get(0),
        )
        .optional()?;
    Ok(hit.is_some())
}

fn count_bounties(db: &Connection) -> Result<u64> {
    let n: i64 = db.query_row("SELECT COUNT(*) FROM bounties", [], |r| r.get(0))?;
    Ok(from_sql_int(n))
}

fn count_fulfillments(db: &Connection, bounty_id: BountyId) -> Result<u64> {
    let n: i64 = db.query_row(
        "SELECT COUNT(*) FROM fulfillments WHERE bounty_id = ?1",
        [to_sql_int(bounty_id)?],
        |r| r.get(0),
    )?;
    Ok(from_sql_int(n))
}
