// src/services/facts.rs
//! Fact store & correlator.
//!
//! - Owns a single SQLite connection (WAL); the only writer of `facts.db`.
//! - `request_fetch` hands a query to the dispatcher and records the pending
//!   request under the id the fetch service assigned.
//! - `deliver_result` (trusted fetch service only) consumes a pending request
//!   exactly once and commits the result under `blake3(subject)`; follower
//!   counts are keyed by the profile portion of the subject.
//! - Facts are partitioned by purpose: `post_text_facts`, `follower_count_facts`.
//!   A missing row reads as the empty string ("not yet resolved").

use chrono::Utc;
use fetch_wire::{FetchQuery, Purpose, RequestId, SubjectHash, fact_subject};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use serde_json::json;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{MarketError, Result};
use crate::services::admin::AdminState;
use crate::services::audit::AuditLog;
use crate::services::dispatch::FetchDispatcher;
use crate::types::{AccountId, Amount, add_amount, from_sql_int, to_sql_int};

/// Read capability the escrow engine is given over the fact store.
pub trait FactSource: Send + Sync {
    /// Resolved fact for `subject`, or `""` when unresolved.
    fn get_fact(&self, purpose: Purpose, subject: &str) -> Result<String>;

    fn request_fetch(
        &self,
        admin: &AdminState,
        caller: &str,
        purpose: Purpose,
        subject: &str,
    ) -> Result<FetchTicket>;
}

/// Outcome of `request_fetch`. Underfunding is a soft failure: nothing was
/// dispatched and no state changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FetchTicket {
    Issued { request_id: RequestId },
    Underfunded { price: Amount, available: Amount },
}

impl FetchTicket {
    /// Hard-error view for callers that cannot continue without a request id.
    pub fn request_id(self) -> Result<RequestId> {
        match self {
            FetchTicket::Issued { request_id } => Ok(request_id),
            FetchTicket::Underfunded { price, available } => {
                Err(MarketError::InsufficientFunds { price, available })
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingRequest {
    pub request_id: RequestId,
    pub purpose: Purpose,
    pub subject: String,
    pub issued_at: String,
    pub resolved_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FactRecord {
    pub purpose: Purpose,
    pub subject_hash: SubjectHash,
    pub result: String,
    pub request_id: RequestId,
    pub updated_at: String,
}

pub struct FactStore {
    db: Connection,
    dispatcher: Box<dyn FetchDispatcher>,
    trusted: AccountId,
    base_url: String,
    audit: AuditLog,
}

impl FactStore {
    /// Open/create `facts.db` and ensure schema.
    pub fn open(
        db_path: &Path,
        dispatcher: Box<dyn FetchDispatcher>,
        trusted: impl Into<AccountId>,
        base_url: impl Into<String>,
        audit: AuditLog,
    ) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Connection::open(db_path)?;
        Self::with_connection(db, dispatcher, trusted.into(), base_url.into(), audit)
    }

    pub fn open_in_memory(
        dispatcher: Box<dyn FetchDispatcher>,
        trusted: impl Into<AccountId>,
        audit: AuditLog,
    ) -> Result<Self> {
        let db = Connection::open_in_memory()?;
        Self::with_connection(
            db,
            dispatcher,
            trusted.into(),
            fetch_wire::DEFAULT_BASE_URL.to_string(),
            audit,
        )
    }

    fn with_connection(
        db: Connection,
        dispatcher: Box<dyn FetchDispatcher>,
        trusted: AccountId,
        base_url: String,
        audit: AuditLog,
    ) -> Result<Self> {
        db.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;

            CREATE TABLE IF NOT EXISTS pending_requests (
              request_id   TEXT PRIMARY KEY,  -- assigned by the fetch service
              purpose      TEXT NOT NULL,     -- post_text | follower_count
              subject      TEXT NOT NULL,     -- unhashed fact key (profile for follower counts)
              issued_at    TEXT NOT NULL,     -- RFC3339 UTC
              resolved_at  TEXT               -- set once, on delivery
            );

            CREATE TABLE IF NOT EXISTS post_text_facts (
              subject_hash TEXT PRIMARY KEY,  -- blake3(subject) hex
              result       TEXT NOT NULL,
              request_id   TEXT NOT NULL,
              updated_at   TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS follower_count_facts (
              subject_hash TEXT PRIMARY KEY,
              result       TEXT NOT NULL,
              request_id   TEXT NOT NULL,
              updated_at   TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS fetch_funds (
              id       INTEGER PRIMARY KEY CHECK (id = 0),
              balance  INTEGER NOT NULL CHECK (balance >= 0)
            );
            INSERT OR IGNORE INTO fetch_funds(id, balance) VALUES (0, 0);
            "#,
        )?;
        Ok(Self {
            db,
            dispatcher,
            trusted,
            base_url,
            audit,
        })
    }

    /// Render queries against `base_url` instead of the default host.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn trusted_identity(&self) -> &str {
        &self.trusted
    }

    /// Issue a fetch for `(purpose, subject)`.
    ///
    /// Underfunding is reported as [`FetchTicket::Underfunded`], never as an error.
    pub fn request_fetch(
        &mut self,
        admin: &AdminState,
        caller: &str,
        purpose: Purpose,
        subject: &str,
    ) -> Result<FetchTicket> {
        admin.ensure_live()?;
        let query = FetchQuery::for_purpose(purpose, subject, &self.base_url)?;
        let price = self.dispatcher.quote(purpose);

        let tx = self.db.transaction()?;
        let available = read_funds(&tx)?;
        if available < price {
            drop(tx);
            self.audit.record_action(
                "facts",
                "fetch_underfunded",
                &json!({"caller": caller, "purpose": purpose, "price": price, "available": available}),
                "medium",
            );
            return Ok(FetchTicket::Underfunded { price, available });
        }

        // Follower counts are keyed by profile, whatever subject was asked for.
        let keyed = fact_subject(purpose, subject);
        let request_id = self.dispatcher.dispatch(query).map_err(MarketError::Dispatch)?;
        if let Err(e) = record_pending(tx, &request_id, purpose, keyed, available - price) {
            self.audit.record_action(
                "facts",
                "fetch_unrecorded",
                &json!({"request_id": request_id, "purpose": purpose, "error": e.to_string()}),
                "high",
            );
            return Err(e);
        }

        self.audit.record_action(
            "facts",
            "fetch_requested",
            &json!({
                "caller": caller,
                "request_id": request_id,
                "purpose": purpose,
                "subject": self.audit.preview(subject),
                "price": price,
            }),
            "low",
        );
        Ok(FetchTicket::Issued { request_id })
    }

    /// Authenticated callback from the fetch service.
    ///
    /// Consumes the pending request (one-shot) and commits `result` under the
    /// hash of its subject in the purpose's table. Last writer wins per subject.
    pub fn deliver_result(
        &mut self,
        admin: &AdminState,
        caller: &str,
        request_id: &str,
        result: &str,
    ) -> Result<FactRecord> {
        admin.ensure_live()?;
        if caller != self.trusted {
            return Err(MarketError::Unauthorized {
                caller: caller.to_string(),
            });
        }

        let tx = self.db.transaction()?;
        let pending = select_pending(&tx, request_id)?
            .filter(|p| !p.subject.is_empty())
            .ok_or_else(|| MarketError::UnknownRequest(request_id.to_string()))?;
        if pending.resolved_at.is_some() {
            return Err(MarketError::RequestAlreadyResolved(request_id.to_string()));
        }

        let now = Utc::now().to_rfc3339();
        let subject_hash = SubjectHash::of(&pending.subject);
        tx.execute(
            &format!(
                "INSERT INTO {}(subject_hash, result, request_id, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(subject_hash) DO UPDATE SET
                   result     = excluded.result,
                   request_id = excluded.request_id,
                   updated_at = excluded.updated_at",
                fact_table(pending.purpose)
            ),
            (subject_hash.as_str(), result, request_id, &now),
        )?;
        tx.execute(
            "UPDATE pending_requests SET resolved_at = ?1 WHERE request_id = ?2",
            (&now, request_id),
        )?;
        tx.commit()?;

        self.audit.record_action(
            "facts",
            "fact_committed",
            &json!({
                "request_id": request_id,
                "purpose": pending.purpose,
                "subject_hash": subject_hash,
                "result": self.audit.preview(result),
            }),
            "low",
        );
        Ok(FactRecord {
            purpose: pending.purpose,
            subject_hash,
            result: result.to_string(),
            request_id: request_id.to_string(),
            updated_at: now,
        })
    }

    /// Resolved fact, or `""` when unresolved.
    pub fn get_fact(&self, purpose: Purpose, subject: &str) -> Result<String> {
        Ok(self
            .fact_record(purpose, subject)?
            .map(|r| r.result)
            .unwrap_or_default())
    }

    pub fn fact_record(&self, purpose: Purpose, subject: &str) -> Result<Option<FactRecord>> {
        let subject_hash = SubjectHash::of(fact_subject(purpose, subject));
        let row = self
            .db
            .query_row(
                &format!(
                    "SELECT result, request_id, updated_at FROM {} WHERE subject_hash = ?1",
                    fact_table(purpose)
                ),
                [subject_hash.as_str()],
                |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?, r.get::<_, String>(2)?)),
            )
            .optional()?;
        Ok(row.map(|(result, request_id, updated_at)| FactRecord {
            purpose,
            subject_hash,
            result,
            request_id,
            updated_at,
        }))
    }

    /// Top up the funds fetches are paid from.
    pub fn fund(&mut self, admin: &AdminState, caller: &str, amount: Amount) -> Result<Amount> {
        admin.ensure_live()?;
        let balance = self.add_funds(amount)?;
        self.audit.record_action(
            "facts",
            "fetch_funded",
            &json!({"caller": caller, "amount": amount, "balance": balance}),
            "low",
        );
        Ok(balance)
    }

    pub(crate) fn add_funds(&mut self, amount: Amount) -> Result<Amount> {
        let tx = self.db.transaction()?;
        let balance = add_amount(read_funds(&tx)?, amount)?;
        tx.execute("UPDATE fetch_funds SET balance = ?1 WHERE id = 0", [to_sql_int(balance)?])?;
        tx.commit()?;
        Ok(balance)
    }

    pub fn funds(&self) -> Result<Amount> {
        read_funds(&self.db)
    }

    /// Zero the fetch funds and return what was held.
    pub fn drain_funds(&mut self) -> Result<Amount> {
        let tx = self.db.transaction()?;
        let held = read_funds(&tx)?;
        tx.execute("UPDATE fetch_funds SET balance = 0 WHERE id = 0", [])?;
        tx.commit()?;
        Ok(held)
    }

    pub fn pending(&self, request_id: &str) -> Result<Option<PendingRequest>> {
        select_pending(&self.db, request_id)
    }

    /// Requests issued but not yet delivered.
    pub fn pending_count(&self) -> Result<u64> {
        let n: i64 = self.db.query_row(
            "SELECT COUNT(*) FROM pending_requests WHERE resolved_at IS NULL",
            [],
            |r| r.get(0),
        )?;
        Ok(from_sql_int(n))
    }
}

/// The fact store shared between the market facade (writer) and the escrow
/// engine (reader). The lock is held for a whole operation.
#[derive(Clone)]
pub struct SharedFactStore(Arc<Mutex<FactStore>>);

impl SharedFactStore {
    pub fn new(store: FactStore) -> Self {
        Self(Arc::new(Mutex::new(store)))
    }

    pub fn lock(&self) -> MutexGuard<'_, FactStore> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl FactSource for SharedFactStore {
    fn get_fact(&self, purpose: Purpose, subject: &str) -> Result<String> {
        self.lock().get_fact(purpose, subject)
    }

    fn request_fetch(
        &self,
        admin: &AdminState,
        caller: &str,
        purpose: Purpose,
        subject: &str,
    ) -> Result<FetchTicket> {
        self.lock().request_fetch(admin, caller, purpose, subject)
    }
}

/// Debit the fetch price and record the dispatched request, then commit.
fn record_pending(
    tx: rusqlite::Transaction<'_>,
    request_id: &str,
    purpose: Purpose,
    subject: &str,
    remaining_funds: Amount,
) -> Result<()> {
    tx.execute(
        "UPDATE fetch_funds SET balance = ?1 WHERE id = 0",
        [to_sql_int(remaining_funds)?],
    )?;
    tx.execute(
        "INSERT INTO pending_requests(request_id, purpose, subject, issued_at) VALUES (?1, ?2, ?3, ?4)",
        (request_id, purpose.as_str(), subject, Utc::now().to_rfc3339()),
    )?;
    tx.commit()?;
    Ok(())
}

fn fact_table(purpose: Purpose) -> &'static str {
    match purpose {
        Purpose::PostText => "post_text_facts",
        Purpose::FollowerCount => "follower_count_facts",
    }
}

fn read_funds(db: &Connection) -> Result<Amount> {
    let v: i64 = db.query_row("SELECT balance FROM fetch_funds WHERE id = 0", [], |r| r.get(0))?;
    Ok(from_sql_int(v))
}

fn select_pending(db: &Connection, request_id: &str) -> Result<Option<PendingRequest>> {
    let row = db
        .query_row(
            "SELECT purpose, subject, issued_at, resolved_at FROM pending_requests WHERE request_id = ?1",
            [request_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, Option<String>>(3)?,
                ))
            },
        )
        .optional()?;
    let Some((purpose, subject, issued_at, resolved_at)) = row else {
        return Ok(None);
    };
    Ok(Some(PendingRequest {
        request_id: request_id.to_string(),
        purpose: purpose.parse()?,
        subject,
        issued_at,
        resolved_at,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::dispatch::{ChannelDispatcher, FetchPrices};

    fn store(price: Amount) -> (FactStore, crossbeam_channel::Receiver<fetch_wire::OutboundFetch>) {
        let (d, rx) = ChannelDispatcher::new(FetchPrices::flat(price));
        let s = FactStore::open_in_memory(Box::new(d), "oracle", AuditLog::disabled()).unwrap();
        (s, rx)
    }

    #[test]
    fn underfunded_request_is_soft_and_dispatches_nothing() {
        let admin = AdminState::new("owner");
        let (mut s, rx) = store(5);
        s.fund(&admin, "owner", 4).unwrap();
        let t = s.request_fetch(&admin, "alice", Purpose::PostText, "alice/status/1").unwrap();
        assert_eq!(t, FetchTicket::Underfunded { price: 5, available: 4 });
        assert!(rx.try_recv().is_err());
        assert_eq!(s.funds().unwrap(), 4);
        assert_eq!(s.pending_count().unwrap(), 0);
        assert!(matches!(
            t.request_id(),
            Err(MarketError::InsufficientFunds { price: 5, available: 4 })
        ));
    }

    #[test]
    fn issued_request_charges_price_and_records_pending() {
        let admin = AdminState::new("owner");
        let (mut s, rx) = store(2);
        s.fund(&admin, "owner", 5).unwrap();
        let id = s
            .request_fetch(&admin, "alice", Purpose::FollowerCount, "alice")
            .unwrap()
            .request_id()
            .unwrap();
        assert_eq!(rx.try_recv().unwrap().request_id, id);
        assert_eq!(s.funds().unwrap(), 3);
        let p = s.pending(&id).unwrap().unwrap();
        assert_eq!(p.purpose, Purpose::FollowerCount);
        assert_eq!(p.subject, "alice");
        assert!(p.resolved_at.is_none());
    }

    #[test]
    fn delivery_commits_once_into_purpose_table() {
        let admin = AdminState::new("owner");
        let (mut s, _rx) = store(0);
        let id = s
            .request_fetch(&admin, "alice", Purpose::PostText, "alice/status/1")
            .unwrap()
            .request_id()
            .unwrap();
        assert_eq!(s.get_fact(Purpose::PostText, "alice/status/1").unwrap(), "");

        let rec = s.deliver_result(&admin, "oracle", &id, "hello world").unwrap();
        assert_eq!(rec.subject_hash, SubjectHash::of("alice/status/1"));
        assert_eq!(s.get_fact(Purpose::PostText, "alice/status/1").unwrap(), "hello world");
        assert_eq!(s.get_fact(Purpose::FollowerCount, "alice/status/1").unwrap(), "");

        assert!(matches!(
            s.deliver_result(&admin, "oracle", &id, "overwritten"),
            Err(MarketError::RequestAlreadyResolved(_))
        ));
        assert_eq!(s.get_fact(Purpose::PostText, "alice/status/1").unwrap(), "hello world");
    }

    #[test]
    fn delivery_requires_trusted_caller_and_known_request() {
        let admin = AdminState::new("owner");
        let (mut s, _rx) = store(0);
        let id = s
            .request_fetch(&admin, "alice", Purpose::PostText, "alice/status/1")
            .unwrap()
            .request_id()
            .unwrap();
        assert!(matches!(
            s.deliver_result(&admin, "mallory", &id, "forged"),
            Err(MarketError::Unauthorized { .. })
        ));
        assert!(matches!(
            s.deliver_result(&admin, "oracle", "no-such-id", "forged"),
            Err(MarketError::UnknownRequest(_))
        ));
        assert_eq!(s.get_fact(Purpose::PostText, "alice/status/1").unwrap(), "");
    }

    #[test]
    fn refetch_overwrites_last_writer_wins() {
        let admin = AdminState::new("owner");
        let (mut s, _rx) = store(0);
        let a = s.request_fetch(&admin, "x", Purpose::FollowerCount, "bob").unwrap().request_id().unwrap();
        let b = s.request_fetch(&admin, "x", Purpose::FollowerCount, "bob").unwrap().request_id().unwrap();
        // out-of-order delivery: commit order decides
        s.deliver_result(&admin, "oracle", &b, "150").unwrap();
        s.deliver_result(&admin, "oracle", &a, "50").unwrap();
        assert_eq!(s.get_fact(Purpose::FollowerCount, "bob").unwrap(), "50");
    }

    #[test]
    fn follower_count_for_post_subject_lands_on_profile() {
        let admin = AdminState::new("owner");
        let (mut s, rx) = store(0);
        let id = s
            .request_fetch(&admin, "x", Purpose::FollowerCount, "bob/status/7")
            .unwrap()
            .request_id()
            .unwrap();
        assert!(rx.try_recv().unwrap().query.contains("twitter.com/bob)"));
        assert_eq!(s.pending(&id).unwrap().unwrap().subject, "bob");

        let rec = s.deliver_result(&admin, "oracle", &id, "500").unwrap();
        assert_eq!(rec.subject_hash, SubjectHash::of("bob"));
        assert_eq!(s.get_fact(Purpose::FollowerCount, "bob").unwrap(), "500");
        assert_eq!(s.get_fact(Purpose::FollowerCount, "bob/status/9").unwrap(), "500");
    }

    /// Hands out the same id every time, so the second insert collides.
    struct FixedIdDispatcher;

    impl FetchDispatcher for FixedIdDispatcher {
        fn quote(&self, _: Purpose) -> Amount {
            1
        }

        fn dispatch(&self, _: FetchQuery) -> anyhow::Result<RequestId> {
            Ok("req-1".to_string())
        }
    }

    #[test]
    fn unrecorded_dispatch_is_logged_and_not_charged() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = crate::config::MarketConfig::rooted(dir.path());
        let admin = AdminState::new("owner");
        let mut s =
            FactStore::open_in_memory(Box::new(FixedIdDispatcher), "oracle", AuditLog::from_config(&cfg)).unwrap();
        s.fund(&admin, "owner", 5).unwrap();
        s.request_fetch(&admin, "x", Purpose::PostText, "a/status/1").unwrap();

        let err = s.request_fetch(&admin, "x", Purpose::PostText, "a/status/2").unwrap_err();
        assert!(matches!(err, MarketError::Storage(_)));
        assert_eq!(s.funds().unwrap(), 4);
        assert_eq!(s.pending_count().unwrap(), 1);

        let log = std::fs::read_to_string(&cfg.logbook.actions).unwrap();
        assert!(log.contains("\"fetch_unrecorded\""));
    }

    #[test]
    fn paused_market_rejects_fact_mutations() {
        let mut admin = AdminState::new("owner");
        let (mut s, _rx) = store(0);
        admin.pause("owner").unwrap();
        assert!(matches!(
            s.request_fetch(&admin, "alice", Purpose::PostText, "alice/status/1"),
            Err(MarketError::Paused)
        ));
        assert!(matches!(s.fund(&admin, "owner", 1), Err(MarketError::Paused)));
    }
}
