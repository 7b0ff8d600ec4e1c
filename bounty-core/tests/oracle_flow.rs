// tests/oracle_flow.rs
// On-disk market: fetch requests go to the JSONL outbox, results come back
// through deliver_result, and everything survives a reopen.

use std::fs;
use std::path::Path;

use bounty_core::{FetchTicket, Market, MarketError, NewBounty, Purpose};
use fetch_wire::OutboundFetch;

const FETCHER: &str = "fetch-service";

fn outbox(root: &Path) -> Vec<OutboundFetch> {
    let text = fs::read_to_string(root.join("outbox.jsonl")).unwrap_or_default();
    text.lines()
        .map(|l| serde_json::from_str(l).expect("outbox line"))
        .collect()
}

#[test]
fn fetch_then_deliver_commits_fact() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let mut m = Market::open(root).expect("open market");
    m.fund("owner", 10).unwrap();

    let id = m
        .request_fetch("alice", Purpose::PostText, "alice/status/1")
        .unwrap()
        .request_id()
        .unwrap();
    let sent = outbox(root);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].request_id, id);
    assert_eq!(
        sent[0].query,
        "html(https://twitter.com/alice/status/1).xpath((//p[contains(@class,'tweet-text')])[1]/text())"
    );
    assert_eq!(m.fetch_funds().unwrap(), 9);
    assert_eq!(m.pending_count().unwrap(), 1);

    // unresolved reads as empty
    assert_eq!(m.get_fact(Purpose::PostText, "alice/status/1").unwrap(), "");

    m.deliver_result(FETCHER, &id, "hello world").unwrap();
    assert_eq!(m.get_fact(Purpose::PostText, "alice/status/1").unwrap(), "hello world");
    assert_eq!(m.pending_count().unwrap(), 0);
    assert!(m.pending(&id).unwrap().unwrap().resolved_at.is_some());
}

#[test]
fn follower_fetch_targets_profile_and_strips_separators() {
    let dir = tempfile::tempdir().unwrap();
    let mut m = Market::open(dir.path()).unwrap();
    m.fund("owner", 1).unwrap();
    let id = m
        .request_fetch("x", Purpose::FollowerCount, "bob/status/3")
        .unwrap()
        .request_id()
        .unwrap();
    let sent = outbox(dir.path());
    assert!(sent[0].query.starts_with("html(https://twitter.com/bob)"));
    assert_eq!(sent[0].strip, ",");

    m.deliver_result(FETCHER, &id, "1200").unwrap();
    assert_eq!(m.get_fact(Purpose::FollowerCount, "bob").unwrap(), "1200");
}

#[test]
fn underfunded_request_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let mut m = Market::open(dir.path()).unwrap();
    let ticket = m.request_fetch("alice", Purpose::PostText, "alice/status/1").unwrap();
    assert_eq!(ticket, FetchTicket::Underfunded { price: 1, available: 0 });
    assert!(outbox(dir.path()).is_empty());
    assert_eq!(m.pending_count().unwrap(), 0);
}

#[test]
fn delivery_rejects_replay_forgery_and_strangers() {
    let dir = tempfile::tempdir().unwrap();
    let mut m = Market::open(dir.path()).unwrap();
    m.fund("owner", 5).unwrap();
    let id = m
        .request_fetch("alice", Purpose::PostText, "alice/status/1")
        .unwrap()
        .request_id()
        .unwrap();

    let err = m.deliver_result("mallory", &id, "forged").unwrap_err();
    assert!(matches!(err, MarketError::Unauthorized { .. }));

    let err = m.deliver_result(FETCHER, "made-up-id", "forged").unwrap_err();
    assert!(matches!(err, MarketError::UnknownRequest(_)));

    m.deliver_result(FETCHER, &id, "hello world").unwrap();
    let err = m.deliver_result(FETCHER, &id, "again").unwrap_err();
    assert!(matches!(err, MarketError::RequestAlreadyResolved(_)));
    assert_eq!(m.get_fact(Purpose::PostText, "alice/status/1").unwrap(), "hello world");
}

#[test]
fn state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    {
        let mut m = Market::open(root).unwrap();
        m.fund("owner", 3).unwrap();
        let id = m
            .request_fetch("alice", Purpose::PostText, "alice/status/1")
            .unwrap()
            .request_id()
            .unwrap();
        m.deliver_result(FETCHER, &id, "hello world").unwrap();
        m.buy_credits("issuer", 2).unwrap();
        m.transfer_ownership("owner", "heir").unwrap();
        m.pause("heir").unwrap();
    }

    let mut m = Market::open(root).unwrap();
    assert_eq!(m.admin().owner, "heir");
    assert!(m.admin().paused);
    assert_eq!(m.fetch_funds().unwrap(), 2);
    assert_eq!(m.credits_of("issuer").unwrap(), 2);
    assert_eq!(m.get_fact(Purpose::PostText, "alice/status/1").unwrap(), "hello world");
    assert!(matches!(m.fund("heir", 1), Err(MarketError::Paused)));
}

#[test]
fn actions_land_in_the_logbook() {
    let dir = tempfile::tempdir().unwrap();
    let mut m = Market::open(dir.path()).unwrap();
    m.fund("owner", 1).unwrap();
    m.request_fetch("alice", Purpose::PostText, "alice/status/1").unwrap();
    m.pause("owner").unwrap();

    let log = fs::read_to_string(dir.path().join("logbook").join("actions.jsonl")).unwrap();
    let actions: Vec<String> = log
        .lines()
        .filter_map(|l| serde_json::from_str::<serde_json::Value>(l).ok())
        .filter_map(|v| v.get("action").and_then(|a| a.as_str()).map(str::to_string))
        .collect();
    assert!(actions.contains(&"fetch_requested".to_string()));
    assert!(actions.contains(&"paused".to_string()));
}

#[test]
fn destroy_that_cannot_persist_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let mut m = Market::open(root).unwrap();
    m.fund("owner", 4).unwrap();
    let id = m
        .request_fetch("alice", Purpose::PostText, "alice/status/1")
        .unwrap()
        .request_id()
        .unwrap();
    m.deliver_result(FETCHER, &id, "hello world").unwrap();
    m.buy_credits("issuer", 1).unwrap();
    let bounty = m
        .create_bounty(
            "issuer",
            NewBounty {
                reward_amount: 2,
                proof_subject: "alice/status/1".into(),
                min_followers: "0".into(),
                deposit: 6,
                ..Default::default()
            },
        )
        .unwrap();
    let owner_before = m.ledger_balance("owner").unwrap();

    // the atomic admin write needs admin.tmp to be a plain file
    fs::create_dir(root.join("admin.tmp")).unwrap();
    let err = m.destroy("owner").unwrap_err();
    assert!(matches!(err, MarketError::AdminPersist(_)));

    let b = m.get_bounty(bounty).unwrap();
    assert!(b.is_open);
    assert_eq!(b.balance, 6);
    assert_eq!(m.ledger_balance("issuer").unwrap(), 0);
    assert_eq!(m.ledger_balance("owner").unwrap(), owner_before);
    assert_eq!(m.fetch_funds().unwrap(), 3);
    assert!(!m.admin().destroyed);

    fs::remove_dir(root.join("admin.tmp")).unwrap();
    let report = m.destroy("owner").unwrap();
    assert_eq!(report.refunded, vec![(bounty, 6)]);
    assert_eq!(report.fetch_funds, 3);
    drop(m);
    assert!(Market::open(root).unwrap().admin().destroyed);
}
