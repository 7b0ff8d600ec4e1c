// src/services/dispatch.rs
//! Outbound boundary to the external fetch service.
//!
//! The fact store never performs a fetch itself. It hands a rendered
//! [`FetchQuery`] to a dispatcher, which returns the request id the fetch
//! service will tag its answer with. The answer comes back later, through
//! `FactStore::deliver_result`, on a separate call.

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{Receiver, Sender};
use fetch_wire::{FetchQuery, OutboundFetch, Purpose, RequestId};
use std::path::PathBuf;
use uuid::Uuid;

use crate::config::FetchConfig;
use crate::types::Amount;
use crate::utils::logbook::append_jsonl;

/// Quoted price per fetch purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchPrices {
    pub post_text: Amount,
    pub follower_count: Amount,
}

impl FetchPrices {
    pub fn from_config(cfg: &FetchConfig) -> Self {
        Self {
            post_text: cfg.post_text_price,
            follower_count: cfg.follower_count_price,
        }
    }

    pub fn flat(price: Amount) -> Self {
        Self {
            post_text: price,
            follower_count: price,
        }
    }

    pub fn for_purpose(&self, purpose: Purpose) -> Amount {
        match purpose {
            Purpose::PostText => self.post_text,
            Purpose::FollowerCount => self.follower_count,
        }
    }
}

pub trait FetchDispatcher: Send {
    /// Current price the fetch service charges for `purpose`.
    fn quote(&self, purpose: Purpose) -> Amount;

    /// Hand the query over; returns the id the eventual result will carry.
    fn dispatch(&self, query: FetchQuery) -> Result<RequestId>;
}

/// In-process boundary: outbound fetches go down a channel to a fetch worker.
pub struct ChannelDispatcher {
    tx: Sender<OutboundFetch>,
    prices: FetchPrices,
}

impl ChannelDispatcher {
    /// Returns the dispatcher and the receiving end the fetch worker drains.
    pub fn new(prices: FetchPrices) -> (Self, Receiver<OutboundFetch>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self { tx, prices }, rx)
    }
}

impl FetchDispatcher for ChannelDispatcher {
    fn quote(&self, purpose: Purpose) -> Amount {
        self.prices.for_purpose(purpose)
    }

    fn dispatch(&self, query: FetchQuery) -> Result<RequestId> {
        let request_id = Uuid::new_v4().to_string();
        self.tx
            .send(query.into_outbound(request_id.clone()))
            .map_err(|_| anyhow!("fetch worker channel closed"))?;
        Ok(request_id)
    }
}

/// Out-of-process boundary: outbound fetches are appended to a JSONL outbox
/// that an external fetcher tails.
pub struct OutboxDispatcher {
    path: PathBuf,
    prices: FetchPrices,
}

impl OutboxDispatcher {
    pub fn new(path: impl Into<PathBuf>, prices: FetchPrices) -> Self {
        Self {
            path: path.into(),
            prices,
        }
    }

    pub fn from_config(cfg: &FetchConfig) -> Self {
        Self::new(cfg.outbox.clone(), FetchPrices::from_config(cfg))
    }
}

impl FetchDispatcher for OutboxDispatcher {
    fn quote(&self, purpose: Purpose) -> Amount {
        self.prices.for_purpose(purpose)
    }

    fn dispatch(&self, query: FetchQuery) -> Result<RequestId> {
        let request_id = Uuid::new_v4().to_string();
        append_jsonl(&self.path, &query.into_outbound(request_id.clone()))
            .with_context(|| format!("append outbound fetch to {}", self.path.display()))?;
        Ok(request_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fetch_wire::DEFAULT_BASE_URL;

    #[test]
    fn channel_dispatch_delivers_tagged_query() {
        let (d, rx) = ChannelDispatcher::new(FetchPrices::flat(3));
        assert_eq!(d.quote(Purpose::FollowerCount), 3);
        let q = FetchQuery::for_purpose(Purpose::PostText, "alice/status/1", DEFAULT_BASE_URL).unwrap();
        let id = d.dispatch(q).unwrap();
        let out = rx.try_recv().unwrap();
        assert_eq!(out.request_id, id);
        assert_eq!(out.purpose, Purpose::PostText);
    }

    #[test]
    fn channel_dispatch_fails_without_worker() {
        let (d, rx) = ChannelDispatcher::new(FetchPrices::flat(1));
        drop(rx);
        let q = FetchQuery::for_purpose(Purpose::PostText, "a/1", DEFAULT_BASE_URL).unwrap();
        assert!(d.dispatch(q).is_err());
    }

    #[test]
    fn outbox_appends_one_line_per_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outbox.jsonl");
        let d = OutboxDispatcher::new(&path, FetchPrices::flat(1));
        for s in ["a/1", "b"] {
            let q = FetchQuery::for_purpose(Purpose::FollowerCount, s, DEFAULT_BASE_URL).unwrap();
            d.dispatch(q).unwrap();
        }
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<OutboundFetch> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_ne!(lines[0].request_id, lines[1].request_id);
        assert!(lines[0].query.contains("twitter.com/a)"));
    }
}
