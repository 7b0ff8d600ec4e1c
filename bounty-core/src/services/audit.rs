//! services/audit.rs
//! Action logbook: every state change and soft failure of the market.
//!
//! - Appends JSONL entries to `<root>/logbook/actions.jsonl`.
//! - Mirrors each entry as a `tracing` event.
//! - Never fails the caller: a logbook write error is reported through tracing only.

use chrono::Utc;
use serde_json::{Value, json};
use std::path::PathBuf;

use crate::config::MarketConfig;
use crate::utils::logbook::{append_jsonl, redact_preview};

#[derive(Debug, Clone)]
pub struct AuditLog {
    actions: Option<PathBuf>,
    preview_len: usize,
}

impl AuditLog {
    pub fn from_config(cfg: &MarketConfig) -> Self {
        if !cfg.services.audit_enabled {
            return Self::disabled();
        }
        Self {
            actions: Some(cfg.logbook.actions.clone()),
            preview_len: cfg.logbook.preview_len,
        }
    }

    /// Tracing only, no logbook file.
    pub fn disabled() -> Self {
        Self {
            actions: None,
            preview_len: 160,
        }
    }

    /// Record an action event.
    ///
    /// # Arguments
    /// * `agent` : component name (`"facts"`, `"escrow"`, `"admin"`).
    /// * `action` : short verb label (e.g. `"bounty_fulfilled"`).
    /// * `details` : arbitrary JSON payload.
    /// * `severity` : `"low" | "medium" | "high"`.
    pub fn record_action(&self, agent: &str, action: &str, details: &Value, severity: &str) {
        match severity {
            "high" | "medium" => tracing::warn!(agent, action, %details, "market action"),
            _ => tracing::info!(agent, action, %details, "market action"),
        }
        let Some(path) = &self.actions else {
            return;
        };
        let entry = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "event": "action",
            "agent": agent,
            "action": action,
            "severity": severity,
            "details": details,
        });
        if let Err(e) = append_jsonl(path, &entry) {
            tracing::warn!(path = %path.display(), error = %e, "logbook append failed");
        }
    }

    /// Privacy-safe preview of caller-supplied text for log details.
    pub fn preview(&self, s: &str) -> String {
        redact_preview(s, self.preview_len)
    }
}
