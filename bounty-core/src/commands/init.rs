// bounty-core/src/commands/init.rs

use anyhow::{Context, Result};
use chrono::Utc;
use once_cell::sync::OnceCell;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::utils::fsio::write_atomic;

#[derive(Debug, Clone)]
pub struct InitReport {
    pub root: PathBuf,
    pub created: Vec<String>,
    pub existed: Vec<String>,
}

// ---------- single global init gate ----------

static INIT: OnceCell<InitReport> = OnceCell::new();

/// Initialize the process-wide market root once. Safe to call often.
pub fn ensure_initialized_once() -> Result<&'static InitReport> {
    INIT.get_or_try_init(|| ensure_initialized(&market_root()))
}

/// Market root; `BOUNTY_ROOT` overrides the default `.bounty`.
pub fn market_root() -> PathBuf {
    std::env::var_os("BOUNTY_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(".bounty"))
}

/// Create the directory layout under `root` (idempotent).
pub fn ensure_initialized(root: &Path) -> Result<InitReport> {
    let root = root.to_path_buf();
    let mut created = Vec::new();
    let mut existed = Vec::new();

    ensure_dir(&root, "", &mut created, &mut existed)?;
    ensure_dir(&root, "logbook", &mut created, &mut existed)?;

    ensure_file(
        &root,
        "config.toml",
        DEFAULT_CONFIG_TOML,
        &mut created,
        &mut existed,
    )?;

    let init_event = format!(
        r#"{{"timestamp":"{}","event":"system_init","agent":"system","details":{{"version":"{}"}}}}"#,
        Utc::now().to_rfc3339(),
        env!("CARGO_PKG_VERSION")
    );
    ensure_seeded_jsonl(&root.join("logbook"), "actions.jsonl", &init_event, &mut created, &mut existed)?;

    Ok(InitReport { root, created, existed })
}

fn ensure_dir(
    base: &Path,
    rel: &str,
    created: &mut Vec<String>,
    existed: &mut Vec<String>,
) -> Result<()> {
    let p = if rel.is_empty() { base.to_path_buf() } else { base.join(rel) };
    let label = if rel.is_empty() { ".".to_string() } else { rel.to_string() };
    if p.exists() {
        existed.push(label);
        return Ok(());
    }
    fs::create_dir_all(&p).with_context(|| format!("create_dir_all({:?})", p))?;
    created.push(label);
    Ok(())
}

fn ensure_file(
    base: &Path,
    rel_file: &str,
    content_if_absent: &str,
    created: &mut Vec<String>,
    existed: &mut Vec<String>,
) -> Result<()> {
    let p = base.join(rel_file);
    if p.exists() {
        existed.push(rel_file.to_string());
        return Ok(());
    }
    write_atomic(&p, content_if_absent.as_bytes())?;
    created.push(rel_file.to_string());
    Ok(())
}

fn ensure_seeded_jsonl(
    dir: &Path,
    file: &str,
    init_line: &str,
    created: &mut Vec<String>,
    existed: &mut Vec<String>,
) -> Result<()> {
    let p = dir.join(file);
    if !p.exists() {
        return ensure_file(dir, file, &format!("{init_line}\n"), created, existed);
    }
    existed.push(file.to_string());
    // exists but empty: seed it
    if fs::metadata(&p)?.len() == 0 {
        let mut f = OpenOptions::new().append(true).open(&p)?;
        writeln!(f, "{init_line}")?;
    }
    Ok(())
}

// ---------- defaults ----------

const DEFAULT_CONFIG_TOML: &str = r#"[system]
name = "bounty-market"
version = "0.1.0"

[storage]
facts_db = "facts.db"
escrow_db = "escrow.db"
admin_state = "admin.json"

[logbook]
path = "logbook"
actions = "logbook/actions.jsonl"
preview_len = 160

[services]
audit_enabled = true

[fetch]
trusted_identity = "fetch-service"
base_url = "https://twitter.com/"
post_text_price = 1
follower_count_price = 1
outbox = "outbox.jsonl"

[credits]
unit_cost = 1

[admin]
owner = "owner"
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MarketConfig;

    #[test]
    fn second_init_reports_everything_existing() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("m");
        let first = ensure_initialized(&root).unwrap();
        assert!(first.created.contains(&"config.toml".to_string()));
        assert!(first.created.contains(&"actions.jsonl".to_string()));

        let second = ensure_initialized(&root).unwrap();
        assert!(second.created.is_empty());
        assert_eq!(second.existed.len(), first.created.len());
    }

    #[test]
    fn seeded_config_parses_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        ensure_initialized(dir.path()).unwrap();
        let cfg = MarketConfig::load(dir.path()).unwrap();
        assert_eq!(cfg.fetch.trusted_identity, "fetch-service");
        assert_eq!(cfg.admin.owner, "owner");
        assert_eq!(cfg.storage.escrow_db, dir.path().join("escrow.db"));
    }
}
