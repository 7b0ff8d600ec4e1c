use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::num::NonZeroU64;
use std::path::{Path, PathBuf};

use crate::types::{AccountId, Amount};

#[derive(Debug, Clone, Deserialize, Default)]
pub struct MarketConfig {
    #[serde(default)]
    pub system: SystemConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logbook: LogbookConfig,
    #[serde(default)]
    pub services: ServicesConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub credits: CreditsConfig,
    #[serde(default)]
    pub admin: AdminConfig,
}

impl MarketConfig {
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join("config.toml");
        let mut cfg = if path.exists() {
            let text = fs::read_to_string(&path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            toml::from_str::<MarketConfig>(&text)
                .with_context(|| format!("parsing config file {}", path.display()))?
        } else {
            tracing::info!(
                "No config file found at {}. Using MarketConfig::default().",
                path.display()
            );
            MarketConfig::default()
        };
        cfg.validate()?;
        cfg.resolve_paths(root);
        Ok(cfg)
    }

    /// Default configuration with every path placed under `root`.
    pub fn rooted(root: &Path) -> Self {
        let mut cfg = MarketConfig::default();
        cfg.resolve_paths(root);
        cfg
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.credits.unit_cost > 0, "[credits].unit_cost must be greater than zero");
        anyhow::ensure!(
            !self.fetch.trusted_identity.is_empty(),
            "[fetch].trusted_identity must not be empty"
        );
        anyhow::ensure!(!self.admin.owner.is_empty(), "[admin].owner must not be empty");
        Ok(())
    }

    pub fn credit_unit_cost(&self) -> NonZeroU64 {
        NonZeroU64::new(self.credits.unit_cost).unwrap_or(NonZeroU64::MIN)
    }

    fn resolve_paths(&mut self, root: &Path) {
        self.storage.facts_db = absolutize(root, &self.storage.facts_db);
        self.storage.escrow_db = absolutize(root, &self.storage.escrow_db);
        self.storage.admin_state = absolutize(root, &self.storage.admin_state);
        self.logbook.path = absolutize(root, &self.logbook.path);
        self.logbook.actions = absolutize(root, &self.logbook.actions);
        self.fetch.outbox = absolutize(root, &self.fetch.outbox);
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemConfig {
    #[serde(default = "SystemConfig::default_name")]
    pub name: String,
    #[serde(default = "SystemConfig::default_version")]
    pub version: String,
}

impl SystemConfig {
    fn default_name() -> String {
        "bounty-market".to_string()
    }

    fn default_version() -> String {
        "0.1.0".to_string()
    }
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            name: Self::default_name(),
            version: Self::default_version(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "StorageConfig::default_facts_db")]
    pub facts_db: PathBuf,
    #[serde(default = "StorageConfig::default_escrow_db")]
    pub escrow_db: PathBuf,
    #[serde(default = "StorageConfig::default_admin_state")]
    pub admin_state: PathBuf,
}

impl StorageConfig {
    fn default_facts_db() -> PathBuf {
        PathBuf::from("facts.db")
    }

    fn default_escrow_db() -> PathBuf {
        PathBuf::from("escrow.db")
    }

    fn default_admin_state() -> PathBuf {
        PathBuf::from("admin.json")
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            facts_db: Self::default_facts_db(),
            escrow_db: Self::default_escrow_db(),
            admin_state: Self::default_admin_state(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogbookConfig {
    #[serde(default = "LogbookConfig::default_path")]
    pub path: PathBuf,
    #[serde(default = "LogbookConfig::default_actions")]
    pub actions: PathBuf,
    #[serde(default = "LogbookConfig::default_preview_len")]
    pub preview_len: usize,
}

impl LogbookConfig {
    fn default_path() -> PathBuf {
        PathBuf::from("logbook")
    }

    fn default_actions() -> PathBuf {
        PathBuf::from("logbook/actions.jsonl")
    }

    fn default_preview_len() -> usize {
        160
    }
}

impl Default for LogbookConfig {
    fn default() -> Self {
        Self {
            path: Self::default_path(),
            actions: Self::default_actions(),
            preview_len: Self::default_preview_len(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServicesConfig {
    #[serde(default = "ServicesConfig::default_true")]
    pub audit_enabled: bool,
}

impl ServicesConfig {
    fn default_true() -> bool {
        true
    }
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self { audit_enabled: true }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
    /// Only this identity may deliver fetch results.
    #[serde(default = "FetchConfig::default_trusted_identity")]
    pub trusted_identity: AccountId,
    #[serde(default = "FetchConfig::default_base_url")]
    pub base_url: String,
    #[serde(default = "FetchConfig::default_price")]
    pub post_text_price: Amount,
    #[serde(default = "FetchConfig::default_price")]
    pub follower_count_price: Amount,
    /// JSONL file outbound fetches are appended to for an out-of-process fetcher.
    #[serde(default = "FetchConfig::default_outbox")]
    pub outbox: PathBuf,
}

impl FetchConfig {
    fn default_trusted_identity() -> AccountId {
        "fetch-service".to_string()
    }

    fn default_base_url() -> String {
        fetch_wire::DEFAULT_BASE_URL.to_string()
    }

    fn default_price() -> Amount {
        1
    }

    fn default_outbox() -> PathBuf {
        PathBuf::from("outbox.jsonl")
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            trusted_identity: Self::default_trusted_identity(),
            base_url: Self::default_base_url(),
            post_text_price: Self::default_price(),
            follower_count_price: Self::default_price(),
            outbox: Self::default_outbox(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreditsConfig {
    /// Funds exchanged for one bounty-creation credit.
    #[serde(default = "CreditsConfig::default_unit_cost")]
    pub unit_cost: Amount,
}

impl CreditsConfig {
    fn default_unit_cost() -> Amount {
        1
    }
}

impl Default for CreditsConfig {
    fn default() -> Self {
        Self {
            unit_cost: Self::default_unit_cost(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdminConfig {
    /// Initial owner, used only when no admin state has been persisted yet.
    #[serde(default = "AdminConfig::default_owner")]
    pub owner: AccountId,
}

impl AdminConfig {
    fn default_owner() -> AccountId {
        "owner".to_string()
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            owner: Self::default_owner(),
        }
    }
}

fn absolutize(root: &Path, value: &Path) -> PathBuf {
    if value.is_absolute() {
        value.to_path_buf()
    } else {
        root.join(value)
    }
}
