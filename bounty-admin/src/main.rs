use std::path::PathBuf;

use anyhow::{Context, Result};
use bounty_core::services::NewBounty;
use bounty_core::{InitReport, Market, Purpose, ensure_initialized};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "bounty-admin",
    about = "Operate a social-proof bounty market rooted at a directory"
)]
struct Cli {
    /// Market root (config.toml, databases, logbook).
    #[arg(long, env = "BOUNTY_ROOT", default_value = ".bounty", global = true)]
    root: PathBuf,
    /// Identity the command is performed as.
    #[arg(long = "as", default_value = "owner", global = true)]
    caller: String,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Create the market layout and default config
    Init,
    /// Top up the funds fetches are paid from
    Fund { amount: u64 },
    /// Ask the fetch service for a fact (post_text | follower_count)
    RequestFetch { purpose: Purpose, subject: String },
    /// Deliver a fetch result (trusted fetch service only)
    Deliver { request_id: String, result: String },
    /// Show the resolved fact for a subject
    Fact { purpose: Purpose, subject: String },
    /// Open a bounty from an already resolved post
    Create {
        #[arg(long)]
        reward: u64,
        #[arg(long)]
        proof: String,
        #[arg(long, default_value = "")]
        topic: String,
        #[arg(long, default_value = "0")]
        min_followers: String,
        #[arg(long, default_value_t = 0)]
        deposit: u64,
    },
    /// Add funds to a bounty
    Contribute { bounty_id: u64, amount: u64 },
    /// Change a bounty's reward (issuer only)
    ChangePayout {
        bounty_id: u64,
        new_reward: u64,
        #[arg(long, default_value_t = 0)]
        extra_deposit: u64,
    },
    /// Claim a bounty with a proof subject
    Fulfill { bounty_id: u64, proof: String },
    /// Close a bounty and sweep its balance to the issuer
    Close { bounty_id: u64 },
    /// Show a bounty
    Show { bounty_id: u64 },
    /// Show one fulfillment of a bounty
    Fulfillment { bounty_id: u64, seq: u64 },
    /// Buy bounty-creation credits
    BuyCredits { amount: u64 },
    /// Withdraw the caller's ledger balance
    Withdraw,
    /// Ledger balance and credits of an account (defaults to the caller)
    Balance { account: Option<String> },
    Pause,
    Unpause,
    /// Refund all open bounties and shut the market down for good
    Destroy,
    TransferOwnership { new_owner: String },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "bounty_core=info,bounty_admin=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    // report what this invocation created before Market::open touches the root
    let report = ensure_initialized(&cli.root)?;
    let mut market = Market::open(&cli.root)
        .with_context(|| format!("opening market at {}", cli.root.display()))?;
    tracing::info!(root = %cli.root.display(), caller = %cli.caller, created = report.created.len(), "running command");
    run(&mut market, &report, &cli.caller, cli.cmd)
}

fn run(m: &mut Market, report: &InitReport, caller: &str, cmd: Cmd) -> Result<()> {
    match cmd {
        Cmd::Init => print(&json!({
            "root": report.root,
            "created": report.created,
            "existed": report.existed,
            "owner": m.admin().owner,
        })),
        Cmd::Fund { amount } => print(&json!({"fetch_funds": m.fund(caller, amount)?})),
        Cmd::RequestFetch { purpose, subject } => print(&m.request_fetch(caller, purpose, &subject)?),
        Cmd::Deliver { request_id, result } => print(&m.deliver_result(caller, &request_id, &result)?),
        Cmd::Fact { purpose, subject } => print(&json!({
            "purpose": purpose,
            "subject": subject,
            "fact": m.get_fact(purpose, &subject)?,
        })),
        Cmd::Create {
            reward,
            proof,
            topic,
            min_followers,
            deposit,
        } => {
            let id = m.create_bounty(
                caller,
                NewBounty {
                    reward_amount: reward,
                    proof_subject: proof,
                    topic,
                    min_followers,
                    deposit,
                },
            )?;
            print(&json!({"bounty_id": id}))
        }
        Cmd::Contribute { bounty_id, amount } => {
            print(&json!({"bounty_id": bounty_id, "balance": m.contribute(caller, bounty_id, amount)?}))
        }
        Cmd::ChangePayout {
            bounty_id,
            new_reward,
            extra_deposit,
        } => print(&m.change_payout(caller, bounty_id, new_reward, extra_deposit)?),
        Cmd::Fulfill { bounty_id, proof } => {
            let seq = m.fulfill(caller, bounty_id, &proof)?;
            print(&m.get_fulfillment(bounty_id, seq)?)
        }
        Cmd::Close { bounty_id } => {
            print(&json!({"bounty_id": bounty_id, "swept": m.close_bounty(caller, bounty_id)?}))
        }
        Cmd::Show { bounty_id } => print(&m.get_bounty(bounty_id)?),
        Cmd::Fulfillment { bounty_id, seq } => print(&m.get_fulfillment(bounty_id, seq)?),
        Cmd::BuyCredits { amount } => print(&json!({
            "granted": m.buy_credits(caller, amount)?,
            "credits": m.credits_of(caller)?,
        })),
        Cmd::Withdraw => print(&json!({"account": caller, "withdrawn": m.withdraw(caller)?})),
        Cmd::Balance { account } => {
            let account = account.as_deref().unwrap_or(caller);
            print(&json!({
                "account": account,
                "ledger": m.ledger_balance(account)?,
                "credits": m.credits_of(account)?,
            }))
        }
        Cmd::Pause => {
            m.pause(caller)?;
            print(m.admin())
        }
        Cmd::Unpause => {
            m.unpause(caller)?;
            print(m.admin())
        }
        Cmd::Destroy => print(&m.destroy(caller)?),
        Cmd::TransferOwnership { new_owner } => {
            m.transfer_ownership(caller, &new_owner)?;
            print(m.admin())
        }
    }
}

fn print<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
