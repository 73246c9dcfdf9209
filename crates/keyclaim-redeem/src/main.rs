//! keyclaim command line.
//!
//! Operator and integration entry point for the redemption service.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use keyclaim_core::config::load_config;
use keyclaim_core::tracing_init::init_tracing;
use keyclaim_core::{Clock, Config, SystemClock};
use keyclaim_redeem::hwid::HwidResetFlow;
use keyclaim_redeem::license::LuarmorClient;
use keyclaim_redeem::notifications::Notifier;
use keyclaim_redeem::ratelimit::RateLimitService;
use keyclaim_redeem::redeem::{
    RedeemSettings, RedemptionCoordinator, RedemptionOutcome, parse_serial,
};
use keyclaim_redeem::storage::{KeyDatabase, KeyState, NewKey};

#[derive(Parser, Debug)]
#[command(name = "keyclaim")]
#[command(version, about = "keyclaim - serial key redemption and license sync")]
struct Args {
    /// Configuration file layered over the global config.
    #[arg(long, env = "KEYCLAIM_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Path to SQLite database file.
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Redeem a serial (bare code or URL) for an identity.
    Redeem {
        serial: String,
        #[arg(long)]
        identity: String,
    },
    /// Reset the hardware binding of a license key.
    ResetHwid {
        user_key: String,
        #[arg(long)]
        identity: String,
    },
    /// Add one serial to the pool.
    AddKey {
        serial: String,
        #[arg(long)]
        order_id: String,
        /// Interval such as "30 days"; omit for a lifetime key.
        #[arg(long)]
        duration: Option<String>,
    },
    /// Import serials from a file of `serial,order_id[,duration]` lines.
    ImportKeys {
        file: PathBuf,
        /// Duration for lines that do not give one.
        #[arg(long)]
        duration: Option<String>,
    },
    /// Show the state of a serial.
    KeyInfo { serial: String },
    /// Show pool totals.
    Stats {
        /// Also list up to this many unclaimed serials.
        #[arg(long, default_value_t = 0)]
        unclaimed: u32,
    },
    /// Delete elapsed rate-limit counters.
    PurgeLimits,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing("keyclaim=info,keyclaim_redeem=info", args.log_json);

    let config = load_config(args.config.as_deref()).context("Failed to load configuration")?;

    let db_path = match args.db_path.clone().or_else(|| config.database.path.clone()) {
        Some(path) => path,
        None => default_db_path()?,
    };
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    info!(
        version = env!("CARGO_PKG_VERSION"),
        path = %db_path.display(),
        "Opening key database"
    );
    let db = KeyDatabase::open(&db_path).await?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let result = run(args.command, &config, db.clone(), clock).await;
    db.close().await;
    result
}

async fn run(
    command: Command,
    config: &Config,
    db: KeyDatabase,
    clock: Arc<dyn Clock>,
) -> anyhow::Result<()> {
    let limits = RateLimitService::new(db.clone(), clock.clone(), &config.rate_limits);

    match command {
        Command::Redeem { serial, identity } => {
            let serial = parse_serial(&serial)?;
            let coordinator = RedemptionCoordinator::new(
                db,
                limits,
                LuarmorClient::new(&config.license)?,
                Notifier::from_config(&config.notifications)?,
                clock,
                RedeemSettings::from_config(config),
            );
            let outcome = coordinator.redeem(&serial, &identity).await?;
            print_outcome(&outcome);
        }
        Command::ResetHwid { user_key, identity } => {
            let flow = HwidResetFlow::new(
                db,
                limits,
                LuarmorClient::new(&config.license)?,
                clock,
                config.admins.iter().cloned(),
            );
            let outcome = flow.reset_hwid(&user_key, &identity).await?;
            print_lines(
                std::iter::once(outcome.message)
                    .chain(outcome.warnings.into_iter().map(|w| format!("warning: {w}"))),
            );
        }
        Command::AddKey {
            serial,
            order_id,
            duration,
        } => {
            let key = NewKey {
                serial: &serial,
                order_id: &order_id,
                key_duration: duration.as_deref(),
            };
            db.insert_key(&key, clock.now()).await?;
            info!(serial = %serial, "Key added");
        }
        Command::ImportKeys { file, duration } => {
            let (added, failed) = import_keys(&db, &file, duration.as_deref(), clock.now()).await?;
            print_lines([format!("imported {added} keys, {failed} failed")]);
        }
        Command::KeyInfo { serial } => {
            let key = db
                .get_key(&serial)
                .await?
                .ok_or_else(|| anyhow::anyhow!("Serial {serial} not found"))?;
            let state = match key.state_at(clock.now()) {
                KeyState::Free => "free".to_string(),
                KeyState::Reserved { by, until } => format!("reserved by {by} until {until}"),
                KeyState::Claimed { by, at } => format!("claimed by {by} at {at}"),
            };
            print_lines([
                format!("serial:   {}", key.serial),
                format!("order:    {}", key.order_id),
                format!(
                    "duration: {}",
                    key.key_duration.as_deref().unwrap_or("lifetime")
                ),
                format!("state:    {state}"),
            ]);
        }
        Command::Stats { unclaimed } => {
            let stats = db.key_stats(clock.now()).await?;
            let mut lines = vec![format!(
                "total {} / claimed {} / reserved {}",
                stats.total, stats.claimed, stats.reserved
            )];
            if unclaimed > 0 {
                lines.extend(
                    db.list_unclaimed(unclaimed)
                        .await?
                        .into_iter()
                        .map(|k| format!("  {} ({})", k.serial, k.order_id)),
                );
            }
            print_lines(lines);
        }
        Command::PurgeLimits => {
            let removed = limits.purge_expired().await?;
            info!(removed, "Expired rate-limit counters purged");
        }
    }
    Ok(())
}

/// Insert every `serial,order_id[,duration]` line of `path`.
///
/// Blank lines and `#` comments are skipped. Bad lines are logged and
/// counted, not fatal.
async fn import_keys(
    db: &KeyDatabase,
    path: &Path,
    default_duration: Option<&str>,
    now: i64,
) -> anyhow::Result<(u64, u64)> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let (mut added, mut failed) = (0, 0);
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut fields = line.split(',').map(str::trim);
        let serial = fields.next().unwrap_or_default();
        let order_id = fields.next().unwrap_or_default();
        let duration = fields
            .next()
            .filter(|d| !d.is_empty())
            .or(default_duration);

        let key = NewKey {
            serial,
            order_id,
            key_duration: duration,
        };
        match db.insert_key(&key, now).await {
            Ok(_) => added += 1,
            Err(e) => {
                warn!(line = lineno + 1, serial, error = %e, "Skipping key");
                failed += 1;
            }
        }
    }
    Ok((added, failed))
}

fn print_outcome(outcome: &RedemptionOutcome) {
    match outcome {
        RedemptionOutcome::Redeemed(r) => {
            let expiry = if r.auth_expire == keyclaim_redeem::license::LIFETIME {
                "lifetime".to_string()
            } else {
                format!("expires at {}", r.auth_expire)
            };
            print_lines(
                std::iter::once(format!(
                    "redeemed {}: license {} {:?}, {expiry}",
                    r.serial, r.user_key, r.operation
                ))
                .chain(r.warnings.iter().map(|w| format!("warning: {w}"))),
            );
        }
        RedemptionOutcome::AlreadyRedeemed { serial } => {
            print_lines([format!("{serial} is already redeemed to this account")]);
        }
    }
}

#[allow(clippy::print_stdout)]
fn print_lines(lines: impl IntoIterator<Item = String>) {
    for line in lines {
        println!("{line}");
    }
}

fn default_db_path() -> anyhow::Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Cannot determine home directory"))?;
    Ok(home.join(".keyclaim").join("keys.db"))
}
