//! spac-reconcile
//!
//! Operator CLI over the reconciliation engine. Reads configuration from the
//! environment (see `EngineConfig::from_env`) and prints JSON.
//!
//! Usage:
//!   spac-reconcile onboard ACME
//!   spac-reconcile apply --file facts.jsonl
//!   spac-reconcile redemption --ticker ACME --shares 5000000 --amount 50500000 \
//!       --filing-date 2025-11-01 --source 8-K
//!   spac-reconcile history ACME --field trustCash

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::io::{BufRead, BufReader};
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use spac_reconciler::models::parse_filing_date;
use spac_reconciler::{
    EngineConfig, EngineError, FactAssertion, ReconciliationEngine, RedemptionEvent,
    TargetLegitimacyValidator,
};

#[derive(Parser, Debug)]
#[command(name = "spac-reconcile")]
#[command(about = "Reconcile extracted SPAC facts against the fact store")]
struct Args {
    /// SQLite database path (overrides SPAC_DB_PATH)
    #[arg(long, global = true)]
    db: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create or upgrade the schema and exit
    Migrate,

    /// Start tracking a ticker
    Onboard { ticker: String },

    /// Apply fact assertions from a JSON-lines file ("-" for stdin)
    Apply {
        #[arg(long)]
        file: String,
    },

    /// Record a redemption disclosure
    Redemption {
        #[arg(long)]
        ticker: String,
        #[arg(long)]
        shares: f64,
        #[arg(long)]
        amount: f64,
        #[arg(long, value_parser = parse_date_arg)]
        filing_date: chrono::NaiveDate,
        #[arg(long)]
        source: String,
        #[arg(long)]
        reason: Option<String>,
    },

    /// Record that a filing disclosed no redemptions
    NoneFound {
        #[arg(long)]
        ticker: String,
        #[arg(long, value_parser = parse_date_arg)]
        filing_date: chrono::NaiveDate,
        #[arg(long)]
        source: String,
        #[arg(long)]
        reason: Option<String>,
    },

    /// Set the market price and recompute premium
    Price {
        #[arg(long)]
        ticker: String,
        #[arg(long)]
        price: f64,
    },

    /// Show an entity and its redemption state
    Show { ticker: String },

    /// Audit log for a ticker, newest first
    History {
        ticker: String,
        #[arg(long)]
        field: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Open target-name anomalies awaiting review
    Anomalies {
        #[arg(long, default_value = "50")]
        limit: usize,
    },

    /// Mark a target-name anomaly resolved
    Resolve {
        id: i64,
        #[arg(long)]
        note: Option<String>,
    },

    /// Dry-run the target-name legitimacy checks
    ValidateTarget {
        #[arg(long)]
        name: String,
        #[arg(long)]
        ticker: String,
    },
}

fn parse_date_arg(raw: &str) -> Result<chrono::NaiveDate, String> {
    parse_filing_date(raw).ok_or_else(|| format!("unparseable date '{}'", raw))
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "spac_reconciler=info,spac_reconcile=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_assertions(path: &str) -> Result<Vec<FactAssertion>> {
    let reader: Box<dyn BufRead> = if path == "-" {
        Box::new(BufReader::new(std::io::stdin()))
    } else {
        let file = std::fs::File::open(path).with_context(|| format!("Failed to open {}", path))?;
        Box::new(BufReader::new(file))
    };

    let mut assertions = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match serde_json::from_str::<FactAssertion>(line) {
            Ok(a) => assertions.push(a),
            Err(e) => warn!(line = i + 1, error = %e, "Skipping malformed assertion"),
        }
    }
    Ok(assertions)
}

fn run(args: Args) -> Result<()> {
    let mut config = EngineConfig::from_env();
    if let Some(db) = args.db {
        config.db_path = db;
    }

    if let Command::ValidateTarget { name, ticker } = &args.command {
        let validator = TargetLegitimacyValidator::new();
        let sanitized = validator.sanitize(name);
        let rejection = validator.validate(name, ticker).err().map(|r| r.to_string());
        return print_json(&serde_json::json!({
            "candidate": name,
            "sanitized": sanitized,
            "valid": rejection.is_none(),
            "reason": rejection,
        }));
    }

    let engine = ReconciliationEngine::from_config(&config)?;

    match args.command {
        Command::Migrate => {
            info!(path = %engine.store().path(), "Schema is current");
        }
        Command::Onboard { ticker } => {
            let created = engine.onboard(&ticker)?;
            print_json(&serde_json::json!({ "ticker": ticker, "created": created }))?;
        }
        Command::Apply { file } => {
            let assertions = read_assertions(&file)?;
            let stats = engine.apply_batch(&assertions);
            print_json(&stats)?;
        }
        Command::Redemption {
            ticker,
            shares,
            amount,
            filing_date,
            source,
            reason,
        } => {
            let event = RedemptionEvent {
                shares_redeemed: shares,
                redemption_amount: amount,
                filing_date,
                source,
                reason,
            };
            let applied = engine.record_redemption(&ticker, &event)?;
            print_json(&serde_json::json!({
                "applied": applied,
                "redemptionState": engine.redemption_state(&ticker)?,
            }))?;
        }
        Command::NoneFound {
            ticker,
            filing_date,
            source,
            reason,
        } => {
            let applied =
                engine.mark_no_redemptions(&ticker, &source, filing_date, reason.as_deref())?;
            print_json(&serde_json::json!({ "applied": applied }))?;
        }
        Command::Price { ticker, price } => {
            let change = engine.set_price(&ticker, price)?;
            print_json(&serde_json::json!({ "premiumChange": change }))?;
        }
        Command::Show { ticker } => {
            print_json(&serde_json::json!({
                "entity": engine.entity(&ticker)?,
                "redemptionState": engine.redemption_state(&ticker)?,
            }))?;
        }
        Command::History { ticker, field, limit } => {
            let limit = limit.unwrap_or(config.history_limit);
            print_json(&engine.history(&ticker, field.as_deref(), limit)?)?;
        }
        Command::Anomalies { limit } => {
            print_json(&engine.open_anomalies(limit)?)?;
        }
        Command::Resolve { id, note } => {
            let resolved = engine.resolve_anomaly(id, note.as_deref())?;
            print_json(&serde_json::json!({ "id": id, "resolved": resolved }))?;
        }
        Command::ValidateTarget { .. } => {}
    }

    Ok(())
}

fn main() -> ExitCode {
    init_tracing();

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            // Persistence failures were alerted, and the engine's sink was
            // drained when `run` dropped it
            match e.downcast_ref::<EngineError>() {
                Some(err) if err.is_alertable() => ExitCode::from(2),
                _ => ExitCode::FAILURE,
            }
        }
    }
}
