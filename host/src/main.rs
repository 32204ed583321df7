// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # CoinVault Host
//!
//! Entry point for the `coinvault-host` binary. Parses CLI arguments,
//! initializes logging and metrics, and drives the escrow coordinator
//! in-process.
//!
//! - `init-config`: write the default denomination config
//! - `simulate`   : run scripted transactions against one wallet
//! - `recover`    : relabel interrupted transactions in the durable log
//! - `log`        : list the durable log
//! - `version`    : print build version information

mod cli;
mod logging;
mod metrics;
mod simulate;

use anyhow::{bail, Context, Result};
use clap::Parser;
use coinvault_coins::config::LOCK_SWEEP_INTERVAL;
use coinvault_coins::{CoinConfig, DenominationTable, Identity};
use coinvault_escrow::{recover_pending, MemoryLog, SledLog, TransactionLog};
use std::path::Path;
use std::sync::Arc;

use cli::{CoinVaultCli, Commands};
use logging::LogFormat;
use metrics::HostMetrics;
use simulate::{Operation, Simulation, WalletLayout};

/// Sub-directory of the data dir that holds the sled log.
const LOG_DIR: &str = "transactions";

fn main() -> Result<()> {
    let cli = CoinVaultCli::parse();
    logging::init_logging(logging::DEFAULT_DIRECTIVE, LogFormat::from_str_lossy(&cli.log_format));

    match cli.command {
        Commands::InitConfig(args) => init_config(args),
        Commands::Simulate(args) => simulate(args),
        Commands::Recover(args) => recover(args),
        Commands::Log(args) => list_log(args),
        Commands::Version => {
            println!("coinvault-host {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Writes the six-tier default config.
fn init_config(args: cli::InitConfigArgs) -> Result<()> {
    if args.config.exists() && !args.force {
        bail!("{} already exists (use --force to overwrite)", args.config.display());
    }
    CoinConfig::default()
        .save(&args.config)
        .with_context(|| format!("failed to write config to {}", args.config.display()))?;
    tracing::info!(path = %args.config.display(), "default coin config written");
    println!("Wrote default denomination config to {}", args.config.display());
    Ok(())
}

fn simulate(args: cli::SimulateArgs) -> Result<()> {
    let ops = args
        .ops
        .iter()
        .map(|s| s.parse::<Operation>())
        .collect::<Result<Vec<_>>>()?;

    let table = Arc::new(load_table(args.config.as_deref())?);
    let log: Arc<dyn TransactionLog> = match &args.data_dir {
        Some(dir) => Arc::new(open_log(dir)?),
        None => Arc::new(MemoryLog::new()),
    };

    let recovered = recover_pending(log.as_ref()).context("startup recovery failed")?;
    for record in &recovered.recovered {
        println!("recovered {} ({}, escrowed {})", record.key, record.kind, record.escrowed_value);
    }

    let identity = match &args.identity {
        Some(text) => Identity::from_uuid(
            uuid::Uuid::parse_str(text).with_context(|| format!("invalid identity {text:?}"))?,
        ),
        None => Identity::random(),
    };
    let layout = WalletLayout {
        storage_slots: args.storage_slots,
        hotbar_slots: args.hotbar_slots,
        backpack_slots: args.backpack_slots,
        filler: args.filler,
        coins: args.coins,
        bank: args.bank,
    };
    let metrics = HostMetrics::new().context("failed to register metrics")?;
    let simulation = Simulation::new(table, log, identity, &layout, metrics, LOCK_SWEEP_INTERVAL)?;
    let wealth_before = simulation.total_wealth()?;

    println!("identity {identity}");
    for op in &ops {
        match simulation.run(op)? {
            Some(result) => {
                let key = result.key.as_ref().map(|k| k.to_string()).unwrap_or_default();
                println!(
                    "{op:<28} {:<22} safe={:<5} {key}\n    {}",
                    result.status, result.money_safe, result.message
                );
            }
            None => println!("{op:<28} done"),
        }
    }

    println!("final state:");
    print!("{}", simulation.report()?);

    let wealth_after = simulation.total_wealth()?;
    if wealth_after != wealth_before {
        tracing::error!(wealth_before, wealth_after, "total wealth changed during simulation");
    }

    simulation.coordinator().evict_expired().context("record eviction failed")?;

    if args.metrics {
        println!();
        print!("{}", simulation.metrics().encode().context("failed to encode metrics")?);
    }
    Ok(())
}

fn recover(args: cli::LogArgs) -> Result<()> {
    let log = open_log(&args.data_dir)?;
    let report = recover_pending(&log).context("recovery failed")?;
    log.flush().context("failed to flush transaction log")?;
    if report.is_empty() {
        println!("no interrupted transactions");
    }
    for record in &report.recovered {
        println!("{}", serde_json::to_string(record).context("failed to encode record")?);
    }
    Ok(())
}

fn list_log(args: cli::LogArgs) -> Result<()> {
    let log = open_log(&args.data_dir)?;
    for record in log.records().context("failed to read transaction log")? {
        println!("{}", serde_json::to_string(&record).context("failed to encode record")?);
    }
    Ok(())
}

fn load_table(path: Option<&Path>) -> Result<DenominationTable> {
    match path {
        Some(path) => CoinConfig::load_or_create(path)
            .and_then(|config| config.table())
            .with_context(|| format!("failed to load denomination config from {}", path.display())),
        None => Ok(DenominationTable::standard()),
    }
}

fn open_log(data_dir: &Path) -> Result<SledLog> {
    let path = data_dir.join(LOG_DIR);
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    let log = SledLog::open(&path).with_context(|| format!("failed to open transaction log at {}", path.display()))?;
    tracing::info!(path = %path.display(), records = log.len(), "transaction log opened");
    Ok(log)
}
