//! # CLI Interface
//!
//! Command-line structure for `coinvault-host`, built with `clap` derive.
//! Subcommands: `init-config`, `simulate`, `recover`, `log` and `version`.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// In-process host for the CoinVault coin economy.
///
/// Drives the escrow coordinator against in-memory containers and an
/// in-memory ledger, with an optional durable transaction log.
#[derive(Parser, Debug)]
#[command(name = "coinvault-host", version, propagate_version = true)]
pub struct CoinVaultCli {
    /// Log format: `pretty` or `json`.
    #[arg(long, global = true, env = "COINVAULT_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write the default denomination config.
    InitConfig(InitConfigArgs),
    /// Build a wallet and run a scripted sequence of transactions.
    Simulate(SimulateArgs),
    /// Relabel interrupted transactions in the durable log.
    Recover(LogArgs),
    /// List the records in the durable log.
    Log(LogArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for `init-config`.
#[derive(Args, Debug)]
pub struct InitConfigArgs {
    /// Where to write the config.
    #[arg(long, short = 'c', env = "COINVAULT_CONFIG", default_value = "coins.json")]
    pub config: PathBuf,

    /// Overwrite an existing file.
    #[arg(long)]
    pub force: bool,
}

/// Arguments for `simulate`.
#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// Denomination config. Created with the defaults if missing; the
    /// built-in chain is used when omitted.
    #[arg(long, short = 'c', env = "COINVAULT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory for the durable transaction log. In-memory when omitted.
    #[arg(long, short = 'd', env = "COINVAULT_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Identity (UUID) to transact as. Random when omitted.
    #[arg(long)]
    pub identity: Option<String>,

    /// Slots in the Storage container.
    #[arg(long, default_value_t = 36)]
    pub storage_slots: usize,

    /// Slots in the Hotbar container (0 for none).
    #[arg(long, default_value_t = 9)]
    pub hotbar_slots: usize,

    /// Slots in the Backpack container (0 for none).
    #[arg(long, default_value_t = 0)]
    pub backpack_slots: usize,

    /// Storage slots to occupy with non-coin items before the run.
    #[arg(long, default_value_t = 0)]
    pub filler: usize,

    /// Value to place in the wallet as coins before the run.
    #[arg(long, default_value_t = 0)]
    pub coins: u64,

    /// Starting bank balance.
    #[arg(long, default_value_t = 0)]
    pub bank: u64,

    /// Operation to run, repeatable: `deposit:<amount>`,
    /// `withdraw:<amount>`, `exchange:<source>:<count>:<destination>`,
    /// `consolidate`.
    #[arg(long = "op", value_name = "OP")]
    pub ops: Vec<String>,

    /// Print the Prometheus metrics text after the run.
    #[arg(long)]
    pub metrics: bool,
}

/// Arguments for `recover` and `log`.
#[derive(Args, Debug)]
pub struct LogArgs {
    /// Directory holding the durable transaction log.
    #[arg(long, short = 'd', env = "COINVAULT_DATA_DIR")]
    pub data_dir: PathBuf,
}
