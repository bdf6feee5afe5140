use std::path::PathBuf;

use alloy_core::primitives::Address;
use clap::{Args, Parser, Subcommand};
use tracing::level_filters::LevelFilter;
use url::Url;

/// Settings file read from the working directory when `--config` is not given.
pub const DEFAULT_SETTINGS_FILE: &str = "Uplift.toml";

#[derive(Parser)]
#[command(name = "uplift")]
#[command(
    author,
    version,
    about = "Deploy and upgrade proxied contracts from a declarative plan"
)]
pub struct Cli {
    /// The verbosity level.
    #[arg(short, long, env = "UPLIFT_VERBOSITY", default_value_t = LevelFilter::INFO)]
    pub verbosity: LevelFilter,

    /// Settings file. Values can also be set with `UPLIFT_` environment variables.
    #[arg(short, long, default_value = DEFAULT_SETTINGS_FILE)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Execute a deployment plan.
    Deploy(DeployArgs),
    /// Check a plan against the artifacts and print its execution order.
    Validate(ValidateArgs),
}

/// Overrides for the connection settings.
#[derive(Debug, Args)]
pub struct ConnectionArgs {
    /// JSON-RPC endpoint of the target chain.
    #[arg(long)]
    pub rpc_url: Option<Url>,

    /// Unlocked account sending the transactions. Defaults to the node's first account.
    #[arg(long)]
    pub sender: Option<Address>,

    /// Hardhat project root, where verification runs.
    #[arg(long)]
    pub project_root: Option<PathBuf>,

    /// Hardhat artifacts directory. Defaults to `<project-root>/artifacts`.
    #[arg(long)]
    pub artifacts: Option<PathBuf>,

    /// Hardhat network name used for verification.
    #[arg(long)]
    pub network: Option<String>,
}

#[derive(Debug, Args)]
pub struct DeployArgs {
    /// The plan to execute (TOML).
    #[arg(short, long)]
    pub plan: PathBuf,

    /// Rehearse the plan on an in-memory chain. Nothing is sent and nothing is verified.
    #[arg(long)]
    pub dry_run: bool,

    /// Skip source verification unless a step asks for it.
    #[arg(long)]
    pub no_verify: bool,

    /// Write the resulting address book (JSON) here, also on failure.
    #[arg(short, long)]
    pub out: Option<PathBuf>,

    /// Address book of an earlier run whose instances become plan imports.
    #[arg(long)]
    pub imports: Option<PathBuf>,

    /// Reuse imported instances that already have code instead of redeploying them.
    #[arg(long)]
    pub resume: bool,

    /// Give up waiting for a confirmation after this many seconds.
    /// The transaction itself is left as is.
    #[arg(long)]
    pub confirmation_timeout: Option<u64>,

    #[command(flatten)]
    pub connection: ConnectionArgs,
}

#[derive(Debug, Args)]
pub struct ValidateArgs {
    /// The plan to check (TOML).
    #[arg(short, long)]
    pub plan: PathBuf,

    /// Address book whose instances become plan imports.
    #[arg(long)]
    pub imports: Option<PathBuf>,

    /// Accept steps that shadow imports, as a resumed run would.
    #[arg(long)]
    pub resume: bool,

    /// Hardhat artifacts directory.
    #[arg(long)]
    pub artifacts: Option<PathBuf>,
}
