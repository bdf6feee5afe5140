//! Layered settings: defaults, then `Uplift.toml`, then `UPLIFT_*` variables.

use std::path::{Path, PathBuf};

use alloy_core::primitives::Address;
use anyhow::Context;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::cli::ConnectionArgs;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub rpc_url: Url,
    /// Defaults to the node's first account.
    pub sender: Option<Address>,
    pub project_root: PathBuf,
    /// Defaults to `<project_root>/artifacts`.
    pub artifacts: Option<PathBuf>,
    /// Hardhat network name passed to `hardhat verify`.
    pub network: String,
    /// Verify sources unless a step or `--no-verify` says otherwise.
    pub verify: bool,
    pub confirmation_timeout_secs: Option<u64>,
    /// How long to wait for the RPC endpoint to answer.
    pub ready_timeout_secs: u64,
    pub verification_retry_delay_ms: u64,
    /// Bound on each `hardhat verify` run.
    pub verification_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            rpc_url: Url::parse("http://127.0.0.1:8545").expect("static URL is valid"),
            sender: None,
            project_root: PathBuf::from("."),
            artifacts: None,
            network: "localhost".to_string(),
            verify: true,
            confirmation_timeout_secs: None,
            ready_timeout_secs: 30,
            verification_retry_delay_ms: 5_000,
            verification_timeout_secs: 180,
        }
    }
}

impl Settings {
    /// Load the settings. A missing file is not an error.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("UPLIFT_"))
            .extract()
            .context(format!("Failed to load settings from {}", path.display()))
    }

    /// Apply command line overrides.
    pub fn with_connection(mut self, args: &ConnectionArgs) -> Self {
        if let Some(rpc_url) = &args.rpc_url {
            self.rpc_url = rpc_url.clone();
        }
        if let Some(sender) = args.sender {
            self.sender = Some(sender);
        }
        if let Some(project_root) = &args.project_root {
            self.project_root = project_root.clone();
        }
        if let Some(artifacts) = &args.artifacts {
            self.artifacts = Some(artifacts.clone());
        }
        if let Some(network) = &args.network {
            self.network = network.clone();
        }
        self
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.artifacts
            .clone()
            .unwrap_or_else(|| self.project_root.join("artifacts"))
    }
}
