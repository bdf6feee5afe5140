//! Plan-level values and the records produced by executing them.

use std::{collections::BTreeSet, fmt};

use alloy_core::primitives::{Address, TxHash};
use serde::{Deserialize, Serialize};

use crate::ArtifactRef;

/// The upgradeable proxy pattern a contract is deployed behind.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ProxyKind {
    /// ERC-1967 proxy whose upgrade logic lives in the implementation (ERC-1822).
    Uups,
    /// Transparent proxy administered by a separate `ProxyAdmin` contract.
    Transparent,
    /// Beacon proxy reading its implementation from an upgradeable beacon.
    Beacon,
}

fn default_initializer() -> String {
    "initialize".to_string()
}

/// Options selecting the proxied deployment strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyOptions {
    /// The proxy pattern.
    pub kind: ProxyKind,
    /// Name of the implementation function run once through the proxy.
    #[serde(default = "default_initializer")]
    pub initializer: String,
    /// Risky implementation patterns the operator explicitly acknowledges
    /// (for example `delegatecall`). Passed to the chain client as-is.
    #[serde(default)]
    pub unsafe_allow: BTreeSet<String>,
}

impl ProxyOptions {
    /// Options for `kind` with the default `initialize` initializer.
    pub fn new(kind: ProxyKind) -> Self {
        Self {
            kind,
            initializer: default_initializer(),
            unsafe_allow: BTreeSet::new(),
        }
    }

    /// Set the initializer function name.
    pub fn initializer(mut self, name: impl Into<String>) -> Self {
        self.initializer = name.into();
        self
    }

    /// Acknowledge an unsafe implementation pattern.
    pub fn unsafe_allow(mut self, flag: impl Into<String>) -> Self {
        self.unsafe_allow.insert(flag.into());
        self
    }
}

/// Options for upgrading an existing proxy. No initializer is re-run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeOptions {
    /// The kind the existing proxy is expected to be.
    pub kind: ProxyKind,
    #[serde(default)]
    pub unsafe_allow: BTreeSet<String>,
}

impl From<&ProxyOptions> for UpgradeOptions {
    fn from(options: &ProxyOptions) -> Self {
        Self {
            kind: options.kind,
            unsafe_allow: options.unsafe_allow.clone(),
        }
    }
}

/// A constructor or initializer argument as written in a plan.
///
/// Literals are coerced to the ABI parameter type by the chain client, so large
/// integers (token amounts in wei) are written as decimal strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    /// Forward reference to the address produced by another step (or an import).
    AddressOf { address_of: String },
    Bool(bool),
    Int(i64),
    Text(String),
}

impl ArgValue {
    /// Shorthand for an address placeholder.
    pub fn address_of(step: impl Into<String>) -> Self {
        Self::AddressOf {
            address_of: step.into(),
        }
    }

    /// The step this value depends on, if it is a placeholder.
    pub fn dependency(&self) -> Option<&str> {
        match self {
            Self::AddressOf { address_of } => Some(address_of),
            _ => None,
        }
    }

    /// Resolve the value, looking placeholders up with `lookup`.
    ///
    /// Returns the name of the missing step when a placeholder cannot be resolved.
    pub fn resolve<'a>(
        &'a self,
        lookup: impl Fn(&str) -> Option<Address>,
    ) -> Result<ResolvedArg, &'a str> {
        Ok(match self {
            Self::AddressOf { address_of } => {
                ResolvedArg::Address(lookup(address_of).ok_or(address_of.as_str())?)
            }
            Self::Bool(value) => ResolvedArg::Bool(*value),
            Self::Int(value) => ResolvedArg::Int(*value),
            Self::Text(value) => ResolvedArg::Text(value.clone()),
        })
    }
}

impl From<&str> for ArgValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<i64> for ArgValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for ArgValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// A concrete argument handed to the chain client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResolvedArg {
    Address(Address),
    Bool(bool),
    Int(i64),
    Text(String),
}

impl fmt::Display for ResolvedArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Address(address) => write!(f, "{address}"),
            Self::Bool(value) => write!(f, "{value}"),
            Self::Int(value) => write!(f, "{value}"),
            Self::Text(value) => f.write_str(value),
        }
    }
}

/// A contract instance that exists on-chain.
///
/// `address` is the durable identity: for proxies it is the proxy address and
/// stays the same across every later upgrade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployedInstance {
    /// The artifact deployed (for upgrades, the new implementation's artifact).
    pub artifact: ArtifactRef,
    /// Externally visible address.
    pub address: Address,
    /// Whether `address` is a proxy.
    pub is_proxy: bool,
    /// Current implementation behind the proxy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub implementation: Option<Address>,
    /// Hash of the transaction that produced this state. Absent for reused instances.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_hash: Option<TxHash>,
    /// Set when a resumed run found the instance already deployed.
    #[serde(default)]
    pub reused: bool,
}
