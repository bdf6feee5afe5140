//! Error kinds surfaced by the orchestrator.

use std::{collections::BTreeMap, time::Duration};

use alloy_core::primitives::{Address, TxHash};

use crate::{DeployedInstance, ProxyKind, executor::ExecutionReport};

/// Coarse classification of a [`DeployError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
pub enum ErrorKind {
    ArtifactNotFound,
    AmbiguousArtifact,
    UnresolvedDependency,
    DeploymentReverted,
    ConfirmationTimeout,
    ProxyKindMismatch,
    VerificationFailed,
    InvalidPlan,
    ChainUnavailable,
    Cancelled,
}

/// Errors raised while resolving, deploying, upgrading or verifying a contract.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("artifact `{0}` not found")]
    ArtifactNotFound(String),

    #[error("artifact `{name}` is ambiguous, pick one of: {}", .candidates.join(", "))]
    AmbiguousArtifact {
        name: String,
        candidates: Vec<String>,
    },

    #[error("step `{step}` depends on `{missing}`, which cannot be resolved")]
    UnresolvedDependency { step: String, missing: String },

    #[error("dependency cycle between steps: {}", .steps.join(" -> "))]
    DependencyCycle { steps: Vec<String> },

    #[error("{what} reverted on-chain: {reason}")]
    DeploymentReverted {
        what: String,
        reason: String,
        tx_hash: Option<TxHash>,
    },

    #[error("no confirmation for transaction {tx_hash} after {waited:?}")]
    ConfirmationTimeout { tx_hash: TxHash, waited: Duration },

    #[error("{proxy} is not a {expected} proxy (found: {})", .found.map_or_else(|| "no proxy".to_string(), |k| k.to_string()))]
    ProxyKindMismatch {
        proxy: Address,
        expected: ProxyKind,
        found: Option<ProxyKind>,
    },

    #[error("verification of {address} failed: {reason}")]
    VerificationFailed { address: Address, reason: String },

    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error("chain client error: {0:#}")]
    ChainUnavailable(#[source] anyhow::Error),

    #[error("plan execution cancelled")]
    Cancelled,
}

impl DeployError {
    /// The [`ErrorKind`] of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ArtifactNotFound(_) => ErrorKind::ArtifactNotFound,
            Self::AmbiguousArtifact { .. } => ErrorKind::AmbiguousArtifact,
            Self::UnresolvedDependency { .. } | Self::DependencyCycle { .. } => {
                ErrorKind::UnresolvedDependency
            }
            Self::DeploymentReverted { .. } => ErrorKind::DeploymentReverted,
            Self::ConfirmationTimeout { .. } => ErrorKind::ConfirmationTimeout,
            Self::ProxyKindMismatch { .. } => ErrorKind::ProxyKindMismatch,
            Self::VerificationFailed { .. } => ErrorKind::VerificationFailed,
            Self::InvalidPlan(_) => ErrorKind::InvalidPlan,
            Self::ChainUnavailable(_) => ErrorKind::ChainUnavailable,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether this error stops the plan. Only verification failures are advisory.
    pub fn is_fatal(&self) -> bool {
        self.kind() != ErrorKind::VerificationFailed
    }
}

/// A plan that stopped before completing every step.
///
/// Carries everything needed to resume by hand: the step that failed, the
/// instances that already exist on-chain and the per-step report.
#[derive(Debug, thiserror::Error)]
#[error("step `{step}` failed: {error}")]
pub struct PlanFailure {
    /// Name of the step that failed, or `<plan>` for validation failures.
    pub step: String,
    /// The underlying error.
    #[source]
    pub error: DeployError,
    /// Instances deployed before the failure. These are not rolled back.
    pub completed: BTreeMap<String, DeployedInstance>,
    /// Per-step states at the time of the failure.
    pub report: ExecutionReport,
}

impl PlanFailure {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_is_an_unresolved_dependency() {
        let err = DeployError::DependencyCycle {
            steps: vec!["A".to_string(), "B".to_string(), "A".to_string()],
        };
        assert_eq!(err.kind(), ErrorKind::UnresolvedDependency);
        assert_eq!(err.to_string(), "dependency cycle between steps: A -> B -> A");
    }

    #[test]
    fn test_only_verification_failures_are_advisory() {
        let verification = DeployError::VerificationFailed {
            address: Address::ZERO,
            reason: "source mismatch".to_string(),
        };
        assert!(!verification.is_fatal());
        assert!(DeployError::Cancelled.is_fatal());
        assert!(DeployError::ArtifactNotFound("Token".to_string()).is_fatal());
    }

    #[test]
    fn test_proxy_kind_mismatch_message() {
        let err = DeployError::ProxyKindMismatch {
            proxy: Address::ZERO,
            expected: ProxyKind::Uups,
            found: None,
        };
        assert!(err.to_string().contains("not a uups proxy (found: no proxy)"));
    }
}
