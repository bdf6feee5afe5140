//! Source verification service.

use std::future::Future;

use alloy_core::primitives::Address;
use serde::{Deserialize, Serialize};

use crate::ResolvedArg;

/// What to verify: the deployed address, the exact source and the constructor
/// arguments it was created with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationRequest {
    pub address: Address,
    /// Fully qualified source path, disambiguating contracts with identical bytecode.
    pub source_path: String,
    pub constructor_args: Vec<ResolvedArg>,
}

/// Outcome of a verification attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum VerificationResult {
    Verified,
    AlreadyVerified,
    Failed(String),
}

impl VerificationResult {
    /// Whether the source is published after this outcome.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Verified | Self::AlreadyVerified)
    }
}

/// Failures reported by a [`Verifier`], split by whether retrying may help.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifierError {
    /// Network hiccup, rate limit or the service not having indexed the bytecode yet.
    #[error("transient verification error: {0}")]
    Transient(String),
    /// Source mismatch, bad arguments, missing API key and the like.
    #[error("verification error: {0}")]
    Permanent(String),
}

impl VerifierError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Publishes contract sources to a verification service.
pub trait Verifier: Send + Sync + 'static {
    fn submit_verification(
        &self,
        request: &VerificationRequest,
    ) -> impl Future<Output = Result<VerificationResult, VerifierError>> + Send;
}
