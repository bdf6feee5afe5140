//! [`Verifier`] running the Hardhat verify task.

mod cmd;
pub use cmd::HardhatVerifyCmdBuilder;

use std::path::PathBuf;

use anyhow::Context;

use crate::traits::{VerificationRequest, VerificationResult, Verifier, VerifierError};

/// Output fragments of a failure worth retrying: the explorer has not indexed
/// the bytecode yet, rate limits and network errors.
const TRANSIENT_MARKERS: &[&str] = &[
    "does not have bytecode",
    "unable to locate contractcode",
    "rate limit",
    "too many requests",
    "timeout",
    "timed out",
    "etimedout",
    "econnreset",
    "econnrefused",
    "socket hang up",
    "502",
    "503",
];

const ALREADY_VERIFIED_MARKERS: &[&str] = &["already verified", "already been verified"];

/// Verifies contracts with `npx hardhat verify` from a Hardhat project.
#[derive(Debug, Clone)]
pub struct HardhatVerifier {
    project_root: PathBuf,
    network: String,
}

impl HardhatVerifier {
    pub fn new(project_root: impl Into<PathBuf>, network: impl Into<String>) -> Self {
        Self {
            project_root: project_root.into(),
            network: network.into(),
        }
    }

    async fn run(&self, args: Vec<String>) -> Result<(bool, String), anyhow::Error> {
        let output = tokio::process::Command::new("npx")
            .args(&args)
            .current_dir(&self.project_root)
            // The verification service drops timed out attempts.
            .kill_on_drop(true)
            .output()
            .await
            .context(format!(
                "Failed to run npx in {}",
                self.project_root.display()
            ))?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok((output.status.success(), text))
    }
}

/// Map the task's exit status and output to a verification outcome.
fn classify(success: bool, output: &str) -> Result<VerificationResult, VerifierError> {
    let lowered = output.to_lowercase();

    if ALREADY_VERIFIED_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
    {
        return Ok(VerificationResult::AlreadyVerified);
    }
    if success {
        return Ok(VerificationResult::Verified);
    }

    let reason = output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .unwrap_or("hardhat verify failed without output")
        .to_string();

    if TRANSIENT_MARKERS.iter().any(|marker| lowered.contains(marker)) {
        Err(VerifierError::Transient(reason))
    } else {
        Err(VerifierError::Permanent(reason))
    }
}

impl Verifier for HardhatVerifier {
    async fn submit_verification(
        &self,
        request: &VerificationRequest,
    ) -> Result<VerificationResult, VerifierError> {
        let args = HardhatVerifyCmdBuilder::new(&self.network, request.address)
            .contract(&request.source_path)
            .constructor_args(request.constructor_args.iter().map(ToString::to_string))
            .build();

        tracing::debug!(
            address = %request.address,
            network = %self.network,
            "Running hardhat verify"
        );

        let (success, output) = self
            .run(args)
            .await
            .map_err(|err| VerifierError::Permanent(format!("{err:#}")))?;

        classify(success, &output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_successful_run_is_verified() {
        let output = "Successfully submitted source code for contract\ncontracts/Token.sol:Token at 0x5FbD\nSuccessfully verified contract Token on the block explorer.";
        assert_eq!(classify(true, output), Ok(VerificationResult::Verified));
    }

    #[test]
    fn test_already_verified() {
        let output = "The contract 0x5FbD has already been verified on the block explorer.";
        assert_eq!(classify(true, output), Ok(VerificationResult::AlreadyVerified));
        assert_eq!(
            classify(false, "Error: Contract source code already verified"),
            Ok(VerificationResult::AlreadyVerified)
        );
    }

    #[test]
    fn test_unindexed_bytecode_is_transient() {
        let output = "Error: The address 0x5FbD does not have bytecode.\nIf you are trying to verify a newly deployed contract, wait a bit.";
        assert!(matches!(
            classify(false, output),
            Err(VerifierError::Transient(_))
        ));
    }

    #[test]
    fn test_source_mismatch_is_permanent() {
        let output = "Error: The contract you want to verify was compiled with solidity 0.8.20,\nbut the deployed bytecode does not match.";
        assert_eq!(
            classify(false, output),
            Err(VerifierError::Permanent(
                "but the deployed bytecode does not match.".to_string()
            ))
        );
    }
}
