//! Narrow interfaces to the collaborators the orchestrator drives.
//!
//! The orchestrator never compiles, signs or talks HTTP itself. It consumes:
//! - an [`ArtifactSource`] for creation bytecode and ABIs,
//! - a [`ChainClient`] to submit transactions and read proxy state,
//! - a [`Verifier`] to publish sources to a verification service.
//!
//! Concrete implementations live in [`crate::backends`].

mod artifact_source;
mod chain_client;
mod verifier;

pub use artifact_source::ArtifactSource;
pub use chain_client::{
    ChainClient, ChainError, Confirmation, InitializerCall, PendingTx, TxRequest,
};
pub use verifier::{VerificationRequest, VerificationResult, Verifier, VerifierError};
