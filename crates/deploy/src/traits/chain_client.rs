//! Chain access: transaction submission, confirmation and state reads.

use std::{collections::BTreeSet, future::Future};

use alloy_core::{
    json_abi::Function,
    primitives::{Address, B256, Bytes, TxHash},
};

use crate::{ArtifactRef, ContractFactory, ProxyKind, ResolvedArg};

/// Initializer invoked through a freshly created proxy.
#[derive(Debug, Clone)]
pub struct InitializerCall {
    /// The implementation function, taken from the artifact ABI.
    pub function: Function,
    pub args: Vec<ResolvedArg>,
}

/// A state-changing request for the chain client.
///
/// Each variant maps to one transaction.
#[derive(Debug, Clone)]
pub enum TxRequest {
    /// Deploy `factory` with `args` passed positionally to its constructor.
    Create {
        artifact: ArtifactRef,
        factory: ContractFactory,
        args: Vec<ResolvedArg>,
    },
    /// Deploy an upgradeable beacon pointing at `implementation`.
    CreateBeacon { implementation: Address },
    /// Deploy a proxy of `kind` pointing at `target` (the implementation, or the
    /// beacon for beacon proxies) and run `initializer` through it atomically.
    CreateProxy {
        kind: ProxyKind,
        target: Address,
        initializer: Option<InitializerCall>,
        unsafe_allow: BTreeSet<String>,
    },
    /// Repoint `proxy` at `implementation` by calling the upgrade entry point on
    /// `via` (the proxy itself, its admin or its beacon depending on `kind`).
    Upgrade {
        proxy: Address,
        kind: ProxyKind,
        via: Address,
        implementation: Address,
        unsafe_allow: BTreeSet<String>,
    },
}

impl TxRequest {
    /// Short human readable description used in logs and errors.
    pub fn describe(&self) -> String {
        match self {
            Self::Create { artifact, .. } => format!("deployment of {artifact}"),
            Self::CreateBeacon { implementation } => {
                format!("beacon creation for implementation {implementation}")
            }
            Self::CreateProxy { kind, target, .. } => {
                format!("{kind} proxy creation for {target}")
            }
            Self::Upgrade {
                proxy,
                implementation,
                ..
            } => format!("upgrade of {proxy} to {implementation}"),
        }
    }
}

/// A submitted, not yet confirmed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingTx {
    pub tx_hash: TxHash,
}

/// A mined, successful transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confirmation {
    pub tx_hash: TxHash,
    /// Address of the contract created by the transaction, if any.
    pub contract_address: Option<Address>,
    pub block_number: Option<u64>,
}

/// Failures reported by a [`ChainClient`].
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    /// The transaction reverted, either when simulated at submission (no hash)
    /// or once mined.
    #[error("reverted: {reason}")]
    Reverted {
        tx_hash: Option<TxHash>,
        reason: String,
    },
    /// Transport or node failure.
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

/// RPC client and signer for the target chain.
///
/// `await_confirmation` must not time out on its own: block production is not
/// under the orchestrator's control, callers bound the wait when they need to.
pub trait ChainClient: Send + Sync + 'static {
    /// Sign and broadcast `request`.
    fn submit(
        &self,
        request: TxRequest,
    ) -> impl Future<Output = Result<PendingTx, ChainError>> + Send;

    /// Wait until `pending` is mined.
    fn await_confirmation(
        &self,
        pending: &PendingTx,
    ) -> impl Future<Output = Result<Confirmation, ChainError>> + Send;

    /// The implementation a proxy currently delegates to, following beacons.
    fn get_current_implementation(
        &self,
        proxy: Address,
    ) -> impl Future<Output = Result<Address, ChainError>> + Send;

    /// Raw storage word at `slot`.
    fn storage_at(
        &self,
        address: Address,
        slot: B256,
    ) -> impl Future<Output = Result<B256, ChainError>> + Send;

    /// Runtime bytecode at `address`. Empty when nothing is deployed there.
    fn code_at(
        &self,
        address: Address,
    ) -> impl Future<Output = Result<Bytes, ChainError>> + Send;
}
