//! Implementations of the collaborator traits.
//!
//! [`MemoryChain`] and [`StaticArtifacts`] keep everything in memory and back
//! dry runs and tests. The rest talk to a Hardhat project and a JSON-RPC node.

mod hardhat_artifacts;
mod hardhat_verify;
mod memory;
mod rpc_client;

pub use hardhat_artifacts::HardhatArtifacts;
pub use hardhat_verify::{HardhatVerifier, HardhatVerifyCmdBuilder};
pub use memory::{DEFAULT_DEPLOYER, MemoryChain, StaticArtifacts};
pub use rpc_client::{ProxyFactories, RpcChainClient};
