//! ERC-1967 proxy introspection.

use alloy_core::primitives::{Address, B256, b256};

use crate::{
    DeployError, ProxyKind,
    traits::{ChainClient, ChainError},
};

/// `bytes32(uint256(keccak256("eip1967.proxy.implementation")) - 1)`
pub const IMPLEMENTATION_SLOT: B256 =
    b256!("360894a13ba1a3210667c828492db98dca3e2076cc3735a920a3ca505d382bbc");

/// `bytes32(uint256(keccak256("eip1967.proxy.admin")) - 1)`
pub const ADMIN_SLOT: B256 =
    b256!("b53127684a568b3173ae13b9f8a6016e243e63b6e8ee1178d6a717850b5d6103");

/// `bytes32(uint256(keccak256("eip1967.proxy.beacon")) - 1)`
pub const BEACON_SLOT: B256 =
    b256!("a3f0ad74e5423aebfd80d3ef4346578335a9a72aeaee59ff6cb3582b35133d50");

/// What the ERC-1967 slots of an address say about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyInspection {
    /// `None` when no proxy slot is populated.
    pub kind: Option<ProxyKind>,
    /// Current implementation (resolved through the beacon for beacon proxies).
    pub implementation: Option<Address>,
    pub admin: Option<Address>,
    pub beacon: Option<Address>,
}

fn slot_address(word: B256) -> Option<Address> {
    (word != B256::ZERO).then(|| Address::from_word(word))
}

/// Read the proxy slots of `address` and classify it.
///
/// A populated beacon slot means a beacon proxy. Otherwise a populated
/// implementation slot means a transparent proxy when an admin is recorded
/// and a UUPS proxy when it is not.
pub async fn inspect<C: ChainClient>(
    chain: &C,
    address: Address,
) -> Result<ProxyInspection, DeployError> {
    let read = |slot| async move {
        chain
            .storage_at(address, slot)
            .await
            .map(slot_address)
            .map_err(|err| match err {
                ChainError::Transport(err) => DeployError::ChainUnavailable(err),
                ChainError::Reverted { reason, .. } => DeployError::ChainUnavailable(
                    anyhow::anyhow!("storage read of {address} failed: {reason}"),
                ),
            })
    };

    let beacon = read(BEACON_SLOT).await?;
    let implementation_slot = read(IMPLEMENTATION_SLOT).await?;
    let admin = read(ADMIN_SLOT).await?;

    let kind = match (beacon, implementation_slot, admin) {
        (Some(_), _, _) => Some(ProxyKind::Beacon),
        (None, Some(_), Some(_)) => Some(ProxyKind::Transparent),
        (None, Some(_), None) => Some(ProxyKind::Uups),
        (None, None, _) => None,
    };

    let implementation = match kind {
        Some(ProxyKind::Beacon) => Some(
            chain
                .get_current_implementation(address)
                .await
                .map_err(|err| DeployError::ChainUnavailable(err.into()))?,
        ),
        _ => implementation_slot,
    };

    Ok(ProxyInspection {
        kind,
        implementation,
        admin,
        beacon,
    })
}
