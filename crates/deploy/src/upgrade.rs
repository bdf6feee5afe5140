//! In-place upgrades of existing proxies.

use std::time::Duration;

use alloy_core::primitives::{Address, TxHash};

use crate::{
    ArtifactRef, ContractFactory, DeployError, ProxyKind, UpgradeOptions,
    proxy::{self, ProxyInspection},
    strategy::{deploy_implementation, transact},
    traits::{ChainClient, TxRequest},
};

/// Result of a successful upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpgradeOutcome {
    /// Always the address that was passed in.
    pub proxy_address: Address,
    pub new_implementation: Address,
    pub previous_implementation: Address,
    /// Hash of the repointing transaction.
    pub transaction_hash: TxHash,
}

/// Swaps the implementation behind an existing proxy.
///
/// Upgrades never run an initializer: state migrations belong to an explicit
/// function exposed by the new implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpgradeCoordinator {
    confirmation_timeout: Option<Duration>,
}

impl UpgradeCoordinator {
    pub fn new(confirmation_timeout: Option<Duration>) -> Self {
        Self {
            confirmation_timeout,
        }
    }

    /// Deploy `artifact` as the new implementation of `proxy_address`.
    ///
    /// The proxy kind is checked first. On mismatch nothing is submitted and the
    /// call fails with [`DeployError::ProxyKindMismatch`].
    pub async fn upgrade<C: ChainClient>(
        &self,
        chain: &C,
        proxy_address: Address,
        artifact: &ArtifactRef,
        factory: &ContractFactory,
        options: &UpgradeOptions,
    ) -> Result<UpgradeOutcome, DeployError> {
        let inspection = proxy::inspect(chain, proxy_address).await?;
        let via = upgrade_entry_point(proxy_address, options.kind, &inspection)?;

        let previous_implementation = inspection.implementation.ok_or_else(|| {
            DeployError::ChainUnavailable(anyhow::anyhow!(
                "could not read the implementation of {proxy_address}"
            ))
        })?;

        tracing::info!(
            proxy = %proxy_address,
            kind = %options.kind,
            %previous_implementation,
            artifact = %artifact,
            "Upgrading proxy"
        );

        let new_implementation =
            deploy_implementation(chain, artifact, factory, self.confirmation_timeout).await?;

        let confirmation = transact(
            chain,
            TxRequest::Upgrade {
                proxy: proxy_address,
                kind: options.kind,
                via,
                implementation: new_implementation,
                unsafe_allow: options.unsafe_allow.clone(),
            },
            self.confirmation_timeout,
        )
        .await?;

        let current = chain
            .get_current_implementation(proxy_address)
            .await
            .map_err(|err| DeployError::ChainUnavailable(err.into()))?;
        if current != new_implementation {
            return Err(DeployError::DeploymentReverted {
                what: format!("upgrade of {proxy_address}"),
                reason: format!(
                    "proxy still points at {current} instead of {new_implementation}"
                ),
                tx_hash: Some(confirmation.tx_hash),
            });
        }

        tracing::info!(
            proxy = %proxy_address,
            %new_implementation,
            "Proxy upgraded"
        );

        Ok(UpgradeOutcome {
            proxy_address,
            new_implementation,
            previous_implementation,
            transaction_hash: confirmation.tx_hash,
        })
    }
}

/// The contract whose upgrade function repoints `proxy`: the proxy itself for
/// UUPS, its admin for transparent proxies and its beacon for beacon proxies.
fn upgrade_entry_point(
    proxy: Address,
    expected: ProxyKind,
    inspection: &ProxyInspection,
) -> Result<Address, DeployError> {
    let mismatch = || DeployError::ProxyKindMismatch {
        proxy,
        expected,
        found: inspection.kind,
    };

    if inspection.kind != Some(expected) {
        return Err(mismatch());
    }

    match expected {
        ProxyKind::Uups => Ok(proxy),
        ProxyKind::Transparent => inspection.admin.ok_or_else(mismatch),
        ProxyKind::Beacon => inspection.beacon.ok_or_else(mismatch),
    }
}
