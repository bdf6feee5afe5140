//! Direct and proxied deployment strategies.

use std::time::Duration;

use alloy_core::{json_abi::Function, primitives::Address};

use crate::{
    ArtifactRef, ContractFactory, DeployError, DeployedInstance, ProxyKind, ProxyOptions,
    ResolvedArg,
    traits::{ChainClient, ChainError, Confirmation, InitializerCall, TxRequest},
};

/// How a contract gets instantiated.
///
/// Selected by the presence of [`ProxyOptions`] on a deployment step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeploymentStrategy {
    /// Plain immutable deployment: constructor arguments go to the contract itself.
    Direct,
    /// Implementation behind an upgradeable proxy, set up through an initializer.
    Proxied(ProxyOptions),
}

impl DeploymentStrategy {
    pub fn from_options(proxy: Option<ProxyOptions>) -> Self {
        proxy.map_or(Self::Direct, Self::Proxied)
    }

    /// Check that the strategy can run against `factory` with `arg_count` arguments.
    ///
    /// This is pure, so a plan can be validated before any transaction is sent.
    pub fn preflight(
        &self,
        artifact: &ArtifactRef,
        factory: &ContractFactory,
        arg_count: usize,
    ) -> Result<(), DeployError> {
        if let Self::Proxied(options) = self {
            find_initializer(artifact, factory, &options.initializer, arg_count)?;
        }
        Ok(())
    }

    /// Deploy `artifact` and wait until the resulting address is confirmed.
    ///
    /// `Direct` sends one creation transaction. `Proxied` deploys the
    /// implementation (plus a beacon for beacon proxies) and then the proxy,
    /// whose creation runs the initializer exactly once. Either way one new
    /// externally visible address comes out.
    pub async fn deploy<C: ChainClient>(
        &self,
        chain: &C,
        artifact: &ArtifactRef,
        factory: &ContractFactory,
        args: Vec<ResolvedArg>,
        confirmation_timeout: Option<Duration>,
    ) -> Result<DeployedInstance, DeployError> {
        match self {
            Self::Direct => {
                let confirmation = transact(
                    chain,
                    TxRequest::Create {
                        artifact: artifact.clone(),
                        factory: factory.clone(),
                        args,
                    },
                    confirmation_timeout,
                )
                .await?;
                let address = created_address(&confirmation)?;

                tracing::info!(artifact = %artifact, %address, "Contract deployed");

                Ok(DeployedInstance {
                    artifact: artifact.clone(),
                    address,
                    is_proxy: false,
                    implementation: None,
                    transaction_hash: Some(confirmation.tx_hash),
                    reused: false,
                })
            }
            Self::Proxied(options) => {
                let function =
                    find_initializer(artifact, factory, &options.initializer, args.len())?;

                let implementation =
                    deploy_implementation(chain, artifact, factory, confirmation_timeout).await?;

                let confirmation = deploy_proxy(
                    chain,
                    options,
                    implementation,
                    InitializerCall { function, args },
                    confirmation_timeout,
                )
                .await
                .map_err(|err| {
                    tracing::info!(
                        artifact = %artifact,
                        %implementation,
                        error = %err,
                        "Implementation deployed but its proxy was not"
                    );
                    with_orphaned_implementation(err, implementation)
                })?;
                let address = created_address(&confirmation)?;

                tracing::info!(
                    artifact = %artifact,
                    proxy = %address,
                    %implementation,
                    kind = %options.kind,
                    "Proxy deployed"
                );

                Ok(DeployedInstance {
                    artifact: artifact.clone(),
                    address,
                    is_proxy: true,
                    implementation: Some(implementation),
                    transaction_hash: Some(confirmation.tx_hash),
                    reused: false,
                })
            }
        }
    }
}

/// Deploy an implementation contract. Upgradeable implementations take no
/// constructor arguments; their setup goes through the initializer.
pub(crate) async fn deploy_implementation<C: ChainClient>(
    chain: &C,
    artifact: &ArtifactRef,
    factory: &ContractFactory,
    confirmation_timeout: Option<Duration>,
) -> Result<Address, DeployError> {
    let confirmation = transact(
        chain,
        TxRequest::Create {
            artifact: artifact.clone(),
            factory: factory.clone(),
            args: Vec::new(),
        },
        confirmation_timeout,
    )
    .await?;
    let implementation = created_address(&confirmation)?;
    tracing::debug!(artifact = %artifact, %implementation, "Implementation deployed");
    Ok(implementation)
}

/// Deploy the proxy in front of `implementation`, with a beacon in between for
/// beacon proxies.
async fn deploy_proxy<C: ChainClient>(
    chain: &C,
    options: &ProxyOptions,
    implementation: Address,
    initializer: InitializerCall,
    confirmation_timeout: Option<Duration>,
) -> Result<Confirmation, DeployError> {
    let target = match options.kind {
        ProxyKind::Beacon => {
            let confirmation = transact(
                chain,
                TxRequest::CreateBeacon { implementation },
                confirmation_timeout,
            )
            .await?;
            let beacon = created_address(&confirmation)?;
            tracing::debug!(%beacon, %implementation, "Beacon deployed");
            beacon
        }
        ProxyKind::Uups | ProxyKind::Transparent => implementation,
    };

    transact(
        chain,
        TxRequest::CreateProxy {
            kind: options.kind,
            target,
            initializer: Some(initializer),
            unsafe_allow: options.unsafe_allow.clone(),
        },
        confirmation_timeout,
    )
    .await
}

/// Name the already deployed implementation in a revert, since it stays on
/// chain after the proxy failed.
fn with_orphaned_implementation(err: DeployError, implementation: Address) -> DeployError {
    match err {
        DeployError::DeploymentReverted {
            what,
            reason,
            tx_hash,
        } => DeployError::DeploymentReverted {
            what,
            reason: format!("{reason} (implementation already deployed at {implementation})"),
            tx_hash,
        },
        other => other,
    }
}

/// Submit `request` and wait for it to be mined.
///
/// With a timeout, an unconfirmed transaction turns into
/// [`DeployError::ConfirmationTimeout`]. The transaction itself is not replaced
/// or resubmitted, since that could deploy twice.
pub(crate) async fn transact<C: ChainClient>(
    chain: &C,
    request: TxRequest,
    confirmation_timeout: Option<Duration>,
) -> Result<Confirmation, DeployError> {
    let what = request.describe();

    let pending = chain
        .submit(request)
        .await
        .map_err(|err| map_chain_error(err, &what))?;

    tracing::debug!(tx_hash = %pending.tx_hash, "Submitted {what}, waiting for confirmation");

    let confirmation = match confirmation_timeout {
        Some(limit) => tokio::time::timeout(limit, chain.await_confirmation(&pending))
            .await
            .map_err(|_| DeployError::ConfirmationTimeout {
                tx_hash: pending.tx_hash,
                waited: limit,
            })?,
        None => chain.await_confirmation(&pending).await,
    }
    .map_err(|err| map_chain_error(err, &what))?;

    tracing::debug!(
        tx_hash = %confirmation.tx_hash,
        block_number = ?confirmation.block_number,
        "Confirmed {what}"
    );

    Ok(confirmation)
}

fn map_chain_error(err: ChainError, what: &str) -> DeployError {
    match err {
        ChainError::Reverted { tx_hash, reason } => DeployError::DeploymentReverted {
            what: what.to_string(),
            reason,
            tx_hash,
        },
        ChainError::Transport(err) => DeployError::ChainUnavailable(err),
    }
}

fn created_address(confirmation: &Confirmation) -> Result<Address, DeployError> {
    confirmation.contract_address.ok_or_else(|| {
        DeployError::ChainUnavailable(anyhow::anyhow!(
            "receipt of {} has no contract address",
            confirmation.tx_hash
        ))
    })
}

/// Find the initializer overload named `name` taking `arg_count` arguments.
fn find_initializer(
    artifact: &ArtifactRef,
    factory: &ContractFactory,
    name: &str,
    arg_count: usize,
) -> Result<Function, DeployError> {
    factory
        .abi
        .function(name)
        .and_then(|overloads| overloads.iter().find(|f| f.inputs.len() == arg_count))
        .cloned()
        .ok_or_else(|| {
            DeployError::InvalidPlan(format!(
                "{artifact} has no initializer `{name}` taking {arg_count} argument(s)"
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{DEFAULT_DEPLOYER, MemoryChain};
    use crate::proxy::{ProxyInspection, inspect};
    use alloy_core::{
        json_abi::JsonAbi,
        primitives::{Address, address},
    };

    fn manager() -> (ArtifactRef, ContractFactory) {
        let abi = JsonAbi::parse(["function initialize(address token, uint256 price)"])
            .expect("Failed to parse ABI");
        (
            ArtifactRef::new("Manager", "contracts/Manager.sol:Manager"),
            ContractFactory::new(vec![0x60, 0x80, 0x01], abi),
        )
    }

    fn token() -> (ArtifactRef, ContractFactory) {
        (
            ArtifactRef::new("Token", "contracts/Token.sol:Token"),
            ContractFactory::new(vec![0x60, 0x80, 0x02], JsonAbi::new()),
        )
    }

    #[tokio::test]
    async fn test_direct_deploy_assigns_a_stable_address() {
        let chain = MemoryChain::default();
        let (artifact, factory) = token();

        let instance = DeploymentStrategy::Direct
            .deploy(&chain, &artifact, &factory, Vec::new(), None)
            .await
            .expect("Direct deployment should succeed");

        assert!(!instance.is_proxy);
        assert_eq!(instance.implementation, None);

        let first_read = chain.code_of(instance.address);
        assert!(!first_read.is_empty());
        for _ in 0..3 {
            assert_eq!(chain.code_of(instance.address), first_read);
        }
        assert_eq!(chain.submitted().len(), 1);
    }

    #[tokio::test]
    async fn test_proxied_deploy_initializes_through_the_proxy() {
        let chain = MemoryChain::default();
        let (artifact, factory) = manager();
        let token = address!("5FbDB2315678afecb367f032d93F642f64180aa3");
        let args = vec![
            ResolvedArg::Address(token),
            ResolvedArg::Text("30000000000000000000".to_string()),
        ];

        let options = ProxyOptions::new(ProxyKind::Uups).unsafe_allow("delegatecall");
        let instance = DeploymentStrategy::Proxied(options)
            .deploy(&chain, &artifact, &factory, args.clone(), None)
            .await
            .expect("Proxied deployment should succeed");

        assert!(instance.is_proxy);
        let implementation = instance.implementation.expect("proxy has an implementation");
        assert_ne!(instance.address, implementation);

        let (initializer, received) = chain
            .initializer_call(instance.address)
            .expect("initializer should have run");
        assert_eq!(initializer, "initialize");
        assert_eq!(received, args);

        let inspection = inspect(&chain, instance.address).await.expect("inspect");
        assert_eq!(
            inspection,
            ProxyInspection {
                kind: Some(ProxyKind::Uups),
                implementation: Some(implementation),
                admin: None,
                beacon: None,
            }
        );
    }

    #[tokio::test]
    async fn test_unsafe_allow_flags_reach_the_chain_client_unchanged() {
        let chain = MemoryChain::default();
        let (artifact, factory) = manager();
        let options = ProxyOptions::new(ProxyKind::Transparent)
            .unsafe_allow("delegatecall")
            .unsafe_allow("external-library-linking");
        let expected = options.unsafe_allow.clone();

        DeploymentStrategy::Proxied(options)
            .deploy(
                &chain,
                &artifact,
                &factory,
                vec![
                    ResolvedArg::Address(Address::ZERO),
                    ResolvedArg::Int(1),
                ],
                None,
            )
            .await
            .expect("Proxied deployment should succeed");

        let forwarded = chain
            .submitted()
            .into_iter()
            .find_map(|tx| match tx {
                TxRequest::CreateProxy { unsafe_allow, .. } => Some(unsafe_allow),
                _ => None,
            })
            .expect("a proxy creation should have been submitted");
        assert_eq!(forwarded, expected);
    }

    #[tokio::test]
    async fn test_beacon_proxy_deploys_a_beacon_first() {
        let chain = MemoryChain::default();
        let (artifact, factory) = manager();

        let instance = DeploymentStrategy::Proxied(ProxyOptions::new(ProxyKind::Beacon))
            .deploy(
                &chain,
                &artifact,
                &factory,
                vec![ResolvedArg::Address(Address::ZERO), ResolvedArg::Int(5)],
                None,
            )
            .await
            .expect("Beacon deployment should succeed");

        let submitted = chain.submitted();
        assert_eq!(submitted.len(), 3);
        assert!(matches!(submitted[1], TxRequest::CreateBeacon { .. }));

        let inspection = inspect(&chain, instance.address).await.expect("inspect");
        assert_eq!(inspection.kind, Some(ProxyKind::Beacon));
        assert_eq!(inspection.implementation, instance.implementation);
    }

    #[tokio::test]
    async fn test_missing_initializer_fails_before_any_transaction() {
        let chain = MemoryChain::default();
        let (artifact, factory) = token();

        let err = DeploymentStrategy::Proxied(ProxyOptions::new(ProxyKind::Uups))
            .deploy(&chain, &artifact, &factory, Vec::new(), None)
            .await
            .unwrap_err();

        assert!(matches!(err, DeployError::InvalidPlan(_)));
        assert!(chain.submitted().is_empty());
    }

    #[tokio::test]
    async fn test_revert_surfaces_as_deployment_reverted() {
        let chain = MemoryChain::default();
        chain.revert_deployments_of("Token", "constructor: zero supply");
        let (artifact, factory) = token();

        let err = DeploymentStrategy::Direct
            .deploy(&chain, &artifact, &factory, Vec::new(), None)
            .await
            .unwrap_err();

        match err {
            DeployError::DeploymentReverted {
                reason, tx_hash, ..
            } => {
                assert_eq!(reason, "constructor: zero supply");
                assert!(tx_hash.is_some());
            }
            other => panic!("expected a revert, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failed_proxy_names_the_deployed_implementation() {
        let chain = MemoryChain::default();
        let (artifact, template) = manager();
        // Without runtime code the implementation is not a contract, so the
        // proxy constructor rejects it.
        let factory = ContractFactory::new(Vec::<u8>::new(), template.abi);

        let err = DeploymentStrategy::Proxied(ProxyOptions::new(ProxyKind::Uups))
            .deploy(
                &chain,
                &artifact,
                &factory,
                vec![ResolvedArg::Address(Address::ZERO), ResolvedArg::Int(1)],
                None,
            )
            .await
            .unwrap_err();

        let implementation = DEFAULT_DEPLOYER.create(0);
        match err {
            DeployError::DeploymentReverted { reason, .. } => {
                assert!(reason.contains("is not a contract"));
                assert!(reason.contains(&format!(
                    "implementation already deployed at {implementation}"
                )));
            }
            other => panic!("expected a revert, got {other:?}"),
        }
        assert_eq!(chain.submitted().len(), 2);
    }

    #[tokio::test]
    async fn test_confirmation_timeout_is_not_retried() {
        let chain = MemoryChain::default();
        chain.stall_confirmations(true);
        let (artifact, factory) = token();

        let err = DeploymentStrategy::Direct
            .deploy(
                &chain,
                &artifact,
                &factory,
                Vec::new(),
                Some(Duration::from_millis(20)),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, DeployError::ConfirmationTimeout { .. }));
        assert_eq!(chain.submitted().len(), 1, "no blind resubmission");
    }
}
