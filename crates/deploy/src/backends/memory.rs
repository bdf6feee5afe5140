//! In-memory chain and artifact store.
//!
//! [`MemoryChain`] simulates just enough of an EVM chain for plans to run
//! without a node: deterministic `CREATE` addresses, ERC-1967 proxy slots,
//! beacons, one-shot initializers and reverts. The CLI uses it for dry runs.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Mutex, MutexGuard},
};

use alloy_core::primitives::{Address, B256, Bytes, TxHash, address, keccak256};

use crate::{
    ContractFactory, DeployError, ProxyKind, ResolvedArg,
    artifact::logical_name_of,
    proxy::{ADMIN_SLOT, BEACON_SLOT, IMPLEMENTATION_SLOT},
    traits::{ArtifactSource, ChainClient, ChainError, Confirmation, PendingTx, TxRequest},
};

/// First development account of Hardhat and Anvil.
pub const DEFAULT_DEPLOYER: Address = address!("f39Fd6e51aad88F6F4ce6aB8827279cffFb92266");

/// Runtime code markers for the contracts the chain creates on its own.
const BEACON_CODE: &[u8] = b"UpgradeableBeacon";
const PROXY_ADMIN_CODE: &[u8] = b"ProxyAdmin";
const PROXY_CODE: &[u8] = b"ERC1967Proxy";

#[derive(Debug)]
enum Receipt {
    Mined(Confirmation),
    Reverted(String),
}

#[derive(Debug, Default)]
struct State {
    nonce: u64,
    block_number: u64,
    code: HashMap<Address, Bytes>,
    storage: HashMap<(Address, B256), B256>,
    beacons: HashMap<Address, Address>,
    initializers: HashMap<Address, Vec<(String, Vec<ResolvedArg>)>>,
    receipts: HashMap<TxHash, Receipt>,
    submitted: Vec<TxRequest>,
    reverting: HashMap<String, String>,
    stalled: bool,
}

impl State {
    fn has_code(&self, address: Address) -> bool {
        self.code.get(&address).is_some_and(|code| !code.is_empty())
    }

    fn slot(&self, address: Address, slot: B256) -> Option<Address> {
        self.storage
            .get(&(address, slot))
            .filter(|word| !word.is_zero())
            .map(|word| Address::from_word(*word))
    }

    fn set_slot(&mut self, address: Address, slot: B256, value: Address) {
        self.storage.insert((address, slot), value.into_word());
    }

    fn install(&mut self, address: Address, code: impl Into<Bytes>) {
        self.code.insert(address, code.into());
    }

    /// Apply the effects of `request`, returning the created address if any.
    fn execute(
        &mut self,
        deployer: Address,
        nonce: u64,
        request: &TxRequest,
    ) -> Result<Option<Address>, String> {
        match request {
            TxRequest::Create {
                artifact, factory, ..
            } => {
                if let Some(reason) = self.reverting.get(&artifact.logical_name) {
                    return Err(reason.clone());
                }
                let created = deployer.create(nonce);
                self.install(created, factory.bytecode.clone());
                Ok(Some(created))
            }
            TxRequest::CreateBeacon { implementation } => {
                if !self.has_code(*implementation) {
                    return Err(format!(
                        "UpgradeableBeacon: implementation {implementation} is not a contract"
                    ));
                }
                let beacon = deployer.create(nonce);
                self.install(beacon, BEACON_CODE);
                self.beacons.insert(beacon, *implementation);
                Ok(Some(beacon))
            }
            TxRequest::CreateProxy {
                kind,
                target,
                initializer,
                ..
            } => {
                if let Some(call) = initializer
                    .as_ref()
                    .filter(|call| call.function.inputs.len() != call.args.len())
                {
                    return Err(format!(
                        "{} expects {} argument(s), got {}",
                        call.function.name,
                        call.function.inputs.len(),
                        call.args.len()
                    ));
                }

                let proxy = deployer.create(nonce);
                match kind {
                    ProxyKind::Uups | ProxyKind::Transparent => {
                        if !self.has_code(*target) {
                            return Err(format!(
                                "ERC1967: new implementation {target} is not a contract"
                            ));
                        }
                        self.set_slot(proxy, IMPLEMENTATION_SLOT, *target);
                        if *kind == ProxyKind::Transparent {
                            // The proxy constructor deploys its own admin.
                            let admin = proxy.create(1);
                            self.install(admin, PROXY_ADMIN_CODE);
                            self.set_slot(proxy, ADMIN_SLOT, admin);
                        }
                    }
                    ProxyKind::Beacon => {
                        if !self.beacons.contains_key(target) {
                            return Err(format!("ERC1967: new beacon {target} is not a contract"));
                        }
                        self.set_slot(proxy, BEACON_SLOT, *target);
                    }
                }
                self.install(proxy, PROXY_CODE);

                if let Some(call) = initializer {
                    self.initializers
                        .entry(proxy)
                        .or_default()
                        .push((call.function.name.clone(), call.args.clone()));
                }
                Ok(Some(proxy))
            }
            TxRequest::Upgrade {
                proxy,
                kind,
                via,
                implementation,
                ..
            } => {
                if !self.has_code(*implementation) {
                    return Err(format!(
                        "ERC1967: new implementation {implementation} is not a contract"
                    ));
                }
                match kind {
                    ProxyKind::Uups => {
                        if via != proxy || self.slot(*proxy, IMPLEMENTATION_SLOT).is_none() {
                            return Err(format!("{proxy} is not a UUPS proxy"));
                        }
                        self.set_slot(*proxy, IMPLEMENTATION_SLOT, *implementation);
                    }
                    ProxyKind::Transparent => {
                        if self.slot(*proxy, ADMIN_SLOT) != Some(*via) {
                            return Err(format!("{via} is not the admin of {proxy}"));
                        }
                        self.set_slot(*proxy, IMPLEMENTATION_SLOT, *implementation);
                    }
                    ProxyKind::Beacon => {
                        if self.slot(*proxy, BEACON_SLOT) != Some(*via) {
                            return Err(format!("{via} is not the beacon of {proxy}"));
                        }
                        let Some(current) = self.beacons.get_mut(via) else {
                            return Err(format!("{via} is not a beacon"));
                        };
                        *current = *implementation;
                    }
                }
                Ok(None)
            }
        }
    }
}

/// A simulated chain with a single unlocked deployer account.
///
/// Every transaction is mined into its own block as soon as it is submitted.
/// Failed transactions still consume a nonce, as they would on a real chain.
#[derive(Debug)]
pub struct MemoryChain {
    deployer: Address,
    state: Mutex<State>,
}

impl Default for MemoryChain {
    fn default() -> Self {
        Self::new(DEFAULT_DEPLOYER)
    }
}

impl MemoryChain {
    pub fn new(deployer: Address) -> Self {
        Self {
            deployer,
            state: Mutex::default(),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // Every mutation completes before the guard drops, so a poisoned lock
        // still holds consistent state.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Place `code` at `address`, as if deployed by an earlier run.
    pub fn install_code(&self, address: Address, code: impl Into<Bytes>) {
        self.state().install(address, code);
    }

    /// Make every deployment of `logical_name` revert with `reason`.
    pub fn revert_deployments_of(&self, logical_name: &str, reason: &str) {
        self.state()
            .reverting
            .insert(logical_name.to_string(), reason.to_string());
    }

    /// While stalled, confirmations never arrive.
    pub fn stall_confirmations(&self, stalled: bool) {
        self.state().stalled = stalled;
    }

    /// Runtime code at `address`.
    pub fn code_of(&self, address: Address) -> Bytes {
        self.state().code.get(&address).cloned().unwrap_or_default()
    }

    /// Every request submitted so far, in order.
    pub fn submitted(&self) -> Vec<TxRequest> {
        self.state().submitted.clone()
    }

    /// The initializer run through `proxy`, with its arguments.
    pub fn initializer_call(&self, proxy: Address) -> Option<(String, Vec<ResolvedArg>)> {
        self.state()
            .initializers
            .get(&proxy)
            .and_then(|calls| calls.first().cloned())
    }

    /// How many times an initializer ran through `proxy`.
    pub fn initializer_count(&self, proxy: Address) -> usize {
        self.state().initializers.get(&proxy).map_or(0, Vec::len)
    }
}

impl ChainClient for MemoryChain {
    async fn submit(&self, request: TxRequest) -> Result<PendingTx, ChainError> {
        let mut state = self.state();
        let nonce = state.nonce;
        state.nonce += 1;
        state.block_number += 1;

        let mut preimage = self.deployer.to_vec();
        preimage.extend_from_slice(&nonce.to_be_bytes());
        let tx_hash = keccak256(preimage);

        let receipt = match state.execute(self.deployer, nonce, &request) {
            Ok(contract_address) => Receipt::Mined(Confirmation {
                tx_hash,
                contract_address,
                block_number: Some(state.block_number),
            }),
            Err(reason) => Receipt::Reverted(reason),
        };
        state.receipts.insert(tx_hash, receipt);
        state.submitted.push(request);

        Ok(PendingTx { tx_hash })
    }

    async fn await_confirmation(&self, pending: &PendingTx) -> Result<Confirmation, ChainError> {
        let outcome = {
            let state = self.state();
            if state.stalled {
                None
            } else {
                Some(match state.receipts.get(&pending.tx_hash) {
                    Some(Receipt::Mined(confirmation)) => Ok(*confirmation),
                    Some(Receipt::Reverted(reason)) => Err(ChainError::Reverted {
                        tx_hash: Some(pending.tx_hash),
                        reason: reason.clone(),
                    }),
                    None => Err(ChainError::Transport(anyhow::anyhow!(
                        "unknown transaction {}",
                        pending.tx_hash
                    ))),
                })
            }
        };

        match outcome {
            Some(result) => result,
            None => std::future::pending().await,
        }
    }

    async fn get_current_implementation(&self, proxy: Address) -> Result<Address, ChainError> {
        let state = self.state();
        let implementation = match state.slot(proxy, BEACON_SLOT) {
            Some(beacon) => state.beacons.get(&beacon).copied(),
            None => state.slot(proxy, IMPLEMENTATION_SLOT),
        };
        implementation.ok_or_else(|| ChainError::Reverted {
            tx_hash: None,
            reason: format!("{proxy} is not a proxy"),
        })
    }

    async fn storage_at(&self, address: Address, slot: B256) -> Result<B256, ChainError> {
        Ok(self
            .state()
            .storage
            .get(&(address, slot))
            .copied()
            .unwrap_or_default())
    }

    async fn code_at(&self, address: Address) -> Result<Bytes, ChainError> {
        Ok(self.code_of(address))
    }
}

/// Artifacts held in memory, keyed by fully qualified source path
/// (`contracts/Token.sol:Token`).
#[derive(Debug, Clone, Default)]
pub struct StaticArtifacts {
    contracts: BTreeMap<String, ContractFactory>,
}

impl StaticArtifacts {
    /// Register `factory` under `source_path`. The logical name is the part after `:`.
    pub fn with_contract(mut self, source_path: impl Into<String>, factory: ContractFactory) -> Self {
        self.contracts.insert(source_path.into(), factory);
        self
    }
}

impl ArtifactSource for StaticArtifacts {
    fn source_paths(&self, logical_name: &str) -> Vec<String> {
        self.contracts
            .keys()
            .filter(|path| logical_name_of(path) == logical_name)
            .cloned()
            .collect()
    }

    fn get_factory(&self, source_path: &str) -> Result<ContractFactory, DeployError> {
        self.contracts
            .get(source_path)
            .cloned()
            .ok_or_else(|| DeployError::ArtifactNotFound(source_path.to_string()))
    }
}
