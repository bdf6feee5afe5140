//! [`ChainClient`] over Ethereum JSON-RPC.
//!
//! Transactions are sent with `eth_sendTransaction`, so the node must hold an
//! unlocked account for the sender (Anvil, Hardhat node, or a signing proxy in
//! front of a remote node).

use std::time::Duration;

use alloy_core::{
    dyn_abi::{DynSolType, DynSolValue, JsonAbiExt, Specifier},
    json_abi::{Function, Param},
    primitives::{Address, B256, Bytes, TxHash, U64},
};
use anyhow::Context;
use serde::Deserialize;
use url::Url;

use crate::{
    ArtifactResolver, ContractFactory, ProxyKind, ResolvedArg,
    proxy::{BEACON_SLOT, IMPLEMENTATION_SLOT},
    rpc::{self, RpcError, RpcTransport},
    traits::{
        ArtifactSource, ChainClient, ChainError, Confirmation, InitializerCall, PendingTx,
        TxRequest,
    },
};

/// Creation code of the OpenZeppelin proxy contracts, taken from the project's
/// artifacts. A kind whose contracts are missing cannot be deployed.
#[derive(Debug, Clone, Default)]
pub struct ProxyFactories {
    pub erc1967: Option<ContractFactory>,
    pub transparent: Option<ContractFactory>,
    pub beacon: Option<ContractFactory>,
    pub beacon_proxy: Option<ContractFactory>,
}

impl ProxyFactories {
    /// Look the proxy contracts up by their OpenZeppelin names.
    pub fn load<A: ArtifactSource>(resolver: &ArtifactResolver<A>) -> Self {
        let find = |name: &str| {
            resolver
                .resolve(name, None)
                .and_then(|artifact| resolver.factory(&artifact))
                .inspect_err(|err| {
                    tracing::debug!(contract = name, error = %err, "Proxy contract unavailable");
                })
                .ok()
        };

        Self {
            erc1967: find("ERC1967Proxy"),
            transparent: find("TransparentUpgradeableProxy"),
            beacon: find("UpgradeableBeacon"),
            beacon_proxy: find("BeaconProxy"),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Receipt {
    transaction_hash: TxHash,
    #[serde(default)]
    status: Option<U64>,
    #[serde(default)]
    contract_address: Option<Address>,
    #[serde(default)]
    block_number: Option<U64>,
}

/// Chain client backed by a JSON-RPC node.
#[derive(Debug)]
pub struct RpcChainClient {
    rpc: RpcTransport,
    sender: Address,
    proxies: ProxyFactories,
    poll_interval: Duration,
}

impl RpcChainClient {
    pub fn new(rpc: RpcTransport, sender: Address, proxies: ProxyFactories) -> Self {
        Self {
            rpc,
            sender,
            proxies,
            poll_interval: rpc::DEFAULT_POLL_INTERVAL,
        }
    }

    /// Connect to `url`, wait for it to answer and pick the sender: `sender`
    /// when given, otherwise the node's first account.
    pub async fn connect(
        url: Url,
        sender: Option<Address>,
        proxies: ProxyFactories,
        ready_timeout: Duration,
    ) -> Result<Self, anyhow::Error> {
        let rpc = RpcTransport::new(url, rpc::DEFAULT_TIMEOUT)?;
        let chain_id = rpc.wait_until_ready(ready_timeout).await?;

        let sender = match sender {
            Some(sender) => sender,
            None => {
                let accounts: Vec<Address> = rpc
                    .call("eth_accounts", Vec::new())
                    .await
                    .context("Failed to list node accounts")?;
                *accounts
                    .first()
                    .context("Node has no unlocked account, configure a sender")?
            }
        };

        tracing::info!(url = %rpc.url(), chain_id, %sender, "Connected to chain");

        Ok(Self::new(rpc, sender, proxies))
    }

    /// Interval between receipt polls.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn sender(&self) -> Address {
        self.sender
    }

    fn proxy_factory<'a>(
        factory: &'a Option<ContractFactory>,
        contract: &str,
    ) -> Result<&'a ContractFactory, ChainError> {
        factory.as_ref().ok_or_else(|| {
            ChainError::Transport(anyhow::anyhow!(
                "no {contract} artifact available, compile the OpenZeppelin proxy contracts"
            ))
        })
    }

    /// Recipient and calldata of `request`. `None` as recipient creates a contract.
    fn encode(&self, request: &TxRequest) -> Result<(Option<Address>, Bytes), ChainError> {
        match request {
            TxRequest::Create { factory, args, .. } => {
                let inputs = factory
                    .abi
                    .constructor
                    .as_ref()
                    .map_or(&[][..], |constructor| constructor.inputs.as_slice());
                let values = coerce_args(inputs, args)?;
                Ok((None, creation_code(factory, values)))
            }
            TxRequest::CreateBeacon { implementation } => {
                let factory = Self::proxy_factory(&self.proxies.beacon, "UpgradeableBeacon")?;
                let values = vec![
                    DynSolValue::Address(*implementation),
                    DynSolValue::Address(self.sender),
                ];
                Ok((None, creation_code(factory, values)))
            }
            TxRequest::CreateProxy {
                kind,
                target,
                initializer,
                unsafe_allow,
            } => {
                if !unsafe_allow.is_empty() {
                    tracing::debug!(?unsafe_allow, "Unsafe patterns acknowledged for proxy");
                }
                let data = DynSolValue::Bytes(match initializer {
                    Some(call) => encode_call(call)?.to_vec(),
                    None => Vec::new(),
                });
                let (factory, values) = match kind {
                    ProxyKind::Uups => (
                        Self::proxy_factory(&self.proxies.erc1967, "ERC1967Proxy")?,
                        vec![DynSolValue::Address(*target), data],
                    ),
                    ProxyKind::Transparent => (
                        Self::proxy_factory(
                            &self.proxies.transparent,
                            "TransparentUpgradeableProxy",
                        )?,
                        vec![
                            DynSolValue::Address(*target),
                            DynSolValue::Address(self.sender),
                            data,
                        ],
                    ),
                    ProxyKind::Beacon => (
                        Self::proxy_factory(&self.proxies.beacon_proxy, "BeaconProxy")?,
                        vec![DynSolValue::Address(*target), data],
                    ),
                };
                Ok((None, creation_code(factory, values)))
            }
            TxRequest::Upgrade {
                proxy,
                kind,
                via,
                implementation,
                ..
            } => {
                let (signature, values) = match kind {
                    ProxyKind::Uups => (
                        "function upgradeToAndCall(address newImplementation, bytes data)",
                        vec![
                            DynSolValue::Address(*implementation),
                            DynSolValue::Bytes(Vec::new()),
                        ],
                    ),
                    ProxyKind::Transparent => (
                        "function upgradeAndCall(address proxy, address implementation, bytes data)",
                        vec![
                            DynSolValue::Address(*proxy),
                            DynSolValue::Address(*implementation),
                            DynSolValue::Bytes(Vec::new()),
                        ],
                    ),
                    ProxyKind::Beacon => (
                        "function upgradeTo(address newImplementation)",
                        vec![DynSolValue::Address(*implementation)],
                    ),
                };
                Ok((Some(*via), encode_signature(signature, &values)?))
            }
        }
    }

    async fn eth_call(&self, to: Address, data: Bytes) -> Result<Bytes, ChainError> {
        self.rpc
            .call(
                "eth_call",
                vec![
                    serde_json::json!({ "to": to, "data": data }),
                    serde_json::json!("latest"),
                ],
            )
            .await
            .map_err(|err| read_error(err, "eth_call"))
    }
}

impl ChainClient for RpcChainClient {
    async fn submit(&self, request: TxRequest) -> Result<PendingTx, ChainError> {
        let (to, data) = self.encode(&request)?;

        let mut tx = serde_json::json!({ "from": self.sender, "data": data });
        if let Some(to) = to {
            tx["to"] = serde_json::json!(to);
        }

        let tx_hash: TxHash = self
            .rpc
            .call("eth_sendTransaction", vec![tx])
            .await
            .map_err(|err| match err {
                err @ RpcError::Node { .. } if err.is_revert() => ChainError::Reverted {
                    tx_hash: None,
                    reason: revert_reason(&err),
                },
                err => ChainError::Transport(
                    anyhow::Error::new(err).context(format!("Failed to send {}", request.describe())),
                ),
            })?;

        tracing::debug!(%tx_hash, "Transaction sent");
        Ok(PendingTx { tx_hash })
    }

    async fn await_confirmation(&self, pending: &PendingTx) -> Result<Confirmation, ChainError> {
        // The transaction is in flight whatever the node answers, so failed
        // polls are retried rather than abandoning it.
        let receipt: Receipt = rpc::poll_until(self.poll_interval, || async {
            let polled = self
                .rpc
                .call::<Option<Receipt>>(
                    "eth_getTransactionReceipt",
                    vec![serde_json::json!(pending.tx_hash)],
                )
                .await;
            Ok::<_, ChainError>(polled.unwrap_or_else(|err| {
                tracing::warn!(
                    tx_hash = %pending.tx_hash,
                    error = %err,
                    "Failed to poll receipt, retrying"
                );
                None
            }))
        })
        .await?;

        if receipt.status.is_some_and(|status| status.is_zero()) {
            return Err(ChainError::Reverted {
                tx_hash: Some(receipt.transaction_hash),
                reason: "transaction reverted".to_string(),
            });
        }

        Ok(Confirmation {
            tx_hash: receipt.transaction_hash,
            contract_address: receipt.contract_address,
            block_number: receipt.block_number.map(|number| number.to::<u64>()),
        })
    }

    async fn get_current_implementation(&self, proxy: Address) -> Result<Address, ChainError> {
        let beacon = self.storage_at(proxy, BEACON_SLOT).await?;
        if !beacon.is_zero() {
            let data = encode_signature("function implementation() returns (address)", &[])?;
            let output = self.eth_call(Address::from_word(beacon), data).await?;
            return DynSolType::Address
                .abi_decode(&output)
                .ok()
                .and_then(|value| value.as_address())
                .ok_or_else(|| {
                    ChainError::Transport(anyhow::anyhow!(
                        "beacon of {proxy} returned an invalid implementation"
                    ))
                });
        }

        let implementation = self.storage_at(proxy, IMPLEMENTATION_SLOT).await?;
        if implementation.is_zero() {
            return Err(ChainError::Reverted {
                tx_hash: None,
                reason: format!("{proxy} is not a proxy"),
            });
        }
        Ok(Address::from_word(implementation))
    }

    async fn storage_at(&self, address: Address, slot: B256) -> Result<B256, ChainError> {
        self.rpc
            .call(
                "eth_getStorageAt",
                vec![
                    serde_json::json!(address),
                    serde_json::json!(slot),
                    serde_json::json!("latest"),
                ],
            )
            .await
            .map_err(|err| read_error(err, "eth_getStorageAt"))
    }

    async fn code_at(&self, address: Address) -> Result<Bytes, ChainError> {
        self.rpc
            .call(
                "eth_getCode",
                vec![serde_json::json!(address), serde_json::json!("latest")],
            )
            .await
            .map_err(|err| read_error(err, "eth_getCode"))
    }
}

fn read_error(err: RpcError, method: &str) -> ChainError {
    ChainError::Transport(anyhow::Error::new(err).context(format!("{method} failed")))
}

/// Reason string of a revert error, without the node's prefix.
fn revert_reason(err: &RpcError) -> String {
    match err {
        RpcError::Node { message, .. } => message
            .strip_prefix("execution reverted: ")
            .unwrap_or(message)
            .to_string(),
        RpcError::Transport(err) => err.to_string(),
    }
}

/// Coerce plan arguments to the ABI types of `params`.
fn coerce_args(params: &[Param], args: &[ResolvedArg]) -> Result<Vec<DynSolValue>, ChainError> {
    if params.len() != args.len() {
        return Err(ChainError::Transport(anyhow::anyhow!(
            "expected {} argument(s), got {}",
            params.len(),
            args.len()
        )));
    }

    params
        .iter()
        .zip(args)
        .map(|(param, arg)| -> Result<DynSolValue, anyhow::Error> {
            let ty = param
                .resolve()
                .with_context(|| format!("unsupported ABI type `{}`", param.ty))?;
            let value = match arg {
                ResolvedArg::Address(address) => DynSolValue::Address(*address),
                ResolvedArg::Bool(value) => DynSolValue::Bool(*value),
                other => ty
                    .coerce_str(&other.to_string())
                    .with_context(|| format!("`{other}` is not a valid {}", param.ty))?,
            };
            if !value.matches(&ty) {
                anyhow::bail!("`{arg}` is not a valid {}", param.ty);
            }
            Ok(value)
        })
        .collect::<Result<_, _>>()
        .map_err(ChainError::Transport)
}

fn creation_code(factory: &ContractFactory, constructor_args: Vec<DynSolValue>) -> Bytes {
    let mut code = factory.bytecode.to_vec();
    if !constructor_args.is_empty() {
        code.extend(DynSolValue::Tuple(constructor_args).abi_encode_params());
    }
    code.into()
}

fn encode_call(call: &InitializerCall) -> Result<Bytes, ChainError> {
    let values = coerce_args(&call.function.inputs, &call.args)?;
    call.function
        .abi_encode_input(&values)
        .map(Bytes::from)
        .with_context(|| format!("Failed to encode call to {}", call.function.name))
        .map_err(ChainError::Transport)
}

fn encode_signature(signature: &str, values: &[DynSolValue]) -> Result<Bytes, ChainError> {
    Function::parse(signature)
        .with_context(|| format!("invalid signature `{signature}`"))
        .and_then(|function| {
            function
                .abi_encode_input(values)
                .with_context(|| format!("Failed to encode {signature}"))
        })
        .map(Bytes::from)
        .map_err(ChainError::Transport)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_core::{json_abi::JsonAbi, primitives::address};

    fn client() -> RpcChainClient {
        let rpc = RpcTransport::new(
            Url::parse("http://127.0.0.1:8545").expect("valid url"),
            rpc::DEFAULT_TIMEOUT,
        )
        .expect("client");
        let proxy = ContractFactory::new(vec![0xfe], JsonAbi::new());
        RpcChainClient::new(
            rpc,
            address!("f39Fd6e51aad88F6F4ce6aB8827279cffFb92266"),
            ProxyFactories {
                erc1967: Some(proxy.clone()),
                transparent: None,
                beacon: Some(proxy.clone()),
                beacon_proxy: Some(proxy),
            },
        )
    }

    /// Serve one canned HTTP response per connection, in order.
    async fn serve(responses: Vec<(&'static str, String)>) -> Url {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let url = Url::parse(&format!("http://{}", listener.local_addr().expect("addr")))
            .expect("valid url");

        tokio::spawn(async move {
            for (status, body) in responses {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };

                // Read the headers, then as much body as they announce.
                let mut request = Vec::new();
                let mut chunk = [0u8; 4096];
                loop {
                    let read = socket.read(&mut chunk).await.unwrap_or(0);
                    if read == 0 {
                        break;
                    }
                    request.extend_from_slice(&chunk[..read]);
                    let text = String::from_utf8_lossy(&request);
                    if let Some(end) = text.find("\r\n\r\n") {
                        let length = text[..end]
                            .lines()
                            .find_map(|line| {
                                let (name, value) = line.split_once(':')?;
                                name.eq_ignore_ascii_case("content-length")
                                    .then(|| value.trim().parse::<usize>().ok())
                                    .flatten()
                            })
                            .unwrap_or(0);
                        if request.len() >= end + 4 + length {
                            break;
                        }
                    }
                }

                let response = format!(
                    "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        url
    }

    #[tokio::test]
    async fn test_receipt_polling_survives_a_failed_poll() {
        let tx_hash = TxHash::repeat_byte(0xab);
        let created = address!("5FbDB2315678afecb367f032d93F642f64180aa3");
        let receipt = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 2,
            "result": {
                "transactionHash": tx_hash,
                "status": "0x1",
                "contractAddress": created,
                "blockNumber": "0x2a",
            },
        });
        let url = serve(vec![
            ("503 Service Unavailable", "upstream unavailable".to_string()),
            ("200 OK", receipt.to_string()),
        ])
        .await;

        let rpc = RpcTransport::new(url, Duration::from_secs(5)).expect("client");
        let client = RpcChainClient::new(
            rpc,
            address!("f39Fd6e51aad88F6F4ce6aB8827279cffFb92266"),
            ProxyFactories::default(),
        )
        .poll_interval(Duration::from_millis(10));

        let confirmation = tokio::time::timeout(
            Duration::from_secs(10),
            client.await_confirmation(&PendingTx { tx_hash }),
        )
        .await
        .expect("confirmation should arrive")
        .expect("a failed poll is retried");

        assert_eq!(confirmation.tx_hash, tx_hash);
        assert_eq!(confirmation.contract_address, Some(created));
        assert_eq!(confirmation.block_number, Some(42));
    }

    #[test]
    fn test_uups_upgrade_calls_the_proxy() {
        let proxy = address!("Cf7Ed3AccA5a467e9e704C703E8D87F634fB0Fc9");
        let implementation = address!("9fE46736679d2D9a65F0992F2272dE9f3c7fa6e0");

        let (to, data) = client()
            .encode(&TxRequest::Upgrade {
                proxy,
                kind: ProxyKind::Uups,
                via: proxy,
                implementation,
                unsafe_allow: Default::default(),
            })
            .expect("encode");

        assert_eq!(to, Some(proxy));
        // upgradeToAndCall(address,bytes)
        assert_eq!(data[..4], [0x4f, 0x1e, 0xf2, 0x86]);
    }

    #[test]
    fn test_constructor_args_are_coerced_to_abi_types() {
        let abi = JsonAbi::parse(["constructor(address owner, uint256 supply, string name)"])
            .expect("abi");
        let factory = ContractFactory::new(vec![0x60, 0x80], abi);
        let owner = address!("f39Fd6e51aad88F6F4ce6aB8827279cffFb92266");

        let (to, data) = client()
            .encode(&TxRequest::Create {
                artifact: crate::ArtifactRef::new("Token", "contracts/Token.sol:Token"),
                factory,
                args: vec![
                    ResolvedArg::Address(owner),
                    ResolvedArg::Text("30000000000000000000".to_string()),
                    ResolvedArg::Text("Subscription".to_string()),
                ],
            })
            .expect("encode");

        assert_eq!(to, None);
        assert_eq!(data[..2], [0x60, 0x80]);
        assert_eq!(data[2 + 12..2 + 32], owner[..]);
    }

    #[test]
    fn test_argument_type_mismatch_is_rejected() {
        let abi = JsonAbi::parse(["constructor(address owner)"]).expect("abi");
        let factory = ContractFactory::new(vec![0x60, 0x80], abi);

        let result = client().encode(&TxRequest::Create {
            artifact: crate::ArtifactRef::new("Token", "contracts/Token.sol:Token"),
            factory,
            args: vec![ResolvedArg::Bool(true)],
        });

        assert!(result.is_err());
    }

    #[test]
    fn test_missing_proxy_artifact_is_reported() {
        let result = client().encode(&TxRequest::CreateProxy {
            kind: ProxyKind::Transparent,
            target: Address::ZERO,
            initializer: None,
            unsafe_allow: Default::default(),
        });

        assert!(matches!(result, Err(ChainError::Transport(err)) if err.to_string().contains("TransparentUpgradeableProxy")));
    }

    #[test]
    fn test_revert_reason_strips_node_prefix() {
        let err = RpcError::Node {
            code: 3,
            message: "execution reverted: Initializable: contract is already initialized"
                .to_string(),
            data: None,
        };
        assert_eq!(
            revert_reason(&err),
            "Initializable: contract is already initialized"
        );
    }
}
