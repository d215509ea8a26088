use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use num_bigint::BigUint;
use serde::Deserialize;
use serde_json::json;

use crate::chain::adapter::{
	BlockInfo, ChainClient, ChainError, PoolInfo, TxRecord, TxRequest, TxStatus,
};
use crate::chain::rpc::{
	AbiToken, RpcClient, decode_address, decode_bytes, decode_string, decode_uint, encode_bytes,
	encode_call, parse_quantity, parse_u64, to_quantity, u64_quantity,
};
use crate::config::ChainConfig;

const CONFIRMATION_POLL_INTERVAL: Duration = Duration::from_secs(2);
const CONFIRMATION_MAX_POLLS: u32 = 30;

/// JSON-RPC client for EVM-dialect chains. Transactions are signed by the
/// node the endpoint points at; the gateway never holds raw signing state
/// outside configuration.
pub struct EthereumChain {
	name: String,
	rpc: RpcClient,
	chain_id: u64,
	network_name: String,
	decimals: u32,
	gas_limit: u64,
	gas_price: BigUint,
	from_address: Option<String>,
	confirmations: u64,
	connected: AtomicBool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcBlock {
	number: String,
	hash: String,
	parent_hash: String,
	timestamp: String,
	#[serde(default)]
	transactions: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcTransaction {
	hash: String,
	#[serde(default)]
	from: Option<String>,
	#[serde(default)]
	to: Option<String>,
	value: String,
	#[serde(default)]
	gas: Option<String>,
	#[serde(default)]
	gas_price: Option<String>,
	#[serde(default)]
	nonce: Option<String>,
	#[serde(default)]
	block_number: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
	#[serde(default)]
	status: Option<String>,
}

impl EthereumChain {
	pub fn new(name: &str, config: &ChainConfig) -> Self {
		let gas_price = BigUint::parse_bytes(config.gas_price.as_bytes(), 10)
			.unwrap_or(BigUint::from(1_000_000_000u64));
		Self {
			name: name.to_string(),
			rpc: RpcClient::new(&config.rpc_endpoint, Duration::from_secs(30)),
			chain_id: config.chain_id,
			network_name: if config.network_name.is_empty() {
				name.to_string()
			} else {
				config.network_name.clone()
			},
			decimals: config.decimals,
			gas_limit: config.gas_limit,
			gas_price,
			from_address: config.public_key.clone(),
			confirmations: config.confirmations,
			connected: AtomicBool::new(false),
		}
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn default_confirmations(&self) -> u64 {
		self.confirmations
	}

	fn require_connected(&self) -> Result<(), ChainError> {
		if !self.connected.load(Ordering::Relaxed) {
			return Err(ChainError::Unavailable(self.name.clone()));
		}
		Ok(())
	}

	fn tx_params(&self, tx: &TxRequest) -> serde_json::Value {
		let mut params = serde_json::Map::new();
		let from = tx.from.clone().or(self.from_address.clone());
		if let Some(from) = from {
			params.insert("from".to_string(), json!(from));
		}
		if let Some(to) = &tx.to {
			params.insert("to".to_string(), json!(to));
		}
		params.insert("value".to_string(), json!(to_quantity(&tx.value)));
		params.insert(
			"gas".to_string(),
			json!(u64_quantity(tx.gas_limit.unwrap_or(self.gas_limit))),
		);
		params.insert(
			"gasPrice".to_string(),
			json!(to_quantity(tx.gas_price.as_ref().unwrap_or(&self.gas_price))),
		);
		if let Some(nonce) = tx.nonce {
			params.insert("nonce".to_string(), json!(u64_quantity(nonce)));
		}
		if !tx.data.is_empty() {
			params.insert("data".to_string(), json!(encode_bytes(&tx.data)));
		}
		serde_json::Value::Object(params)
	}

	async fn receipt_status(&self, hash: &str) -> Result<TxStatus, ChainError> {
		let receipt: Option<RpcReceipt> = self
			.rpc
			.call("eth_getTransactionReceipt", json!([hash]))
			.await?;
		Ok(match receipt.and_then(|r| r.status) {
			Some(status) if status == "0x0" => TxStatus::Failed,
			Some(_) => TxStatus::Confirmed,
			None => TxStatus::Pending,
		})
	}

	async fn block_timestamp(&self, number: u64) -> Option<u64> {
		let block: Option<RpcBlock> = self
			.rpc
			.call("eth_getBlockByNumber", json!([u64_quantity(number), false]))
			.await
			.ok()?;
		block.and_then(|b| parse_u64(&b.timestamp).ok())
	}

	async fn record_from(&self, raw: RpcTransaction) -> Result<TxRecord, ChainError> {
		let block_number = match &raw.block_number {
			Some(n) => Some(parse_u64(n)?),
			None => None,
		};
		let status = match block_number {
			Some(_) => self.receipt_status(&raw.hash).await?,
			None => TxStatus::Pending,
		};
		let timestamp = match block_number {
			Some(n) => self.block_timestamp(n).await,
			None => None,
		};
		Ok(TxRecord {
			hash: raw.hash,
			from: raw.from,
			to: raw.to,
			value: parse_quantity(&raw.value)?,
			gas_limit: raw.gas.as_deref().map(parse_u64).transpose()?,
			gas_price: raw.gas_price.as_deref().map(parse_quantity).transpose()?,
			nonce: raw.nonce.as_deref().map(parse_u64).transpose()?,
			block_number,
			status,
			timestamp,
		})
	}

	async fn execute_encoded(
		&self,
		contract: &str,
		signature: &str,
		args: &[AbiToken],
	) -> Result<String, ChainError> {
		let data = encode_call(signature, args)?;
		self.execute_contract(contract, &data, &BigUint::ZERO).await
	}

	async fn call_encoded(
		&self,
		contract: &str,
		signature: &str,
		args: &[AbiToken],
	) -> Result<Vec<u8>, ChainError> {
		let data = encode_call(signature, args)?;
		self.call_contract(contract, &data).await
	}
}

#[async_trait]
impl ChainClient for EthereumChain {
	async fn connect(&self) -> Result<(), ChainError> {
		let chain_id: String = self
			.rpc
			.call("eth_chainId", json!([]))
			.await
			.map_err(|e| ChainError::Unavailable(format!("{}: {e}", self.name)))?;
		let remote = parse_u64(&chain_id)?;
		if self.chain_id != 0 && remote != self.chain_id {
			tracing::warn!(
				chain = %self.name,
				configured = self.chain_id,
				remote,
				"chain id mismatch, proceeding with the remote value"
			);
		}
		self.connected.store(true, Ordering::Relaxed);
		tracing::info!(chain = %self.name, endpoint = %self.rpc.endpoint(), chain_id = remote, "chain connected");
		Ok(())
	}

	async fn disconnect(&self) {
		self.connected.store(false, Ordering::Relaxed);
	}

	fn is_connected(&self) -> bool {
		self.connected.load(Ordering::Relaxed)
	}

	fn native_decimals(&self) -> u32 {
		self.decimals
	}

	fn network_name(&self) -> &str {
		&self.network_name
	}

	async fn get_chain_id(&self) -> Result<u64, ChainError> {
		self.require_connected()?;
		let id: String = self.rpc.call("eth_chainId", json!([])).await?;
		Ok(parse_u64(&id)?)
	}

	async fn get_block_number(&self) -> Result<u64, ChainError> {
		self.require_connected()?;
		let number: String = self.rpc.call("eth_blockNumber", json!([])).await?;
		Ok(parse_u64(&number)?)
	}

	async fn get_block(&self, number: Option<u64>) -> Result<BlockInfo, ChainError> {
		self.require_connected()?;
		let tag = match number {
			Some(n) => u64_quantity(n),
			None => "latest".to_string(),
		};
		let block: Option<RpcBlock> = self
			.rpc
			.call("eth_getBlockByNumber", json!([tag, false]))
			.await?;
		let block = block.ok_or(ChainError::Invalid(format!(
			"block {:?} not found",
			number
		)))?;
		Ok(BlockInfo {
			number: parse_u64(&block.number)?,
			hash: block.hash,
			parent_hash: block.parent_hash,
			timestamp: parse_u64(&block.timestamp)?,
			transaction_count: block.transactions.len(),
		})
	}

	async fn get_balance(&self, address: &str) -> Result<BigUint, ChainError> {
		self.require_connected()?;
		let balance: String = self
			.rpc
			.call("eth_getBalance", json!([address, "latest"]))
			.await?;
		Ok(parse_quantity(&balance)?)
	}

	async fn get_token_balance(&self, token: &str, address: &str) -> Result<BigUint, ChainError> {
		let data = self
			.call_encoded(
				token,
				"balanceOf(address)",
				&[AbiToken::Address(address.to_string())],
			)
			.await?;
		Ok(decode_uint(&data)?)
	}

	async fn get_nonce(&self, address: &str) -> Result<u64, ChainError> {
		self.require_connected()?;
		let nonce: String = self
			.rpc
			.call("eth_getTransactionCount", json!([address, "pending"]))
			.await?;
		Ok(parse_u64(&nonce)?)
	}

	async fn send_transaction(&self, tx: &TxRequest) -> Result<String, ChainError> {
		self.require_connected()?;
		let hash: String = self
			.rpc
			.call("eth_sendTransaction", json!([self.tx_params(tx)]))
			.await?;
		Ok(hash)
	}

	async fn get_transaction(&self, hash: &str) -> Result<Option<TxRecord>, ChainError> {
		self.require_connected()?;
		let raw: Option<RpcTransaction> = self
			.rpc
			.call("eth_getTransactionByHash", json!([hash]))
			.await?;
		match raw {
			Some(raw) => Ok(Some(self.record_from(raw).await?)),
			None => Ok(None),
		}
	}

	async fn wait_for_confirmation(
		&self,
		hash: &str,
		confirmations: u64,
	) -> Result<TxRecord, ChainError> {
		for _ in 0..CONFIRMATION_MAX_POLLS {
			if let Some(record) = self.get_transaction(hash).await? {
				if let Some(mined_at) = record.block_number {
					let head = self.get_block_number().await?;
					if head + 1 >= mined_at + confirmations {
						return Ok(record);
					}
				}
			}
			tokio::time::sleep(CONFIRMATION_POLL_INTERVAL).await;
		}
		Err(ChainError::Unavailable(format!(
			"{hash} unconfirmed after {} polls",
			CONFIRMATION_MAX_POLLS
		)))
	}

	async fn estimate_gas(&self, tx: &TxRequest) -> Result<u64, ChainError> {
		self.require_connected()?;
		let estimate: String = self
			.rpc
			.call("eth_estimateGas", json!([self.tx_params(tx)]))
			.await?;
		Ok(parse_u64(&estimate)?)
	}

	async fn call_contract(&self, address: &str, data: &[u8]) -> Result<Vec<u8>, ChainError> {
		self.require_connected()?;
		let result: String = self
			.rpc
			.call(
				"eth_call",
				json!([{"to": address, "data": encode_bytes(data)}, "latest"]),
			)
			.await?;
		Ok(decode_bytes(&result)?)
	}

	async fn execute_contract(
		&self,
		address: &str,
		data: &[u8],
		value: &BigUint,
	) -> Result<String, ChainError> {
		self
			.send_transaction(&TxRequest {
				to: Some(address.to_string()),
				value: value.clone(),
				data: data.to_vec(),
				..Default::default()
			})
			.await
	}

	async fn deploy_contract(&self, bytecode: &[u8]) -> Result<String, ChainError> {
		if bytecode.is_empty() {
			return Err(ChainError::Invalid("empty contract bytecode".to_string()));
		}
		self
			.send_transaction(&TxRequest {
				data: bytecode.to_vec(),
				..Default::default()
			})
			.await
	}

	async fn transfer_token(
		&self,
		token: &str,
		to: &str,
		amount: &BigUint,
	) -> Result<String, ChainError> {
		self
			.execute_encoded(
				token,
				"transfer(address,uint256)",
				&[
					AbiToken::Address(to.to_string()),
					AbiToken::Uint(amount.clone()),
				],
			)
			.await
	}

	async fn approve_token(
		&self,
		token: &str,
		spender: &str,
		amount: &BigUint,
	) -> Result<String, ChainError> {
		self
			.execute_encoded(
				token,
				"approve(address,uint256)",
				&[
					AbiToken::Address(spender.to_string()),
					AbiToken::Uint(amount.clone()),
				],
			)
			.await
	}

	async fn mint_nft(
		&self,
		contract: &str,
		to: &str,
		token_uri: &str,
	) -> Result<String, ChainError> {
		self
			.execute_encoded(
				contract,
				"mint(address,string)",
				&[
					AbiToken::Address(to.to_string()),
					AbiToken::Str(token_uri.to_string()),
				],
			)
			.await
	}

	async fn transfer_nft(
		&self,
		contract: &str,
		to: &str,
		token_id: &BigUint,
	) -> Result<String, ChainError> {
		let from = self
			.from_address
			.clone()
			.ok_or(ChainError::Invalid("no sender address configured".to_string()))?;
		self
			.execute_encoded(
				contract,
				"transferFrom(address,address,uint256)",
				&[
					AbiToken::Address(from),
					AbiToken::Address(to.to_string()),
					AbiToken::Uint(token_id.clone()),
				],
			)
			.await
	}

	async fn nft_metadata(&self, contract: &str, token_id: &BigUint) -> Result<String, ChainError> {
		let data = self
			.call_encoded(
				contract,
				"tokenURI(uint256)",
				&[AbiToken::Uint(token_id.clone())],
			)
			.await?;
		Ok(decode_string(&data)?)
	}

	async fn nft_owner(&self, contract: &str, token_id: &BigUint) -> Result<String, ChainError> {
		let data = self
			.call_encoded(
				contract,
				"ownerOf(uint256)",
				&[AbiToken::Uint(token_id.clone())],
			)
			.await?;
		Ok(decode_address(&data)?)
	}

	async fn pool_info(&self, pool: &str) -> Result<PoolInfo, ChainError> {
		let token_a = decode_address(&self.call_encoded(pool, "token0()", &[]).await?)?;
		let token_b = decode_address(&self.call_encoded(pool, "token1()", &[]).await?)?;
		let reserves = self.call_encoded(pool, "getReserves()", &[]).await?;
		if reserves.len() < 64 {
			return Err(ChainError::Rpc(crate::chain::rpc::RpcError::Malformed(
				"short getReserves return".to_string(),
			)));
		}
		Ok(PoolInfo {
			token_a,
			token_b,
			reserve_a: decode_uint(&reserves[..32])?,
			reserve_b: decode_uint(&reserves[32..64])?,
		})
	}

	async fn swap(
		&self,
		pool: &str,
		token_in: &str,
		amount_in: &BigUint,
		min_out: &BigUint,
	) -> Result<String, ChainError> {
		self
			.execute_encoded(
				pool,
				"swap(address,uint256,uint256)",
				&[
					AbiToken::Address(token_in.to_string()),
					AbiToken::Uint(amount_in.clone()),
					AbiToken::Uint(min_out.clone()),
				],
			)
			.await
	}

	async fn add_liquidity(
		&self,
		pool: &str,
		amount_a: &BigUint,
		amount_b: &BigUint,
	) -> Result<String, ChainError> {
		self
			.execute_encoded(
				pool,
				"addLiquidity(uint256,uint256)",
				&[
					AbiToken::Uint(amount_a.clone()),
					AbiToken::Uint(amount_b.clone()),
				],
			)
			.await
	}

	async fn remove_liquidity(&self, pool: &str, liquidity: &BigUint) -> Result<String, ChainError> {
		self
			.execute_encoded(
				pool,
				"removeLiquidity(uint256)",
				&[AbiToken::Uint(liquidity.clone())],
			)
			.await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::{ChainKind, ContractAddresses};
	use serde_json::json;
	use wiremock::matchers::{body_partial_json, method};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	fn config(endpoint: &str) -> ChainConfig {
		ChainConfig {
			kind: ChainKind::Ethereum,
			rpc_endpoint: endpoint.to_string(),
			chain_id: 1337,
			network_name: "devnet".to_string(),
			private_key: None,
			public_key: Some("0x00000000000000000000000000000000000000f0".to_string()),
			contracts: ContractAddresses::default(),
			gas_limit: 500_000,
			gas_price: "1000000000".to_string(),
			confirmations: 1,
			decimals: 18,
			custom: Default::default(),
		}
	}

	fn rpc_result(value: serde_json::Value) -> ResponseTemplate {
		ResponseTemplate::new(200).set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": value}))
	}

	async fn connected_chain(server: &MockServer) -> EthereumChain {
		Mock::given(method("POST"))
			.and(body_partial_json(json!({"method": "eth_chainId"})))
			.respond_with(rpc_result(json!("0x539")))
			.mount(server)
			.await;
		let chain = EthereumChain::new("ethereum", &config(&server.uri()));
		chain.connect().await.unwrap();
		chain
	}

	#[tokio::test]
	async fn operations_require_a_connection() {
		let chain = EthereumChain::new("ethereum", &config("http://127.0.0.1:1"));
		let err = chain.get_block_number().await.unwrap_err();
		assert!(matches!(err, ChainError::Unavailable(_)));
	}

	#[tokio::test]
	async fn balance_is_an_exact_big_integer() {
		let server = MockServer::start().await;
		let chain = connected_chain(&server).await;

		// 123456789012345678901234567890 = 0x18ee90ff6c373e0ee4e3f0ad2
		Mock::given(method("POST"))
			.and(body_partial_json(json!({"method": "eth_getBalance"})))
			.respond_with(rpc_result(json!("0x18ee90ff6c373e0ee4e3f0ad2")))
			.mount(&server)
			.await;

		let balance = chain.get_balance("0xabc").await.unwrap();
		assert_eq!(balance.to_string(), "123456789012345678901234567890");
	}

	#[tokio::test]
	async fn send_transaction_returns_the_hash() {
		let server = MockServer::start().await;
		let chain = connected_chain(&server).await;

		Mock::given(method("POST"))
			.and(body_partial_json(json!({"method": "eth_sendTransaction"})))
			.respond_with(rpc_result(json!("0xdeadbeef")))
			.mount(&server)
			.await;

		let hash = chain
			.send_transaction(&TxRequest {
				to: Some("0xabc".to_string()),
				value: BigUint::from(1000u32),
				..Default::default()
			})
			.await
			.unwrap();
		assert_eq!(hash, "0xdeadbeef");
	}

	#[tokio::test]
	async fn unmined_transactions_are_pending() {
		let server = MockServer::start().await;
		let chain = connected_chain(&server).await;

		Mock::given(method("POST"))
			.and(body_partial_json(json!({"method": "eth_getTransactionByHash"})))
			.respond_with(rpc_result(json!({
				"hash": "0xdeadbeef",
				"from": "0xf0",
				"to": "0xabc",
				"value": "0x3e8",
				"gas": "0x5208",
				"nonce": "0x1",
				"blockNumber": null
			})))
			.mount(&server)
			.await;

		let record = chain.get_transaction("0xdeadbeef").await.unwrap().unwrap();
		assert_eq!(record.status, TxStatus::Pending);
		assert_eq!(record.value, BigUint::from(1000u32));
		assert_eq!(record.block_number, None);
	}

	#[tokio::test]
	async fn missing_transactions_are_none() {
		let server = MockServer::start().await;
		let chain = connected_chain(&server).await;

		Mock::given(method("POST"))
			.and(body_partial_json(json!({"method": "eth_getTransactionByHash"})))
			.respond_with(rpc_result(json!(null)))
			.mount(&server)
			.await;

		assert!(chain.get_transaction("0x404").await.unwrap().is_none());
	}

	#[tokio::test]
	async fn token_balance_goes_through_eth_call() {
		let server = MockServer::start().await;
		let chain = connected_chain(&server).await;

		Mock::given(method("POST"))
			.and(body_partial_json(json!({"method": "eth_call"})))
			.respond_with(rpc_result(json!(
				"0x00000000000000000000000000000000000000000000000000000000000003e8"
			)))
			.mount(&server)
			.await;

		let balance = chain
			.get_token_balance(
				"0x00000000000000000000000000000000000000aa",
				"0x00000000000000000000000000000000000000bb",
			)
			.await
			.unwrap();
		assert_eq!(balance, BigUint::from(1000u32));
	}
}
