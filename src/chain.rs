use std::collections::HashMap;
use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use num_bigint::BigUint;
use serde::Deserialize;
use serde_json::json;

use crate::chain::adapter::{Adapter, ChainClient, ChainError, TxRecord, TxRequest};
use crate::chain::rpc::{AbiToken, decode_bytes, decode_uint, encode_call, format_units};
use crate::config::BlockchainConfig;
use crate::errors::GatewayError;
use crate::gateway::AppState;
use crate::metrics::{ChainCall, IncrementRecorder, Metrics};

pub mod adapter;
pub mod ethereum;
pub mod rpc;

/// Contract roles resolved from `blockchain.chains.{name}.contracts`.
#[derive(Clone, Copy, Debug)]
pub enum ContractKey {
	RewardToken,
	IsaToken,
	Billing,
	ServiceNft,
	ServiceRegistry,
	Dex,
}

impl ContractKey {
	fn as_str(&self) -> &'static str {
		match self {
			ContractKey::RewardToken => "reward_token",
			ContractKey::IsaToken => "isa_token",
			ContractKey::Billing => "billing",
			ContractKey::ServiceNft => "service_nft",
			ContractKey::ServiceRegistry => "service_registry",
			ContractKey::Dex => "dex",
		}
	}
}

/// Outcome of a cross-chain transfer orchestration: one transaction on
/// each side, no consensus in between.
#[derive(Clone, Debug)]
pub struct BridgeTransfer {
	pub source_tx: String,
	pub dest_tx: String,
}

/// Chain-agnostic front over the registered adapters. Adapters are fixed
/// after startup; only connection state changes, serialized by a mutex.
pub struct ChainFacade {
	adapters: HashMap<String, Adapter>,
	default_chain: String,
	config: BlockchainConfig,
	connect_lock: tokio::sync::Mutex<()>,
	metrics: Arc<Metrics>,
}

impl ChainFacade {
	pub fn from_config(config: &BlockchainConfig, metrics: Arc<Metrics>) -> anyhow::Result<Self> {
		anyhow::ensure!(
			config.chains.contains_key(&config.default_chain),
			"default chain {} is not configured",
			config.default_chain
		);
		let adapters = config
			.chains
			.iter()
			.map(|(name, chain)| (name.clone(), Adapter::from_config(name, chain)))
			.collect();
		Ok(Self {
			adapters,
			default_chain: config.default_chain.clone(),
			config: config.clone(),
			connect_lock: tokio::sync::Mutex::new(()),
			metrics,
		})
	}

	/// Best-effort startup connect; a chain that stays down yields
	/// ChainUnavailable per request rather than failing the gateway.
	pub async fn connect_all(&self) {
		let _guard = self.connect_lock.lock().await;
		for (name, adapter) in &self.adapters {
			if let Err(e) = adapter.client().connect().await {
				tracing::warn!(chain = %name, error = %e, "chain connect failed");
			}
		}
	}

	pub async fn disconnect_all(&self) {
		let _guard = self.connect_lock.lock().await;
		for adapter in self.adapters.values() {
			adapter.client().disconnect().await;
		}
	}

	pub fn default_chain(&self) -> &str {
		&self.default_chain
	}

	pub fn adapter(&self, name: Option<&str>) -> Result<&Adapter, ChainError> {
		let name = name.unwrap_or(&self.default_chain);
		self
			.adapters
			.get(name)
			.ok_or(ChainError::Config(format!("unknown chain {name}")))
	}

	pub fn default_client(&self) -> Result<&(dyn ChainClient), ChainError> {
		Ok(self.adapter(None)?.client())
	}

	pub fn default_connected(&self) -> bool {
		self
			.adapter(None)
			.map(|a| a.client().is_connected())
			.unwrap_or(false)
	}

	fn contract_for(&self, chain: &str, key: ContractKey) -> Result<String, ChainError> {
		let contracts = &self
			.config
			.chains
			.get(chain)
			.ok_or(ChainError::Config(format!("unknown chain {chain}")))?
			.contracts;
		let address = match key {
			ContractKey::RewardToken | ContractKey::IsaToken => contracts.isa_token.clone(),
			ContractKey::Billing => contracts.usage_billing.clone(),
			ContractKey::ServiceNft => contracts.isa_nft.clone(),
			ContractKey::ServiceRegistry => contracts.service_registry.clone(),
			ContractKey::Dex => contracts.simple_dex.clone(),
		};
		address.ok_or(ChainError::Config(format!(
			"contract {} not configured for chain {chain}",
			key.as_str()
		)))
	}

	fn contract(&self, key: ContractKey) -> Result<String, ChainError> {
		self.contract_for(&self.default_chain, key)
	}

	fn record(&self, operation: &str) {
		self.metrics.increment(&ChainCall {
			chain: self.default_chain.clone(),
			operation: operation.to_string(),
		});
	}

	/// Service rewards are minted on the reward token contract.
	pub async fn mint_reward_tokens(&self, to: &str, amount: &BigUint) -> Result<String, ChainError> {
		self.record("mint_reward_tokens");
		let token = self.contract(ContractKey::RewardToken)?;
		let data = encode_call(
			"mint(address,uint256)",
			&[
				AbiToken::Address(to.to_string()),
				AbiToken::Uint(amount.clone()),
			],
		)?;
		self
			.default_client()?
			.execute_contract(&token, &data, &BigUint::ZERO)
			.await
	}

	/// Usage billing burns service tokens from the consumer's balance.
	pub async fn deduct_service_tokens(
		&self,
		user: &str,
		amount: &BigUint,
	) -> Result<String, ChainError> {
		self.record("deduct_service_tokens");
		let billing = self.contract(ContractKey::Billing)?;
		let data = encode_call(
			"deductTokens(address,uint256)",
			&[
				AbiToken::Address(user.to_string()),
				AbiToken::Uint(amount.clone()),
			],
		)?;
		self
			.default_client()?
			.execute_contract(&billing, &data, &BigUint::ZERO)
			.await
	}

	pub async fn mint_service_certificate(
		&self,
		to: &str,
		token_uri: &str,
	) -> Result<String, ChainError> {
		self.record("mint_service_certificate");
		let nft = self.contract(ContractKey::ServiceNft)?;
		self.default_client()?.mint_nft(&nft, to, token_uri).await
	}

	pub async fn verify_service_access(
		&self,
		user: &str,
		service_id: &BigUint,
	) -> Result<bool, ChainError> {
		self.record("verify_service_access");
		let registry = self.contract(ContractKey::ServiceRegistry)?;
		let data = encode_call(
			"hasAccess(address,uint256)",
			&[
				AbiToken::Address(user.to_string()),
				AbiToken::Uint(service_id.clone()),
			],
		)?;
		let result = self.default_client()?.call_contract(&registry, &data).await?;
		Ok(decode_uint(&result)? != BigUint::ZERO)
	}

	pub async fn swap_tokens_for_service(
		&self,
		amount_in: &BigUint,
		min_out: &BigUint,
	) -> Result<String, ChainError> {
		self.record("swap_tokens_for_service");
		let dex = self.contract(ContractKey::Dex)?;
		let token = self.contract(ContractKey::IsaToken)?;
		self
			.default_client()?
			.swap(&dex, &token, amount_in, min_out)
			.await
	}

	pub async fn get_service_pricing(&self, service_id: &BigUint) -> Result<BigUint, ChainError> {
		self.record("get_service_pricing");
		let registry = self.contract(ContractKey::ServiceRegistry)?;
		let data = encode_call(
			"getServicePrice(uint256)",
			&[AbiToken::Uint(service_id.clone())],
		)?;
		let result = self.default_client()?.call_contract(&registry, &data).await?;
		Ok(decode_uint(&result)?)
	}

	/// Cross-chain transfer: lock (burn) on the source chain, mint on the
	/// destination. The gateway only orchestrates the two adapter calls.
	pub async fn bridge_transfer(
		&self,
		source: &str,
		dest: &str,
		to: &str,
		amount: &BigUint,
	) -> Result<BridgeTransfer, ChainError> {
		self.record("bridge_transfer");
		let source_token = self.contract_for(source, ContractKey::IsaToken)?;
		let dest_token = self.contract_for(dest, ContractKey::IsaToken)?;

		let burn = encode_call("burn(uint256)", &[AbiToken::Uint(amount.clone())])?;
		let source_tx = self
			.adapter(Some(source))?
			.client()
			.execute_contract(&source_token, &burn, &BigUint::ZERO)
			.await?;

		let mint = encode_call(
			"mint(address,uint256)",
			&[
				AbiToken::Address(to.to_string()),
				AbiToken::Uint(amount.clone()),
			],
		)?;
		let dest_tx = self
			.adapter(Some(dest))?
			.client()
			.execute_contract(&dest_token, &mint, &BigUint::ZERO)
			.await?;

		Ok(BridgeTransfer { source_tx, dest_tx })
	}
}

/// Routes mounted under `/api/v1/blockchain`, behind the auth pipeline.
pub fn http_router() -> axum::Router<Arc<AppState>> {
	axum::Router::new()
		.route("/status", get(status_handler))
		.route("/balance/{address}", get(balance_handler))
		.route("/transaction", post(submit_transaction_handler))
		.route("/transaction/{hash}", get(transaction_handler))
		.route("/block/{number}", get(block_handler))
}

fn facade(state: &AppState) -> Result<&Arc<ChainFacade>, GatewayError> {
	state
		.chains
		.as_ref()
		.ok_or(GatewayError::ChainUnavailable("blockchain disabled".to_string()))
}

/// Decimal by default, hex with an 0x prefix.
fn parse_amount(s: &str) -> Result<BigUint, GatewayError> {
	let parsed = if let Some(hex) = s.strip_prefix("0x") {
		BigUint::parse_bytes(hex.as_bytes(), 16)
	} else {
		BigUint::parse_bytes(s.as_bytes(), 10)
	};
	parsed.ok_or(GatewayError::BadRequest(format!("bad amount {s}")))
}

fn tx_json(record: &TxRecord) -> serde_json::Value {
	json!({
		"hash": record.hash,
		"from": record.from,
		"to": record.to,
		"value": record.value.to_string(),
		"block_number": record.block_number,
		"status": record.status.as_str(),
		"timestamp": record.timestamp,
	})
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Result<Response, GatewayError> {
	let facade = facade(&state)?;
	let client = facade.default_client()?;
	let connected = client.is_connected();
	let (chain_id, block_number) = if connected {
		(client.get_chain_id().await?, client.get_block_number().await?)
	} else {
		(0, 0)
	};
	Ok(
		Json(json!({
			"chain": facade.default_chain(),
			"connected": connected,
			"chain_id": chain_id,
			"block_number": block_number,
			"network_name": client.network_name(),
		}))
		.into_response(),
	)
}

async fn balance_handler(
	State(state): State<Arc<AppState>>,
	Path(address): Path<String>,
) -> Result<Response, GatewayError> {
	let facade = facade(&state)?;
	let client = facade.default_client()?;
	let balance = client.get_balance(&address).await?;
	let decimals = client.native_decimals();
	Ok(
		Json(json!({
			"chain": facade.default_chain(),
			"address": address,
			"balance": balance.to_string(),
			"formatted": format_units(&balance, decimals),
			"decimals": decimals,
		}))
		.into_response(),
	)
}

#[derive(Debug, Deserialize)]
struct SubmitTransaction {
	#[serde(default)]
	from: Option<String>,
	#[serde(default)]
	to: Option<String>,
	#[serde(default)]
	value: Option<String>,
	#[serde(default)]
	data: Option<String>,
	#[serde(default)]
	gas_limit: Option<u64>,
	#[serde(default)]
	gas_price: Option<String>,
	#[serde(default)]
	nonce: Option<u64>,
}

async fn submit_transaction_handler(
	State(state): State<Arc<AppState>>,
	Json(body): Json<SubmitTransaction>,
) -> Result<Response, GatewayError> {
	let facade = facade(&state)?;
	let value = match &body.value {
		Some(v) => parse_amount(v)?,
		None => BigUint::ZERO,
	};
	let gas_price = body.gas_price.as_deref().map(parse_amount).transpose()?;
	let data = match &body.data {
		Some(hex) => {
			decode_bytes(hex).map_err(|e| GatewayError::BadRequest(e.to_string()))?
		},
		None => Vec::new(),
	};
	let tx = TxRequest {
		from: body.from,
		to: body.to,
		value,
		data,
		gas_limit: body.gas_limit,
		gas_price,
		nonce: body.nonce,
	};
	let hash = facade.default_client()?.send_transaction(&tx).await?;
	Ok(
		Json(json!({
			"transaction_hash": hash,
			"status": "pending",
		}))
		.into_response(),
	)
}

async fn transaction_handler(
	State(state): State<Arc<AppState>>,
	Path(hash): Path<String>,
) -> Result<Response, GatewayError> {
	let facade = facade(&state)?;
	match facade.default_client()?.get_transaction(&hash).await? {
		Some(record) => Ok(Json(tx_json(&record)).into_response()),
		None => Ok(
			(
				StatusCode::NOT_FOUND,
				Json(json!({"error": "transaction not found", "hash": hash})),
			)
				.into_response(),
		),
	}
}

async fn block_handler(
	State(state): State<Arc<AppState>>,
	Path(number): Path<String>,
) -> Result<Response, GatewayError> {
	let facade = facade(&state)?;
	let number = match number.as_str() {
		"latest" => None,
		n => Some(
			n.parse::<u64>()
				.map_err(|_| GatewayError::BadRequest(format!("bad block number {n}")))?,
		),
	};
	let block = facade.default_client()?.get_block(number).await?;
	Ok(Json(json!(block)).into_response())
}
