use async_trait::async_trait;
use num_bigint::BigUint;
use serde::Serialize;

use crate::chain::ethereum::EthereumChain;
use crate::chain::rpc::RpcError;
use crate::config::{ChainConfig, ChainKind};
use crate::errors::GatewayError;

#[derive(thiserror::Error, Debug)]
pub enum ChainError {
	#[error("chain not connected: {0}")]
	Unavailable(String),

	#[error("missing chain configuration: {0}")]
	Config(String),

	#[error(transparent)]
	Rpc(#[from] RpcError),

	#[error("invalid input: {0}")]
	Invalid(String),
}

impl From<ChainError> for GatewayError {
	fn from(err: ChainError) -> Self {
		match err {
			ChainError::Unavailable(chain) => GatewayError::ChainUnavailable(chain),
			ChainError::Config(what) => GatewayError::ConfigMissing(what),
			ChainError::Rpc(cause) => GatewayError::Chain(cause.to_string()),
			ChainError::Invalid(reason) => GatewayError::BadRequest(reason),
		}
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
	Pending,
	Confirmed,
	Failed,
}

impl TxStatus {
	pub fn as_str(&self) -> &'static str {
		match self {
			TxStatus::Pending => "pending",
			TxStatus::Confirmed => "confirmed",
			TxStatus::Failed => "failed",
		}
	}
}

/// Chain-agnostic transaction submission.
#[derive(Clone, Debug, Default)]
pub struct TxRequest {
	pub from: Option<String>,
	pub to: Option<String>,
	pub value: BigUint,
	pub data: Vec<u8>,
	pub gas_limit: Option<u64>,
	pub gas_price: Option<BigUint>,
	pub nonce: Option<u64>,
}

/// Chain-agnostic transaction lookup result.
#[derive(Clone, Debug)]
pub struct TxRecord {
	pub hash: String,
	pub from: Option<String>,
	pub to: Option<String>,
	pub value: BigUint,
	pub gas_limit: Option<u64>,
	pub gas_price: Option<BigUint>,
	pub nonce: Option<u64>,
	pub block_number: Option<u64>,
	pub status: TxStatus,
	pub timestamp: Option<u64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct BlockInfo {
	pub number: u64,
	pub hash: String,
	pub parent_hash: String,
	pub timestamp: u64,
	pub transaction_count: usize,
}

#[derive(Clone, Debug)]
pub struct PoolInfo {
	pub token_a: String,
	pub token_b: String,
	pub reserve_a: BigUint,
	pub reserve_b: BigUint,
}

/// The shared capability set every chain adapter implements. Read paths
/// take seconds; `wait_for_confirmation` may take up to a minute.
#[async_trait]
pub trait ChainClient: Send + Sync {
	async fn connect(&self) -> Result<(), ChainError>;
	async fn disconnect(&self);
	fn is_connected(&self) -> bool;
	fn native_decimals(&self) -> u32;
	fn network_name(&self) -> &str;

	async fn get_chain_id(&self) -> Result<u64, ChainError>;
	async fn get_block_number(&self) -> Result<u64, ChainError>;
	async fn get_block(&self, number: Option<u64>) -> Result<BlockInfo, ChainError>;
	async fn get_balance(&self, address: &str) -> Result<BigUint, ChainError>;
	async fn get_token_balance(&self, token: &str, address: &str) -> Result<BigUint, ChainError>;
	async fn get_nonce(&self, address: &str) -> Result<u64, ChainError>;

	async fn send_transaction(&self, tx: &TxRequest) -> Result<String, ChainError>;
	async fn get_transaction(&self, hash: &str) -> Result<Option<TxRecord>, ChainError>;
	async fn wait_for_confirmation(
		&self,
		hash: &str,
		confirmations: u64,
	) -> Result<TxRecord, ChainError>;
	async fn estimate_gas(&self, tx: &TxRequest) -> Result<u64, ChainError>;

	async fn call_contract(&self, address: &str, data: &[u8]) -> Result<Vec<u8>, ChainError>;
	async fn execute_contract(
		&self,
		address: &str,
		data: &[u8],
		value: &BigUint,
	) -> Result<String, ChainError>;
	async fn deploy_contract(&self, bytecode: &[u8]) -> Result<String, ChainError>;

	async fn transfer_token(
		&self,
		token: &str,
		to: &str,
		amount: &BigUint,
	) -> Result<String, ChainError>;
	async fn approve_token(
		&self,
		token: &str,
		spender: &str,
		amount: &BigUint,
	) -> Result<String, ChainError>;

	async fn mint_nft(&self, contract: &str, to: &str, token_uri: &str)
	-> Result<String, ChainError>;
	async fn transfer_nft(
		&self,
		contract: &str,
		to: &str,
		token_id: &BigUint,
	) -> Result<String, ChainError>;
	async fn nft_metadata(&self, contract: &str, token_id: &BigUint) -> Result<String, ChainError>;
	async fn nft_owner(&self, contract: &str, token_id: &BigUint) -> Result<String, ChainError>;

	async fn pool_info(&self, pool: &str) -> Result<PoolInfo, ChainError>;
	async fn swap(
		&self,
		pool: &str,
		token_in: &str,
		amount_in: &BigUint,
		min_out: &BigUint,
	) -> Result<String, ChainError>;
	async fn add_liquidity(
		&self,
		pool: &str,
		amount_a: &BigUint,
		amount_b: &BigUint,
	) -> Result<String, ChainError>;
	async fn remove_liquidity(&self, pool: &str, liquidity: &BigUint) -> Result<String, ChainError>;
}

/// Tagged sum over the concrete chain types. The isA appchain speaks the
/// same JSON-RPC dialect as its Ethereum settlement layer, so both tags are
/// currently backed by the same client; new chain types add variants
/// without touching the HTTP layer.
pub enum Adapter {
	Isa(EthereumChain),
	Ethereum(EthereumChain),
}

impl Adapter {
	pub fn from_config(name: &str, config: &ChainConfig) -> Adapter {
		let chain = EthereumChain::new(name, config);
		match config.kind {
			ChainKind::Isa => Adapter::Isa(chain),
			ChainKind::Ethereum => Adapter::Ethereum(chain),
		}
	}

	pub fn kind(&self) -> ChainKind {
		match self {
			Adapter::Isa(_) => ChainKind::Isa,
			Adapter::Ethereum(_) => ChainKind::Ethereum,
		}
	}

	pub fn client(&self) -> &(dyn ChainClient) {
		match self {
			Adapter::Isa(chain) => chain,
			Adapter::Ethereum(chain) => chain,
		}
	}
}
