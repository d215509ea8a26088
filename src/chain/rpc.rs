use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use num_bigint::BigUint;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde::{Deserialize};
use sha3::{Digest, Keccak256};

#[derive(thiserror::Error, Debug)]
pub enum RpcError {
	#[error("rpc transport: {0}")]
	Transport(#[from] reqwest::Error),

	#[error("rpc error {code}: {message}")]
	Rpc { code: i64, message: String },

	#[error("malformed rpc response: {0}")]
	Malformed(String),
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
	#[serde(default)]
	result: serde_json::Value,
	#[serde(default)]
	error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
	code: i64,
	message: String,
}

/// Plain JSON-RPC 2.0 client. One per configured chain endpoint.
pub struct RpcClient {
	http: reqwest::Client,
	endpoint: String,
	next_id: AtomicU64,
}

impl RpcClient {
	pub fn new(endpoint: &str, timeout: Duration) -> Self {
		let http = reqwest::Client::builder()
			.timeout(timeout)
			.build()
			.expect("default reqwest client");
		Self {
			http,
			endpoint: endpoint.to_string(),
			next_id: AtomicU64::new(1),
		}
	}

	pub fn endpoint(&self) -> &str {
		&self.endpoint
	}

	pub async fn call<P: Serialize, T: DeserializeOwned>(
		&self,
		method: &str,
		params: P,
	) -> Result<T, RpcError> {
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		let body = serde_json::json!({
			"jsonrpc": "2.0",
			"id": id,
			"method": method,
			"params": params,
		});
		let resp: RpcResponse = self
			.http
			.post(&self.endpoint)
			.json(&body)
			.send()
			.await?
			.json()
			.await?;
		if let Some(err) = resp.error {
			return Err(RpcError::Rpc {
				code: err.code,
				message: err.message,
			});
		}
		// A null result is legitimate (e.g. unknown transaction); the
		// target type decides whether it is acceptable.
		serde_json::from_value(resp.result)
			.map_err(|e| RpcError::Malformed(format!("{method}: {e}")))
	}
}

/// Hex quantity ("0x...") parsing and rendering.
pub fn parse_quantity(s: &str) -> Result<BigUint, RpcError> {
	let digits = s.strip_prefix("0x").unwrap_or(s);
	if digits.is_empty() {
		return Ok(BigUint::ZERO);
	}
	BigUint::parse_bytes(digits.as_bytes(), 16)
		.ok_or(RpcError::Malformed(format!("bad quantity {s}")))
}

pub fn parse_u64(s: &str) -> Result<u64, RpcError> {
	let digits = s.strip_prefix("0x").unwrap_or(s);
	u64::from_str_radix(digits, 16).map_err(|_| RpcError::Malformed(format!("bad quantity {s}")))
}

pub fn to_quantity(v: &BigUint) -> String {
	format!("0x{:x}", v)
}

pub fn u64_quantity(v: u64) -> String {
	format!("0x{v:x}")
}

pub fn encode_bytes(data: &[u8]) -> String {
	let mut out = String::with_capacity(2 + data.len() * 2);
	out.push_str("0x");
	for b in data {
		out.push_str(&format!("{b:02x}"));
	}
	out
}

pub fn decode_bytes(s: &str) -> Result<Vec<u8>, RpcError> {
	let digits = s.strip_prefix("0x").unwrap_or(s);
	if digits.len() % 2 != 0 {
		return Err(RpcError::Malformed(format!("odd-length hex: {s}")));
	}
	(0..digits.len())
		.step_by(2)
		.map(|i| {
			u8::from_str_radix(&digits[i..i + 2], 16)
				.map_err(|_| RpcError::Malformed(format!("bad hex: {s}")))
		})
		.collect()
}

/// ABI arguments the gateway's contract surface needs. Strings use the
/// standard dynamic head/tail layout.
pub enum AbiToken {
	Address(String),
	Uint(BigUint),
	Str(String),
}

/// First four bytes of keccak256 over the canonical signature.
pub fn selector(signature: &str) -> [u8; 4] {
	let digest = Keccak256::digest(signature.as_bytes());
	[digest[0], digest[1], digest[2], digest[3]]
}

fn address_word(address: &str) -> Result<[u8; 32], RpcError> {
	let raw = decode_bytes(address)?;
	if raw.len() != 20 {
		return Err(RpcError::Malformed(format!("bad address {address}")));
	}
	let mut word = [0u8; 32];
	word[12..].copy_from_slice(&raw);
	Ok(word)
}

fn uint_word(value: &BigUint) -> Result<[u8; 32], RpcError> {
	let raw = value.to_bytes_be();
	if raw.len() > 32 {
		return Err(RpcError::Malformed("uint overflows 256 bits".to_string()));
	}
	let mut word = [0u8; 32];
	word[32 - raw.len()..].copy_from_slice(&raw);
	Ok(word)
}

/// Encode a contract call: selector plus ABI-encoded arguments.
pub fn encode_call(signature: &str, args: &[AbiToken]) -> Result<Vec<u8>, RpcError> {
	let mut head: Vec<[u8; 32]> = Vec::with_capacity(args.len());
	let mut tail: Vec<u8> = Vec::new();
	let head_len = args.len() * 32;

	for arg in args {
		match arg {
			AbiToken::Address(addr) => head.push(address_word(addr)?),
			AbiToken::Uint(v) => head.push(uint_word(v)?),
			AbiToken::Str(s) => {
				let offset = BigUint::from(head_len + tail.len());
				head.push(uint_word(&offset)?);
				let bytes = s.as_bytes();
				tail.extend_from_slice(&uint_word(&BigUint::from(bytes.len()))?);
				tail.extend_from_slice(bytes);
				let padding = (32 - bytes.len() % 32) % 32;
				tail.extend(std::iter::repeat_n(0u8, padding));
			},
		}
	}

	let mut out = Vec::with_capacity(4 + head_len + tail.len());
	out.extend_from_slice(&selector(signature));
	for word in head {
		out.extend_from_slice(&word);
	}
	out.extend_from_slice(&tail);
	Ok(out)
}

/// Decode a single uint256 return value.
pub fn decode_uint(data: &[u8]) -> Result<BigUint, RpcError> {
	if data.is_empty() {
		return Err(RpcError::Malformed("empty return data".to_string()));
	}
	Ok(BigUint::from_bytes_be(&data[..data.len().min(32)]))
}

/// Decode an address return value (last 20 bytes of the first word).
pub fn decode_address(data: &[u8]) -> Result<String, RpcError> {
	if data.len() < 32 {
		return Err(RpcError::Malformed("short return data".to_string()));
	}
	Ok(encode_bytes(&data[12..32]))
}

/// Decode a dynamic string return value.
pub fn decode_string(data: &[u8]) -> Result<String, RpcError> {
	if data.len() < 64 {
		return Err(RpcError::Malformed("short return data".to_string()));
	}
	let offset: usize = decode_uint(&data[..32])?
		.try_into()
		.map_err(|_| RpcError::Malformed("bad string offset".to_string()))?;
	if data.len() < offset + 32 {
		return Err(RpcError::Malformed("bad string offset".to_string()));
	}
	let len: usize = decode_uint(&data[offset..offset + 32])?
		.try_into()
		.map_err(|_| RpcError::Malformed("bad string length".to_string()))?;
	if data.len() < offset + 32 + len {
		return Err(RpcError::Malformed("truncated string".to_string()));
	}
	String::from_utf8(data[offset + 32..offset + 32 + len].to_vec())
		.map_err(|_| RpcError::Malformed("non-utf8 string".to_string()))
}

/// Render a raw integer amount with the chain's native decimals.
pub fn format_units(value: &BigUint, decimals: u32) -> String {
	let base = BigUint::from(10u32).pow(decimals);
	let whole = value / &base;
	let frac = value % &base;
	if frac == BigUint::ZERO {
		return whole.to_string();
	}
	let frac = format!("{:0>width$}", frac.to_string(), width = decimals as usize);
	format!("{whole}.{}", frac.trim_end_matches('0'))
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;
	use wiremock::matchers::{body_partial_json, method, path as mock_path};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	#[test]
	fn quantity_round_trip_is_exact() {
		let v: BigUint = "123456789012345678901234567890".parse().unwrap();
		let hex = to_quantity(&v);
		assert_eq!(parse_quantity(&hex).unwrap(), v);
		assert_eq!(parse_quantity("0x0").unwrap(), BigUint::ZERO);
		assert_eq!(parse_quantity("0x").unwrap(), BigUint::ZERO);
	}

	#[test]
	fn known_erc20_selectors() {
		assert_eq!(selector("transfer(address,uint256)"), [0xa9, 0x05, 0x9c, 0xbb]);
		assert_eq!(selector("balanceOf(address)"), [0x70, 0xa0, 0x82, 0x31]);
		assert_eq!(selector("approve(address,uint256)"), [0x09, 0x5e, 0xa7, 0xb3]);
	}

	#[test]
	fn call_encoding_pads_static_words() {
		let data = encode_call(
			"transfer(address,uint256)",
			&[
				AbiToken::Address("0x00000000000000000000000000000000000000ab".to_string()),
				AbiToken::Uint(BigUint::from(1000u32)),
			],
		)
		.unwrap();
		assert_eq!(data.len(), 4 + 32 + 32);
		assert_eq!(&data[..4], &[0xa9, 0x05, 0x9c, 0xbb]);
		assert_eq!(data[35], 0xab);
		// 1000 = 0x03e8 in the last two bytes.
		assert_eq!(&data[66..68], &[0x03, 0xe8]);
	}

	#[test]
	fn string_args_use_the_dynamic_layout() {
		let data = encode_call(
			"mint(address,string)",
			&[
				AbiToken::Address("0x00000000000000000000000000000000000000ab".to_string()),
				AbiToken::Str("ipfs://cert/1".to_string()),
			],
		)
		.unwrap();
		// selector + 2 head words + length word + 1 padded data word
		assert_eq!(data.len(), 4 + 64 + 32 + 32);
		// offset points past the two head words
		assert_eq!(decode_uint(&data[36..68]).unwrap(), BigUint::from(64u32));
		assert_eq!(
			decode_uint(&data[68..100]).unwrap(),
			BigUint::from("ipfs://cert/1".len())
		);
	}

	#[test]
	fn string_decoding_round_trips() {
		let uri = "ipfs://metadata/42";
		let mut data = Vec::new();
		data.extend_from_slice(&uint_word(&BigUint::from(32u32)).unwrap());
		data.extend_from_slice(&uint_word(&BigUint::from(uri.len())).unwrap());
		data.extend_from_slice(uri.as_bytes());
		data.extend(std::iter::repeat_n(0u8, (32 - uri.len() % 32) % 32));
		assert_eq!(decode_string(&data).unwrap(), uri);
	}

	#[test]
	fn unit_formatting_trims_trailing_zeros() {
		let one_and_a_half: BigUint = "1500000000000000000".parse().unwrap();
		assert_eq!(format_units(&one_and_a_half, 18), "1.5");
		assert_eq!(format_units(&BigUint::from(5u32), 18), "0.000000000000000005");
		assert_eq!(format_units(&BigUint::from(7000u32), 3), "7");
		assert_eq!(format_units(&BigUint::ZERO, 18), "0");
	}

	#[tokio::test]
	async fn rpc_errors_surface_code_and_message() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(mock_path("/"))
			.and(body_partial_json(json!({"method": "eth_blockNumber"})))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({
				"jsonrpc": "2.0", "id": 1,
				"error": {"code": -32601, "message": "method not found"}
			})))
			.mount(&server)
			.await;

		let client = RpcClient::new(&server.uri(), Duration::from_secs(5));
		let err = client
			.call::<_, String>("eth_blockNumber", json!([]))
			.await
			.unwrap_err();
		match err {
			RpcError::Rpc { code, message } => {
				assert_eq!(code, -32601);
				assert_eq!(message, "method not found");
			},
			other => panic!("unexpected error: {other:?}"),
		}
	}
}
