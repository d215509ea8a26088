use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Prefix for environment overrides. Dots in the option path map to
/// underscores, e.g. `server.http_port` -> `ISA_CLOUD_SERVER_HTTP_PORT`.
pub const ENV_PREFIX: &str = "ISA_CLOUD";

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct Config {
	#[serde(default)]
	pub server: ServerConfig,
	#[serde(default)]
	pub registry: RegistryConfig,
	/// Static fallback map: logical service name -> target. Consulted when
	/// the registry has no healthy instance (or is absent entirely).
	#[serde(default = "default_services")]
	pub services: BTreeMap<String, ServiceTarget>,
	#[serde(default)]
	pub security: SecurityConfig,
	#[serde(default)]
	pub blockchain: BlockchainConfig,
	#[serde(default)]
	pub mqtt: MqttConfig,
	#[serde(default)]
	pub device_management: DeviceManagementConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ServerConfig {
	#[serde(default = "default_server_host")]
	pub host: String,
	#[serde(default = "default_http_port")]
	pub http_port: u16,
	#[serde(default = "default_grpc_port")]
	pub grpc_port: u16,
}

fn default_server_host() -> String {
	"0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
	8000
}

fn default_grpc_port() -> u16 {
	9000
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self {
			host: default_server_host(),
			http_port: default_http_port(),
			grpc_port: default_grpc_port(),
		}
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RegistryConfig {
	#[serde(default = "default_true")]
	pub enabled: bool,
	#[serde(default = "default_registry_address")]
	pub address: String,
}

fn default_registry_address() -> String {
	"http://127.0.0.1:8500".to_string()
}

impl Default for RegistryConfig {
	fn default() -> Self {
		Self {
			enabled: true,
			address: default_registry_address(),
		}
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ServiceTarget {
	pub host: String,
	pub http_port: u16,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub grpc_port: Option<u16>,
	/// Per-request timeout in seconds.
	#[serde(default = "default_service_timeout")]
	pub timeout: u64,
	#[serde(default)]
	pub retry: RetryConfig,
}

fn default_service_timeout() -> u64 {
	30
}

impl ServiceTarget {
	pub fn new(host: &str, http_port: u16) -> Self {
		Self {
			host: host.to_string(),
			http_port,
			grpc_port: None,
			timeout: default_service_timeout(),
			retry: RetryConfig::default(),
		}
	}

	pub fn base_url(&self) -> String {
		format!("http://{}:{}", self.host, self.http_port)
	}

	pub fn timeout(&self) -> Duration {
		Duration::from_secs(self.timeout)
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RetryConfig {
	#[serde(default = "default_max_attempts")]
	pub max_attempts: u32,
	/// Backoff between attempts in seconds.
	#[serde(default = "default_backoff")]
	pub backoff: u64,
}

fn default_max_attempts() -> u32 {
	3
}

fn default_backoff() -> u64 {
	1
}

impl Default for RetryConfig {
	fn default() -> Self {
		Self {
			max_attempts: default_max_attempts(),
			backoff: default_backoff(),
		}
	}
}

fn default_services() -> BTreeMap<String, ServiceTarget> {
	BTreeMap::from([
		("user".to_string(), ServiceTarget::new("127.0.0.1", 8201)),
		("auth".to_string(), ServiceTarget::new("127.0.0.1", 8202)),
		("agent".to_string(), ServiceTarget::new("127.0.0.1", 8203)),
		("model".to_string(), ServiceTarget::new("127.0.0.1", 8204)),
		("mcp".to_string(), ServiceTarget::new("127.0.0.1", 8205)),
	])
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SecurityConfig {
	#[serde(default)]
	pub cors: CorsConfig,
	#[serde(default)]
	pub rate_limit: RateLimitConfig,
	/// On authorization-service transport failure: allow (true) or deny.
	/// Production deployments flip this to false.
	#[serde(default = "default_true")]
	pub authz_fail_open: bool,
	/// Accept loopback requests with a known service-client user agent as an
	/// internal service. Must stay off when a public interface is bound.
	#[serde(default)]
	pub local_dev_auth: bool,
	/// Shared secret expected in X-Service-Secret. When unset, internal
	/// callers are identified by registry membership alone.
	#[serde(default, skip_serializing)]
	pub service_shared_secret: Option<SecretString>,
}

impl Default for SecurityConfig {
	fn default() -> Self {
		Self {
			cors: CorsConfig::default(),
			rate_limit: RateLimitConfig::default(),
			authz_fail_open: true,
			local_dev_auth: false,
			service_shared_secret: None,
		}
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CorsConfig {
	#[serde(default = "default_true")]
	pub enabled: bool,
	#[serde(default = "default_allow_origins")]
	pub allow_origins: Vec<String>,
	#[serde(default = "default_allow_methods")]
	pub allow_methods: Vec<String>,
	#[serde(default = "default_allow_headers")]
	pub allow_headers: Vec<String>,
	#[serde(default)]
	pub allow_credentials: bool,
}

fn default_allow_origins() -> Vec<String> {
	vec!["*".to_string()]
}

fn default_allow_methods() -> Vec<String> {
	["GET", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"]
		.into_iter()
		.map(str::to_string)
		.collect()
}

fn default_allow_headers() -> Vec<String> {
	["authorization", "content-type", "x-api-key", "x-request-id"]
		.into_iter()
		.map(str::to_string)
		.collect()
}

impl Default for CorsConfig {
	fn default() -> Self {
		Self {
			enabled: true,
			allow_origins: default_allow_origins(),
			allow_methods: default_allow_methods(),
			allow_headers: default_allow_headers(),
			allow_credentials: false,
		}
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RateLimitConfig {
	#[serde(default = "default_true")]
	pub enabled: bool,
	#[serde(default = "default_rps")]
	pub rps: u32,
	#[serde(default = "default_burst")]
	pub burst: u32,
}

fn default_rps() -> u32 {
	100
}

fn default_burst() -> u32 {
	200
}

impl Default for RateLimitConfig {
	fn default() -> Self {
		Self {
			enabled: true,
			rps: default_rps(),
			burst: default_burst(),
		}
	}
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub struct BlockchainConfig {
	#[serde(default)]
	pub enabled: bool,
	#[serde(default = "default_chain_name")]
	pub default_chain: String,
	#[serde(default)]
	pub chains: BTreeMap<String, ChainConfig>,
}

fn default_chain_name() -> String {
	"isa".to_string()
}

#[derive(Clone, Debug, Serialize, Deserialize, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChainKind {
	Isa,
	Ethereum,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ChainConfig {
	#[serde(rename = "type")]
	pub kind: ChainKind,
	pub rpc_endpoint: String,
	pub chain_id: u64,
	#[serde(default)]
	pub network_name: String,
	#[serde(default, skip_serializing)]
	pub private_key: Option<SecretString>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub public_key: Option<String>,
	#[serde(default)]
	pub contracts: ContractAddresses,
	#[serde(default = "default_gas_limit")]
	pub gas_limit: u64,
	/// Decimal string; chains routinely exceed u64 gas prices.
	#[serde(default = "default_gas_price")]
	pub gas_price: String,
	#[serde(default = "default_confirmations")]
	pub confirmations: u64,
	/// Decimals of the native token, used to render balances.
	#[serde(default = "default_decimals")]
	pub decimals: u32,
	#[serde(default)]
	pub custom: BTreeMap<String, serde_json::Value>,
}

fn default_gas_limit() -> u64 {
	500_000
}

fn default_gas_price() -> String {
	"1000000000".to_string()
}

fn default_confirmations() -> u64 {
	1
}

fn default_decimals() -> u32 {
	18
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub struct ContractAddresses {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub isa_token: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub isa_nft: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub nft_marketplace: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub simple_dex: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub service_registry: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub usage_billing: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MqttConfig {
	#[serde(default)]
	pub enabled: bool,
	#[serde(default = "default_broker_url")]
	pub broker_url: String,
	#[serde(default = "default_mqtt_client_id")]
	pub client_id: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub username: Option<String>,
	#[serde(default, skip_serializing)]
	pub password: Option<SecretString>,
	/// Seconds.
	#[serde(default = "default_keep_alive")]
	pub keep_alive: u64,
	/// Seconds.
	#[serde(default = "default_ping_timeout")]
	pub ping_timeout: u64,
	#[serde(default = "default_true")]
	pub clean_session: bool,
	#[serde(default = "default_true")]
	pub auto_reconnect: bool,
	/// 0, 1 or 2.
	#[serde(default = "default_qos")]
	pub qos: u8,
	#[serde(default)]
	pub topics: MqttTopics,
}

fn default_broker_url() -> String {
	"mqtt://127.0.0.1:1883".to_string()
}

fn default_mqtt_client_id() -> String {
	"isa-gateway".to_string()
}

fn default_keep_alive() -> u64 {
	60
}

fn default_ping_timeout() -> u64 {
	10
}

fn default_qos() -> u8 {
	1
}

impl Default for MqttConfig {
	fn default() -> Self {
		Self {
			enabled: false,
			broker_url: default_broker_url(),
			client_id: default_mqtt_client_id(),
			username: None,
			password: None,
			keep_alive: default_keep_alive(),
			ping_timeout: default_ping_timeout(),
			clean_session: true,
			auto_reconnect: true,
			qos: default_qos(),
			topics: MqttTopics::default(),
		}
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MqttTopics {
	#[serde(default = "default_topic_telemetry")]
	pub device_telemetry: String,
	#[serde(default = "default_topic_status")]
	pub device_status: String,
	#[serde(default = "default_topic_commands_response")]
	pub device_commands_response: String,
	#[serde(default = "default_topic_auth")]
	pub device_auth: String,
	#[serde(default = "default_topic_registration")]
	pub device_registration: String,
}

fn default_topic_telemetry() -> String {
	"devices/+/telemetry".to_string()
}

fn default_topic_status() -> String {
	"devices/+/status".to_string()
}

fn default_topic_commands_response() -> String {
	"devices/+/commands/response".to_string()
}

fn default_topic_auth() -> String {
	"devices/+/auth".to_string()
}

fn default_topic_registration() -> String {
	"devices/register".to_string()
}

impl Default for MqttTopics {
	fn default() -> Self {
		Self {
			device_telemetry: default_topic_telemetry(),
			device_status: default_topic_status(),
			device_commands_response: default_topic_commands_response(),
			device_auth: default_topic_auth(),
			device_registration: default_topic_registration(),
		}
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DeviceManagementConfig {
	#[serde(default)]
	pub enabled: bool,
	#[serde(default = "default_device_service")]
	pub device_service: ServiceTarget,
	#[serde(default = "default_telemetry_service")]
	pub telemetry_service: ServiceTarget,
	#[serde(default = "default_ota_service")]
	pub ota_service: ServiceTarget,
}

fn default_device_service() -> ServiceTarget {
	ServiceTarget::new("127.0.0.1", 8220)
}

fn default_telemetry_service() -> ServiceTarget {
	ServiceTarget::new("127.0.0.1", 8221)
}

fn default_ota_service() -> ServiceTarget {
	ServiceTarget::new("127.0.0.1", 8222)
}

impl Default for DeviceManagementConfig {
	fn default() -> Self {
		Self {
			enabled: false,
			device_service: default_device_service(),
			telemetry_service: default_telemetry_service(),
			ota_service: default_ota_service(),
		}
	}
}

fn default_true() -> bool {
	true
}

impl Config {
	/// Load from an optional YAML file, then apply `ISA_CLOUD_*` overrides.
	/// Env always wins over the file.
	pub fn load(path: Option<&Path>) -> anyhow::Result<Config> {
		let mut cfg: Config = match path {
			Some(path) => {
				let raw = std::fs::read_to_string(path)?;
				serde_yaml::from_str(&raw)?
			},
			None => Config::default_with_services(),
		};
		if cfg.services.is_empty() {
			cfg.services = default_services();
		}
		cfg.apply_env();
		Ok(cfg)
	}

	pub fn default_with_services() -> Config {
		Config {
			services: default_services(),
			..Config::default()
		}
	}

	fn apply_env(&mut self) {
		set_string(&mut self.server.host, "SERVER_HOST");
		set_parse(&mut self.server.http_port, "SERVER_HTTP_PORT");
		set_parse(&mut self.server.grpc_port, "SERVER_GRPC_PORT");

		set_bool(&mut self.registry.enabled, "REGISTRY_ENABLED");
		set_string(&mut self.registry.address, "REGISTRY_ADDRESS");

		for (name, target) in self.services.iter_mut() {
			let upper = name.to_uppercase();
			set_string(&mut target.host, &format!("SERVICES_{upper}_HOST"));
			set_parse(&mut target.http_port, &format!("SERVICES_{upper}_HTTP_PORT"));
		}

		set_bool(&mut self.security.cors.enabled, "SECURITY_CORS_ENABLED");
		set_bool(
			&mut self.security.rate_limit.enabled,
			"SECURITY_RATE_LIMIT_ENABLED",
		);
		set_parse(&mut self.security.rate_limit.rps, "SECURITY_RATE_LIMIT_RPS");
		set_parse(
			&mut self.security.rate_limit.burst,
			"SECURITY_RATE_LIMIT_BURST",
		);
		set_bool(&mut self.security.authz_fail_open, "SECURITY_AUTHZ_FAIL_OPEN");
		set_bool(&mut self.security.local_dev_auth, "SECURITY_LOCAL_DEV_AUTH");
		if let Some(v) = env_var("SECURITY_SERVICE_SHARED_SECRET") {
			self.security.service_shared_secret = Some(SecretString::from(v));
		}

		set_bool(&mut self.blockchain.enabled, "BLOCKCHAIN_ENABLED");
		set_string(&mut self.blockchain.default_chain, "BLOCKCHAIN_DEFAULT_CHAIN");

		set_bool(&mut self.mqtt.enabled, "MQTT_ENABLED");
		set_string(&mut self.mqtt.broker_url, "MQTT_BROKER_URL");
		set_string(&mut self.mqtt.client_id, "MQTT_CLIENT_ID");
		if let Some(v) = env_var("MQTT_USERNAME") {
			self.mqtt.username = Some(v);
		}
		if let Some(v) = env_var("MQTT_PASSWORD") {
			self.mqtt.password = Some(SecretString::from(v));
		}

		set_bool(&mut self.device_management.enabled, "DEVICE_MANAGEMENT_ENABLED");
	}

	/// Static fallback lookup. Logical names on the wire are plural
	/// (`users`, `agents`); config keys are singular, so try both.
	pub fn static_target(&self, logical_name: &str) -> Option<&ServiceTarget> {
		if let Some(t) = self.services.get(logical_name) {
			return Some(t);
		}
		logical_name
			.strip_suffix('s')
			.and_then(|singular| self.services.get(singular))
	}
}

fn env_var(suffix: &str) -> Option<String> {
	std::env::var(format!("{ENV_PREFIX}_{suffix}")).ok()
}

fn set_string(field: &mut String, suffix: &str) {
	if let Some(v) = env_var(suffix) {
		*field = v;
	}
}

fn set_bool(field: &mut bool, suffix: &str) {
	if let Some(v) = env_var(suffix) {
		match v.to_lowercase().as_str() {
			"1" | "true" | "yes" | "on" => *field = true,
			"0" | "false" | "no" | "off" => *field = false,
			_ => tracing::warn!(%suffix, value = %v, "unparseable boolean override ignored"),
		}
	}
}

fn set_parse<T: std::str::FromStr>(field: &mut T, suffix: &str) {
	if let Some(v) = env_var(suffix) {
		match v.parse() {
			Ok(parsed) => *field = parsed,
			Err(_) => tracing::warn!(%suffix, value = %v, "unparseable override ignored"),
		}
	}
}
