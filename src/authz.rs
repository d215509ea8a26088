use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const READ_ONLY: &str = "read_only";
pub const READ_WRITE: &str = "read_write";

/// What the authorization service is asked about. Derived from the request
/// path; `None` from [derive_selector] means the gate is skipped entirely.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct ResourceSelector {
	pub resource_type: &'static str,
	pub resource_name: String,
	pub required_level: &'static str,
}

fn selector(
	resource_type: &'static str,
	resource_name: &str,
	required_level: &'static str,
) -> Option<ResourceSelector> {
	Some(ResourceSelector {
		resource_type,
		resource_name: resource_name.to_string(),
		required_level,
	})
}

/// Static path-prefix table mapping requests to protected resources.
/// Anything not listed carries no resource requirement.
pub fn derive_selector(path: &str) -> Option<ResourceSelector> {
	if let Some(rest) = path.strip_prefix("/api/v1/blockchain") {
		let name = if rest.contains("/balance") {
			"blockchain_balance_check"
		} else if rest.contains("/transaction") {
			"blockchain_transaction"
		} else if rest.contains("/status") {
			"blockchain_status"
		} else {
			"blockchain_general"
		};
		return selector("api_endpoint", name, READ_ONLY);
	}

	if let Some(rest) = path.strip_prefix("/api/v1/agents") {
		let level = if rest.contains("/chat") {
			READ_WRITE
		} else {
			READ_ONLY
		};
		return selector("api_endpoint", "agent_chat", level);
	}

	if let Some(rest) = path.strip_prefix("/api/v1/mcp") {
		let (name, level) = if rest.contains("search") {
			("search", READ_ONLY)
		} else if rest.contains("tool") {
			("tool_execution", READ_WRITE)
		} else if rest.contains("prompt") {
			("prompt_access", READ_ONLY)
		} else {
			("mcp_general", READ_ONLY)
		};
		return selector("mcp_tool", name, level);
	}

	if path.starts_with("/api/v1/gateway") {
		return selector("api_endpoint", "gateway_management", READ_ONLY);
	}

	None
}

/// Response of the authorization service's check-access endpoint.
#[derive(Clone, Debug, Deserialize, Default)]
pub struct AccessDecision {
	#[serde(default)]
	pub has_access: bool,
	#[serde(default)]
	pub user_access_level: Option<String>,
	#[serde(default)]
	pub permission_source: Option<String>,
	#[serde(default)]
	pub subscription_tier: Option<String>,
	#[serde(default)]
	pub organization_plan: Option<String>,
	#[serde(default)]
	pub reason: Option<String>,
	#[serde(default)]
	pub expires_at: Option<String>,
	#[serde(default)]
	pub metadata: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct CheckAccessRequest<'a> {
	user_id: &'a str,
	resource_type: &'static str,
	resource_name: &'a str,
	required_access_level: &'static str,
}

/// Client for the remote authorization service. Transport failures are the
/// caller's policy decision (fail-open by default).
#[derive(Clone)]
pub struct AuthorizationClient {
	http: reqwest::Client,
	base: String,
}

impl AuthorizationClient {
	pub fn new(base: &str) -> Self {
		let http = reqwest::Client::builder()
			.timeout(Duration::from_secs(3))
			.build()
			.expect("default reqwest client");
		Self {
			http,
			base: base.trim_end_matches('/').to_string(),
		}
	}

	pub async fn check_access(
		&self,
		user_id: &str,
		selector: &ResourceSelector,
	) -> Result<AccessDecision, reqwest::Error> {
		let request = CheckAccessRequest {
			user_id,
			resource_type: selector.resource_type,
			resource_name: &selector.resource_name,
			required_access_level: selector.required_level,
		};
		let resp = self
			.http
			.post(format!("{}/api/v1/authorization/check-access", self.base))
			.json(&request)
			.send()
			.await?;
		resp.json().await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;
	use wiremock::matchers::{body_partial_json, method, path as mock_path};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	#[test]
	fn blockchain_paths_map_to_their_subkind() {
		let s = derive_selector("/api/v1/blockchain/transaction").unwrap();
		assert_eq!(s.resource_type, "api_endpoint");
		assert_eq!(s.resource_name, "blockchain_transaction");
		assert_eq!(s.required_level, READ_ONLY);

		let s = derive_selector("/api/v1/blockchain/balance/0xabc").unwrap();
		assert_eq!(s.resource_name, "blockchain_balance_check");

		let s = derive_selector("/api/v1/blockchain/status").unwrap();
		assert_eq!(s.resource_name, "blockchain_status");

		let s = derive_selector("/api/v1/blockchain/block/latest").unwrap();
		assert_eq!(s.resource_name, "blockchain_general");
	}

	#[test]
	fn agent_chat_requires_write() {
		let s = derive_selector("/api/v1/agents/chat").unwrap();
		assert_eq!(s.resource_name, "agent_chat");
		assert_eq!(s.required_level, READ_WRITE);

		let s = derive_selector("/api/v1/agents/list").unwrap();
		assert_eq!(s.required_level, READ_ONLY);
	}

	#[test]
	fn mcp_tool_execution_requires_write() {
		let s = derive_selector("/api/v1/mcp/tools/call").unwrap();
		assert_eq!(s.resource_type, "mcp_tool");
		assert_eq!(s.resource_name, "tool_execution");
		assert_eq!(s.required_level, READ_WRITE);

		let s = derive_selector("/api/v1/mcp/search").unwrap();
		assert_eq!(s.resource_name, "search");
		assert_eq!(s.required_level, READ_ONLY);

		let s = derive_selector("/api/v1/mcp/prompts/get").unwrap();
		assert_eq!(s.resource_name, "prompt_access");

		let s = derive_selector("/api/v1/mcp/resources").unwrap();
		assert_eq!(s.resource_name, "mcp_general");
	}

	#[test]
	fn unlisted_paths_skip_the_gate() {
		assert_eq!(derive_selector("/api/v1/users/42"), None);
		assert_eq!(derive_selector("/api/v1/models/generate"), None);
		assert_eq!(derive_selector("/health"), None);
	}

	#[tokio::test]
	async fn check_access_posts_the_documented_shape() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(mock_path("/api/v1/authorization/check-access"))
			.and(body_partial_json(json!({
				"user_id": "u1",
				"resource_type": "api_endpoint",
				"resource_name": "blockchain_transaction",
				"required_access_level": "read_only"
			})))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({
				"has_access": true,
				"user_access_level": "read_write",
				"permission_source": "organization",
				"subscription_tier": "pro"
			})))
			.expect(1)
			.mount(&server)
			.await;

		let client = AuthorizationClient::new(&server.uri());
		let selector = derive_selector("/api/v1/blockchain/transaction").unwrap();
		let decision = client.check_access("u1", &selector).await.unwrap();
		assert!(decision.has_access);
		assert_eq!(decision.permission_source.as_deref(), Some("organization"));
	}

	#[tokio::test]
	async fn denial_carries_the_reason() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(mock_path("/api/v1/authorization/check-access"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({
				"has_access": false,
				"reason": "Insufficient permissions"
			})))
			.mount(&server)
			.await;

		let client = AuthorizationClient::new(&server.uri());
		let selector = derive_selector("/api/v1/mcp/tools/call").unwrap();
		let decision = client.check_access("u2", &selector).await.unwrap();
		assert!(!decision.has_access);
		assert_eq!(decision.reason.as_deref(), Some("Insufficient permissions"));
	}
}
