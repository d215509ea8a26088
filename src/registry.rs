use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A healthy instance returned by discovery. Lives for one request.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct ServiceInstance {
	pub id: String,
	pub name: String,
	pub host: String,
	pub port: u16,
	pub tags: Vec<String>,
}

impl ServiceInstance {
	pub fn base_url(&self) -> String {
		format!("http://{}:{}", self.host, self.port)
	}

	pub fn has_tag(&self, tag: &str) -> bool {
		self.tags.iter().any(|t| t == tag)
	}
}

#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
	#[error("registry unavailable: {0}")]
	Transport(#[from] reqwest::Error),

	#[error("registry returned status {0}")]
	Status(http::StatusCode),
}

/// Thin client over a Consul-style catalog. The gateway treats the registry
/// as optional: every caller holds `Option<&RegistryClient>` and falls back
/// to the static service map when it is absent.
pub struct RegistryClient {
	http: reqwest::Client,
	base: String,
}

impl RegistryClient {
	pub fn new(address: &str) -> Self {
		let http = reqwest::Client::builder()
			.timeout(Duration::from_secs(10))
			.build()
			.expect("default reqwest client");
		Self {
			http,
			base: address.trim_end_matches('/').to_string(),
		}
	}

	fn url(&self, path: &str) -> String {
		format!("{}/v1/{}", self.base, path)
	}

	/// Cheap connectivity probe, used at startup and by `/ready`.
	pub async fn probe(&self) -> Result<(), RegistryError> {
		let resp = self.http.get(self.url("status/leader")).send().await?;
		if !resp.status().is_success() {
			return Err(RegistryError::Status(resp.status()));
		}
		Ok(())
	}

	/// Registers the gateway itself with an HTTP health check. Registration
	/// failure is never fatal to gateway start; callers log and continue.
	pub async fn register_self(
		&self,
		name: &str,
		host: &str,
		port: u16,
		tags: Vec<String>,
	) -> Result<String, RegistryError> {
		let service_id = format!("{name}-{host}-{port}");
		let registration = Registration {
			id: service_id.clone(),
			name: name.to_string(),
			tags,
			address: host.to_string(),
			port: port as u32,
			check: Some(HealthCheck {
				http: format!("http://{host}:{port}/health"),
				interval: "10s".to_string(),
				timeout: "5s".to_string(),
				deregister_critical_service_after: "60s".to_string(),
			}),
		};
		let resp = self
			.http
			.put(self.url("agent/service/register"))
			.json(&registration)
			.send()
			.await?;
		if !resp.status().is_success() {
			return Err(RegistryError::Status(resp.status()));
		}
		tracing::info!(%service_id, "registered with service registry");
		Ok(service_id)
	}

	pub async fn deregister(&self, service_id: &str) -> Result<(), RegistryError> {
		let resp = self
			.http
			.put(self.url(&format!("agent/service/deregister/{service_id}")))
			.send()
			.await?;
		if !resp.status().is_success() {
			return Err(RegistryError::Status(resp.status()));
		}
		Ok(())
	}

	/// Healthy instances for a logical service name. Empty is a valid
	/// non-error outcome; the router falls back to the static map.
	pub async fn list_instances(&self, name: &str) -> Result<Vec<ServiceInstance>, RegistryError> {
		let resp = self
			.http
			.get(self.url(&format!("health/service/{name}")))
			.query(&[("passing", "true")])
			.send()
			.await?;
		if !resp.status().is_success() {
			return Err(RegistryError::Status(resp.status()));
		}
		let entries: Vec<HealthEntry> = resp.json().await?;
		let instances = entries
			.into_iter()
			.map(|entry| {
				// Service.Address is optional in the catalog; the node
				// address is the documented fallback.
				let host = if entry.service.address.is_empty() {
					entry.node.map(|n| n.address).unwrap_or_default()
				} else {
					entry.service.address
				};
				ServiceInstance {
					id: entry.service.id,
					name: entry.service.service,
					host,
					port: entry.service.port as u16,
					tags: entry.service.tags,
				}
			})
			.collect();
		Ok(instances)
	}

	/// First healthy instance, if any. Load balancing is deliberately left
	/// to the registry's own rotation.
	pub async fn pick_one(&self, name: &str) -> Result<Option<ServiceInstance>, RegistryError> {
		Ok(self.list_instances(name).await?.into_iter().next())
	}

	/// All registered service names with their tag sets. Used by the
	/// internal-service authenticator.
	pub async fn list_services(&self) -> Result<BTreeMap<String, Vec<String>>, RegistryError> {
		let resp = self.http.get(self.url("catalog/services")).send().await?;
		if !resp.status().is_success() {
			return Err(RegistryError::Status(resp.status()));
		}
		Ok(resp.json().await?)
	}
}

#[derive(Debug, Serialize)]
struct Registration {
	#[serde(rename = "ID")]
	id: String,
	#[serde(rename = "Name")]
	name: String,
	#[serde(rename = "Tags")]
	tags: Vec<String>,
	#[serde(rename = "Address")]
	address: String,
	#[serde(rename = "Port")]
	port: u32,
	#[serde(rename = "Check", skip_serializing_if = "Option::is_none")]
	check: Option<HealthCheck>,
}

#[derive(Debug, Serialize)]
struct HealthCheck {
	#[serde(rename = "HTTP")]
	http: String,
	#[serde(rename = "Interval")]
	interval: String,
	#[serde(rename = "Timeout")]
	timeout: String,
	#[serde(rename = "DeregisterCriticalServiceAfter")]
	deregister_critical_service_after: String,
}

#[derive(Debug, Deserialize)]
struct HealthEntry {
	#[serde(rename = "Service")]
	service: CatalogService,
	#[serde(rename = "Node")]
	node: Option<CatalogNode>,
}

#[derive(Debug, Deserialize)]
struct CatalogService {
	#[serde(rename = "ID")]
	id: String,
	#[serde(rename = "Service")]
	service: String,
	#[serde(rename = "Tags", default)]
	tags: Vec<String>,
	#[serde(rename = "Address", default)]
	address: String,
	#[serde(rename = "Port")]
	port: u32,
}

#[derive(Debug, Deserialize)]
struct CatalogNode {
	#[serde(rename = "Address")]
	address: String,
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;
	use wiremock::matchers::{method, path, query_param};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	#[tokio::test]
	async fn lists_only_what_the_registry_returns() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/v1/health/service/agents"))
			.and(query_param("passing", "true"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!([
				{
					"Service": {
						"ID": "agents-1",
						"Service": "agents",
						"Tags": ["sse", "agent"],
						"Address": "10.0.0.5",
						"Port": 8203
					},
					"Checks": []
				}
			])))
			.mount(&server)
			.await;

		let client = RegistryClient::new(&server.uri());
		let instances = client.list_instances("agents").await.unwrap();
		assert_eq!(instances.len(), 1);
		assert_eq!(instances[0].base_url(), "http://10.0.0.5:8203");
		assert!(instances[0].has_tag("sse"));

		let picked = client.pick_one("agents").await.unwrap().unwrap();
		assert_eq!(picked, instances[0]);
	}

	#[tokio::test]
	async fn empty_catalog_is_not_an_error() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/v1/health/service/ghost"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
			.mount(&server)
			.await;

		let client = RegistryClient::new(&server.uri());
		assert!(client.pick_one("ghost").await.unwrap().is_none());
	}

	#[tokio::test]
	async fn falls_back_to_node_address() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/v1/health/service/mcp"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!([
				{
					"Service": {
						"ID": "mcp-1",
						"Service": "mcp",
						"Tags": [],
						"Address": "",
						"Port": 8205
					},
					"Node": {"Address": "10.0.0.9"}
				}
			])))
			.mount(&server)
			.await;

		let client = RegistryClient::new(&server.uri());
		let instances = client.list_instances("mcp").await.unwrap();
		assert_eq!(instances[0].host, "10.0.0.9");
	}

	#[tokio::test]
	async fn register_self_sends_a_health_check() {
		let server = MockServer::start().await;
		Mock::given(method("PUT"))
			.and(path("/v1/agent/service/register"))
			.respond_with(ResponseTemplate::new(200))
			.expect(1)
			.mount(&server)
			.await;

		let client = RegistryClient::new(&server.uri());
		let id = client
			.register_self("isa-gateway", "10.0.0.1", 8000, vec!["gateway".to_string()])
			.await
			.unwrap();
		assert_eq!(id, "isa-gateway-10.0.0.1-8000");
	}

	#[tokio::test]
	async fn service_listing_feeds_internal_auth() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/v1/catalog/services"))
			.respond_with(
				ResponseTemplate::new(200)
					.set_body_json(json!({"payment": ["internal"], "agents": ["sse"]})),
			)
			.mount(&server)
			.await;

		let client = RegistryClient::new(&server.uri());
		let services = client.list_services().await.unwrap();
		assert!(services.contains_key("payment"));
		assert_eq!(services["agents"], vec!["sse"]);
	}
}
