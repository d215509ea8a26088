use serde::Serialize;

use crate::config::Config;
use crate::errors::GatewayError;
use crate::registry::{RegistryClient, ServiceInstance};

/// How the proxy forwards the request once a target is chosen.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyStrategy {
	Standard,
	Sse,
}

impl ProxyStrategy {
	pub fn as_str(&self) -> &'static str {
		match self {
			ProxyStrategy::Standard => "standard",
			ProxyStrategy::Sse => "sse",
		}
	}
}

/// Per-request routing outcome: where to send the request and how.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteDecision {
	pub logical_name: String,
	pub target_base_url: String,
	pub rewritten_path: String,
	pub strategy: ProxyStrategy,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouteClass {
	/// Not under /api/v1/ — health, readiness, anything the gateway's own
	/// routes already claimed.
	NotApi,
	/// /api/v1/gateway/... — handled by the gateway, never proxied.
	Management,
	/// /api/v1/{service}/... — proxied to the logical service.
	Service(String),
}

pub fn classify(path: &str) -> RouteClass {
	let Some(rest) = path.strip_prefix("/api/v1/") else {
		return RouteClass::NotApi;
	};
	let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();
	match segments.first() {
		None => RouteClass::NotApi,
		Some(&"gateway") => RouteClass::Management,
		Some(first) => {
			// /api/v1/users/{id}/sessions/... belongs to the session
			// service regardless of the leading segment.
			if *first == "users" && segments.get(2) == Some(&"sessions") {
				RouteClass::Service("sessions".to_string())
			} else {
				RouteClass::Service((*first).to_string())
			}
		},
	}
}

/// Upstreams for `agents` and `models` route on the full prefix themselves;
/// the session rewrite also keeps the original path. Everything else gets
/// the `/api/v1/{service}` prefix stripped.
pub fn rewrite_path(logical_name: &str, path: &str) -> String {
	if matches!(logical_name, "agents" | "models" | "sessions") {
		return path.to_string();
	}
	let prefix = format!("/api/v1/{logical_name}");
	match path.strip_prefix(&prefix) {
		Some("") => "/".to_string(),
		Some(rest) => rest.to_string(),
		None => path.to_string(),
	}
}

fn strategy_for(instance: &ServiceInstance) -> ProxyStrategy {
	if instance.has_tag("sse") || instance.has_tag("streaming") {
		ProxyStrategy::Sse
	} else {
		ProxyStrategy::Standard
	}
}

/// Choose a target for a classified service path. Registry first; the
/// static map only when the registry has no healthy instance or is absent.
pub async fn resolve(
	config: &Config,
	registry: Option<&RegistryClient>,
	logical_name: &str,
	path: &str,
) -> Result<RouteDecision, GatewayError> {
	let rewritten_path = rewrite_path(logical_name, path);

	if let Some(registry) = registry {
		match registry.pick_one(logical_name).await {
			Ok(Some(instance)) => {
				return Ok(RouteDecision {
					logical_name: logical_name.to_string(),
					target_base_url: instance.base_url(),
					rewritten_path,
					strategy: strategy_for(&instance),
				});
			},
			Ok(None) => {
				tracing::debug!(service = %logical_name, "no healthy instance, trying static map");
			},
			Err(e) => {
				tracing::warn!(service = %logical_name, error = %e, "registry lookup failed, trying static map");
			},
		}
	}

	match config.static_target(logical_name) {
		Some(target) => Ok(RouteDecision {
			logical_name: logical_name.to_string(),
			target_base_url: target.base_url(),
			rewritten_path,
			strategy: ProxyStrategy::Standard,
		}),
		None => Err(GatewayError::ServiceNotFound),
	}
}
