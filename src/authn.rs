use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum_extra::extract::cookie::CookieJar;
use headers::authorization::Bearer;
use headers::{Authorization, HeaderMapExt};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};

use crate::authz;
use crate::errors::GatewayError;
use crate::gateway::AppState;
use crate::metrics::IncrementRecorder;
use crate::metrics::{AuthOutcome, AuthzCheck};

/// User agents that identify first-party service clients during local
/// development. Only consulted for loopback peers with local_dev_auth on.
const SERVICE_CLIENT_AGENTS: [&str; 5] = ["python-httpx", "axios", "node-fetch", "go-resty", "curl"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
	Jwt,
	ApiKey,
}

/// The authenticated identity of a request. Built once by the middleware,
/// never mutated afterwards.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Principal {
	Anonymous,
	InternalService {
		service_name: String,
		is_local_dev: bool,
	},
	ExternalUser {
		user_id: String,
		#[serde(skip_serializing_if = "Option::is_none")]
		email: Option<String>,
		#[serde(skip_serializing_if = "Option::is_none")]
		provider: Option<String>,
		auth_method: AuthMethod,
		#[serde(skip_serializing_if = "Vec::is_empty")]
		permissions: Vec<String>,
		#[serde(skip_serializing_if = "Option::is_none")]
		access_level: Option<String>,
		#[serde(skip_serializing_if = "Option::is_none")]
		permission_source: Option<String>,
		#[serde(skip_serializing_if = "Option::is_none")]
		subscription_tier: Option<String>,
	},
}

#[derive(Debug, Deserialize, Default)]
pub struct TokenVerification {
	#[serde(default)]
	pub valid: bool,
	#[serde(default)]
	pub provider: Option<String>,
	#[serde(default)]
	pub user_id: Option<String>,
	#[serde(default)]
	pub email: Option<String>,
	#[serde(default)]
	pub expires_at: Option<String>,
	#[serde(default)]
	pub error: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ApiKeyVerification {
	#[serde(default)]
	pub valid: bool,
	#[serde(default)]
	pub key_id: Option<String>,
	#[serde(default)]
	pub organization_id: Option<String>,
	#[serde(default)]
	pub name: Option<String>,
	#[serde(default)]
	pub permissions: Vec<String>,
	#[serde(default)]
	pub error: Option<String>,
}

/// Client for the remote identity service. Identity failures are always
/// fail-closed: without a verdict no principal can be derived.
#[derive(Clone)]
pub struct IdentityClient {
	http: reqwest::Client,
	base: String,
}

impl IdentityClient {
	pub fn new(base: &str) -> Self {
		let http = reqwest::Client::builder()
			.timeout(Duration::from_secs(5))
			.build()
			.expect("default reqwest client");
		Self {
			http,
			base: base.trim_end_matches('/').to_string(),
		}
	}

	pub async fn verify_token(&self, token: &str) -> Result<TokenVerification, reqwest::Error> {
		let resp = self
			.http
			.post(format!("{}/api/v1/auth/verify-token", self.base))
			.json(&serde_json::json!({"token": token}))
			.send()
			.await?;
		resp.json().await
	}

	pub async fn verify_api_key(&self, api_key: &str) -> Result<ApiKeyVerification, reqwest::Error> {
		let resp = self
			.http
			.post(format!("{}/api/v1/auth/verify-api-key", self.base))
			.json(&serde_json::json!({"api_key": api_key}))
			.send()
			.await?;
		resp.json().await
	}
}

/// Paths that never require a principal.
pub fn is_public(path: &str) -> bool {
	path == "/health" || path == "/ready" || path.starts_with("/api/v1/gateway/services")
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
	headers.get(name).and_then(|v| v.to_str().ok())
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
	headers
		.typed_get::<Authorization<Bearer>>()
		.map(|Authorization(bearer)| bearer.token().to_string())
}

/// API keys arrive in a header, a query parameter or a cookie, checked in
/// that order.
fn api_key_credential(req: &Request) -> Option<String> {
	if let Some(key) = header_str(req.headers(), "x-api-key") {
		return Some(key.to_string());
	}
	if let Some(query) = req.uri().query() {
		if let Some((_, v)) = url::form_urlencoded::parse(query.as_bytes()).find(|(k, _)| k == "api_key")
		{
			return Some(v.into_owned());
		}
	}
	CookieJar::from_headers(req.headers())
		.get("api_key")
		.map(|c| c.value().to_string())
}

fn service_header_pair(headers: &HeaderMap) -> Option<(String, String)> {
	let name = header_str(headers, "x-service-name")?;
	let secret = header_str(headers, "x-service-secret")?;
	Some((name.to_string(), secret.to_string()))
}

fn peer_is_loopback(req: &Request) -> bool {
	req
		.extensions()
		.get::<ConnectInfo<SocketAddr>>()
		.map(|ConnectInfo(addr)| addr.ip().is_loopback())
		.unwrap_or(false)
}

fn is_service_client_agent(headers: &HeaderMap) -> bool {
	header_str(headers, "user-agent")
		.map(|ua| SERVICE_CLIENT_AGENTS.iter().any(|f| ua.starts_with(f)))
		.unwrap_or(false)
}

/// Constant-time equality over the full secret length. Only the length
/// check can short-circuit.
fn secrets_match(expected: &str, provided: &str) -> bool {
	let expected = expected.as_bytes();
	let provided = provided.as_bytes();
	if expected.len() != provided.len() {
		return false;
	}
	let mut diff = 0u8;
	for (a, b) in expected.iter().zip(provided) {
		diff |= a ^ b;
	}
	diff == 0
}

/// The registry (or, absent one, the static map) tells us which service
/// names exist. The shared secret is checked when deployment configured one.
async fn recognize_internal(state: &AppState, name: &str, secret: &str) -> bool {
	if let Some(expected) = &state.config.security.service_shared_secret {
		if !secrets_match(expected.expose_secret(), secret) {
			return false;
		}
	}
	match &state.registry {
		Some(registry) => match registry.list_services().await {
			Ok(services) => services.contains_key(name),
			Err(e) => {
				tracing::warn!(error = %e, "service listing failed, using static map");
				state.config.services.contains_key(name)
			},
		},
		None => state.config.services.contains_key(name),
	}
}

/// The unified authentication pipeline: public bypass, internal-service
/// recognition, JWT, API key — first success wins, and only the JWT flow
/// passes through the resource authorization gate.
pub async fn authenticate(
	State(state): State<Arc<AppState>>,
	mut req: Request,
	next: Next,
) -> Response {
	let path = req.uri().path().to_string();

	if is_public(&path) {
		state.metrics.increment(&AuthOutcome {
			method: "public".to_string(),
			outcome: "bypass".to_string(),
		});
		req.extensions_mut().insert(Principal::Anonymous);
		return next.run(req).await;
	}

	// Internal service recognition.
	if let Some((name, secret)) = service_header_pair(req.headers()) {
		if recognize_internal(&state, &name, &secret).await {
			state.metrics.increment(&AuthOutcome {
				method: "internal".to_string(),
				outcome: "ok".to_string(),
			});
			req.extensions_mut().insert(Principal::InternalService {
				service_name: name,
				is_local_dev: false,
			});
			return next.run(req).await;
		}
	} else if state.config.security.local_dev_auth
		&& peer_is_loopback(&req)
		&& is_service_client_agent(req.headers())
	{
		// Gated on loopback; never reachable from a public interface.
		state.metrics.increment(&AuthOutcome {
			method: "internal".to_string(),
			outcome: "local_dev".to_string(),
		});
		req.extensions_mut().insert(Principal::InternalService {
			service_name: "local-dev-service".to_string(),
			is_local_dev: true,
		});
		return next.run(req).await;
	}

	// JWT flow.
	if let Some(token) = bearer_token(req.headers()) {
		let verification = match state.identity.verify_token(&token).await {
			Ok(v) => v,
			Err(e) => {
				tracing::warn!(error = %e, "identity service unreachable");
				state.metrics.increment(&AuthOutcome {
					method: "jwt".to_string(),
					outcome: "error".to_string(),
				});
				return GatewayError::AuthInvalid("identity service unreachable".to_string())
					.into_response();
			},
		};
		if !verification.valid {
			state.metrics.increment(&AuthOutcome {
				method: "jwt".to_string(),
				outcome: "invalid".to_string(),
			});
			let reason = verification.error.unwrap_or("invalid token".to_string());
			return GatewayError::AuthInvalid(reason).into_response();
		}

		let user_id = verification.user_id.unwrap_or_default();
		let mut access_level = None;
		let mut permission_source = None;
		let mut subscription_tier = None;

		if let Some(selector) = authz::derive_selector(&path) {
			match state.authorization.check_access(&user_id, &selector).await {
				Ok(decision) if decision.has_access => {
					state.metrics.increment(&AuthzCheck {
						resource_type: selector.resource_type.to_string(),
						outcome: "allow".to_string(),
					});
					access_level = decision.user_access_level;
					permission_source = decision.permission_source;
					subscription_tier = decision.subscription_tier;
				},
				Ok(decision) => {
					state.metrics.increment(&AuthzCheck {
						resource_type: selector.resource_type.to_string(),
						outcome: "deny".to_string(),
					});
					let reason = decision
						.reason
						.unwrap_or("access denied for resource".to_string());
					return GatewayError::PermissionDenied { reason }.into_response();
				},
				Err(e) if state.config.security.authz_fail_open => {
					// Deliberate availability posture; see configuration.
					tracing::warn!(error = %e, %user_id, resource = %selector.resource_name,
						"authorization service unreachable, failing open");
					state.metrics.increment(&AuthzCheck {
						resource_type: selector.resource_type.to_string(),
						outcome: "fail_open".to_string(),
					});
				},
				Err(e) => {
					tracing::warn!(error = %e, %user_id, "authorization service unreachable, failing closed");
					return GatewayError::PermissionDenied {
						reason: "authorization unavailable".to_string(),
					}
					.into_response();
				},
			}
		}

		state.metrics.increment(&AuthOutcome {
			method: "jwt".to_string(),
			outcome: "ok".to_string(),
		});
		req.extensions_mut().insert(Principal::ExternalUser {
			user_id,
			email: verification.email,
			provider: verification.provider,
			auth_method: AuthMethod::Jwt,
			permissions: Vec::new(),
			access_level,
			permission_source,
			subscription_tier,
		});
		return next.run(req).await;
	}

	// API-key flow. Keys carry their own permission list, so the resource
	// gate is skipped.
	if let Some(api_key) = api_key_credential(&req) {
		let verification = match state.identity.verify_api_key(&api_key).await {
			Ok(v) => v,
			Err(e) => {
				tracing::warn!(error = %e, "identity service unreachable");
				state.metrics.increment(&AuthOutcome {
					method: "api_key".to_string(),
					outcome: "error".to_string(),
				});
				return GatewayError::AuthInvalid("identity service unreachable".to_string())
					.into_response();
			},
		};
		if !verification.valid {
			state.metrics.increment(&AuthOutcome {
				method: "api_key".to_string(),
				outcome: "invalid".to_string(),
			});
			let reason = verification.error.unwrap_or("invalid api key".to_string());
			return GatewayError::AuthInvalid(reason).into_response();
		}

		state.metrics.increment(&AuthOutcome {
			method: "api_key".to_string(),
			outcome: "ok".to_string(),
		});
		let key_id = verification.key_id.unwrap_or_default();
		req.extensions_mut().insert(Principal::ExternalUser {
			user_id: format!("api-key-{key_id}"),
			email: None,
			provider: None,
			auth_method: AuthMethod::ApiKey,
			permissions: verification.permissions,
			access_level: None,
			permission_source: None,
			subscription_tier: None,
		});
		return next.run(req).await;
	}

	state.metrics.increment(&AuthOutcome {
		method: "none".to_string(),
		outcome: "missing".to_string(),
	});
	GatewayError::AuthMissing.into_response()
}
