use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::config::CorsConfig;
use crate::errors::GatewayError;
use crate::gateway::AppState;
use crate::metrics::{HttpRequest, IncrementRecorder};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Request id attached to every request; honored when the client sent one.
#[derive(Clone, Debug)]
pub struct RequestId(pub String);

pub async fn request_id(mut req: Request, next: Next) -> Response {
	let id = req
		.headers()
		.get(REQUEST_ID_HEADER)
		.and_then(|v| v.to_str().ok())
		.map(str::to_string)
		.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
	req.extensions_mut().insert(RequestId(id.clone()));

	let mut resp = next.run(req).await;
	if let Ok(value) = HeaderValue::from_str(&id) {
		resp.headers_mut().insert(REQUEST_ID_HEADER, value);
	}
	resp
}

/// Access log plus the request counter, both recorded after the response
/// is produced.
pub async fn log_requests(
	State(state): State<Arc<AppState>>,
	req: Request,
	next: Next,
) -> Response {
	let method = req.method().clone();
	let path = req.uri().path().to_string();
	let client_ip = req
		.extensions()
		.get::<ConnectInfo<SocketAddr>>()
		.map(|ConnectInfo(addr)| addr.ip().to_string())
		.unwrap_or_default();
	let user_agent = req
		.headers()
		.get(header::USER_AGENT)
		.and_then(|v| v.to_str().ok())
		.unwrap_or("")
		.to_string();
	let request_id = req
		.extensions()
		.get::<RequestId>()
		.map(|id| id.0.clone())
		.unwrap_or_default();
	let start = Instant::now();

	let resp = next.run(req).await;

	state.metrics.increment(&HttpRequest {
		method: method.to_string(),
		status: resp.status().as_u16().to_string(),
	});
	tracing::info!(
		%method,
		%path,
		status = resp.status().as_u16(),
		latency_ms = start.elapsed().as_millis() as u64,
		%client_ip,
		%user_agent,
		%request_id,
		"request completed"
	);
	resp
}

/// One global token bucket. Coarse on purpose; per-principal buckets are a
/// documented extension point.
pub struct RateLimit {
	limiter: DefaultDirectRateLimiter,
	pub rps: u32,
}

impl RateLimit {
	pub fn new(rps: u32, burst: u32) -> Option<Self> {
		let rps_nz = NonZeroU32::new(rps)?;
		let burst_nz = NonZeroU32::new(burst.max(1))?;
		let quota = Quota::per_second(rps_nz).allow_burst(burst_nz);
		Some(Self {
			limiter: RateLimiter::direct(quota),
			rps,
		})
	}

	pub fn try_acquire(&self) -> bool {
		self.limiter.check().is_ok()
	}
}

/// Applies to every path, `/health` included.
pub async fn rate_limit(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
	if let Some(limit) = &state.rate_limit {
		if !limit.try_acquire() {
			return GatewayError::RateLimited { rps: limit.rps }.into_response();
		}
	}
	next.run(req).await
}

/// CORS layer from configuration. Credentials are only honored with an
/// explicit origin list; a wildcard with credentials is not a valid
/// browser combination.
pub fn cors_layer(cfg: &CorsConfig) -> Option<CorsLayer> {
	if !cfg.enabled {
		return None;
	}

	let wildcard_origin = cfg.allow_origins.iter().any(|o| o == "*");
	let mut layer = CorsLayer::new();

	layer = if wildcard_origin {
		layer.allow_origin(Any)
	} else {
		let origins: Vec<HeaderValue> = cfg
			.allow_origins
			.iter()
			.filter_map(|o| HeaderValue::from_str(o).ok())
			.collect();
		layer.allow_origin(AllowOrigin::list(origins))
	};

	layer = if cfg.allow_methods.iter().any(|m| m == "*") {
		layer.allow_methods(Any)
	} else {
		let methods: Vec<Method> = cfg
			.allow_methods
			.iter()
			.filter_map(|m| m.parse().ok())
			.collect();
		layer.allow_methods(methods)
	};

	layer = if cfg.allow_headers.iter().any(|h| h == "*") {
		layer.allow_headers(Any)
	} else {
		let headers: Vec<header::HeaderName> = cfg
			.allow_headers
			.iter()
			.filter_map(|h| h.parse().ok())
			.collect();
		layer.allow_headers(headers)
	};

	if cfg.allow_credentials && !wildcard_origin {
		layer = layer.allow_credentials(true);
	}

	Some(layer)
}

/// Successful preflights answer 204 No Content.
pub async fn preflight_status(req: Request, next: Next) -> Response {
	let is_preflight = req.method() == Method::OPTIONS;
	let mut resp = next.run(req).await;
	if is_preflight
		&& resp.status() == StatusCode::OK
		&& resp
			.headers()
			.contains_key(header::ACCESS_CONTROL_ALLOW_METHODS)
	{
		*resp.status_mut() = StatusCode::NO_CONTENT;
	}
	resp
}
