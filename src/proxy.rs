use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, StatusCode, header};
use axum::response::{IntoResponse, Response};
use once_cell::sync::Lazy;

use crate::errors::GatewayError;
use crate::gateway::AppState;
use crate::metrics::IncrementRecorder;
use crate::router::{self, ProxyStrategy, RouteClass, RouteDecision};
use crate::{metrics, sse};

/// Hop-by-hop headers are stripped in both directions (RFC 7230 §6.1).
static HOP_BY_HOP: Lazy<Vec<HeaderName>> = Lazy::new(|| {
	vec![
		header::CONNECTION,
		HeaderName::from_static("keep-alive"),
		header::PROXY_AUTHENTICATE,
		header::PROXY_AUTHORIZATION,
		header::TE,
		header::TRAILER,
		header::TRANSFER_ENCODING,
		header::UPGRADE,
	]
});

/// The gateway owns CORS; upstream copies are dropped so the browser never
/// sees duplicates.
static UPSTREAM_CORS: Lazy<Vec<HeaderName>> = Lazy::new(|| {
	vec![
		header::ACCESS_CONTROL_ALLOW_ORIGIN,
		header::ACCESS_CONTROL_ALLOW_METHODS,
		header::ACCESS_CONTROL_ALLOW_HEADERS,
		header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
		header::ACCESS_CONTROL_MAX_AGE,
		header::ACCESS_CONTROL_EXPOSE_HEADERS,
	]
});

/// Upstream HTTP clients. The streaming client carries the 30-minute SSE
/// deadline; everything else uses the standard 30-second one.
pub struct ProxyClient {
	pub standard: reqwest::Client,
	pub streaming: reqwest::Client,
}

impl ProxyClient {
	pub fn new() -> Self {
		let standard = reqwest::Client::builder()
			.timeout(Duration::from_secs(30))
			.build()
			.expect("default reqwest client");
		let streaming = reqwest::Client::builder()
			.timeout(Duration::from_secs(30 * 60))
			.build()
			.expect("default reqwest client");
		Self {
			standard,
			streaming,
		}
	}
}

impl Default for ProxyClient {
	fn default() -> Self {
		Self::new()
	}
}

pub(crate) fn target_url(decision: &RouteDecision, query: Option<&str>) -> String {
	match query {
		Some(q) if !q.is_empty() => {
			format!("{}{}?{}", decision.target_base_url, decision.rewritten_path, q)
		},
		_ => format!("{}{}", decision.target_base_url, decision.rewritten_path),
	}
}

/// Headers forwarded upstream. Host and content-length are recomputed by
/// the client.
pub(crate) fn upstream_request_headers(inbound: &HeaderMap) -> HeaderMap {
	let mut out = HeaderMap::new();
	for (name, value) in inbound {
		if HOP_BY_HOP.contains(name) || name == header::HOST || name == header::CONTENT_LENGTH {
			continue;
		}
		out.append(name, value.clone());
	}
	out
}

/// Headers copied back to the client: everything except hop-by-hop and
/// upstream CORS.
pub(crate) fn downstream_response_headers(upstream: &HeaderMap) -> HeaderMap {
	let mut out = HeaderMap::new();
	for (name, value) in upstream {
		if HOP_BY_HOP.contains(name) || UPSTREAM_CORS.contains(name) {
			continue;
		}
		out.append(name, value.clone());
	}
	out
}

/// Forward a request and stream the upstream response through unchanged.
pub async fn forward_standard(
	client: &reqwest::Client,
	decision: &RouteDecision,
	req: Request,
) -> Result<Response, GatewayError> {
	let (parts, body) = req.into_parts();
	let url = target_url(decision, parts.uri.query());
	let headers = upstream_request_headers(&parts.headers);

	let upstream = client
		.request(parts.method, url)
		.headers(headers)
		.body(reqwest::Body::wrap_stream(body.into_data_stream()))
		.send()
		.await
		.map_err(GatewayError::from_upstream)?;

	Ok(stream_response(upstream))
}

/// Build the downstream response from an upstream one: same status, pruned
/// headers, body streamed rather than buffered.
pub(crate) fn stream_response(upstream: reqwest::Response) -> Response {
	let status = upstream.status();
	let headers = downstream_response_headers(upstream.headers());
	let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
	*response.status_mut() = status;
	*response.headers_mut() = headers;
	response
}

/// Fallback handler for every dynamic `/api/v1/{service}/...` path: route,
/// then hand off to the chosen forwarding strategy.
pub async fn dispatch(State(state): State<Arc<AppState>>, req: Request) -> Response {
	let path = req.uri().path().to_string();
	let logical_name = match router::classify(&path) {
		RouteClass::Service(name) => name,
		// Anything else that reached the fallback has no handler.
		RouteClass::NotApi | RouteClass::Management => {
			return StatusCode::NOT_FOUND.into_response();
		},
	};

	let decision = match router::resolve(
		&state.config,
		state.registry.as_deref(),
		&logical_name,
		&path,
	)
	.await
	{
		Ok(decision) => decision,
		Err(e) => return e.into_response(),
	};

	state.metrics.increment(&metrics::ProxiedRequest {
		service: decision.logical_name.clone(),
		strategy: decision.strategy.as_str().to_string(),
	});

	let result = match decision.strategy {
		ProxyStrategy::Standard => forward_standard(&state.proxy.standard, &decision, req).await,
		ProxyStrategy::Sse => sse::forward(&state.proxy, &decision, req).await,
	};

	match result {
		Ok(response) => response,
		Err(e) => {
			tracing::error!(service = %decision.logical_name, error = %e, "upstream forwarding failed");
			state.metrics.increment(&metrics::ProxyError {
				service: decision.logical_name.clone(),
				kind: match &e {
					GatewayError::UpstreamTimeout => "timeout".to_string(),
					_ => "unavailable".to_string(),
				},
			});
			e.into_response()
		},
	}
}
