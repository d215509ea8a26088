use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Request-plane error taxonomy. Every variant has a stable HTTP mapping;
/// the bodies are part of the gateway's public contract.
#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
	#[error("authentication required")]
	AuthMissing,

	#[error("authentication failed: {0}")]
	AuthInvalid(String),

	#[error("insufficient permissions")]
	PermissionDenied { reason: String },

	#[error("service not found")]
	ServiceNotFound,

	#[error("upstream unavailable: {0}")]
	UpstreamUnavailable(String),

	#[error("upstream timed out")]
	UpstreamTimeout,

	#[error("rate limit exceeded")]
	RateLimited { rps: u32 },

	#[error("bad request: {0}")]
	BadRequest(String),

	#[error("missing configuration: {0}")]
	ConfigMissing(String),

	#[error("chain unavailable: {0}")]
	ChainUnavailable(String),

	#[error("chain error: {0}")]
	Chain(String),

	#[error("internal error: {0}")]
	Internal(String),
}

impl IntoResponse for GatewayError {
	fn into_response(self) -> Response {
		let (status, body) = match &self {
			GatewayError::AuthMissing => (
				StatusCode::UNAUTHORIZED,
				json!({"error": "authentication required"}),
			),
			GatewayError::AuthInvalid(reason) => (
				StatusCode::UNAUTHORIZED,
				json!({"error": "authentication failed", "message": reason}),
			),
			GatewayError::PermissionDenied { reason } => (
				StatusCode::FORBIDDEN,
				json!({"error": "insufficient permissions", "message": reason}),
			),
			GatewayError::ServiceNotFound => {
				(StatusCode::NOT_FOUND, json!({"error": "Service not found"}))
			},
			GatewayError::UpstreamUnavailable(cause) => (
				StatusCode::BAD_GATEWAY,
				json!({"error": format!("Service unavailable: {}", cause)}),
			),
			GatewayError::UpstreamTimeout => (
				StatusCode::GATEWAY_TIMEOUT,
				json!({"error": "upstream timed out"}),
			),
			GatewayError::RateLimited { rps } => (
				StatusCode::TOO_MANY_REQUESTS,
				json!({
					"error": "rate limit exceeded",
					"message": format!("rate limit: {} requests per second", rps),
				}),
			),
			GatewayError::BadRequest(reason) => (
				StatusCode::BAD_REQUEST,
				json!({"error": "bad request", "message": reason}),
			),
			GatewayError::ConfigMissing(what) => (
				StatusCode::INTERNAL_SERVER_ERROR,
				json!({"error": "configuration missing", "code": "CONFIG_MISSING", "message": what}),
			),
			GatewayError::ChainUnavailable(chain) => (
				StatusCode::SERVICE_UNAVAILABLE,
				json!({"error": "chain unavailable", "message": chain}),
			),
			GatewayError::Chain(cause) => (
				StatusCode::INTERNAL_SERVER_ERROR,
				json!({"error": "chain error", "message": cause}),
			),
			GatewayError::Internal(cause) => (
				StatusCode::INTERNAL_SERVER_ERROR,
				json!({"error": "internal error", "message": cause}),
			),
		};
		(status, Json(body)).into_response()
	}
}

impl GatewayError {
	/// Collapse a reqwest transport failure into the upstream taxonomy.
	pub fn from_upstream(err: reqwest::Error) -> Self {
		if err.is_timeout() {
			GatewayError::UpstreamTimeout
		} else {
			GatewayError::UpstreamUnavailable(err.to_string())
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use http_body_util::BodyExt;

	async fn body_json(resp: Response) -> serde_json::Value {
		let bytes = resp.into_body().collect().await.unwrap().to_bytes();
		serde_json::from_slice(&bytes).unwrap()
	}

	#[tokio::test]
	async fn not_found_body_is_stable() {
		let resp = GatewayError::ServiceNotFound.into_response();
		assert_eq!(resp.status(), StatusCode::NOT_FOUND);
		assert_eq!(
			body_json(resp).await,
			serde_json::json!({"error": "Service not found"})
		);
	}

	#[tokio::test]
	async fn rate_limit_body_names_the_rate() {
		let resp = GatewayError::RateLimited { rps: 5 }.into_response();
		assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
		let body = body_json(resp).await;
		assert_eq!(body["error"], "rate limit exceeded");
		assert_eq!(body["message"], "rate limit: 5 requests per second");
	}

	#[tokio::test]
	async fn upstream_error_keeps_the_cause() {
		let resp = GatewayError::UpstreamUnavailable("connection refused".to_string()).into_response();
		assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
		let body = body_json(resp).await;
		assert_eq!(body["error"], "Service unavailable: connection refused");
	}
}
