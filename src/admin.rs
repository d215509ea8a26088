use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde_json::json;

use crate::gateway::AppState;
use crate::metrics;

/// Management routes nested under /api/v1/gateway.
pub fn router() -> Router<Arc<AppState>> {
	Router::new()
		.route("/services", get(services_handler))
		.route("/metrics", get(metrics_handler))
		.route("/health", get(services_health_handler))
}

/// Liveness: always 200 while the process serves traffic.
pub async fn health() -> Json<serde_json::Value> {
	Json(json!({
		"status": "healthy",
		"service": "isa-gateway",
		"version": env!("CARGO_PKG_VERSION"),
		"timestamp": chrono::Utc::now().to_rfc3339(),
	}))
}

/// Readiness: 200 iff every configured optional subsystem is reachable.
pub async fn ready(State(state): State<Arc<AppState>>) -> Response {
	let mut services: BTreeMap<&'static str, bool> = BTreeMap::new();

	if state.config.registry.enabled {
		let up = match &state.registry {
			Some(registry) => registry.probe().await.is_ok(),
			None => false,
		};
		services.insert("registry", up);
	}
	if state.config.mqtt.enabled {
		let up = state
			.mqtt
			.as_ref()
			.map(|handle| handle.is_connected())
			.unwrap_or(false);
		services.insert("mqtt", up);
	}
	if state.config.blockchain.enabled {
		let up = state
			.chains
			.as_ref()
			.map(|facade| facade.default_connected())
			.unwrap_or(false);
		services.insert("blockchain", up);
	}

	let ready = services.values().all(|up| *up);
	let status = if ready {
		StatusCode::OK
	} else {
		StatusCode::SERVICE_UNAVAILABLE
	};
	(
		status,
		Json(json!({
			"ready": ready,
			"services": services,
			"timestamp": chrono::Utc::now().to_rfc3339(),
		})),
	)
		.into_response()
}

/// The static service map the router falls back to.
async fn services_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
	let services: Vec<serde_json::Value> = state
		.config
		.services
		.iter()
		.map(|(name, target)| {
			json!({
				"name": name,
				"host": target.host,
				"http_port": target.http_port,
				"grpc_port": target.grpc_port,
				"status": "configured",
			})
		})
		.collect();
	Json(json!({"services": services}))
}

/// Probe /health of every static target. 2s per probe keeps the page
/// responsive even with a dead backend in the map.
async fn services_health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
	let mut health: BTreeMap<String, bool> = BTreeMap::new();
	for (name, target) in state.config.services.iter() {
		let up = state
			.proxy
			.standard
			.get(format!("{}/health", target.base_url()))
			.timeout(Duration::from_secs(2))
			.send()
			.await
			.map(|resp| resp.status().is_success())
			.unwrap_or(false);
		health.insert(name.clone(), up);
	}
	Json(json!({
		"services": health,
		"timestamp": chrono::Utc::now().to_rfc3339(),
	}))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
	match metrics::render(&state.prometheus) {
		Ok(text) => text.into_response(),
		Err(e) => {
			tracing::error!(error = %e, "metrics encoding failed");
			StatusCode::INTERNAL_SERVER_ERROR.into_response()
		},
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::Config;
	use axum::body::Body;
	use http_body_util::BodyExt;
	use tower::ServiceExt;

	async fn body_json(resp: Response) -> serde_json::Value {
		let bytes = resp.into_body().collect().await.unwrap().to_bytes();
		serde_json::from_slice(&bytes).unwrap()
	}

	#[tokio::test]
	async fn health_is_always_200() {
		let resp = health().await.into_response();
		assert_eq!(resp.status(), StatusCode::OK);
		let body = body_json(resp).await;
		assert_eq!(body["status"], "healthy");
		assert_eq!(body["service"], "isa-gateway");
	}

	#[tokio::test]
	async fn ready_reports_missing_registry() {
		// Registry enabled in config but unreachable at startup.
		let state = Arc::new(AppState::new(Arc::new(Config::default_with_services())));
		let resp = ready(State(state)).await;
		assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
		let body = body_json(resp).await;
		assert_eq!(body["ready"], false);
		assert_eq!(body["services"]["registry"], false);
	}

	#[tokio::test]
	async fn ready_is_200_with_nothing_optional_configured() {
		let mut config = Config::default_with_services();
		config.registry.enabled = false;
		let state = Arc::new(AppState::new(Arc::new(config)));
		let resp = ready(State(state)).await;
		assert_eq!(resp.status(), StatusCode::OK);
	}

	#[tokio::test]
	async fn services_listing_shows_the_static_map() {
		let state = Arc::new(AppState::new(Arc::new(Config::default_with_services())));
		let router = router().with_state(state);
		let resp = router
			.oneshot(
				axum::http::Request::builder()
					.uri("/services")
					.body(Body::empty())
					.unwrap(),
			)
			.await
			.unwrap();
		assert_eq!(resp.status(), StatusCode::OK);
		let body = body_json(resp).await;
		let names: Vec<&str> = body["services"]
			.as_array()
			.unwrap()
			.iter()
			.map(|s| s["name"].as_str().unwrap())
			.collect();
		assert!(names.contains(&"auth"));
		assert!(names.contains(&"mcp"));
	}

	#[tokio::test]
	async fn metrics_render_as_prometheus_text() {
		let state = Arc::new(AppState::new(Arc::new(Config::default_with_services())));
		let router = router().with_state(state);
		let resp = router
			.oneshot(
				axum::http::Request::builder()
					.uri("/metrics")
					.body(Body::empty())
					.unwrap(),
			)
			.await
			.unwrap();
		assert_eq!(resp.status(), StatusCode::OK);
	}
}
