use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::middleware;
use axum::routing::get;
use prometheus_client::registry::Registry;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::authn::{self, IdentityClient};
use crate::authz::AuthorizationClient;
use crate::chain::ChainFacade;
use crate::config::Config;
use crate::filters::{self, RateLimit};
use crate::metrics::Metrics;
use crate::mqtt::{BridgeHandle, MqttBridge};
use crate::proxy::ProxyClient;
use crate::registry::RegistryClient;
use crate::{admin, chain, proxy};

const GATEWAY_SERVICE_NAME: &str = "isa-gateway";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Long-lived singletons shared by every request task. Read-only after
/// startup apart from adapter connection state and the MQTT handler map,
/// which guard themselves.
pub struct AppState {
	pub config: Arc<Config>,
	pub registry: Option<Arc<RegistryClient>>,
	pub identity: IdentityClient,
	pub authorization: AuthorizationClient,
	pub proxy: ProxyClient,
	pub chains: Option<Arc<ChainFacade>>,
	pub mqtt: Option<BridgeHandle>,
	pub rate_limit: Option<RateLimit>,
	pub metrics: Arc<Metrics>,
	pub prometheus: Arc<Registry>,
}

impl AppState {
	pub fn new(config: Arc<Config>) -> Self {
		let mut prometheus = Registry::default();
		let metrics = Arc::new(Metrics::new(crate::metrics::sub_registry(&mut prometheus)));

		// Identity and authorization live on the auth service.
		let auth_base = config
			.static_target("auth")
			.map(|t| t.base_url())
			.unwrap_or("http://127.0.0.1:8202".to_string());

		let rate_limit = if config.security.rate_limit.enabled {
			RateLimit::new(
				config.security.rate_limit.rps,
				config.security.rate_limit.burst,
			)
		} else {
			None
		};

		Self {
			identity: IdentityClient::new(&auth_base),
			authorization: AuthorizationClient::new(&auth_base),
			proxy: ProxyClient::new(),
			registry: None,
			chains: None,
			mqtt: None,
			rate_limit,
			metrics,
			prometheus: Arc::new(prometheus),
			config,
		}
	}
}

/// Full middleware and route assembly. Execution order per request:
/// rate limit, request id, access log, CORS, authentication, then the
/// gateway's own routes with dynamic proxying as the fallback.
pub fn build_router(state: Arc<AppState>) -> Router {
	let mut router = Router::new()
		.route("/health", get(admin::health))
		.route("/ready", get(admin::ready))
		.nest("/api/v1/gateway", admin::router())
		.nest("/api/v1/blockchain", chain::http_router())
		.fallback(proxy::dispatch)
		.layer(middleware::from_fn_with_state(
			state.clone(),
			authn::authenticate,
		));

	if let Some(cors) = filters::cors_layer(&state.config.security.cors) {
		router = router
			.layer(cors)
			.layer(middleware::from_fn(filters::preflight_status));
	}

	router
		.layer(middleware::from_fn_with_state(
			state.clone(),
			filters::log_requests,
		))
		.layer(middleware::from_fn(filters::request_id))
		.layer(middleware::from_fn_with_state(
			state.clone(),
			filters::rate_limit,
		))
		.with_state(state)
}

/// Wires the subsystems, then runs the HTTP and gRPC listeners until a
/// signal or a listener failure triggers graceful shutdown.
pub struct Gateway {
	config: Arc<Config>,
	state: Arc<AppState>,
	mqtt_bridge: Option<MqttBridge>,
}

impl Gateway {
	pub async fn new(config: Config) -> anyhow::Result<Self> {
		let config = Arc::new(config);
		let mut state = AppState::new(config.clone());

		if config.registry.enabled {
			let client = RegistryClient::new(&config.registry.address);
			match client.probe().await {
				Ok(()) => {
					state.registry = Some(Arc::new(client));
				},
				Err(e) => {
					// The registry is optional; all lookups fall back to
					// the static service map.
					warn!(error = %e, "service registry unreachable, continuing without discovery");
				},
			}
		}

		if config.blockchain.enabled {
			let facade = ChainFacade::from_config(&config.blockchain, state.metrics.clone())?;
			facade.connect_all().await;
			state.chains = Some(Arc::new(facade));
		}

		let mqtt_bridge = if config.mqtt.enabled {
			let (bridge, handle) = MqttBridge::new(&config, state.metrics.clone())?;
			state.mqtt = Some(handle);
			Some(bridge)
		} else {
			None
		};

		Ok(Self {
			config,
			state: Arc::new(state),
			mqtt_bridge,
		})
	}

	pub fn state(&self) -> Arc<AppState> {
		self.state.clone()
	}

	pub async fn run(self) -> anyhow::Result<()> {
		let ct = CancellationToken::new();
		let mut run_set: JoinSet<anyhow::Result<()>> = JoinSet::new();

		// Best-effort self-registration; never fatal.
		let mut registration_id = None;
		if let Some(registry) = &self.state.registry {
			let host = if self.config.server.host == "0.0.0.0" {
				"127.0.0.1".to_string()
			} else {
				self.config.server.host.clone()
			};
			match registry
				.register_self(
					GATEWAY_SERVICE_NAME,
					&host,
					self.config.server.http_port,
					vec!["gateway".to_string()],
				)
				.await
			{
				Ok(id) => registration_id = Some(id),
				Err(e) => warn!(error = %e, "gateway self-registration failed"),
			}
		}

		// HTTP listener.
		let http_addr = format!(
			"{}:{}",
			self.config.server.host, self.config.server.http_port
		);
		let listener = tokio::net::TcpListener::bind(&http_addr).await?;
		info!(%http_addr, "serving http");
		let router = build_router(self.state.clone());
		let svc = router.into_make_service_with_connect_info::<SocketAddr>();
		let shutdown = ct.child_token();
		run_set.spawn(async move {
			axum::serve(listener, svc)
				.with_graceful_shutdown(shutdown.cancelled_owned())
				.await
				.map_err(anyhow::Error::from)
		});

		// gRPC listener: standard health protocol only.
		let grpc_addr: SocketAddr = format!(
			"{}:{}",
			self.config.server.host, self.config.server.grpc_port
		)
		.parse()?;
		let (mut health_reporter, health_service) = tonic_health::server::health_reporter();
		health_reporter
			.set_service_status(GATEWAY_SERVICE_NAME, tonic_health::ServingStatus::Serving)
			.await;
		info!(%grpc_addr, "serving grpc");
		let shutdown = ct.child_token();
		run_set.spawn(async move {
			tonic::transport::Server::builder()
				.add_service(health_service)
				.serve_with_shutdown(grpc_addr, shutdown.cancelled_owned())
				.await
				.map_err(anyhow::Error::from)
		});

		if let Some(bridge) = self.mqtt_bridge {
			let child = ct.child_token();
			run_set.spawn(bridge.run(child));
		}

		// Run until a signal arrives or any listener dies.
		tokio::select! {
			_ = shutdown_signal() => {
				info!("shutdown signal received");
			},
			result = run_set.join_next() => {
				match result {
					Some(Ok(Ok(()))) => info!("listener exited"),
					Some(Ok(Err(e))) => error!(error = %e, "listener failed"),
					Some(Err(e)) => error!(error = %e, "listener panicked"),
					None => {},
				}
			},
		}

		ct.cancel();
		let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
			while run_set.join_next().await.is_some() {}
		})
		.await;
		if drained.is_err() {
			warn!("shutdown grace period exceeded, aborting remaining tasks");
			run_set.abort_all();
		}

		if let (Some(registry), Some(id)) = (&self.state.registry, &registration_id) {
			if let Err(e) = registry.deregister(id).await {
				warn!(error = %e, "gateway deregistration failed");
			}
		}
		if let Some(chains) = &self.state.chains {
			chains.disconnect_all().await;
		}
		info!("gateway stopped");
		Ok(())
	}
}

async fn shutdown_signal() {
	let ctrl_c = async {
		if let Err(e) = tokio::signal::ctrl_c().await {
			error!(error = %e, "failed to install ctrl-c handler");
		}
	};

	#[cfg(unix)]
	let terminate = async {
		match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
			Ok(mut signal) => {
				signal.recv().await;
			},
			Err(e) => error!(error = %e, "failed to install sigterm handler"),
		}
	};
	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		_ = ctrl_c => {},
		_ = terminate => {},
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use axum::body::Body;
	use axum::http::StatusCode;
	use http_body_util::BodyExt;
	use tower::ServiceExt;

	fn quiet_config() -> Config {
		let mut config = Config::default_with_services();
		config.registry.enabled = false;
		config
	}

	#[tokio::test]
	async fn health_works_through_the_full_stack() {
		let state = Arc::new(AppState::new(Arc::new(quiet_config())));
		let router = build_router(state.clone());
		let resp = router
			.oneshot(
				axum::http::Request::builder()
					.uri("/health")
					.body(Body::empty())
					.unwrap(),
			)
			.await
			.unwrap();
		assert_eq!(resp.status(), StatusCode::OK);
		// Request id minted by the filter chain.
		assert!(resp.headers().contains_key("x-request-id"));

		// The access-log filter counted the request.
		let rendered = crate::metrics::render(&state.prometheus).unwrap();
		assert!(rendered.contains("isa_gateway_requests_total"));
		assert!(rendered.contains("method=\"GET\""));
		assert!(rendered.contains("status=\"200\""));
	}

	#[tokio::test]
	async fn rate_limit_applies_before_everything_else() {
		let mut config = quiet_config();
		config.security.rate_limit.rps = 1;
		config.security.rate_limit.burst = 1;
		let state = Arc::new(AppState::new(Arc::new(config)));
		let router = build_router(state);

		let first = router
			.clone()
			.oneshot(
				axum::http::Request::builder()
					.uri("/health")
					.body(Body::empty())
					.unwrap(),
			)
			.await
			.unwrap();
		assert_eq!(first.status(), StatusCode::OK);

		let second = router
			.oneshot(
				axum::http::Request::builder()
					.uri("/health")
					.body(Body::empty())
					.unwrap(),
			)
			.await
			.unwrap();
		assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
		let body: serde_json::Value =
			serde_json::from_slice(&second.into_body().collect().await.unwrap().to_bytes()).unwrap();
		assert_eq!(body["message"], "rate limit: 1 requests per second");
	}

	#[tokio::test]
	async fn unknown_service_is_404_through_the_stack() {
		let mut config = quiet_config();
		// Internal recognition needs no secret when none is configured;
		// use a static service name so the request passes authentication.
		config.security.local_dev_auth = false;
		let state = Arc::new(AppState::new(Arc::new(config)));
		let router = build_router(state);
		let resp = router
			.oneshot(
				axum::http::Request::builder()
					.uri("/api/v1/payments/charge")
					.header("x-service-name", "auth")
					.header("x-service-secret", "dev")
					.body(Body::empty())
					.unwrap(),
			)
			.await
			.unwrap();
		assert_eq!(resp.status(), StatusCode::NOT_FOUND);
		let body: serde_json::Value =
			serde_json::from_slice(&resp.into_body().collect().await.unwrap().to_bytes()).unwrap();
		assert_eq!(body["error"], "Service not found");
	}
}
