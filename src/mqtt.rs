use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use secrecy::ExposeSecret;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::metrics::{IncrementRecorder, Metrics, MqttMessage};

pub fn parse_qos(qos: u8) -> QoS {
	match qos {
		0 => QoS::AtMostOnce,
		2 => QoS::ExactlyOnce,
		_ => QoS::AtLeastOnce,
	}
}

/// Segment-level MQTT pattern match: `+` spans one segment, `#` the rest.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
	let mut pattern = pattern.split('/');
	let mut topic = topic.split('/');
	loop {
		match (pattern.next(), topic.next()) {
			(Some("#"), _) => return true,
			(Some("+"), Some(_)) => continue,
			(Some(p), Some(t)) if p == t => continue,
			(None, None) => return true,
			_ => return false,
		}
	}
}

fn device_id_from_topic(topic: &str) -> Option<&str> {
	topic.split('/').nth(1).filter(|s| !s.is_empty())
}

/// Built-in handler set; first matching pattern wins.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandlerKind {
	Telemetry,
	Status,
	CommandResponse,
	Auth,
	Registration,
}

impl HandlerKind {
	pub fn as_str(&self) -> &'static str {
		match self {
			HandlerKind::Telemetry => "telemetry",
			HandlerKind::Status => "status",
			HandlerKind::CommandResponse => "command_response",
			HandlerKind::Auth => "auth",
			HandlerKind::Registration => "registration",
		}
	}
}

/// State shared between the broker event loop and dispatch tasks. Kept
/// separate from the event loop itself so it stays `Sync` and can be
/// borrowed across `.await` points inside the bridge's run loop.
struct BridgeShared {
	handlers: RwLock<Vec<(String, HandlerKind)>>,
	ctx: Arc<BridgeCtx>,
}

impl BridgeShared {
	async fn resubscribe_all(&self) {
		let patterns: Vec<String> = self
			.handlers
			.read()
			.await
			.iter()
			.map(|(p, _)| p.clone())
			.collect();
		for pattern in patterns {
			if let Err(e) = self.ctx.client.subscribe(pattern.as_str(), self.ctx.qos).await {
				tracing::error!(%pattern, error = %e, "subscribe failed");
			}
		}
	}

	/// First matching pattern wins; the forwarding work runs on its own
	/// task so the broker callback loop never blocks on backend HTTP.
	async fn dispatch(&self, topic: String, payload: Bytes) {
		let kind = {
			let handlers = self.handlers.read().await;
			handlers
				.iter()
				.find(|(pattern, _)| topic_matches(pattern, &topic))
				.map(|(_, kind)| *kind)
		};
		let Some(kind) = kind else {
			tracing::debug!(%topic, "unmatched mqtt message dropped");
			return;
		};

		let ctx = self.ctx.clone();
		tokio::spawn(async move {
			let outcome = match handle_message(&ctx, kind, &topic, &payload).await {
				Ok(()) => "ok",
				Err(e) => {
					tracing::error!(%topic, handler = kind.as_str(), error = %e, "mqtt handler failed");
					"error"
				},
			};
			ctx.metrics.increment(&MqttMessage {
				handler: kind.as_str().to_string(),
				outcome: outcome.to_string(),
			});
		});
	}
}

/// Everything a message handler needs, shared with spawned dispatch tasks.
struct BridgeCtx {
	http: reqwest::Client,
	client: AsyncClient,
	qos: QoS,
	telemetry_base: String,
	device_base: String,
	auth_base: String,
	metrics: Arc<Metrics>,
}

/// Cheap handle held by the HTTP layer: downlink publishing and the
/// readiness flag.
#[derive(Clone)]
pub struct BridgeHandle {
	client: AsyncClient,
	qos: QoS,
	connected: Arc<AtomicBool>,
}

impl BridgeHandle {
	pub fn is_connected(&self) -> bool {
		self.connected.load(Ordering::Relaxed)
	}

	/// Downlink: publish a command to `devices/{device_id}/commands`.
	pub async fn send_command(
		&self,
		device_id: &str,
		command: &serde_json::Value,
	) -> anyhow::Result<()> {
		let payload = serde_json::to_vec(command)?;
		self
			.client
			.publish(
				format!("devices/{device_id}/commands"),
				self.qos,
				false,
				payload,
			)
			.await?;
		Ok(())
	}
}

/// Adapts device MQTT traffic onto the backend HTTP surface and publishes
/// downlink/auth/registration responses back to the broker.
pub struct MqttBridge {
	eventloop: rumqttc::EventLoop,
	shared: Arc<BridgeShared>,
	connected: Arc<AtomicBool>,
	auto_reconnect: bool,
}

fn broker_host_port(broker_url: &str) -> anyhow::Result<(String, u16)> {
	let normalized = if broker_url.contains("://") {
		broker_url.to_string()
	} else {
		format!("mqtt://{broker_url}")
	};
	let url = url::Url::parse(&normalized)?;
	let host = url
		.host_str()
		.ok_or(anyhow::anyhow!("broker url has no host: {broker_url}"))?
		.to_string();
	Ok((host, url.port().unwrap_or(1883)))
}

impl MqttBridge {
	pub fn new(config: &Config, metrics: Arc<Metrics>) -> anyhow::Result<(Self, BridgeHandle)> {
		let mqtt = &config.mqtt;
		let (host, port) = broker_host_port(&mqtt.broker_url)?;

		// Timestamp suffix keeps concurrent gateway instances from kicking
		// each other off the broker.
		let unix_ts = SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.unwrap_or_default()
			.as_secs();
		let client_id = format!("{}_{}", mqtt.client_id, unix_ts);

		let mut options = MqttOptions::new(client_id, host, port);
		options.set_keep_alive(Duration::from_secs(mqtt.keep_alive));
		options.set_clean_session(mqtt.clean_session);
		if let Some(username) = &mqtt.username {
			let password = mqtt
				.password
				.as_ref()
				.map(|p| p.expose_secret().to_string())
				.unwrap_or_default();
			options.set_credentials(username.clone(), password);
		}

		let (client, eventloop) = AsyncClient::new(options, 64);

		let qos = parse_qos(mqtt.qos);
		let http = reqwest::Client::builder()
			.timeout(Duration::from_secs(30))
			.build()
			.expect("default reqwest client");

		let auth_base = config
			.static_target("auth")
			.map(|t| t.base_url())
			.unwrap_or("http://127.0.0.1:8202".to_string());
		let ctx = Arc::new(BridgeCtx {
			http,
			client: client.clone(),
			qos,
			telemetry_base: config.device_management.telemetry_service.base_url(),
			device_base: config.device_management.device_service.base_url(),
			auth_base,
			metrics,
		});

		let topics = &mqtt.topics;
		let handlers = RwLock::new(vec![
			(topics.device_telemetry.clone(), HandlerKind::Telemetry),
			(topics.device_status.clone(), HandlerKind::Status),
			(
				topics.device_commands_response.clone(),
				HandlerKind::CommandResponse,
			),
			(topics.device_auth.clone(), HandlerKind::Auth),
			(topics.device_registration.clone(), HandlerKind::Registration),
		]);

		let connected = Arc::new(AtomicBool::new(false));
		let handle = BridgeHandle {
			client,
			qos,
			connected: connected.clone(),
		};
		Ok((
			Self {
				eventloop,
				shared: Arc::new(BridgeShared { handlers, ctx }),
				connected,
				auto_reconnect: mqtt.auto_reconnect,
			},
			handle,
		))
	}

	/// Register an additional handler pattern at runtime.
	pub async fn subscribe(&self, pattern: &str, kind: HandlerKind) -> anyhow::Result<()> {
		self
			.shared
			.handlers
			.write()
			.await
			.push((pattern.to_string(), kind));
		if self.connected.load(Ordering::Relaxed) {
			self.shared.ctx.client.subscribe(pattern, self.shared.ctx.qos).await?;
		}
		Ok(())
	}

	pub async fn unsubscribe(&self, pattern: &str) -> anyhow::Result<()> {
		self
			.shared
			.handlers
			.write()
			.await
			.retain(|(p, _)| p != pattern);
		self.shared.ctx.client.unsubscribe(pattern).await?;
		Ok(())
	}

	/// Broker event loop. Polling again after an error is what reconnects;
	/// every ConnAck re-subscribes the full handler set.
	pub async fn run(mut self, ct: CancellationToken) -> anyhow::Result<()> {
		loop {
			tokio::select! {
				_ = ct.cancelled() => {
					tracing::info!("mqtt bridge shutting down");
					let _ = self.shared.ctx.client.disconnect().await;
					return Ok(());
				},
				event = self.eventloop.poll() => match event {
					Ok(Event::Incoming(Packet::ConnAck(_))) => {
						tracing::info!("connected to mqtt broker");
						self.connected.store(true, Ordering::Relaxed);
						self.shared.resubscribe_all().await;
					},
					Ok(Event::Incoming(Packet::Publish(publish))) => {
						self.shared.dispatch(publish.topic, publish.payload).await;
					},
					Ok(_) => {},
					Err(e) => {
						self.connected.store(false, Ordering::Relaxed);
						if !self.auto_reconnect {
							return Err(anyhow::anyhow!("mqtt connection lost: {e}"));
						}
						tracing::warn!(error = %e, "mqtt connection error, reconnecting");
						tokio::time::sleep(Duration::from_secs(1)).await;
					},
				},
			}
		}
	}
}

fn parse_object(payload: &[u8]) -> anyhow::Result<serde_json::Map<String, serde_json::Value>> {
	match serde_json::from_slice(payload)? {
		serde_json::Value::Object(map) => Ok(map),
		other => anyhow::bail!("expected JSON object, got {other}"),
	}
}

async fn handle_message(
	ctx: &BridgeCtx,
	kind: HandlerKind,
	topic: &str,
	payload: &[u8],
) -> anyhow::Result<()> {
	match kind {
		HandlerKind::Telemetry => {
			let device_id = device_id_from_topic(topic)
				.ok_or(anyhow::anyhow!("no device id in topic {topic}"))?;
			let mut body = parse_object(payload)?;
			body
				.entry("device_id".to_string())
				.or_insert(serde_json::Value::String(device_id.to_string()));
			let url = format!("{}/api/v1/devices/{device_id}/telemetry", ctx.telemetry_base);
			ctx.http.post(url).json(&body).send().await?.error_for_status()?;
			Ok(())
		},
		HandlerKind::Status => {
			let device_id = device_id_from_topic(topic)
				.ok_or(anyhow::anyhow!("no device id in topic {topic}"))?;
			let mut body = parse_object(payload)?;
			body
				.entry("device_id".to_string())
				.or_insert(serde_json::Value::String(device_id.to_string()));
			let url = format!("{}/api/v1/devices/{device_id}/status", ctx.device_base);
			ctx.http.post(url).json(&body).send().await?.error_for_status()?;
			Ok(())
		},
		HandlerKind::CommandResponse => {
			tracing::info!(%topic, payload = %String::from_utf8_lossy(payload), "device command response");
			Ok(())
		},
		HandlerKind::Auth => {
			let device_id = device_id_from_topic(topic)
				.ok_or(anyhow::anyhow!("no device id in topic {topic}"))?;
			let body = parse_object(payload)?;
			let api_key = body
				.get("api_key")
				.and_then(|v| v.as_str())
				.unwrap_or_default();
			let success = match ctx
				.http
				.post(format!("{}/api/v1/auth/verify-api-key", ctx.auth_base))
				.json(&serde_json::json!({"api_key": api_key}))
				.send()
				.await
			{
				Ok(resp) => resp
					.json::<serde_json::Value>()
					.await
					.ok()
					.and_then(|v| v.get("valid").and_then(|b| b.as_bool()))
					.unwrap_or(false),
				Err(e) => {
					tracing::warn!(%device_id, error = %e, "device auth verification failed");
					false
				},
			};
			let response = serde_json::json!({"success": success, "device_id": device_id});
			ctx
				.client
				.publish(
					format!("devices/{device_id}/auth/response"),
					ctx.qos,
					false,
					serde_json::to_vec(&response)?,
				)
				.await?;
			Ok(())
		},
		HandlerKind::Registration => {
			let body = parse_object(payload)?;
			let device_id = body
				.get("device_id")
				.and_then(|v| v.as_str())
				.ok_or(anyhow::anyhow!("registration payload missing device_id"))?
				.to_string();
			let resp = ctx
				.http
				.post(format!("{}/api/v1/devices/register", ctx.device_base))
				.json(&body)
				.send()
				.await?;
			let status = resp.status();
			let mut result: serde_json::Value = resp.json().await.unwrap_or(serde_json::json!({}));
			if let Some(map) = result.as_object_mut() {
				map.insert("success".to_string(), serde_json::json!(status.is_success()));
			}
			ctx
				.client
				.publish(
					format!("devices/{device_id}/register/response"),
					ctx.qos,
					false,
					serde_json::to_vec(&result)?,
				)
				.await?;
			Ok(())
		},
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;
	use wiremock::matchers::{body_json, method, path as mock_path};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	#[test]
	fn single_segment_wildcard() {
		assert!(topic_matches("devices/+/telemetry", "devices/sensor001/telemetry"));
		assert!(!topic_matches("devices/+/status", "devices/sensor001/telemetry"));
		assert!(!topic_matches("devices/+/telemetry", "devices/telemetry"));
		assert!(!topic_matches(
			"devices/+/telemetry",
			"devices/a/b/telemetry"
		));
	}

	#[test]
	fn multi_segment_wildcard() {
		assert!(topic_matches("devices/#", "devices/sensor001/commands/response"));
		assert!(topic_matches("devices/#", "devices"));
		assert!(!topic_matches("devices/#", "fleet/sensor001"));
	}

	#[test]
	fn exact_topics_need_exact_matches() {
		assert!(topic_matches("devices/register", "devices/register"));
		assert!(!topic_matches("devices/register", "devices/register/extra"));
	}

	#[test]
	fn qos_parsing_defaults_to_at_least_once() {
		assert_eq!(parse_qos(0), QoS::AtMostOnce);
		assert_eq!(parse_qos(1), QoS::AtLeastOnce);
		assert_eq!(parse_qos(2), QoS::ExactlyOnce);
		assert_eq!(parse_qos(7), QoS::AtLeastOnce);
	}

	#[test]
	fn broker_urls_with_and_without_scheme() {
		assert_eq!(
			broker_host_port("mqtt://broker.local:1884").unwrap(),
			("broker.local".to_string(), 1884)
		);
		assert_eq!(
			broker_host_port("broker.local").unwrap(),
			("broker.local".to_string(), 1883)
		);
	}

	fn test_ctx(telemetry_base: &str, device_base: &str, auth_base: &str) -> BridgeCtx {
		let (client, _eventloop) = AsyncClient::new(MqttOptions::new("test", "127.0.0.1", 1883), 16);
		let mut registry = prometheus_client::registry::Registry::default();
		BridgeCtx {
			http: reqwest::Client::new(),
			client,
			qos: QoS::AtLeastOnce,
			telemetry_base: telemetry_base.to_string(),
			device_base: device_base.to_string(),
			auth_base: auth_base.to_string(),
			metrics: Arc::new(Metrics::new(crate::metrics::sub_registry(&mut registry))),
		}
	}

	#[tokio::test]
	async fn telemetry_forward_injects_the_device_id() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(mock_path("/api/v1/devices/sensor001/telemetry"))
			.and(body_json(json!({"device_id": "sensor001", "temperature": 23.5})))
			.respond_with(ResponseTemplate::new(200))
			.expect(1)
			.mount(&server)
			.await;

		let ctx = test_ctx(&server.uri(), &server.uri(), &server.uri());
		handle_message(
			&ctx,
			HandlerKind::Telemetry,
			"devices/sensor001/telemetry",
			br#"{"temperature":23.5}"#,
		)
		.await
		.unwrap();
	}

	#[tokio::test]
	async fn telemetry_keeps_an_existing_device_id() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(mock_path("/api/v1/devices/sensor001/telemetry"))
			.and(body_json(json!({"device_id": "custom", "temperature": 1.0})))
			.respond_with(ResponseTemplate::new(200))
			.expect(1)
			.mount(&server)
			.await;

		let ctx = test_ctx(&server.uri(), &server.uri(), &server.uri());
		handle_message(
			&ctx,
			HandlerKind::Telemetry,
			"devices/sensor001/telemetry",
			br#"{"device_id":"custom","temperature":1.0}"#,
		)
		.await
		.unwrap();
	}

	#[tokio::test]
	async fn status_goes_to_the_device_service() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(mock_path("/api/v1/devices/sensor001/status"))
			.respond_with(ResponseTemplate::new(200))
			.expect(1)
			.mount(&server)
			.await;

		let ctx = test_ctx("http://127.0.0.1:1", &server.uri(), "http://127.0.0.1:1");
		handle_message(
			&ctx,
			HandlerKind::Status,
			"devices/sensor001/status",
			br#"{"online":true}"#,
		)
		.await
		.unwrap();
	}

	#[tokio::test]
	async fn downlink_commands_are_queued_for_publish() {
		let mut config = crate::config::Config::default_with_services();
		config.mqtt.enabled = true;
		let mut registry = prometheus_client::registry::Registry::default();
		let metrics = Arc::new(Metrics::new(crate::metrics::sub_registry(&mut registry)));
		let (_bridge, handle) = MqttBridge::new(&config, metrics).unwrap();

		// Queued into the client channel; delivery happens once the event
		// loop has a broker to talk to.
		handle
			.send_command("sensor001", &json!({"action": "reboot"}))
			.await
			.unwrap();
		assert!(!handle.is_connected());
	}

	#[tokio::test]
	async fn runtime_subscriptions_extend_the_handler_table() {
		let mut config = crate::config::Config::default_with_services();
		config.mqtt.enabled = true;
		let mut registry = prometheus_client::registry::Registry::default();
		let metrics = Arc::new(Metrics::new(crate::metrics::sub_registry(&mut registry)));
		let (bridge, _handle) = MqttBridge::new(&config, metrics).unwrap();

		assert_eq!(bridge.shared.handlers.read().await.len(), 5);
		bridge
			.subscribe("devices/+/ota/progress", HandlerKind::Status)
			.await
			.unwrap();
		assert_eq!(bridge.shared.handlers.read().await.len(), 6);
		bridge.unsubscribe("devices/+/ota/progress").await.unwrap();
		assert_eq!(bridge.shared.handlers.read().await.len(), 5);
	}

	#[tokio::test]
	async fn malformed_payloads_are_an_error_not_a_panic() {
		let ctx = test_ctx("http://127.0.0.1:1", "http://127.0.0.1:1", "http://127.0.0.1:1");
		let err = handle_message(
			&ctx,
			HandlerKind::Telemetry,
			"devices/sensor001/telemetry",
			b"not json",
		)
		.await
		.unwrap_err();
		assert!(err.to_string().contains("expected"));
	}
}
