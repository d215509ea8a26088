use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

/// Creates the gateway's metrics sub registry.
pub fn sub_registry(registry: &mut Registry) -> &mut Registry {
	registry.sub_registry_with_prefix("isa_gateway")
}

pub trait Recorder<E, T> {
	/// Record the given event
	fn record(&self, event: &E, meta: T);
}

pub trait IncrementRecorder<E>: Recorder<E, u64> {
	/// Record the given event by incrementing the counter by count
	fn increment(&self, event: &E);
}

impl<E, R> IncrementRecorder<E> for R
where
	R: Recorder<E, u64>,
{
	fn increment(&self, event: &E) {
		self.record(event, 1);
	}
}

pub struct Metrics {
	requests: Family<HttpRequest, Counter>,
	proxied: Family<ProxiedRequest, Counter>,
	proxy_errors: Family<ProxyError, Counter>,
	auth_outcomes: Family<AuthOutcome, Counter>,
	authz_checks: Family<AuthzCheck, Counter>,
	mqtt_messages: Family<MqttMessage, Counter>,
	chain_calls: Family<ChainCall, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HttpRequest {
	pub method: String,
	pub status: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ProxiedRequest {
	pub service: String,
	pub strategy: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ProxyError {
	pub service: String,
	pub kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct AuthOutcome {
	pub method: String,
	pub outcome: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct AuthzCheck {
	pub resource_type: String,
	pub outcome: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct MqttMessage {
	pub handler: String,
	pub outcome: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ChainCall {
	pub chain: String,
	pub operation: String,
}

impl Metrics {
	pub fn new(registry: &mut Registry) -> Self {
		let requests = Family::default();
		registry.register(
			"requests",
			"The total number of inbound HTTP requests",
			requests.clone(),
		);

		let proxied = Family::default();
		registry.register(
			"proxied_requests",
			"The total number of requests forwarded upstream",
			proxied.clone(),
		);

		let proxy_errors = Family::default();
		registry.register(
			"proxy_errors",
			"The total number of upstream forwarding failures",
			proxy_errors.clone(),
		);

		let auth_outcomes = Family::default();
		registry.register(
			"auth_outcomes",
			"The total number of authentication attempts by method and outcome",
			auth_outcomes.clone(),
		);

		let authz_checks = Family::default();
		registry.register(
			"authz_checks",
			"The total number of resource authorization checks",
			authz_checks.clone(),
		);

		let mqtt_messages = Family::default();
		registry.register(
			"mqtt_messages",
			"The total number of MQTT messages dispatched to handlers",
			mqtt_messages.clone(),
		);

		let chain_calls = Family::default();
		registry.register(
			"chain_calls",
			"The total number of chain adapter operations",
			chain_calls.clone(),
		);

		Self {
			requests,
			proxied,
			proxy_errors,
			auth_outcomes,
			authz_checks,
			mqtt_messages,
			chain_calls,
		}
	}
}

impl Recorder<HttpRequest, u64> for Metrics {
	fn record(&self, event: &HttpRequest, count: u64) {
		self.requests.get_or_create(event).inc_by(count);
	}
}

impl Recorder<ProxiedRequest, u64> for Metrics {
	fn record(&self, event: &ProxiedRequest, count: u64) {
		self.proxied.get_or_create(event).inc_by(count);
	}
}

impl Recorder<ProxyError, u64> for Metrics {
	fn record(&self, event: &ProxyError, count: u64) {
		self.proxy_errors.get_or_create(event).inc_by(count);
	}
}

impl Recorder<AuthOutcome, u64> for Metrics {
	fn record(&self, event: &AuthOutcome, count: u64) {
		self.auth_outcomes.get_or_create(event).inc_by(count);
	}
}

impl Recorder<AuthzCheck, u64> for Metrics {
	fn record(&self, event: &AuthzCheck, count: u64) {
		self.authz_checks.get_or_create(event).inc_by(count);
	}
}

impl Recorder<MqttMessage, u64> for Metrics {
	fn record(&self, event: &MqttMessage, count: u64) {
		self.mqtt_messages.get_or_create(event).inc_by(count);
	}
}

impl Recorder<ChainCall, u64> for Metrics {
	fn record(&self, event: &ChainCall, count: u64) {
		self.chain_calls.get_or_create(event).inc_by(count);
	}
}

/// Text-encode a registry for the management endpoints.
pub fn render(registry: &Registry) -> Result<String, std::fmt::Error> {
	let mut buffer = String::new();
	encode(&mut buffer, registry)?;
	Ok(buffer)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn counters_show_up_in_the_encoding() {
		let mut registry = Registry::default();
		let metrics = Metrics::new(sub_registry(&mut registry));
		metrics.increment(&ProxiedRequest {
			service: "agents".to_string(),
			strategy: "sse".to_string(),
		});
		let text = render(&registry).unwrap();
		assert!(text.contains("isa_gateway_proxied_requests_total"));
		assert!(text.contains("service=\"agents\""));
	}
}
