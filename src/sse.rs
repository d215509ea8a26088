use std::mem;

use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderMap, HeaderValue, header};
use axum::response::Response;
use bytes::Bytes;
use futures::TryStreamExt;
use tokio::io::AsyncBufReadExt;
use tokio_util::io::StreamReader;

use crate::errors::GatewayError;
use crate::proxy::{self, ProxyClient};
use crate::router::RouteDecision;

const EVENT_STREAM: &str = "text/event-stream";

/// Whether the client is willing to receive an event stream. A missing
/// Accept header means "anything".
pub(crate) fn accepts_event_stream(headers: &HeaderMap) -> bool {
	match headers.get(header::ACCEPT).and_then(|v| v.to_str().ok()) {
		None => true,
		Some(accept) => {
			accept.is_empty() || accept.contains(EVENT_STREAM) || accept.contains("*/*")
		},
	}
}

/// Accept header sent upstream: preserve what the client asked for (MCP
/// requires `application/json, text/event-stream`) and make sure the
/// event-stream type is present.
fn augmented_accept(headers: &HeaderMap) -> HeaderValue {
	match headers.get(header::ACCEPT).and_then(|v| v.to_str().ok()) {
		None | Some("") => HeaderValue::from_static(EVENT_STREAM),
		Some(accept) if accept.contains(EVENT_STREAM) => headers[header::ACCEPT].clone(),
		Some(accept) => HeaderValue::from_str(&format!("{accept}, {EVENT_STREAM}"))
			.unwrap_or(HeaderValue::from_static(EVENT_STREAM)),
	}
}

/// Streaming-path forwarding. Delegates to the standard proxy when the
/// client did not ask for an event stream, and falls back to a plain copy
/// when the upstream response turns out not to be one.
pub async fn forward(
	proxy: &ProxyClient,
	decision: &RouteDecision,
	req: Request,
) -> Result<Response, GatewayError> {
	if !accepts_event_stream(req.headers()) {
		return proxy::forward_standard(&proxy.standard, decision, req).await;
	}

	let (parts, body) = req.into_parts();
	let url = proxy::target_url(decision, parts.uri.query());
	let mut headers = proxy::upstream_request_headers(&parts.headers);
	let accept = augmented_accept(&parts.headers);
	headers.insert(header::ACCEPT, accept);
	headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));

	let upstream = proxy
		.streaming
		.request(parts.method, url)
		.headers(headers)
		.body(reqwest::Body::wrap_stream(body.into_data_stream()))
		.send()
		.await
		.map_err(GatewayError::from_upstream)?;

	let is_event_stream = upstream
		.headers()
		.get(header::CONTENT_TYPE)
		.and_then(|v| v.to_str().ok())
		.map(|ct| ct.starts_with(EVENT_STREAM))
		.unwrap_or(false);
	if !is_event_stream {
		return Ok(proxy::stream_response(upstream));
	}

	let status = upstream.status();
	let body = event_stream_body(upstream);

	let mut response = Response::new(body);
	*response.status_mut() = status;
	let headers = response.headers_mut();
	headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(EVENT_STREAM));
	headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
	headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
	headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
	Ok(response)
}

/// Re-chunk the upstream bytes on SSE event boundaries: lines accumulate
/// until the blank separator line, then the whole event is emitted as one
/// write so every `\n\n` reaches the client immediately. Mid-stream errors
/// terminate the stream; retrying is the client's job.
fn event_stream_body(upstream: reqwest::Response) -> Body {
	let reader = StreamReader::new(upstream.bytes_stream().map_err(std::io::Error::other));
	let stream = async_stream::stream! {
		let mut lines = reader.lines();
		let mut event = String::new();
		loop {
			match lines.next_line().await {
				Ok(Some(line)) => {
					let is_separator = line.is_empty();
					event.push_str(&line);
					event.push('\n');
					if is_separator {
						yield Ok::<_, std::io::Error>(Bytes::from(mem::take(&mut event)));
					}
				},
				Ok(None) => {
					if !event.is_empty() {
						yield Ok(Bytes::from(mem::take(&mut event)));
					}
					break;
				},
				Err(e) => {
					tracing::debug!(error = %e, "event stream interrupted");
					yield Err(e);
					break;
				},
			}
		}
	};
	Body::from_stream(stream)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::router::ProxyStrategy;
	use axum::http::StatusCode;
	use futures::StreamExt;
	use http_body_util::BodyExt;
	use wiremock::matchers::{header as mock_header, method, path as mock_path};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	fn sse_decision(base: &str) -> RouteDecision {
		RouteDecision {
			logical_name: "agents".to_string(),
			target_base_url: base.to_string(),
			rewritten_path: "/api/v1/agents/chat".to_string(),
			strategy: ProxyStrategy::Sse,
		}
	}

	#[test]
	fn accept_header_gate() {
		let mut headers = HeaderMap::new();
		assert!(accepts_event_stream(&headers));
		headers.insert(header::ACCEPT, "application/json".parse().unwrap());
		assert!(!accepts_event_stream(&headers));
		headers.insert(header::ACCEPT, "*/*".parse().unwrap());
		assert!(accepts_event_stream(&headers));
		headers.insert(
			header::ACCEPT,
			"application/json, text/event-stream".parse().unwrap(),
		);
		assert!(accepts_event_stream(&headers));
	}

	#[test]
	fn accept_is_augmented_not_replaced() {
		let mut headers = HeaderMap::new();
		headers.insert(header::ACCEPT, "*/*".parse().unwrap());
		assert_eq!(augmented_accept(&headers), "*/*, text/event-stream");

		headers.insert(
			header::ACCEPT,
			"application/json, text/event-stream".parse().unwrap(),
		);
		assert_eq!(
			augmented_accept(&headers),
			"application/json, text/event-stream"
		);
	}

	#[tokio::test]
	async fn streams_events_with_per_event_chunks() {
		let server = MockServer::start().await;
		let sse_body = "data: {\"type\":\"start\"}\n\ndata: {\"type\":\"content\",\"text\":\"hi\"}\n\ndata: [DONE]\n\n";
		Mock::given(method("POST"))
			.and(mock_path("/api/v1/agents/chat"))
			.respond_with(ResponseTemplate::new(200).set_body_raw(sse_body, "text/event-stream"))
			.mount(&server)
			.await;

		let req = Request::builder()
			.method("POST")
			.uri("/api/v1/agents/chat")
			.header(header::ACCEPT, "text/event-stream")
			.body(Body::from("{\"message\":\"hi\"}"))
			.unwrap();

		let proxy = ProxyClient::new();
		let resp = forward(&proxy, &sse_decision(&server.uri()), req)
			.await
			.unwrap();

		assert_eq!(resp.status(), StatusCode::OK);
		assert_eq!(
			resp.headers().get(header::CONTENT_TYPE).unwrap(),
			"text/event-stream"
		);
		assert_eq!(resp.headers().get("x-accel-buffering").unwrap(), "no");

		let mut chunks = Vec::new();
		let mut stream = resp.into_body().into_data_stream();
		while let Some(chunk) = stream.next().await {
			chunks.push(String::from_utf8(chunk.unwrap().to_vec()).unwrap());
		}
		// One chunk per event, each terminated by the blank separator.
		assert_eq!(chunks.len(), 3);
		assert!(chunks.iter().all(|c| c.ends_with("\n\n")));
		assert_eq!(chunks.concat(), sse_body);
	}

	#[tokio::test]
	async fn non_event_stream_upstream_is_copied_plainly() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(mock_path("/api/v1/agents/chat"))
			.respond_with(ResponseTemplate::new(200).set_body_raw("{\"reply\":\"hi\"}", "application/json"))
			.mount(&server)
			.await;

		let req = Request::builder()
			.method("POST")
			.uri("/api/v1/agents/chat")
			.header(header::ACCEPT, "text/event-stream")
			.body(Body::empty())
			.unwrap();

		let proxy = ProxyClient::new();
		let resp = forward(&proxy, &sse_decision(&server.uri()), req)
			.await
			.unwrap();
		assert!(resp.headers().get("x-accel-buffering").is_none());
		let body = resp.into_body().collect().await.unwrap().to_bytes();
		assert_eq!(&body[..], b"{\"reply\":\"hi\"}");
	}

	#[tokio::test]
	async fn json_only_accept_takes_the_standard_path() {
		let server = MockServer::start().await;
		// The standard path forwards the Accept header untouched.
		Mock::given(method("GET"))
			.and(mock_path("/api/v1/agents/chat"))
			.and(mock_header("accept", "application/json"))
			.respond_with(ResponseTemplate::new(200).set_body_string("plain"))
			.mount(&server)
			.await;

		let req = Request::builder()
			.method("GET")
			.uri("/api/v1/agents/chat")
			.header(header::ACCEPT, "application/json")
			.body(Body::empty())
			.unwrap();

		let proxy = ProxyClient::new();
		let resp = forward(&proxy, &sse_decision(&server.uri()), req)
			.await
			.unwrap();
		let body = resp.into_body().collect().await.unwrap().to_bytes();
		assert_eq!(&body[..], b"plain");
	}
}
