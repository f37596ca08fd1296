mod common;

use std::io;
use std::sync::{Arc, Mutex};

use axum::body::{Body, to_bytes};
use axum::extract::Extension;
use axum::http::{Request, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use opentelemetry::trace::{SpanKind, Status};
use opentelemetry::{Context, KeyValue};
use serde_json::Value;
use tower::{Layer, ServiceExt, service_fn};
use vanopticon_telemetry::middleware::{HTTP_ROUTE, TelemetryLayer};
use vanopticon_telemetry::observability::correlation;
use vanopticon_telemetry::RequestErrors;

use common::{Harness, Sink};

const INBOUND_TRACE: &str = "4bf92f3577b34da6a3ce929d0e0e4736";
const CHROME: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

async fn trace_id(Extension(cx): Extension<Context>) -> String {
	correlation::from_context(&cx)
		.map(|sc| sc.trace_id().to_string())
		.unwrap_or_default()
}

async fn flaky() -> impl IntoResponse {
	let mut errors = RequestErrors::new("db timeout");
	errors.push("retry exhausted");
	(StatusCode::OK, Extension(errors), "partial")
}

fn app(layer: TelemetryLayer) -> Router {
	Router::new()
		.route("/hello", get(|| async { "hello" }))
		.route("/boom", get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }))
		.route("/missing", get(|| async { (StatusCode::NOT_FOUND, "gone") }))
		.route("/teapot", get(|| async { (StatusCode::IM_A_TEAPOT, "short and stout") }))
		.route("/flaky", get(flaky))
		.route("/trace", get(trace_id))
		.route("/a", get(|| async { "a" }))
		.route("/b", get(|| async { "b" }))
		.layer(layer)
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, String) {
	let resp = app.clone().oneshot(req).await.expect("infallible");
	let status = resp.status();
	let body = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
	(status, String::from_utf8_lossy(&body).into_owned())
}

fn get_req(path: &str) -> Request<Body> {
	Request::get(path).body(Body::empty()).unwrap()
}

fn request_records(sink: &Sink) -> Vec<Value> {
	sink.records()
		.into_iter()
		.filter(|r| r.get("http.request.path").is_some())
		.collect()
}

#[cfg(feature = "unit-tests")]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn successful_request_is_logged_and_traced() {
	let h = Harness::new("mw");
	let app = app(TelemetryLayer::new(h.state()));

	let req = Request::get("/hello")
		.header("host", "api.example.test")
		.header("user-agent", CHROME)
		.header("X-Request-Id", "ABC")
		.body(Body::empty())
		.unwrap();
	let (status, body) = send(&app, req).await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(body, "hello");

	let spans = h.finished_spans();
	assert_eq!(spans.len(), 1);
	let span = &spans[0];
	assert_eq!(span.name, "GET: /hello");
	assert_eq!(span.span_kind, SpanKind::Server);
	assert_eq!(span.status, Status::Ok);
	assert!(span.attributes.contains(&KeyValue::new(HTTP_ROUTE, "GET: /hello")));
	assert!(span.attributes.contains(&KeyValue::new("service.name", "mw")));

	let records = request_records(&h.sink);
	assert_eq!(records.len(), 1);
	let rec = &records[0];
	assert_eq!(rec["level"], "info");
	assert_eq!(rec["message"], "request");
	assert_eq!(rec["http.request.method"], "GET");
	assert_eq!(rec["http.response.status"], 200);
	assert_eq!(rec["http.scheme"], "http");
	assert_eq!(rec["http.request.host"], "api.example.test");
	assert_eq!(rec["http.x-request-id"], "abc");
	assert_eq!(rec["http.user_agent.device"], "desktop");
	assert_eq!(rec["http.user_agent.browser"], "chrome");
	assert!(rec["http.response.latency"].as_str().unwrap().ends_with("ms"));
	assert_eq!(rec["otel.trace_id"], span.span_context.trace_id().to_string());
	assert_eq!(rec["otel.span_id"], span.span_context.span_id().to_string());
	h.shutdown();
}

#[cfg(feature = "unit-tests")]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_error_is_logged_at_error_severity() {
	let h = Harness::new("mw");
	let app = app(TelemetryLayer::new(h.state()));

	let (status, _) = send(&app, get_req("/boom")).await;
	assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

	let spans = h.finished_spans();
	assert_eq!(spans[0].status, Status::error("Internal Server Error"));

	let rec = &request_records(&h.sink)[0];
	assert_eq!(rec["level"], "error");
	assert_eq!(rec["message"], "request failed");
	assert_eq!(rec["is-fatal"], "false");
	h.shutdown();
}

#[cfg(feature = "unit-tests")]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_errors_follow_the_status_table() {
	let h = Harness::new("mw");
	let app = app(TelemetryLayer::new(h.state()));

	send(&app, get_req("/missing")).await;
	send(&app, get_req("/teapot")).await;

	let spans = h.finished_spans();
	let status_of = |name: &str| {
		spans
			.iter()
			.find(|s| s.name == name)
			.map(|s| s.status.clone())
			.expect("span")
	};
	assert_eq!(status_of("GET: /missing"), Status::Ok);
	assert_eq!(status_of("GET: /teapot"), Status::error("Unknown"));

	// 4xx responses are not failures for the access log
	for rec in request_records(&h.sink) {
		assert_eq!(rec["level"], "info");
	}
	h.shutdown();
}

#[cfg(feature = "unit-tests")]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn recorded_errors_raise_severity() {
	let h = Harness::new("mw");
	let app = app(TelemetryLayer::new(h.state()));

	let (status, _) = send(&app, get_req("/flaky")).await;
	assert_eq!(status, StatusCode::OK);

	let rec = &request_records(&h.sink)[0];
	assert_eq!(rec["level"], "error");
	assert_eq!(rec["error"], "db timeout;retry exhausted");
	assert_eq!(rec["http.response.status"], 200);
	h.shutdown();
}

#[cfg(feature = "unit-tests")]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn inbound_trace_context_is_continued() {
	let h = Harness::new("mw");
	let app = app(TelemetryLayer::new(h.state()));

	let req = Request::get("/trace")
		.header("traceparent", format!("00-{}-00f067aa0ba902b7-01", INBOUND_TRACE))
		.body(Body::empty())
		.unwrap();
	let (_, body) = send(&app, req).await;
	assert_eq!(body, INBOUND_TRACE);

	let spans = h.finished_spans();
	assert_eq!(spans[0].span_context.trace_id().to_string(), INBOUND_TRACE);
	assert_eq!(spans[0].parent_span_id.to_string(), "00f067aa0ba902b7");
	h.shutdown();
}

#[cfg(feature = "unit-tests")]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn instruments_are_created_on_first_request() {
	let h = Harness::new("mw");
	let layer = TelemetryLayer::new(h.state());
	let app = app(layer.clone());
	assert!(layer.instruments().is_none());

	send(&app, get_req("/hello")).await;
	assert!(layer.instruments().is_some());

	let names = h.exported_metric_names();
	assert!(names.contains(&"unit.mw.request.count".to_string()));
	assert!(names.contains(&"unit.mw.request.duration".to_string()));
	h.shutdown();
}

#[cfg(feature = "unit-tests")]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_share_one_pipeline() {
	let h = Harness::new("mw");
	let app = app(TelemetryLayer::new(h.state()));

	let calls = (0..16).map(|_| {
		let app = app.clone();
		tokio::spawn(async move { send(&app, get_req("/hello")).await })
	});
	for result in futures_util::future::join_all(calls).await {
		assert_eq!(result.expect("join").0, StatusCode::OK);
	}

	assert_eq!(request_records(&h.sink).len(), 16);
	assert_eq!(h.finished_spans().len(), 16);

	let text = h.metrics.encode();
	let total = text
		.lines()
		.find(|l| l.starts_with("unit_mw_total_calls{") && l.contains("path=\"/hello\""))
		.expect("total calls series");
	assert!(total.ends_with(" 16"), "{}", total);
	let in_flight = text
		.lines()
		.find(|l| l.starts_with("unit_mw_concurrent_calls{"))
		.expect("concurrent calls series");
	assert!(in_flight.ends_with(" 0"), "{}", in_flight);
	assert!(text.contains("unit_mw_call_duration_count"));
	h.shutdown();
}

/// Panics on the first write of a request log line, then behaves.
#[derive(Clone, Default)]
struct Tripwire {
	sink: Sink,
	tripped: Arc<Mutex<bool>>,
}

impl io::Write for Tripwire {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		let line = String::from_utf8_lossy(buf);
		if line.contains("\"message\":\"request\"") {
			let mut tripped = self.tripped.lock().unwrap_or_else(|e| e.into_inner());
			if !*tripped {
				*tripped = true;
				drop(tripped);
				panic!("sink exploded");
			}
		}
		io::Write::write(&mut self.sink, buf)
	}

	fn flush(&mut self) -> io::Result<()> {
		Ok(())
	}
}

#[cfg(feature = "unit-tests")]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn logging_panic_does_not_fail_the_request() {
	let tripwire = Tripwire::default();
	let h = Harness::with_writer("mw", Box::new(tripwire.clone()));
	let app = app(TelemetryLayer::new(h.state()));

	let (status, body) = send(&app, get_req("/hello")).await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(body, "hello");

	let records = tripwire.sink.records();
	let rec = records
		.iter()
		.find(|r| r["message"] == "panic in logging middleware")
		.expect("panic record");
	assert_eq!(rec["level"], "error");
	assert_eq!(rec["panic"], "sink exploded");

	// the span is still closed with its status
	assert_eq!(h.finished_spans()[0].status, Status::Ok);
	h.shutdown();
}

#[cfg(feature = "unit-tests")]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn every_span_carries_only_its_own_route() {
	let h = Harness::new("mw");
	let app = app(TelemetryLayer::new(h.state()));

	send(&app, get_req("/a")).await;
	send(&app, get_req("/b")).await;
	for _ in 0..30 {
		send(&app, get_req("/a")).await;
	}
	send(&app, get_req("/b")).await;

	let spans = h.finished_spans();
	assert_eq!(spans.len(), 33);
	let routes_of = |i: usize| -> Vec<String> {
		spans[i]
			.attributes
			.iter()
			.filter(|kv| kv.key.as_str() == HTTP_ROUTE)
			.map(|kv| kv.value.as_str().into_owned())
			.collect()
	};
	assert_eq!(routes_of(1), vec!["GET: /b".to_string()]);

	let last = spans.last().expect("last span");
	assert_eq!(last.name, "GET: /b");
	assert_eq!(routes_of(spans.len() - 1), vec!["GET: /b".to_string()]);
	assert_eq!(last.dropped_attributes_count, 0);
	h.shutdown();
}

#[cfg(feature = "unit-tests")]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_service_is_logged_and_traced() {
	let h = Harness::new("mw");
	let svc = TelemetryLayer::new(h.state()).layer(service_fn(|_req: Request<Body>| async {
		Err::<axum::response::Response, _>(io::Error::other("backend down"))
	}));

	let err = svc.oneshot(get_req("/down")).await.unwrap_err();
	assert_eq!(err.to_string(), "backend down");

	let rec = &request_records(&h.sink)[0];
	assert_eq!(rec["level"], "error");
	assert_eq!(rec["message"], "request failed");
	assert_eq!(rec["error"], "backend down");
	assert_eq!(rec["http.response.status"], 500);

	let spans = h.finished_spans();
	assert_eq!(spans.len(), 1);
	assert_eq!(spans[0].name, "GET: /down");
	assert_eq!(spans[0].status, Status::error("backend down"));

	let text = h.metrics.encode();
	assert!(text.lines().any(|l| l.starts_with("unit_mw_total_calls{")
		&& l.contains("path=\"/down\"")
		&& l.contains("status_code=\"500\"")));
	h.shutdown();
}
