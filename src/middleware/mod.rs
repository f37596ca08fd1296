//! Per-request instrumentation as a `tower` layer.
//!
//! For every request the layer starts a server span continuing any inbound
//! trace context, runs the wrapped service inside that span, writes one
//! access log line correlated to it, maps the response status onto the span
//! and records the request count and duration.

pub mod request_log;
pub mod status;

use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use std::time::Instant;

use axum::http::{HeaderMap, Request, Response};
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::propagation::Extractor;
use opentelemetry::trace::{FutureExt as _, SpanContext, SpanKind, Status};
use opentelemetry::KeyValue;
use prometheus::Gauge;
use serde_json::json;
use tower::{Layer, Service};

use crate::observability::logging::Severity;
use crate::state::TelemetryState;
pub use request_log::{RequestSnapshot, TlsInfo};
pub use status::{SpanStatusCode, otel_status, span_status};

const METHOD: &str = "method";
const PATH: &str = "path";
const STATUS: &str = "status";
pub const HTTP_ROUTE: &str = "http.route";

/// Status recorded when the wrapped service fails without a response.
const SERVICE_FAILED: u16 = 500;

/// Errors a handler wants reported on the access log line. Add it to the
/// response extensions; the messages are joined with `;`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestErrors(pub Vec<String>);

impl RequestErrors {
	pub fn new(err: impl std::fmt::Display) -> Self {
		Self(vec![err.to_string()])
	}

	pub fn push(&mut self, err: impl std::fmt::Display) {
		self.0.push(err.to_string());
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn joined(&self) -> String {
		self.0.join(";")
	}
}

#[derive(Debug, thiserror::Error)]
#[error("panic in logging middleware")]
struct LoggingPanic;

/// Reads propagation headers out of a `HeaderMap`.
pub struct HeaderExtractor<'a>(pub &'a HeaderMap);

impl Extractor for HeaderExtractor<'_> {
	fn get(&self, key: &str) -> Option<&str> {
		self.0.get(key).and_then(|v| v.to_str().ok())
	}

	fn keys(&self) -> Vec<&str> {
		self.0.keys().map(|k| k.as_str()).collect()
	}
}

/// Instruments created on the first request.
#[derive(Debug, Clone)]
pub struct RequestInstruments {
	pub duration: Histogram<f64>,
	pub count: Counter<u64>,
}

impl RequestInstruments {
	fn new(state: &TelemetryState) -> Self {
		let attributes = state.attributes();
		let prefix = format!("{}.{}", attributes.namespace(), attributes.service_name());
		let meter = state.meters().meter();

		let duration = meter
			.f64_histogram(format!("{}.request.duration", prefix))
			.with_description("Measures the duration of inbound call.")
			.with_unit("ms")
			.build();
		let count = meter
			.u64_counter(format!("{}.request.count", prefix))
			.with_description("Measures the number of inbound calls.")
			.with_unit("{count}")
			.build();
		log::debug!("request instruments created under {}.request", prefix);

		Self { duration, count }
	}
}

/// Clone-able layer; every clone shares the same state and the same
/// lazily created instruments.
#[derive(Clone)]
pub struct TelemetryLayer {
	state: Arc<TelemetryState>,
	instruments: Arc<OnceLock<RequestInstruments>>,
}

impl TelemetryLayer {
	pub fn new(state: Arc<TelemetryState>) -> Self {
		Self {
			state,
			instruments: Arc::new(OnceLock::new()),
		}
	}

	/// `None` until the first request has passed through.
	pub fn instruments(&self) -> Option<&RequestInstruments> {
		self.instruments.get()
	}
}

#[derive(Clone)]
pub struct TelemetryService<S> {
	inner: S,
	state: Arc<TelemetryState>,
	instruments: Arc<OnceLock<RequestInstruments>>,
}

impl<S> Layer<S> for TelemetryLayer {
	type Service = TelemetryService<S>;

	fn layer(&self, inner: S) -> Self::Service {
		TelemetryService {
			inner,
			state: self.state.clone(),
			instruments: self.instruments.clone(),
		}
	}
}

/// Keeps the in-flight gauge honest on every exit path, unwinding included.
struct InFlight(Option<Gauge>);

impl InFlight {
	fn enter(gauge: Option<Gauge>) -> Self {
		if let Some(g) = &gauge {
			g.inc();
		}
		Self(gauge)
	}
}

impl Drop for InFlight {
	fn drop(&mut self) {
		if let Some(g) = &self.0 {
			g.dec();
		}
	}
}

type BoxF<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for TelemetryService<S>
where
	S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
	S::Future: Send + 'static,
	S::Error: std::fmt::Display + Send + 'static,
	ReqBody: Send + 'static,
	ResBody: Send + 'static,
{
	type Response = Response<ResBody>;
	type Error = S::Error;
	type Future = BoxF<Result<Self::Response, Self::Error>>;

	fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
		self.inner.poll_ready(cx)
	}

	fn call(&mut self, mut req: Request<ReqBody>) -> Self::Future {
		let mut inner = self.inner.clone();
		let state = self.state.clone();
		let instruments = self.instruments.clone();

		Box::pin(async move {
			let instruments = instruments.get_or_init(|| RequestInstruments::new(&state));
			let snapshot = RequestSnapshot::from_request(&req);
			let span_name = format!("{}: {}", snapshot.method, snapshot.path);

			let parent = state
				.tracing()
				.extract_context(&opentelemetry::Context::current(), &HeaderExtractor(req.headers()));
			let mut span_attrs = state.attributes().all();
			span_attrs.push(KeyValue::new(HTTP_ROUTE, span_name.clone()));
			let span = state
				.tracing()
				.start_span(&parent, span_name, SpanKind::Server, span_attrs);
			req.extensions_mut().insert(span.context().clone());

			let in_flight = InFlight::enter(state.metrics().map(|m| {
				m.api_metrics()
					.concurrent_calls
					.with_label_values(&[snapshot.path.as_str(), snapshot.method.as_str()])
			}));

			let before = Instant::now();
			let result = inner.call(req).with_context(span.context().clone()).await;
			let elapsed_ms = before.elapsed().as_secs_f64() * 1000.0;
			drop(in_flight);

			let code = match &result {
				Ok(resp) => {
					let code = resp.status().as_u16();
					let errors = resp.extensions().get::<RequestErrors>();
					log_request(&state, &span.span_context(), &snapshot, code, elapsed_ms, errors);
					span.set_status(otel_status(code));
					code
				}
				Err(err) => {
					// no response to report, account it as a server error
					let errors = RequestErrors::new(err);
					let code = SERVICE_FAILED;
					log_request(&state, &span.span_context(), &snapshot, code, elapsed_ms, Some(&errors));
					span.set_status(Status::error(errors.joined()));
					code
				}
			};
			span.end();

			let labels = [
				KeyValue::new(METHOD, snapshot.method.clone()),
				KeyValue::new(PATH, snapshot.path.clone()),
				KeyValue::new(STATUS, i64::from(code)),
			];
			instruments.count.add(1, &labels);
			instruments.duration.record(elapsed_ms, &labels);

			if let Some(metrics) = state.metrics() {
				let code = code.to_string();
				let api = metrics.api_metrics();
				let values = [snapshot.path.as_str(), snapshot.method.as_str(), code.as_str()];
				api.total_calls.with_label_values(&values).inc();
				api.call_duration.with_label_values(&values).observe(elapsed_ms);
			}

			result
		})
	}
}

fn log_request(
	state: &TelemetryState,
	span_ctx: &SpanContext,
	snapshot: &RequestSnapshot,
	status: u16,
	elapsed_ms: f64,
	errors: Option<&RequestErrors>,
) {
	let logger = state.logger();
	let logged = catch_unwind(AssertUnwindSafe(|| {
		let fields = request_log::request_fields(snapshot, span_ctx, status, elapsed_ms);
		let errors = errors.map(RequestErrors::joined).unwrap_or_default();
		if status > 499 || !errors.is_empty() {
			logger.log_fields(Severity::Error, Some(span_ctx), "request failed", fields, Some(errors));
		} else {
			logger.log_fields(Severity::Info, Some(span_ctx), "request", fields, None);
		}
	}));

	if let Err(payload) = logged {
		let detail = payload
			.downcast_ref::<&str>()
			.map(|s| s.to_string())
			.or_else(|| payload.downcast_ref::<String>().cloned())
			.unwrap_or_default();
		logger.error(&LoggingPanic, "panic in logging middleware", &[("panic", json!(detail))]);
	}
}
