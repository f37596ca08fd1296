//! Common test utilities and helpers for integration tests.
#![allow(dead_code)]

use std::io;
use std::sync::{Arc, Mutex};

use log::LevelFilter;
use opentelemetry_sdk::testing::metrics::InMemoryMetricExporter;
use opentelemetry_sdk::testing::trace::InMemorySpanExporter;
use serde_json::Value;
use vanopticon_telemetry::{Attributes, Logger, Meters, Metrics, TelemetryState, Tracing};

pub const NAMESPACE: &str = "unit";

/// In-memory log writer; clones share the buffer.
#[derive(Clone, Default)]
pub struct Sink(pub Arc<Mutex<Vec<u8>>>);

impl Sink {
	pub fn contents(&self) -> String {
		String::from_utf8_lossy(&self.0.lock().unwrap_or_else(|e| e.into_inner())).into_owned()
	}

	/// Every JSON record written so far.
	pub fn records(&self) -> Vec<Value> {
		self.contents()
			.lines()
			.map(|l| serde_json::from_str(l).expect("json log line"))
			.collect()
	}
}

impl io::Write for Sink {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		self.0
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.extend_from_slice(buf);
		Ok(buf.len())
	}

	fn flush(&mut self) -> io::Result<()> {
		Ok(())
	}
}

/// Facades wired to in-memory exporters and a shared log sink.
pub struct Harness {
	pub attributes: Attributes,
	pub logger: Logger,
	pub sink: Sink,
	pub tracing: Arc<Tracing>,
	pub spans: InMemorySpanExporter,
	pub meters: Meters,
	pub points: InMemoryMetricExporter,
	pub metrics: Arc<Metrics>,
}

impl Harness {
	/// Facades logging into `self.sink`. Must be called inside a
	/// multi-threaded tokio runtime.
	pub fn new(service: &str) -> Self {
		let sink = Sink::default();
		let mut harness = Self::with_writer(service, Box::new(sink.clone()));
		harness.sink = sink;
		harness
	}

	/// Facades logging into `writer`; `self.sink` stays empty.
	pub fn with_writer(service: &str, writer: Box<dyn io::Write + Send>) -> Self {
		let attributes = Attributes::new(NAMESPACE, service, "1.0.0", "test", Vec::new());
		let logger = Logger::initialize(LevelFilter::Debug, Some(writer), service, "1.0.0", "test")
			.expect("logger");
		let spans = InMemorySpanExporter::default();
		let tracing =
			Tracing::initialize(Some(spans.clone()), 1.0, Some(&attributes)).expect("tracing");
		let points = InMemoryMetricExporter::default();
		let meters = Meters::initialize(Some(points.clone()), Some(&attributes)).expect("meters");
		let metrics = Metrics::initialize_with_default_port(NAMESPACE, service)
			.expect("metrics")
			.with_logger(logger.clone());

		Self {
			attributes,
			logger,
			sink: Sink::default(),
			tracing: Arc::new(tracing),
			spans,
			meters,
			points,
			metrics: Arc::new(metrics),
		}
	}

	pub fn state(&self) -> Arc<TelemetryState> {
		Arc::new(
			TelemetryState::new(
				self.attributes.clone(),
				self.logger.clone(),
				self.tracing.clone(),
				self.meters.clone(),
			)
			.with_metrics(self.metrics.clone()),
		)
	}

	pub fn finished_spans(&self) -> Vec<opentelemetry_sdk::export::trace::SpanData> {
		for result in self.tracing.provider().force_flush() {
			result.expect("flush spans");
		}
		self.spans.get_finished_spans().expect("finished spans")
	}

	/// Names of every OpenTelemetry metric pushed so far.
	pub fn exported_metric_names(&self) -> Vec<String> {
		self.meters.provider().force_flush().expect("flush metrics");
		self.points
			.get_finished_metrics()
			.expect("finished metrics")
			.iter()
			.flat_map(|rm| rm.scope_metrics.iter())
			.flat_map(|sm| sm.metrics.iter())
			.map(|m| m.name.to_string())
			.collect()
	}

	pub fn shutdown(&self) {
		let _ = self.tracing.shutdown();
		let _ = self.meters.shutdown();
	}
}
