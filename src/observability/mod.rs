pub mod correlation;
pub mod logging;
pub mod meter;
pub mod metrics;
pub mod scrape;
pub mod tracing_setup;

pub use logging::{Logger, Severity, merge_maps};
pub use meter::Meters;
pub use metrics::{Metrics, normalize};
pub use tracing_setup::{ActiveSpan, Tracing};

use std::io::Write;
use std::sync::Arc;

use log::LevelFilter;
use opentelemetry_sdk::export::trace::SpanExporter;
use opentelemetry_sdk::metrics::exporter::PushMetricExporter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;

use crate::attributes::Attributes;
use crate::error::Result;
use crate::state::TelemetryState;

/// Every facade of one service, built together by [`init_observability`].
#[derive(Debug)]
pub struct Observability {
	pub attributes: Attributes,
	pub logger: Logger,
	pub metrics: Arc<Metrics>,
	pub meters: Meters,
	pub tracing: Arc<Tracing>,
}

impl Observability {
	/// Shared state for the request middleware, with the registry metrics
	/// attached.
	pub fn state(&self) -> TelemetryState {
		TelemetryState::new(
			self.attributes.clone(),
			self.logger.clone(),
			self.tracing.clone(),
			self.meters.clone(),
		)
		.with_metrics(self.metrics.clone())
	}

	/// Stop the scrape listener, then flush and stop both export pipelines.
	/// Every step runs even when an earlier one fails; the first error wins.
	pub async fn shutdown(&self) -> Result<()> {
		let scrape = self.metrics.shutdown().await;
		let traces = self.tracing.shutdown();
		let meters = self.meters.shutdown();
		scrape.and(traces).and(meters)
	}
}

/// Options for [`init_observability`] that are not part of the attribute
/// bundle.
#[derive(Debug, Clone)]
pub struct ObservabilityOptions {
	pub level: LevelFilter,
	pub metrics_port: String,
	pub sample_rate: f64,
}

/// Initialize logging, then the registry metrics, then tracing and the
/// meter pipeline, all from one attribute bundle. Must run inside a tokio
/// runtime.
pub fn init_observability<T, M>(
	attributes: Attributes,
	options: &ObservabilityOptions,
	writer: Box<dyn Write + Send>,
	trace_exporter: T,
	metric_exporter: M,
) -> Result<Observability>
where
	T: SpanExporter + 'static,
	M: PushMetricExporter,
{
	let logger = Logger::initialize(
		options.level,
		Some(writer),
		&attributes.service_name(),
		&attributes.service_version(),
		&attributes.environment(),
	)?;

	let metrics = Metrics::initialize(
		&options.metrics_port,
		&attributes.namespace(),
		&attributes.service_name(),
	)?
	.with_logger(logger.clone());

	let tracing = Tracing::initialize(Some(trace_exporter), options.sample_rate, Some(&attributes))?;
	let meters = Meters::initialize(Some(metric_exporter), Some(&attributes))?;

	logger.info(
		"observability initialized",
		&[
			("component", "observability".into()),
			("metrics_port", options.metrics_port.as_str().into()),
		],
	);

	Ok(Observability {
		attributes,
		logger,
		metrics: Arc::new(metrics),
		meters,
		tracing: Arc::new(tracing),
	})
}

/// Make `logger` the backend of the `log` macros, so the crate's own
/// diagnostics end up in the same JSON stream.
pub fn install_log_bridge(logger: &Logger) -> Result<()> {
	log::set_boxed_logger(Box::new(logger.clone()))?;
	log::set_max_level(logger.level());
	Ok(())
}

/// Install a global `tracing` subscriber printing JSON to stderr, filtered
/// by `RUST_LOG` or else `level`. With `pipeline` given, `tracing` spans are
/// exported through that pipeline too.
///
/// `log` records are not captured here; use [`install_log_bridge`] for those.
pub fn init_diagnostics(level: LevelFilter, pipeline: Option<&Tracing>) -> Result<()> {
	let filter = EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| EnvFilter::new(level.to_string().to_lowercase()));

	let subscriber = tracing_subscriber::registry()
		.with(filter)
		.with(pipeline.map(|t| t.layer()))
		.with(
			tracing_subscriber::fmt::layer()
				.json()
				.with_writer(std::io::stderr)
				.with_current_span(false),
		);

	tracing::subscriber::set_global_default(subscriber)?;
	Ok(())
}
