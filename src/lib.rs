pub mod attributes;
pub mod config;
pub mod error;
pub mod middleware;
pub mod observability;
pub mod state;

pub use attributes::Attributes;
pub use error::{Result, TelemetryError};
pub use middleware::{RequestErrors, TelemetryLayer, TlsInfo};
pub use observability::{Logger, Meters, Metrics, Tracing};
pub use state::TelemetryState;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Extension, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use opentelemetry::{Context, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use prometheus::{IntCounter, Opts};

use crate::config::Settings;
use crate::observability::{ObservabilityOptions, correlation, init_observability};

const DEFAULT_OTLP_ENDPOINT: &str = "http://localhost:4317";

#[derive(Clone)]
struct DemoState {
	telemetry: Arc<TelemetryState>,
	greetings: IntCounter,
}

async fn hello(State(demo): State<DemoState>, Extension(cx): Extension<Context>) -> impl IntoResponse {
	demo.greetings.inc();
	demo.telemetry.logger().info_with_context(
		correlation::from_context(&cx).as_ref(),
		"saying hello",
		&[("greetings", demo.greetings.get().into())],
	);
	"hello"
}

async fn shutdown_signal(logger: Logger) {
	if let Err(e) = tokio::signal::ctrl_c().await {
		logger.error(&e, "failed to listen for ctrl-c", &[]);
		return;
	}
	logger.info("shutdown requested", &[]);
}

/// Run the demo host: every facade wired to OTLP exporters, the scrape
/// endpoint on `settings.metrics_port`, and `GET /hello` behind the request
/// middleware until Ctrl-C.
pub async fn run(settings: Settings) -> anyhow::Result<()> {
	let attributes = Attributes::with_batching_duration(
		settings.namespace.clone(),
		settings.service_name.clone(),
		settings.service_version.clone(),
		settings.environment.clone(),
		Duration::from_millis(settings.batching_ms),
		[KeyValue::new("host.name", config::host_name())],
	);

	let endpoint = settings
		.otlp_endpoint
		.clone()
		.unwrap_or_else(|| DEFAULT_OTLP_ENDPOINT.to_string());
	let span_exporter = opentelemetry_otlp::SpanExporter::builder()
		.with_tonic()
		.with_endpoint(endpoint.clone())
		.build()?;
	let metric_exporter = opentelemetry_otlp::MetricExporter::builder()
		.with_tonic()
		.with_endpoint(endpoint)
		.build()?;

	let options = ObservabilityOptions {
		level: settings.log_level,
		metrics_port: settings.metrics_port.clone(),
		sample_rate: settings.sample_rate,
	};
	let obs = init_observability(
		attributes,
		&options,
		Box::new(std::io::stdout()),
		span_exporter,
		metric_exporter,
	)?;
	if let Err(e) = observability::install_log_bridge(&obs.logger) {
		obs.logger.warn("log bridge not installed", &[("reason", e.to_string().into())]);
	}
	obs.tracing.install_global();

	let greetings = IntCounter::with_opts(
		Opts::new("greetings_total", "Number of greetings served").namespace(settings.namespace.as_str()),
	)?;
	obs.metrics.register_metrics(vec![Box::new(greetings.clone())])?;
	obs.metrics.publish()?;

	let telemetry = Arc::new(obs.state());
	let app = Router::new()
		.route("/hello", get(hello))
		.with_state(DemoState {
			telemetry: telemetry.clone(),
			greetings,
		})
		.layer(TelemetryLayer::new(telemetry));

	let addr = format!("{}:{}", settings.host, settings.port);
	let listener = tokio::net::TcpListener::bind(&addr).await?;
	obs.logger.info("demo host listening", &[("addr", addr.as_str().into())]);

	axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
		.with_graceful_shutdown(shutdown_signal(obs.logger.clone()))
		.await?;

	obs.shutdown().await?;
	Ok(())
}
