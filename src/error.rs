use thiserror::Error;

/// Errors returned by the telemetry facades.
///
/// Configuration errors come back synchronously from the `initialize` calls;
/// faults in background tasks (the scrape listener, exporters) are logged
/// instead of being returned.
#[derive(Debug, Error)]
pub enum TelemetryError {
	#[error("configuration error: a log writer is required")]
	MissingWriter,

	#[error("configuration error: a trace exporter is required")]
	MissingTraceExporter,

	#[error("configuration error: a metric exporter is required")]
	MissingMetricExporter,

	#[error("configuration error: attributes are required")]
	MissingAttributes,

	#[error("configuration error: sample rate must be within (0.0, 1.0], got {0}")]
	InvalidSampleRate(f64),

	#[error("configuration error: port for metrics must be specified")]
	EmptyPort,

	#[error(
		"configuration error: invalid port value `{0}`; a valid port is a number between 1024 and 49151"
	)]
	InvalidPort(String),

	#[error("configuration error: namespace for metrics must be specified")]
	EmptyNamespace,

	#[error("configuration error: service name for metrics must be specified")]
	EmptyServiceName,

	#[error("metrics must be initialized before registering or publishing metrics")]
	NotInitialized,

	#[error("metric registration failed: {0}")]
	Registration(#[from] prometheus::Error),

	#[error("a tokio runtime is required: {0}")]
	Runtime(#[from] tokio::runtime::TryCurrentError),

	#[error("trace pipeline error: {0}")]
	Trace(#[from] opentelemetry::trace::TraceError),

	#[error("metrics pipeline error: {0}")]
	Metrics(#[from] opentelemetry_sdk::metrics::MetricError),

	#[error("a global tracing subscriber is already installed: {0}")]
	Subscriber(#[from] tracing::subscriber::SetGlobalDefaultError),

	#[error("a `log` backend is already installed: {0}")]
	LogBackend(#[from] log::SetLoggerError),
}

impl TelemetryError {
	/// True for the errors a caller can only fix by changing how it calls
	/// `initialize`.
	pub fn is_configuration(&self) -> bool {
		matches!(
			self,
			Self::MissingWriter
				| Self::MissingTraceExporter
				| Self::MissingMetricExporter
				| Self::MissingAttributes
				| Self::InvalidSampleRate(_)
				| Self::EmptyPort
				| Self::InvalidPort(_)
				| Self::EmptyNamespace
				| Self::EmptyServiceName
		)
	}
}

pub type Result<T> = std::result::Result<T, TelemetryError>;
