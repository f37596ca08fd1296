use std::sync::Arc;

use crate::attributes::Attributes;
use crate::observability::{Logger, Meters, Metrics, Tracing};

/// The facades the request middleware works with, built once at start-up
/// and shared by every request worker.
///
/// The registry `Metrics` facade is optional; without it only the
/// OpenTelemetry instruments are recorded.
#[derive(Debug, Clone)]
pub struct TelemetryState {
	attributes: Arc<Attributes>,
	logger: Logger,
	tracing: Arc<Tracing>,
	meters: Meters,
	metrics: Option<Arc<Metrics>>,
}

impl TelemetryState {
	pub fn new(attributes: Attributes, logger: Logger, tracing: Arc<Tracing>, meters: Meters) -> Self {
		Self {
			attributes: Arc::new(attributes),
			logger,
			tracing,
			meters,
			metrics: None,
		}
	}

	pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
		self.metrics = Some(metrics);
		self
	}

	pub fn attributes(&self) -> &Attributes {
		&self.attributes
	}

	pub fn logger(&self) -> &Logger {
		&self.logger
	}

	pub fn tracing(&self) -> &Tracing {
		&self.tracing
	}

	pub fn meters(&self) -> &Meters {
		&self.meters
	}

	pub fn metrics(&self) -> Option<&Metrics> {
		self.metrics.as_deref()
	}
}
