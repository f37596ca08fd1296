use std::time::Duration;

use opentelemetry::metrics::{Meter, MeterProvider as _};
use opentelemetry::InstrumentationScope;
use opentelemetry_sdk::metrics::exporter::PushMetricExporter;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::{Resource, runtime};

use crate::attributes::Attributes;
use crate::error::{Result, TelemetryError};

/// Collection interval used when the attribute bundle leaves it at zero.
pub const INTERVAL_DEFAULT: Duration = Duration::from_secs(60);

/// OpenTelemetry meter pipeline: a periodic reader pushing to `exporter`.
///
/// The request middleware takes its duration histogram and call counter from
/// [`Meters::meter`].
#[derive(Clone)]
pub struct Meters {
	provider: SdkMeterProvider,
	meter: Meter,
}

impl std::fmt::Debug for Meters {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Meters").finish_non_exhaustive()
	}
}

impl Meters {
	/// Must run inside a tokio runtime, which drives the periodic reader.
	pub fn initialize<E>(exporter: Option<E>, attributes: Option<&Attributes>) -> Result<Self>
	where
		E: PushMetricExporter,
	{
		let exporter = exporter.ok_or(TelemetryError::MissingMetricExporter)?;
		let attributes = attributes.ok_or(TelemetryError::MissingAttributes)?;
		tokio::runtime::Handle::try_current()?;

		let interval = match attributes.batching_duration() {
			Duration::ZERO => INTERVAL_DEFAULT,
			d => d,
		};
		let reader = PeriodicReader::builder(exporter, runtime::Tokio)
			.with_interval(interval)
			.build();

		let provider = SdkMeterProvider::builder()
			.with_reader(reader)
			.with_resource(Resource::new(attributes.all()))
			.build();

		let scope = InstrumentationScope::builder(attributes.service_name())
			.with_version(attributes.service_version())
			.build();
		let meter = provider.meter_with_scope(scope);

		log::debug!(
			"meter pipeline initialized for {} (interval {:?})",
			attributes.service_name(),
			interval
		);

		Ok(Self { provider, meter })
	}

	pub fn meter(&self) -> &Meter {
		&self.meter
	}

	pub fn provider(&self) -> &SdkMeterProvider {
		&self.provider
	}

	/// Push collected points one last time and stop the reader.
	pub fn shutdown(&self) -> Result<()> {
		self.provider.shutdown()?;
		Ok(())
	}
}
