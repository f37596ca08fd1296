use std::borrow::Cow;
use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use opentelemetry::propagation::{Extractor, TextMapCompositePropagator, TextMapPropagator};
use opentelemetry::trace::{
	SpanContext, SpanKind, Status, TraceContextExt, Tracer as _, TracerProvider as _,
};
use opentelemetry::{Context, InstrumentationScope, KeyValue, global};
use opentelemetry_sdk::export::trace::SpanExporter;
use opentelemetry_sdk::propagation::{BaggagePropagator, TraceContextPropagator};
use opentelemetry_sdk::trace::{
	BatchConfigBuilder, BatchSpanProcessor, Sampler, Tracer, TracerProvider,
};
use opentelemetry_sdk::{Resource, runtime};
use tracing_opentelemetry::OpenTelemetryLayer;

use crate::attributes::Attributes;
use crate::error::{Result, TelemetryError};

/// Export batching interval used when the attribute bundle leaves it at zero.
pub const INTERVAL_DEFAULT: Duration = Duration::from_millis(5000);

/// Span factory over an OpenTelemetry batch pipeline.
///
/// Every span started through [`Tracing::start_span`] carries the bundle's
/// attributes plus every extra attribute passed to any earlier `start_span`
/// call. The accumulated list only grows; it is guarded by a mutex so
/// concurrent request workers can share one `Tracing`.
pub struct Tracing {
	provider: TracerProvider,
	tracer: Tracer,
	propagator: TextMapCompositePropagator,
	common_attributes: Mutex<Vec<KeyValue>>,
}

impl std::fmt::Debug for Tracing {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Tracing").finish_non_exhaustive()
	}
}

impl Tracing {
	/// Build the span pipeline.
	///
	/// `sample_rate` must be in `(0.0, 1.0]`; `1.0` samples everything. Must
	/// run inside a tokio runtime, which drives the batch processor.
	pub fn initialize<E>(
		exporter: Option<E>,
		sample_rate: f64,
		attributes: Option<&Attributes>,
	) -> Result<Self>
	where
		E: SpanExporter + 'static,
	{
		let exporter = exporter.ok_or(TelemetryError::MissingTraceExporter)?;
		let attributes = attributes.ok_or(TelemetryError::MissingAttributes)?;
		if !(sample_rate > 0.0 && sample_rate <= 1.0) {
			return Err(TelemetryError::InvalidSampleRate(sample_rate));
		}
		tokio::runtime::Handle::try_current()?;

		let batching = match attributes.batching_duration() {
			Duration::ZERO => INTERVAL_DEFAULT,
			d => d,
		};
		let processor = BatchSpanProcessor::builder(exporter, runtime::Tokio)
			.with_batch_config(
				BatchConfigBuilder::default()
					.with_scheduled_delay(batching)
					.build(),
			)
			.build();

		let sampler = if sample_rate >= 1.0 {
			Sampler::AlwaysOn
		} else {
			Sampler::TraceIdRatioBased(sample_rate)
		};

		let provider = TracerProvider::builder()
			.with_sampler(sampler)
			.with_resource(Resource::new(attributes.all()))
			.with_span_processor(processor)
			.build();

		let scope = InstrumentationScope::builder(attributes.service_name())
			.with_version(attributes.service_version())
			.build();
		let tracer = provider.tracer_with_scope(scope);

		let propagator = TextMapCompositePropagator::new(vec![
			Box::new(TraceContextPropagator::new()),
			Box::new(BaggagePropagator::new()),
		]);

		log::debug!(
			"tracing initialized for {} (sample rate {}, batching {:?})",
			attributes.service_name(),
			sample_rate,
			batching
		);

		Ok(Self {
			provider,
			tracer,
			propagator,
			common_attributes: Mutex::new(attributes.all()),
		})
	}

	pub fn tracer(&self) -> &Tracer {
		&self.tracer
	}

	pub fn provider(&self) -> &TracerProvider {
		&self.provider
	}

	/// Decode trace-context and baggage headers from `carrier` on top of
	/// `base`. Values already attached to `base` are kept.
	pub fn extract_context(&self, base: &Context, carrier: &dyn Extractor) -> Context {
		self.propagator.extract_with_context(base, carrier)
	}

	/// Start a child of `parent` named `name`.
	///
	/// `extra` is appended to the shared common attributes before the span
	/// is built, so it also lands on every later span. A key that occurs
	/// more than once is set on the span once, with its last value.
	pub fn start_span(
		&self,
		parent: &Context,
		name: impl Into<Cow<'static, str>>,
		kind: SpanKind,
		extra: impl IntoIterator<Item = KeyValue>,
	) -> ActiveSpan {
		let attributes = {
			let mut common = self
				.common_attributes
				.lock()
				.unwrap_or_else(PoisonError::into_inner);
			common.extend(extra);
			last_value_wins(&common)
		};

		let span = self
			.tracer
			.span_builder(name)
			.with_kind(kind)
			.with_attributes(attributes)
			.start_with_context(&self.tracer, parent);

		ActiveSpan {
			cx: parent.with_span(span),
		}
	}

	/// Snapshot of the attributes every new span currently receives.
	pub fn common_attributes(&self) -> Vec<KeyValue> {
		self.common_attributes
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.clone()
	}

	/// Register this pipeline's provider and propagator as the process-wide
	/// OpenTelemetry defaults, for libraries that only talk to `global`.
	pub fn install_global(&self) {
		global::set_tracer_provider(self.provider.clone());
		global::set_text_map_propagator(TextMapCompositePropagator::new(vec![
			Box::new(TraceContextPropagator::new()),
			Box::new(BaggagePropagator::new()),
		]));
	}

	/// A `tracing-subscriber` layer exporting `tracing` spans through this
	/// pipeline.
	pub fn layer<S>(&self) -> OpenTelemetryLayer<S, Tracer>
	where
		S: tracing::Subscriber + for<'span> tracing_subscriber::registry::LookupSpan<'span>,
	{
		tracing_opentelemetry::layer().with_tracer(self.tracer.clone())
	}

	/// Flush pending spans and stop the batch processor.
	pub fn shutdown(&self) -> Result<()> {
		self.provider.shutdown()?;
		Ok(())
	}
}

/// One entry per key, keeping the last value and the position of its last
/// occurrence.
fn last_value_wins(attributes: &[KeyValue]) -> Vec<KeyValue> {
	let mut seen = HashSet::with_capacity(attributes.len());
	let mut unique: Vec<KeyValue> = attributes
		.iter()
		.rev()
		.filter(|kv| seen.insert(kv.key.clone()))
		.cloned()
		.collect();
	unique.reverse();
	unique
}

/// A started span together with the context that carries it.
///
/// Dropping the last clone of the context ends the span if [`ActiveSpan::end`]
/// was not called.
#[derive(Debug, Clone)]
pub struct ActiveSpan {
	cx: Context,
}

impl ActiveSpan {
	pub fn context(&self) -> &Context {
		&self.cx
	}

	pub fn span_context(&self) -> SpanContext {
		self.cx.span().span_context().clone()
	}

	pub fn set_status(&self, status: Status) {
		self.cx.span().set_status(status);
	}

	pub fn set_attribute(&self, attribute: KeyValue) {
		self.cx.span().set_attribute(attribute);
	}

	pub fn add_event(&self, name: impl Into<Cow<'static, str>>, attributes: Vec<KeyValue>) {
		self.cx
			.span()
			.add_event_with_timestamp(name, SystemTime::now(), attributes);
	}

	pub fn end(&self) {
		self.cx.span().end();
	}
}
