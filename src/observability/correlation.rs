//! Trace/span correlation for log records.

use opentelemetry::Context;
use opentelemetry::trace::{SpanContext, TraceContextExt};
use serde_json::{Map, Value};

pub const TRACE_ID_FIELD: &str = "otel.trace_id";
pub const SPAN_ID_FIELD: &str = "otel.span_id";

/// Hex-rendered trace and span identifiers of a sampled span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Correlation {
	pub trace_id: String,
	pub span_id: String,
}

impl Correlation {
	/// `None` for an invalid (all-zero) or unsampled span context.
	pub fn from_span_context(span_ctx: &SpanContext) -> Option<Self> {
		if !span_ctx.is_valid() || !span_ctx.is_sampled() {
			return None;
		}
		Some(Self {
			trace_id: span_ctx.trace_id().to_string(),
			span_id: span_ctx.span_id().to_string(),
		})
	}

	pub fn into_fields(self) -> Map<String, Value> {
		let mut fields = Map::with_capacity(2);
		fields.insert(TRACE_ID_FIELD.to_owned(), Value::String(self.trace_id));
		fields.insert(SPAN_ID_FIELD.to_owned(), Value::String(self.span_id));
		fields
	}
}

/// Correlation fields for `span_ctx`, or an empty map when there is nothing
/// worth correlating.
pub fn trace_fields(span_ctx: Option<&SpanContext>) -> Map<String, Value> {
	span_ctx
		.and_then(Correlation::from_span_context)
		.map(Correlation::into_fields)
		.unwrap_or_default()
}

/// The span context of the span active in `cx`, if it carries a valid one.
pub fn from_context(cx: &Context) -> Option<SpanContext> {
	let span = cx.span();
	let span_ctx = span.span_context();
	span_ctx.is_valid().then(|| span_ctx.clone())
}
