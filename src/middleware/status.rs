use std::fmt;

use opentelemetry::trace::Status;

/// Terminal span status chosen for a finished request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanStatusCode {
	Ok,
	Error,
}

impl fmt::Display for SpanStatusCode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			SpanStatusCode::Ok => f.write_str("Ok"),
			SpanStatusCode::Error => f.write_str("Error"),
		}
	}
}

/// Map an HTTP status code to a span status and a short description.
///
/// Only the listed 4xx codes map to `Ok`; any other code, 418 included,
/// is `Error`/"Unknown".
pub fn span_status(status: u16) -> (SpanStatusCode, &'static str) {
	match status {
		200 => (SpanStatusCode::Ok, "OK"),
		400 => (SpanStatusCode::Ok, "Bad Request"),
		401 => (SpanStatusCode::Ok, "Unauthorized"),
		403 => (SpanStatusCode::Ok, "Forbidden"),
		404 => (SpanStatusCode::Ok, "Not Found"),
		405 => (SpanStatusCode::Ok, "Method Not Allowed"),
		500 => (SpanStatusCode::Error, "Internal Server Error"),
		502 => (SpanStatusCode::Error, "Bad Gateway"),
		503 => (SpanStatusCode::Error, "Service Unavailable"),
		_ => (SpanStatusCode::Error, "Unknown"),
	}
}

/// The OpenTelemetry status for `status`. An `Ok` status carries no
/// description, so the description only survives on errors.
pub fn otel_status(status: u16) -> Status {
	match span_status(status) {
		(SpanStatusCode::Ok, _) => Status::Ok,
		(SpanStatusCode::Error, desc) => Status::error(desc),
	}
}
