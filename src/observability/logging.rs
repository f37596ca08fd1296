//! Structured JSON logging facade.
//!
//! Every record is one JSON object per line carrying the service identity
//! fields fixed at initialization, the caller's tags and, for the
//! `*_with_context` calls, the trace/span ids of a sampled span.

use std::fmt;
use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{SecondsFormat, Utc};
use log::LevelFilter;
use opentelemetry::trace::SpanContext;
use serde_json::{Map, Value};

use super::correlation::trace_fields;
use crate::error::{Result, TelemetryError};

pub type Fields = Map<String, Value>;

/// Called with the exit status by [`Logger::fatal`].
pub type ExitHook = Arc<dyn Fn(i32) + Send + Sync>;

pub const LEVEL_FIELD: &str = "level";
pub const TIME_FIELD: &str = "time";
pub const MESSAGE_FIELD: &str = "message";
pub const ERROR_FIELD: &str = "error";
pub const FATAL_FIELD: &str = "is-fatal";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
	Debug,
	Info,
	Warn,
	Error,
	Panic,
}

impl Severity {
	pub fn as_str(self) -> &'static str {
		match self {
			Severity::Debug => "debug",
			Severity::Info => "info",
			Severity::Warn => "warn",
			Severity::Error => "error",
			Severity::Panic => "panic",
		}
	}

	fn enabled(self, filter: LevelFilter) -> bool {
		match self {
			Severity::Debug => filter >= LevelFilter::Debug,
			Severity::Info => filter >= LevelFilter::Info,
			Severity::Warn => filter >= LevelFilter::Warn,
			Severity::Error | Severity::Panic => filter >= LevelFilter::Error,
		}
	}
}

impl From<log::Level> for Severity {
	fn from(level: log::Level) -> Self {
		match level {
			log::Level::Error => Severity::Error,
			log::Level::Warn => Severity::Warn,
			log::Level::Info => Severity::Info,
			log::Level::Debug | log::Level::Trace => Severity::Debug,
		}
	}
}

impl fmt::Display for Severity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

struct Inner {
	level: LevelFilter,
	sink: Mutex<Box<dyn Write + Send>>,
	context: Fields,
	exit: RwLock<ExitHook>,
}

/// Cheap to clone; clones share the sink and the exit hook.
#[derive(Clone)]
pub struct Logger {
	inner: Arc<Inner>,
}

impl fmt::Debug for Logger {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Logger")
			.field("level", &self.inner.level)
			.field("context", &self.inner.context)
			.finish_non_exhaustive()
	}
}

impl Logger {
	/// Build a logger writing to `writer`. Fails when no writer is given.
	///
	/// Calling this again builds an independent logger; whichever one the
	/// host keeps using wins.
	pub fn initialize(
		level: LevelFilter,
		writer: Option<Box<dyn Write + Send>>,
		service_name: &str,
		service_version: &str,
		environment: &str,
	) -> Result<Self> {
		let sink = writer.ok_or(TelemetryError::MissingWriter)?;

		let mut context = Fields::new();
		context.insert("service".into(), Value::from(service_name));
		context.insert("version".into(), Value::from(service_version));
		context.insert("environment".into(), Value::from(environment));

		Ok(Self {
			inner: Arc::new(Inner {
				level,
				sink: Mutex::new(sink),
				context,
				exit: RwLock::new(Arc::new(|code| std::process::exit(code))),
			}),
		})
	}

	pub fn level(&self) -> LevelFilter {
		self.inner.level
	}

	/// Replace the action taken by [`Logger::fatal`] after the record is
	/// written. The default terminates the process.
	pub fn set_exit_hook(&self, hook: impl Fn(i32) + Send + Sync + 'static) {
		*self.inner.exit.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(hook);
	}

	pub fn debug(&self, message: &str, tags: &[(&str, Value)]) {
		self.emit(Severity::Debug, None, message, to_fields(tags), None, None);
	}

	pub fn info(&self, message: &str, tags: &[(&str, Value)]) {
		self.emit(Severity::Info, None, message, to_fields(tags), None, None);
	}

	pub fn warn(&self, message: &str, tags: &[(&str, Value)]) {
		self.emit(Severity::Warn, None, message, to_fields(tags), None, None);
	}

	pub fn error(&self, err: &dyn std::error::Error, message: &str, tags: &[(&str, Value)]) {
		self.emit(
			Severity::Error,
			None,
			message,
			to_fields(tags),
			Some(err.to_string()),
			Some(false),
		);
	}

	/// Log at error severity with `is-fatal=true`, then run the exit hook
	/// with status 1. The record is flushed before the hook runs.
	pub fn fatal(&self, err: &dyn std::error::Error, message: &str, tags: &[(&str, Value)]) {
		self.fatal_with_context(None, err, message, tags);
	}

	/// Log at panic severity, then panic with `message`.
	pub fn panic(&self, err: &dyn std::error::Error, message: &str, tags: &[(&str, Value)]) -> ! {
		self.panic_with_context(None, err, message, tags)
	}

	pub fn debug_with_context(
		&self,
		span_ctx: Option<&SpanContext>,
		message: &str,
		tags: &[(&str, Value)],
	) {
		self.emit(Severity::Debug, span_ctx, message, to_fields(tags), None, None);
	}

	pub fn info_with_context(
		&self,
		span_ctx: Option<&SpanContext>,
		message: &str,
		tags: &[(&str, Value)],
	) {
		self.emit(Severity::Info, span_ctx, message, to_fields(tags), None, None);
	}

	pub fn warn_with_context(
		&self,
		span_ctx: Option<&SpanContext>,
		message: &str,
		tags: &[(&str, Value)],
	) {
		self.emit(Severity::Warn, span_ctx, message, to_fields(tags), None, None);
	}

	pub fn error_with_context(
		&self,
		span_ctx: Option<&SpanContext>,
		err: &dyn std::error::Error,
		message: &str,
		tags: &[(&str, Value)],
	) {
		self.emit(
			Severity::Error,
			span_ctx,
			message,
			to_fields(tags),
			Some(err.to_string()),
			Some(false),
		);
	}

	pub fn fatal_with_context(
		&self,
		span_ctx: Option<&SpanContext>,
		err: &dyn std::error::Error,
		message: &str,
		tags: &[(&str, Value)],
	) {
		self.emit(
			Severity::Error,
			span_ctx,
			message,
			to_fields(tags),
			Some(err.to_string()),
			Some(true),
		);
		let exit = self.inner.exit.read().unwrap_or_else(PoisonError::into_inner).clone();
		exit(1);
	}

	pub fn panic_with_context(
		&self,
		span_ctx: Option<&SpanContext>,
		err: &dyn std::error::Error,
		message: &str,
		tags: &[(&str, Value)],
	) -> ! {
		self.emit(
			Severity::Panic,
			span_ctx,
			message,
			to_fields(tags),
			Some(err.to_string()),
			None,
		);
		panic!("{message}: {err}");
	}

	/// Emit a record built from an already assembled field map. Used by the
	/// request middleware, which collects its fields as a map.
	pub fn log_fields(
		&self,
		severity: Severity,
		span_ctx: Option<&SpanContext>,
		message: &str,
		fields: Fields,
		err: Option<String>,
	) {
		let fatal = matches!(severity, Severity::Error).then_some(false);
		self.emit(severity, span_ctx, message, fields, err, fatal);
	}

	fn emit(
		&self,
		severity: Severity,
		span_ctx: Option<&SpanContext>,
		message: &str,
		tags: Fields,
		err: Option<String>,
		fatal: Option<bool>,
	) {
		if !severity.enabled(self.inner.level) {
			return;
		}

		let mut record = self.inner.context.clone();
		record.extend(merge_maps(tags, trace_fields(span_ctx)));
		if let Some(err) = err {
			record.insert(ERROR_FIELD.into(), Value::String(err));
		}
		if let Some(fatal) = fatal {
			record.insert(FATAL_FIELD.into(), Value::String(fatal.to_string()));
		}
		record.insert(LEVEL_FIELD.into(), Value::from(severity.as_str()));
		record.insert(
			TIME_FIELD.into(),
			Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)),
		);
		record.insert(MESSAGE_FIELD.into(), Value::from(message));

		let mut line = match serde_json::to_vec(&Value::Object(record)) {
			Ok(line) => line,
			Err(e) => {
				eprintln!("Failed to encode log record: {}", e);
				return;
			}
		};
		line.push(b'\n');

		let mut sink = self.inner.sink.lock().unwrap_or_else(PoisonError::into_inner);
		if let Err(e) = sink.write_all(&line).and_then(|_| sink.flush()) {
			eprintln!("Failed to write log record: {}", e);
		}
	}
}

/// Routes `log` macros into the facade, so a host can install the logger
/// with `log::set_boxed_logger`.
impl log::Log for Logger {
	fn enabled(&self, metadata: &log::Metadata) -> bool {
		Severity::from(metadata.level()).enabled(self.inner.level)
	}

	fn log(&self, record: &log::Record) {
		if !self.enabled(record.metadata()) {
			return;
		}
		let mut fields = Fields::new();
		fields.insert("target".into(), Value::from(record.target()));
		let severity = Severity::from(record.level());
		self.log_fields(severity, None, &record.args().to_string(), fields, None);
	}

	fn flush(&self) {
		let mut sink = self.inner.sink.lock().unwrap_or_else(PoisonError::into_inner);
		let _ = sink.flush();
	}
}

/// Combine two maps; on a key collision the value from `overrides` wins.
pub fn merge_maps(base: Fields, overrides: Fields) -> Fields {
	let mut merged = base;
	merged.extend(overrides);
	merged
}

fn to_fields(tags: &[(&str, Value)]) -> Fields {
	tags.iter()
		.map(|(k, v)| ((*k).to_owned(), v.clone()))
		.collect()
}
