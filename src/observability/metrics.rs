use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use once_cell::sync::Lazy;
use prometheus::core::Collector;
use prometheus::{
	CounterVec, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, exponential_buckets,
};
use regex::Regex;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::logging::Logger;
use super::scrape::{self, ScrapeState};
use crate::error::{Result, TelemetryError};

/// Port used by [`Metrics::initialize_with_default_port`].
pub const DEFAULT_PORT: &str = "9090";

const PORT_MIN: u16 = 1024;
const PORT_MAX: u16 = 49151;

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static SEPARATORS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[./:_-]").unwrap());

/// Label names shared by the call counter and the duration histogram.
pub fn api_labels() -> [&'static str; 3] {
	["path", "http_method", "status_code"]
}

/// Collapse whitespace runs to `_`, lower-case, then turn each of
/// `. / : _ -` into `_`. Applying it twice gives the same result.
pub fn normalize(name: &str) -> String {
	let name = WHITESPACE.replace_all(name, "_");
	SEPARATORS
		.replace_all(&name.to_lowercase(), "_")
		.into_owned()
}

/// The three instruments every service gets.
#[derive(Clone)]
pub struct ApiMetrics {
	/// Requests in flight, by path and method.
	pub concurrent_calls: GaugeVec,
	pub total_calls: CounterVec,
	/// Call duration in milliseconds.
	pub call_duration: HistogramVec,
}

impl ApiMetrics {
	fn new(namespace: &str, service_name: &str) -> Result<(Self, Vec<String>)> {
		let concurrent_calls_name = normalize(&format!("{}_concurrent_calls", service_name));
		let concurrent_calls = GaugeVec::new(
			Opts::new(
				concurrent_calls_name.as_str(),
				"the count of concurrent calls to the APIs, grouped by API name, path, and response code",
			)
			.namespace(namespace),
			&["path", "http_method"],
		)?;

		let total_calls_name = normalize(&format!("{}_total_calls", service_name));
		let total_calls = CounterVec::new(
			Opts::new(
				total_calls_name.as_str(),
				"The count of all call to the API, grouped by API name, path, and response code",
			)
			.namespace(namespace),
			&api_labels(),
		)?;

		let call_duration_name = normalize(&format!("{}_call_duration", service_name));
		let call_duration = HistogramVec::new(
			HistogramOpts::new(
				call_duration_name.as_str(),
				"The duration in milliseconds calls to the API, grouped by API name, path, and response code",
			)
			.namespace(namespace)
			.buckets(exponential_buckets(0.1, 1.5, 5)?),
			&api_labels(),
		)?;

		Ok((
			Self {
				concurrent_calls,
				total_calls,
				call_duration,
			},
			vec![concurrent_calls_name, total_calls_name, call_duration_name],
		))
	}

	fn collectors(&self) -> Vec<Box<dyn Collector>> {
		vec![
			Box::new(self.concurrent_calls.clone()),
			Box::new(self.total_calls.clone()),
			Box::new(self.call_duration.clone()),
		]
	}
}

struct ScrapeServer {
	shutdown: oneshot::Sender<()>,
	task: JoinHandle<()>,
}

/// Prometheus registry for one service plus the scrape endpoint serving it.
pub struct Metrics {
	namespace: String,
	service_name: String,
	port: String,
	registry: Registry,
	api: ApiMetrics,
	names: Vec<String>,
	initialized: AtomicBool,
	published: AtomicBool,
	server: Mutex<Option<ScrapeServer>>,
	logger: Option<Logger>,
}

impl std::fmt::Debug for Metrics {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Metrics")
			.field("namespace", &self.namespace)
			.field("service_name", &self.service_name)
			.field("port", &self.port)
			.field("names", &self.names)
			.field("published", &self.is_published())
			.finish_non_exhaustive()
	}
}

impl Metrics {
	/// Validate the inputs and build a fresh registry holding the standard
	/// API instruments. `port` must be a number within 1024..=49151.
	pub fn initialize(port: &str, namespace: &str, service_name: &str) -> Result<Self> {
		if port.is_empty() {
			return Err(TelemetryError::EmptyPort);
		}
		if namespace.is_empty() {
			return Err(TelemetryError::EmptyNamespace);
		}
		if service_name.is_empty() {
			return Err(TelemetryError::EmptyServiceName);
		}
		match port.parse::<u16>() {
			Ok(p) if (PORT_MIN..=PORT_MAX).contains(&p) => {}
			_ => return Err(TelemetryError::InvalidPort(port.to_string())),
		}

		let registry = Registry::new();
		let (api, names) = ApiMetrics::new(namespace, service_name)?;
		for collector in api.collectors() {
			registry.register(collector)?;
		}
		log::debug!("api metrics registered: {:?}", names);

		Ok(Self {
			namespace: namespace.to_string(),
			service_name: service_name.to_string(),
			port: port.to_string(),
			registry,
			api,
			names,
			initialized: AtomicBool::new(true),
			published: AtomicBool::new(false),
			server: Mutex::new(None),
			logger: None,
		})
	}

	pub fn initialize_with_default_port(namespace: &str, service_name: &str) -> Result<Self> {
		Self::initialize(DEFAULT_PORT, namespace, service_name)
	}

	/// Report scrape-listener faults through `logger` instead of the `log`
	/// crate.
	pub fn with_logger(mut self, logger: Logger) -> Self {
		self.logger = Some(logger);
		self
	}

	pub fn namespace(&self) -> &str {
		&self.namespace
	}

	pub fn service_name(&self) -> &str {
		&self.service_name
	}

	pub fn port(&self) -> &str {
		&self.port
	}

	pub fn registry(&self) -> &Registry {
		&self.registry
	}

	/// Normalized names of the standard API instruments.
	pub fn metric_names(&self) -> &[String] {
		&self.names
	}

	pub fn api_metrics(&self) -> &ApiMetrics {
		&self.api
	}

	pub fn is_published(&self) -> bool {
		self.published.load(Ordering::Acquire)
	}

	/// Add caller-defined collectors. A name already in the registry is a
	/// registration error.
	pub fn register_metrics(&self, collectors: Vec<Box<dyn Collector>>) -> Result<()> {
		self.ensure_initialized()?;
		for collector in collectors {
			self.registry.register(collector)?;
		}
		Ok(())
	}

	/// Encode the registry in the Prometheus text format.
	pub fn encode(&self) -> String {
		scrape::encode(&self.registry)
	}

	/// Start serving `/metrics` and `/metrics/names` on the configured port.
	///
	/// Only the first call starts a listener; later calls return `Ok(())`
	/// without doing anything. Bind and serve failures happen in the
	/// background task and are logged, not returned.
	pub fn publish(&self) -> Result<()> {
		self.ensure_initialized()?;
		let handle = tokio::runtime::Handle::try_current()?;
		if self
			.published
			.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
			.is_err()
		{
			return Ok(());
		}

		let state = ScrapeState::new(self.registry.clone(), self.names.clone());
		let addr = format!("0.0.0.0:{}", self.port);
		let logger = self.logger.clone();
		let (shutdown, signal) = oneshot::channel::<()>();

		let task = handle.spawn(async move {
			let listener = match TcpListener::bind(&addr).await {
				Ok(l) => l,
				Err(e) => {
					report(logger.as_ref(), &e, "metrics endpoint failed to bind", &addr);
					return;
				}
			};
			let served = axum::serve(listener, scrape::router(state))
				.with_graceful_shutdown(async move {
					let _ = signal.await;
				})
				.await;
			if let Err(e) = served {
				report(logger.as_ref(), &e, "metrics endpoint failed with error", &addr);
			}
		});

		*self.server.lock().unwrap_or_else(PoisonError::into_inner) =
			Some(ScrapeServer { shutdown, task });
		log::info!("metrics endpoint started on port {}", self.port);
		Ok(())
	}

	/// Stop the scrape listener, if one is running, and wait for it to
	/// finish. A later [`Metrics::publish`] starts a new listener.
	pub async fn shutdown(&self) -> Result<()> {
		let server = self
			.server
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.take();
		if let Some(server) = server {
			let _ = server.shutdown.send(());
			if let Err(e) = server.task.await {
				log::warn!("metrics endpoint task ended abnormally: {}", e);
			}
		}
		self.published.store(false, Ordering::Release);
		Ok(())
	}

	/// Test support: drop the standard instruments from the registry, detach
	/// the listener and reopen the publish gate. The facade must be
	/// initialized again before use.
	pub fn reset(&self) {
		self.initialized.store(false, Ordering::Release);
		for collector in self.api.collectors() {
			let _ = self.registry.unregister(collector);
		}
		let server = self
			.server
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.take();
		if let Some(server) = server {
			let _ = server.shutdown.send(());
			server.task.abort();
		}
		self.published.store(false, Ordering::Release);
	}

	fn ensure_initialized(&self) -> Result<()> {
		if self.initialized.load(Ordering::Acquire) {
			Ok(())
		} else {
			Err(TelemetryError::NotInitialized)
		}
	}
}

impl Drop for Metrics {
	fn drop(&mut self) {
		let server = self
			.server
			.get_mut()
			.unwrap_or_else(PoisonError::into_inner)
			.take();
		if let Some(server) = server {
			let _ = server.shutdown.send(());
		}
	}
}

fn report(logger: Option<&Logger>, err: &dyn std::error::Error, message: &str, addr: &str) {
	match logger {
		Some(logger) => logger.error(err, message, &[("addr", json!(addr))]),
		None => log::error!("{} ({}): {}", message, addr, err),
	}
}
