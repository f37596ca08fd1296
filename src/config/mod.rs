use log::LevelFilter;
use serde::Deserialize;
use thiserror::Error;

/// Settings of the demo host.
///
/// Values are loaded from (in order): `/etc/vanopticon/telemetry.json`, the
/// same file name under the user config folders (all optional), then
/// environment variables prefixed with `TLM_` (e.g. `TLM_METRICS_PORT`). The
/// telemetry facades themselves read none of this; the host passes the values
/// in.
#[derive(Debug, Deserialize, PartialEq, Clone)]
#[serde(default)]
pub struct Settings {
	pub namespace: String,
	pub service_name: String,
	pub service_version: String,
	pub environment: String,
	pub log_level: LevelFilter,
	pub host: String,
	pub port: u16,
	// scrape endpoint port, validated by the metrics facade
	pub metrics_port: String,
	pub sample_rate: f64,
	pub batching_ms: u64,
	pub otlp_endpoint: Option<String>,
}

impl Default for Settings {
	fn default() -> Self {
		Self {
			namespace: "vanopticon".to_string(),
			service_name: "telemetry-demo".to_string(),
			service_version: env!("CARGO_PKG_VERSION").to_string(),
			environment: "development".to_string(),
			log_level: LevelFilter::Info,
			host: "127.0.0.1".to_string(),
			port: 8080,
			metrics_port: crate::observability::metrics::DEFAULT_PORT.to_string(),
			sample_rate: 1.0,
			batching_ms: 5000,
			otlp_endpoint: None,
		}
	}
}

#[derive(Debug, Error)]
pub enum SettingsError {
	#[error("configuration error: {0}")]
	Config(#[from] config::ConfigError),
}

/// Name of the machine the host runs on, reported as `host.name`.
pub fn host_name() -> String {
	hostname::get()
		.ok()
		.and_then(|s| s.into_string().ok())
		.unwrap_or_else(|| "localhost".to_string())
}

pub fn load() -> Result<Settings, SettingsError> {
	let mut builder = config::Config::builder()
		.add_source(config::File::with_name("/etc/vanopticon/telemetry.json").required(false));

	if let Some(folder) = dirs::config_dir() {
		let user_config_path = folder.join("vanopticon").join("telemetry.json");
		builder = builder.add_source(config::File::from(user_config_path).required(false));
	}
	if let Some(folder) = dirs::config_local_dir() {
		let local_config_path = folder.join("vanopticon").join("telemetry.json");
		builder = builder.add_source(config::File::from(local_config_path).required(false));
	}

	builder = builder.add_source(config::Environment::with_prefix("TLM").separator("__"));

	let cfg = builder.build()?;

	let mut s: Settings = cfg.try_deserialize()?;

	// Explicit variables are re-read directly so an override always wins,
	// however the layered sources mapped it.
	if let Some(v) = non_empty("TLM_NAMESPACE") {
		s.namespace = v;
	}
	if let Some(v) = non_empty("TLM_SERVICE_NAME") {
		s.service_name = v;
	}
	if let Some(v) = non_empty("TLM_SERVICE_VERSION") {
		s.service_version = v;
	}
	if let Some(v) = non_empty("TLM_ENVIRONMENT") {
		s.environment = v;
	}
	if let Some(v) = non_empty("TLM_LOG_LEVEL") {
		if let Ok(parsed) = v.parse::<LevelFilter>() {
			s.log_level = parsed;
		}
	}
	if let Some(v) = non_empty("TLM_HOST") {
		s.host = v;
	}
	if let Some(v) = non_empty("TLM_PORT") {
		if let Ok(parsed) = v.parse::<u16>() {
			s.port = parsed;
		}
	}
	if let Some(v) = non_empty("TLM_METRICS_PORT") {
		s.metrics_port = v;
	}
	if let Some(v) = non_empty("TLM_SAMPLE_RATE") {
		if let Ok(parsed) = v.parse::<f64>() {
			s.sample_rate = parsed;
		}
	}
	if let Some(v) = non_empty("TLM_BATCHING_MS") {
		if let Ok(parsed) = v.parse::<u64>() {
			s.batching_ms = parsed;
		}
	}
	if let Some(v) = non_empty("TLM_OTLP_ENDPOINT") {
		s.otlp_endpoint = Some(v);
	}

	Ok(s)
}

fn non_empty(key: &str) -> Option<String> {
	std::env::var(key).ok().filter(|v| !v.is_empty())
}
