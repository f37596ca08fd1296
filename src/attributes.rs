use std::time::Duration;

use opentelemetry::{Key, KeyValue};

pub const SERVICE_NAMESPACE: &str = "service.namespace";
pub const SERVICE_NAME: &str = "service.name";
pub const SERVICE_VERSION: &str = "service.version";
pub const DEPLOYMENT_ENVIRONMENT: &str = "deployment.environment";

/// Service identity plus free-form tags shared by the logging, metrics and
/// tracing facades.
///
/// The bundle is read-only once built. Hosts usually create one at start-up
/// and hand it (behind an `Arc`) to every facade.
#[derive(Debug, Clone)]
pub struct Attributes {
	namespace: KeyValue,
	service_name: KeyValue,
	service_version: KeyValue,
	environment: KeyValue,
	batching_duration: Duration,
	extra: Vec<KeyValue>,
}

impl Attributes {
	pub fn new(
		namespace: impl Into<String>,
		service_name: impl Into<String>,
		service_version: impl Into<String>,
		environment: impl Into<String>,
		extra: impl IntoIterator<Item = KeyValue>,
	) -> Self {
		Self::with_batching_duration(
			namespace,
			service_name,
			service_version,
			environment,
			Duration::ZERO,
			extra,
		)
	}

	/// Like [`Attributes::new`] but with an explicit export batching interval.
	/// A zero interval lets each pipeline pick its own default.
	pub fn with_batching_duration(
		namespace: impl Into<String>,
		service_name: impl Into<String>,
		service_version: impl Into<String>,
		environment: impl Into<String>,
		batching_duration: Duration,
		extra: impl IntoIterator<Item = KeyValue>,
	) -> Self {
		Self {
			namespace: KeyValue::new(SERVICE_NAMESPACE, namespace.into()),
			service_name: KeyValue::new(SERVICE_NAME, service_name.into()),
			service_version: KeyValue::new(SERVICE_VERSION, service_version.into()),
			environment: KeyValue::new(DEPLOYMENT_ENVIRONMENT, environment.into()),
			batching_duration,
			extra: extra.into_iter().collect(),
		}
	}

	/// Identity tags first (namespace, name, version, environment), then the
	/// extra tags in the order they were supplied.
	pub fn all(&self) -> Vec<KeyValue> {
		let mut all = Vec::with_capacity(4 + self.extra.len());
		all.push(self.namespace.clone());
		all.push(self.service_name.clone());
		all.push(self.service_version.clone());
		all.push(self.environment.clone());
		all.extend(self.extra.iter().cloned());
		all
	}

	pub fn namespace(&self) -> String {
		self.namespace.value.as_str().into_owned()
	}

	pub fn service_name(&self) -> String {
		self.service_name.value.as_str().into_owned()
	}

	pub fn service_version(&self) -> String {
		self.service_version.value.as_str().into_owned()
	}

	pub fn environment(&self) -> String {
		self.environment.value.as_str().into_owned()
	}

	pub fn batching_duration(&self) -> Duration {
		self.batching_duration
	}

	/// Value of the first extra tag named `key`, rendered as a string, or an
	/// empty string when no such tag exists. Identity tags are not searched.
	pub fn get(&self, key: &str) -> String {
		let key = Key::from(key.to_owned());
		self.extra
			.iter()
			.find(|kv| kv.key == key)
			.map(|kv| kv.value.as_str().into_owned())
			.unwrap_or_default()
	}
}
