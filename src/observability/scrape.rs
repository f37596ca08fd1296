use std::sync::Arc;

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use prometheus::{Registry, TEXT_FORMAT, TextEncoder};

pub const METRICS_PATH: &str = "/metrics";
pub const METRIC_NAMES_PATH: &str = "/metrics/names";

/// What the scrape handlers read from.
#[derive(Clone)]
pub struct ScrapeState {
	registry: Registry,
	names: Arc<Vec<String>>,
}

impl ScrapeState {
	pub fn new(registry: Registry, names: Vec<String>) -> Self {
		Self {
			registry,
			names: Arc::new(names),
		}
	}
}

pub fn router(state: ScrapeState) -> Router {
	Router::new()
		.route(METRICS_PATH, get(metrics_handler))
		.route(METRIC_NAMES_PATH, get(metric_names_handler))
		.with_state(state)
}

pub(crate) fn encode(registry: &Registry) -> String {
	let encoder = TextEncoder::new();
	encoder
		.encode_to_string(&registry.gather())
		.unwrap_or_else(|e| {
			log::warn!("failed to encode metrics: {}", e);
			String::new()
		})
}

/// Prometheus metrics endpoint: returns metrics in Prometheus text format
pub async fn metrics_handler(State(state): State<ScrapeState>) -> impl IntoResponse {
	(
		StatusCode::OK,
		[(header::CONTENT_TYPE, TEXT_FORMAT)],
		encode(&state.registry),
	)
}

/// Names of the standard API instruments as a JSON array.
pub async fn metric_names_handler(State(state): State<ScrapeState>) -> impl IntoResponse {
	Json(state.names.as_ref().clone())
}
