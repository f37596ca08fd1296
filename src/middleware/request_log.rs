//! Fields of the per-request access log line.

use std::net::SocketAddr;

use axum::http::{HeaderMap, header};
use opentelemetry::trace::SpanContext;
use serde_json::Value;
use woothee::parser::Parser;

use crate::observability::correlation::{SPAN_ID_FIELD, TRACE_ID_FIELD};
use crate::observability::logging::{Fields, merge_maps};

pub const HTTP: &str = "http";
pub const HTTPS: &str = "https";

pub const HTTP_METHOD: &str = "http.request.method";
pub const HTTP_PATH: &str = "http.request.path";
pub const HTTP_REMOTE_ADDR: &str = "http.request.remoteAddr";
pub const HTTP_REQUEST_HOST: &str = "http.request.host";
pub const HTTP_STATUS: &str = "http.response.status";
pub const HTTP_LATENCY: &str = "http.response.latency";
pub const TLS_VERSION: &str = "http.tls.version";
pub const HTTP_SCHEME: &str = "http.scheme";

pub const USER_AGENT_OS: &str = "http.user_agent.os";
pub const USER_AGENT_OS_VERSION: &str = "http.user_agent.os_version";
pub const USER_AGENT_DEVICE: &str = "http.user_agent.device";
pub const USER_AGENT_BROWSER: &str = "http.user_agent.browser";
pub const USER_AGENT_BROWSER_VERSION: &str = "http.user_agent.browser_version";

pub const BROWSER_CHROME: &str = "chrome";
pub const BROWSER_SAFARI: &str = "safari";
pub const BROWSER_FIREFOX: &str = "firefox";
pub const BROWSER_OPERA: &str = "opera";
pub const BROWSER_IE: &str = "ie";
pub const BROWSER_EDGE: &str = "edge";
const TRIDENT: &str = "Trident";
const UNKNOWN: &str = "UNKNOWN";

pub const DEVICE_MOBILE: &str = "mobile";
pub const DEVICE_DESKTOP: &str = "desktop";
pub const DEVICE_BOT: &str = "bot";

/// TLS details of the connection a request arrived on. Whatever terminates
/// TLS inserts this as a request extension; its absence means plain HTTP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsInfo {
	pub version: String,
}

/// Request data captured before the request is handed downstream.
#[derive(Debug, Clone)]
pub struct RequestSnapshot {
	pub method: String,
	pub path: String,
	pub remote_addr: Option<SocketAddr>,
	pub host: String,
	pub tls: Option<TlsInfo>,
	pub headers: HeaderMap,
}

impl RequestSnapshot {
	pub fn from_request<B>(req: &axum::http::Request<B>) -> Self {
		let remote_addr = req
			.extensions()
			.get::<axum::extract::ConnectInfo<SocketAddr>>()
			.map(|info| info.0);
		let host = req
			.headers()
			.get(header::HOST)
			.and_then(|h| h.to_str().ok())
			.map(str::to_owned)
			.or_else(|| req.uri().authority().map(|a| a.to_string()))
			.unwrap_or_default();

		Self {
			method: req.method().to_string(),
			path: req.uri().path().to_string(),
			remote_addr,
			host,
			tls: req.extensions().get::<TlsInfo>().cloned(),
			headers: req.headers().clone(),
		}
	}
}

/// Every field of the access log line for a finished request.
pub fn request_fields(
	req: &RequestSnapshot,
	span_ctx: &SpanContext,
	status: u16,
	elapsed_ms: f64,
) -> Fields {
	let mut fields = Fields::new();
	fields.insert(HTTP_METHOD.into(), Value::from(req.method.as_str()));
	fields.insert(HTTP_PATH.into(), Value::from(req.path.as_str()));
	fields.insert(
		HTTP_REMOTE_ADDR.into(),
		Value::from(req.remote_addr.map(|a| a.to_string()).unwrap_or_default()),
	);
	fields.insert(HTTP_STATUS.into(), Value::from(status));
	fields.insert(HTTP_LATENCY.into(), Value::from(format!("{:.6}ms", elapsed_ms)));
	fields.insert(TRACE_ID_FIELD.into(), Value::from(span_ctx.trace_id().to_string()));
	fields.insert(SPAN_ID_FIELD.into(), Value::from(span_ctx.span_id().to_string()));

	let scheme = match &req.tls {
		Some(tls) => {
			fields.insert(TLS_VERSION.into(), Value::from(tls.version.as_str()));
			HTTPS
		}
		None => HTTP,
	};
	fields.insert(HTTP_SCHEME.into(), Value::from(scheme));
	fields.insert(HTTP_REQUEST_HOST.into(), Value::from(req.host.as_str()));

	let user_agent = req
		.headers
		.get(header::USER_AGENT)
		.and_then(|ua| ua.to_str().ok())
		.unwrap_or_default();

	let fields = merge_maps(fields, parse_headers(&req.headers));
	merge_maps(fields, parse_user_agent(user_agent))
}

/// One `http.<name>` field per header, values lower-cased and joined with
/// `", "` when a header repeats.
pub fn parse_headers(headers: &HeaderMap) -> Fields {
	let mut fields = Fields::new();
	for name in headers.keys() {
		let joined = headers
			.get_all(name)
			.iter()
			.map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
			.collect::<Vec<_>>()
			.join(", ");
		fields.insert(
			format!("http.{}", name.as_str()).to_lowercase(),
			Value::String(joined.to_lowercase()),
		);
	}
	fields
}

/// Device class, OS and browser of a raw `User-Agent` value. Empty input
/// yields no fields; browser fields are only set for mobile and desktop
/// clients.
pub fn parse_user_agent(raw: &str) -> Fields {
	let mut fields = Fields::new();
	if raw.is_empty() {
		return fields;
	}

	let parsed = Parser::new().parse(raw);
	let (os, os_version, category, name, version) = match &parsed {
		Some(ua) => (
			known(ua.os),
			known(&ua.os_version),
			ua.category,
			ua.name,
			known(ua.version),
		),
		None => ("", "", "", "", ""),
	};

	fields.insert(USER_AGENT_OS.into(), Value::from(os));
	fields.insert(USER_AGENT_OS_VERSION.into(), Value::from(os_version));

	let device = match category {
		"smartphone" | "mobilephone" => DEVICE_MOBILE,
		"pc" => DEVICE_DESKTOP,
		"crawler" => DEVICE_BOT,
		_ => "",
	};
	fields.insert(USER_AGENT_DEVICE.into(), Value::from(device));

	if device == DEVICE_MOBILE || device == DEVICE_DESKTOP {
		let browser = match name {
			"Chrome" => BROWSER_CHROME,
			"Safari" => BROWSER_SAFARI,
			"Firefox" => BROWSER_FIREFOX,
			"Opera" => BROWSER_OPERA,
			"Internet Explorer" => BROWSER_IE,
			_ if raw.contains(TRIDENT) => BROWSER_IE,
			"Edge" => BROWSER_EDGE,
			_ => "",
		};
		fields.insert(USER_AGENT_BROWSER.into(), Value::from(browser));
		fields.insert(USER_AGENT_BROWSER_VERSION.into(), Value::from(version));
	}
	fields
}

// woothee reports anything it cannot classify as "UNKNOWN"
fn known(value: &str) -> &str {
	if value == UNKNOWN { "" } else { value }
}
