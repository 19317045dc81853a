//! Top-level façade: initialization and the cache-routed request path.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;
use tracing_subscriber::EnvFilter;

use crate::cache::{CacheError, ServiceCache, munge};
use crate::client::ClientError;
use crate::config::{Config, ConfigError};
use crate::message::Message;
use crate::wire::header::Envelope;

#[derive(thiserror::Error, Debug)]
pub enum BusError {
	#[error(transparent)]
	Config(#[from] ConfigError),
	#[error(transparent)]
	Cache(#[from] CacheError),
}

#[derive(thiserror::Error, Debug)]
pub enum RequestError {
	#[error("no candidate services for `{0}`")]
	NoCandidates(String),
	#[error("request failed: no candidate for `{0}` accepted the send")]
	SendFailed(String),
	#[error("request timed out after {0:?}")]
	Timeout(Duration),
	#[error("no response before the connection closed")]
	NoResponse,
	#[error(transparent)]
	Client(#[from] ClientError),
}

/// A connected bus participant: configuration plus the discovery cache
/// used to find peers.
pub struct Bus {
	config: Config,
	cache: Arc<ServiceCache>,
}

impl Bus {
	/// Loads configuration, wires logging from `log.level`, and builds the
	/// discovery cache. Fails fast when `discovery.cache_path` is absent.
	pub fn init(config_path: impl AsRef<Path>) -> Result<Bus, BusError> {
		let config = Config::load(config_path)?;
		init_logging(config.log_level());
		let cache_path = config.cache_path()?.to_string();
		let cache = Arc::new(ServiceCache::new(cache_path)?);
		Ok(Bus { config, cache })
	}

	/// Builds a bus from an already-loaded configuration and cache.
	pub fn with_parts(config: Config, cache: Arc<ServiceCache>) -> Bus {
		Bus { config, cache }
	}

	pub fn config(&self) -> &Config {
		&self.config
	}

	pub fn cache(&self) -> &Arc<ServiceCache> {
		&self.cache
	}

	/// Routes one request: looks up candidates in the cache, prefers the
	/// least-loaded, sends through the first whose client accepts it, and
	/// awaits the reply under the caller's timeout.
	pub async fn make_request(
		&self,
		sector: &str,
		action: &str,
		version: i64,
		envelope: Envelope,
		mut msg: Message,
		timeout: Duration,
	) -> Result<Message, RequestError> {
		msg.action = action.to_string();
		msg.version = version;
		msg.envelope = envelope;

		let key = munge(sector, action, version, envelope.as_str());
		let candidates = self.cache.search_by_action(sector, action, version, envelope.as_str());
		if candidates.is_empty() {
			return Err(RequestError::NoCandidates(key));
		}

		// Least-loaded first: open-request count ascending, lookup order as
		// the tie-break.
		let mut ordered = Vec::with_capacity(candidates.len());
		for proxy in candidates {
			ordered.push((proxy.open_request_count().await, proxy));
		}
		ordered.sort_by_key(|(open, _)| *open);

		let mut waiter = None;
		for (_, proxy) in &ordered {
			let client = match proxy.get_client().await {
				Ok(client) => client,
				Err(e) => {
					debug!(ident = proxy.ident(), error = %e, "candidate unreachable; trying next");
					continue;
				},
			};
			match client.send(&mut msg).await {
				Ok(Some(rx)) => {
					waiter = Some(rx);
					break;
				},
				Ok(None) => break,
				Err(e) => {
					debug!(ident = proxy.ident(), error = %e, "candidate send failed; trying next");
				},
			}
		}
		let Some(waiter) = waiter else {
			return Err(RequestError::SendFailed(key));
		};

		match tokio::time::timeout(timeout, waiter).await {
			// Timeout abandons the waiter; a late reply is dropped by the
			// client demultiplexer.
			Err(_) => Err(RequestError::Timeout(timeout)),
			Ok(Err(_closed)) => Err(RequestError::NoResponse),
			Ok(Ok(reply)) => Ok(reply),
		}
	}
}

/// Installs the global tracing subscriber once. The configured `log.level`
/// seeds the filter; `RUST_LOG` still wins when set.
pub fn init_logging(level: Option<&str>) {
	let filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
		Ok(env) => EnvFilter::new(env),
		Err(_) => EnvFilter::new(level.unwrap_or("info")),
	};
	let _ = tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_writer(std::io::stderr)
		.with_ansi(false)
		.try_init();
}
