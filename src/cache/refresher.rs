//! Keeps a [`ServiceCache`] fresh, either reactively (re-parse on read
//! once a cooldown has elapsed) or on a timer task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{error, trace};

use super::{CacheError, ServiceCache};
use crate::cache::proxy::ServiceProxy;

#[derive(Debug, Clone)]
pub struct RefresherOptions {
	/// Minimum spacing between refreshes.
	pub wait: Duration,
	/// Refresh on demand when a reader asks, instead of on a timer.
	pub reactive: bool,
}

impl Default for RefresherOptions {
	fn default() -> Self {
		RefresherOptions {
			wait: Duration::from_secs(5),
			reactive: true,
		}
	}
}

pub struct CacheRefresher {
	cache: Arc<ServiceCache>,
	options: RefresherOptions,
	last_refresh: Mutex<Option<Instant>>,
	cancel: CancellationToken,
	running: AtomicBool,
}

impl CacheRefresher {
	pub fn new(cache: Arc<ServiceCache>, options: RefresherOptions) -> CacheRefresher {
		CacheRefresher {
			cache,
			options,
			last_refresh: Mutex::new(None),
			cancel: CancellationToken::new(),
			running: AtomicBool::new(false),
		}
	}

	pub fn reactive(&self) -> bool {
		self.options.reactive
	}

	pub fn running(&self) -> bool {
		self.running.load(Ordering::SeqCst)
	}

	/// Starts the timer task. A no-op in reactive mode, and on every call
	/// after the first.
	pub fn run(self: &Arc<Self>) {
		if self.reactive() {
			return;
		}
		if self.running.swap(true, Ordering::SeqCst) {
			return;
		}
		let refresher = self.clone();
		tokio::spawn(async move {
			refresher.mark_refresh();
			let mut due = tokio::time::interval(refresher.options.wait);
			due.reset();
			loop {
				tokio::select! {
					_ = refresher.cancel.cancelled() => break,
					_ = due.tick() => refresher.mark_refresh(),
				}
			}
			refresher.running.store(false, Ordering::SeqCst);
		});
	}

	/// Idempotent; stops the timer task if one is running.
	pub fn stop(&self) {
		self.cancel.cancel();
	}

	fn mark_refresh(&self) {
		if let Err(e) = self.cache.refresh() {
			error!(error = %e, "refresh cache");
		}
		*self.last_refresh.lock().expect("refresh stamp poisoned") = Some(Instant::now());
	}

	fn due(&self) -> bool {
		let last = self.last_refresh.lock().expect("refresh stamp poisoned");
		match *last {
			None => true,
			Some(at) => at.elapsed() >= self.options.wait,
		}
	}

	/// In reactive mode, refreshes when the cooldown has elapsed.
	pub fn reactive_refresh(&self) {
		if self.reactive() && self.due() {
			trace!("reactive cache refresh");
			self.mark_refresh();
		}
	}

	pub fn refresh(&self) -> Result<(), CacheError> {
		self.cache.refresh()
	}

	// Read-through accessors; each gives the reactive refresher a chance
	// to re-parse first.

	pub fn retrieve(&self, ident: &str) -> Option<Arc<ServiceProxy>> {
		self.reactive_refresh();
		self.cache.retrieve(ident)
	}

	pub fn search_by_action(
		&self,
		sector: &str,
		action: &str,
		version: i64,
		envelope: &str,
	) -> Vec<Arc<ServiceProxy>> {
		self.reactive_refresh();
		self.cache.search_by_action(sector, action, version, envelope)
	}

	pub fn size(&self) -> usize {
		self.reactive_refresh();
		self.cache.size()
	}

	pub fn all(&self) -> Vec<Arc<ServiceProxy>> {
		self.reactive_refresh();
		self.cache.all()
	}

	pub fn action_list(&self) -> Vec<String> {
		self.reactive_refresh();
		self.cache.action_list()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;

	fn empty_cache() -> (tempfile::NamedTempFile, Arc<ServiceCache>) {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		file.write_all(b"").unwrap();
		let cache = Arc::new(ServiceCache::new(file.path()).unwrap());
		(file, cache)
	}

	#[test]
	fn reactive_refresher_respects_cooldown() {
		let (_file, cache) = empty_cache();
		let refresher = CacheRefresher::new(
			cache,
			RefresherOptions {
				wait: Duration::from_secs(3600),
				reactive: true,
			},
		);
		assert!(refresher.due());
		refresher.reactive_refresh();
		// Within the cooldown the next read must not trigger a re-parse.
		assert!(!refresher.due());
		assert_eq!(refresher.size(), 0);
	}

	#[tokio::test]
	async fn timer_refresher_starts_once_and_stops() {
		let (_file, cache) = empty_cache();
		let refresher = Arc::new(CacheRefresher::new(
			cache,
			RefresherOptions {
				wait: Duration::from_millis(10),
				reactive: false,
			},
		));
		refresher.run();
		refresher.run();
		tokio::time::sleep(Duration::from_millis(30)).await;
		assert!(refresher.running());
		refresher.stop();
		refresher.stop();
		tokio::time::sleep(Duration::from_millis(30)).await;
		assert!(!refresher.running());
	}
}
