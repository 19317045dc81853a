//! Memory-resident index over the signed announce records in a discovery
//! cache file.
//!
//! Records are indexed two ways: by service ident, and by the munged
//! action key `sector:class.action~version#envelope` (lowercased) for each
//! `(class, action, protocol)` tuple. Refresh is a full rebuild swapped in
//! under the write lock, so readers never observe a half-built index.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use itertools::Itertools;
use tracing::{debug, warn};

use crate::client::ClientError;
use crate::crypto::CryptoError;
use proxy::ServiceProxy;

pub mod proxy;
pub mod refresher;

const RECORD_SEPARATOR: &str = "%%%";

#[derive(thiserror::Error, Debug)]
pub enum CacheError {
	#[error("cannot use cache path: `{0}` is a directory")]
	PathIsDirectory(PathBuf),
	#[error(transparent)]
	Io(#[from] io::Error),
	#[error("expected newline after class records")]
	MalformedRecord,
	#[error("bad announce record: {0}")]
	Record(#[from] serde_json::Error),
	#[error("expected action spec to have 2 or 3 entries")]
	BadActionSpec,
	#[error("expected class spec to start with a class name")]
	BadClassSpec,
	#[error(transparent)]
	Crypto(#[from] CryptoError),
	#[error("invalid connspec `{0}`")]
	Connspec(String),
	#[error(transparent)]
	Client(#[from] ClientError),
}

#[derive(Default)]
struct CacheInner {
	ident_index: HashMap<String, Arc<ServiceProxy>>,
	action_index: HashMap<String, Vec<Arc<ServiceProxy>>>,
}

impl CacheInner {
	fn store(&mut self, instance: Arc<ServiceProxy>) {
		self
			.ident_index
			.insert(instance.ident().to_string(), instance.clone());
		for class in instance.classes() {
			for action in &class.actions {
				for protocol in instance.protocols() {
					let key = munge(
						instance.sector(),
						&format!("{}.{}", class.name, action.name),
						action.version,
						protocol,
					);
					self
						.action_index
						.entry(key)
						.or_default()
						.push(instance.clone());
				}
			}
		}
	}
}

/// The munged action-index key.
pub fn munge(sector: &str, action: &str, version: i64, envelope: &str) -> String {
	format!("{sector}:{action}~{version}#{envelope}").to_lowercase()
}

pub struct ServiceCache {
	path: PathBuf,
	verify_records: AtomicBool,
	inner: RwLock<CacheInner>,
}

impl std::fmt::Debug for ServiceCache {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ServiceCache")
			.field("path", &self.path)
			.field("verify_records", &self.verify_records)
			.finish_non_exhaustive()
	}
}

impl ServiceCache {
	/// Builds a cache over `path` and performs the initial refresh.
	pub fn new(path: impl Into<PathBuf>) -> Result<ServiceCache, CacheError> {
		let cache = ServiceCache {
			path: path.into(),
			verify_records: AtomicBool::new(true),
			inner: RwLock::new(CacheInner::default()),
		};
		cache.refresh()?;
		Ok(cache)
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	/// Record signature verification is on by default; benchmarks and
	/// tests may disable it.
	pub fn set_record_verification(&self, enabled: bool) {
		self.verify_records.store(enabled, Ordering::SeqCst);
	}

	/// Full re-parse of the cache file. The new indices are built off-lock
	/// and swapped in whole.
	pub fn refresh(&self) -> Result<(), CacheError> {
		let meta = std::fs::metadata(&self.path)?;
		if meta.is_dir() {
			return Err(CacheError::PathIsDirectory(self.path.clone()));
		}
		let text = std::fs::read_to_string(&self.path)?;

		let mut fresh = CacheInner::default();
		let verify = self.verify_records.load(Ordering::SeqCst);
		for record in scan_records(&text) {
			let (class_records, cert, sig) = record?;
			let instance = match ServiceProxy::parse(class_records.as_bytes(), cert.as_bytes(), sig.as_bytes()) {
				Ok(instance) => instance,
				Err(e) => {
					warn!(error = %e, "dropping unparseable announce record");
					continue;
				},
			};
			if verify {
				if let Err(e) = instance.validate() {
					warn!(ident = instance.ident(), error = %e, "dropping announce record that failed validation");
					continue;
				}
			}
			fresh.store(Arc::new(instance));
		}

		let mut inner = self.inner.write().expect("cache lock poisoned");
		*inner = fresh;
		debug!(services = inner.ident_index.len(), "service cache refreshed");
		Ok(())
	}

	/// Inserts a record directly, bypassing the file. Mostly useful for
	/// tests and local tooling.
	pub fn store(&self, instance: Arc<ServiceProxy>) {
		let mut inner = self.inner.write().expect("cache lock poisoned");
		inner.store(instance);
	}

	pub fn retrieve(&self, ident: &str) -> Option<Arc<ServiceProxy>> {
		let inner = self.inner.read().expect("cache lock poisoned");
		inner.ident_index.get(ident).cloned()
	}

	/// Proxies able to serve `sector:action~version#envelope`, in record
	/// insertion order. Unknown keys yield an empty list.
	pub fn search_by_action(
		&self,
		sector: &str,
		action: &str,
		version: i64,
		envelope: &str,
	) -> Vec<Arc<ServiceProxy>> {
		let key = munge(sector, action, version, envelope);
		let inner = self.inner.read().expect("cache lock poisoned");
		inner.action_index.get(&key).cloned().unwrap_or_default()
	}

	pub fn size(&self) -> usize {
		let inner = self.inner.read().expect("cache lock poisoned");
		inner.ident_index.len()
	}

	pub fn all(&self) -> Vec<Arc<ServiceProxy>> {
		let inner = self.inner.read().expect("cache lock poisoned");
		inner.ident_index.values().cloned().collect()
	}

	/// Every munged action key currently indexed, sorted.
	pub fn action_list(&self) -> Vec<String> {
		let inner = self.inner.read().expect("cache lock poisoned");
		inner.action_index.keys().cloned().sorted().collect()
	}
}

type RawRecord = (String, String, String);

/// Walks the cache file format: any slop, a `%%%` line, a one-line class
/// record, a blank line, PEM cert lines, a blank line, wrapped signature
/// lines, a blank line (or the next separator).
fn scan_records(text: &str) -> impl Iterator<Item = Result<RawRecord, CacheError>> + '_ {
	let mut lines = text.lines().map(|l| l.strip_suffix('\r').unwrap_or(l));
	let mut at_separator = false;
	std::iter::from_fn(move || {
		if !at_separator {
			loop {
				match lines.next() {
					None => return None,
					Some(line) if line == RECORD_SEPARATOR => break,
					Some(_) => {},
				}
			}
		}
		at_separator = false;

		let class_records = match lines.next() {
			None => return None,
			Some(line) if line.is_empty() => return None,
			Some(line) => line.to_string(),
		};
		match lines.next() {
			Some(line) if line.is_empty() => {},
			_ => return Some(Err(CacheError::MalformedRecord)),
		}

		let mut cert_lines = Vec::new();
		loop {
			match lines.next() {
				None => break,
				Some(line) if line.is_empty() => break,
				Some(line) => cert_lines.push(line),
			}
		}

		let mut sig_lines = Vec::new();
		loop {
			match lines.next() {
				None => break,
				Some(line) if line.is_empty() => break,
				Some(line) if line == RECORD_SEPARATOR => {
					// Signature ran straight into the next record.
					at_separator = true;
					break;
				},
				Some(line) => sig_lines.push(line),
			}
		}

		Some(Ok((
			class_records,
			cert_lines.join("\n"),
			sig_lines.join("\n"),
		)))
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	const RECORD: &str = r#"[3,"logger-abc","main",1,2500,"beepish+tls://10.0.0.1:30100",["json"],[["Logger",["info","",1]]],10.0]"#;

	fn cache_file(contents: &str) -> tempfile::NamedTempFile {
		use std::io::Write;
		let mut file = tempfile::NamedTempFile::new().unwrap();
		file.write_all(contents.as_bytes()).unwrap();
		file.flush().unwrap();
		file
	}

	#[test]
	fn munged_keys_are_lowercased() {
		assert_eq!(
			munge("MAIN", "Logger.Info", 1, "JSON"),
			"main:logger.info~1#json"
		);
	}

	#[test]
	fn scan_finds_single_record() {
		let text = format!(
			"%%%\n{RECORD}\n\n-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n\nc2ln\nbmF0dXJl\n\n"
		);
		let records: Vec<_> = scan_records(&text).collect::<Result<_, _>>().unwrap();
		assert_eq!(records.len(), 1);
		let (class_records, cert, sig) = &records[0];
		assert_eq!(class_records, RECORD);
		assert!(cert.starts_with("-----BEGIN CERTIFICATE-----"));
		assert!(cert.ends_with("-----END CERTIFICATE-----"));
		assert_eq!(sig, "c2ln\nbmF0dXJl");
	}

	#[test]
	fn scan_handles_multiple_records_and_slop() {
		let one = format!("%%%\n{RECORD}\n\nCERT\n\nSIG\n\n");
		let text = format!("leading slop\n{one}{one}trailing slop\n");
		let records: Vec<_> = scan_records(&text).collect::<Result<_, _>>().unwrap();
		assert_eq!(records.len(), 2);
	}

	#[test]
	fn scan_requires_blank_after_class_records() {
		let text = format!("%%%\n{RECORD}\nCERT\n");
		let err = scan_records(&text).next().unwrap().unwrap_err();
		assert!(matches!(err, CacheError::MalformedRecord));
	}

	#[test]
	fn unverified_cache_parses_and_indexes() {
		let file = cache_file(&format!("%%%\n{RECORD}\n\nCERT\n\nSIG\n\n"));
		let cache = ServiceCache::new(file.path()).unwrap();
		// The dummy record has no real cert, so it only survives with
		// verification off.
		assert_eq!(cache.size(), 0);
		cache.set_record_verification(false);
		cache.refresh().unwrap();

		assert_eq!(cache.size(), 1);
		assert!(cache.retrieve("logger-abc").is_some());
		assert!(cache.retrieve("other").is_none());

		let found = cache.search_by_action("main", "Logger.info", 1, "json");
		assert_eq!(found.len(), 1);
		assert_eq!(found[0].ident(), "logger-abc");

		// Lookup is case-insensitive through the munged key.
		let found = cache.search_by_action("Main", "logger.INFO", 1, "JSON");
		assert_eq!(found.len(), 1);

		assert!(cache.search_by_action("main", "Logger.info", 2, "json").is_empty());
		assert!(cache.search_by_action("main", "Logger.info", 1, "jsonstore").is_empty());

		assert_eq!(cache.action_list(), vec!["main:logger.info~1#json".to_string()]);
	}

	#[test]
	fn refresh_is_idempotent_on_unchanged_file() {
		let file = cache_file(&format!("%%%\n{RECORD}\n\nCERT\n\nSIG\n\n"));
		let cache = ServiceCache::new(file.path()).unwrap();
		cache.set_record_verification(false);
		cache.refresh().unwrap();
		let before: Vec<String> = cache.all().iter().map(|p| p.ident().to_string()).collect();
		let actions_before = cache.action_list();
		cache.refresh().unwrap();
		let after: Vec<String> = cache.all().iter().map(|p| p.ident().to_string()).collect();
		assert_eq!(before, after);
		assert_eq!(actions_before, cache.action_list());
	}

	#[test]
	fn verification_drops_garbage_records() {
		let file = cache_file(&format!("%%%\n{RECORD}\n\nNOT A CERT\n\nSIG\n\n"));
		let cache = ServiceCache::new(file.path()).unwrap();
		assert_eq!(cache.size(), 0);
		assert!(cache.search_by_action("main", "Logger.info", 1, "json").is_empty());
	}

	#[test]
	fn directory_path_is_rejected() {
		let dir = tempfile::tempdir().unwrap();
		let err = ServiceCache::new(dir.path()).unwrap_err();
		assert!(matches!(err, CacheError::PathIsDirectory(_)));
	}
}
