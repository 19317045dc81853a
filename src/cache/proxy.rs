//! A signed announce record describing one remote service instance, plus
//! the lazily-dialed client used to reach it.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::warn;
use url::Url;

use super::CacheError;
use crate::client::Client;
use crate::crypto;

/// Discovery extension blob some services embed in their `protocols`
/// array. Preserved verbatim, never indexed.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryExtension {
	#[serde(default)]
	pub vmin: i64,
	#[serde(default)]
	pub vmaj: i64,
	#[serde(default)]
	pub acsec: Value,
	#[serde(default)]
	pub acname: Value,
	#[serde(default)]
	pub acver: Value,
	#[serde(default)]
	pub acenv: Value,
	#[serde(default)]
	pub acflag: Value,
	#[serde(default)]
	pub acns: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionDescription {
	pub name: String,
	pub crud_tags: String,
	pub version: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyClass {
	pub name: String,
	pub actions: Vec<ActionDescription>,
}

pub struct ServiceProxy {
	version: i64,
	ident: String,
	sector: String,
	weight: i64,
	announce_interval: i64,
	connspec: String,
	protocols: Vec<String>,
	extension: Option<DiscoveryExtension>,
	classes: Vec<ProxyClass>,
	timestamp: f64,
	raw_class_records: Vec<u8>,
	raw_cert: Vec<u8>,
	raw_sig: Vec<u8>,
	// Cached client, connected on demand. Weakly owned by the proxy: the
	// client clears this slot when it closes.
	client: Mutex<Option<Arc<Client>>>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ProtocolEntry {
	Name(String),
	Extension(DiscoveryExtension),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ClassItem {
	Name(String),
	Action(Vec<Value>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum VersionField {
	Int(i64),
	Str(String),
}

type RawRecord = (
	i64,
	String,
	String,
	i64,
	i64,
	String,
	Vec<ProtocolEntry>,
	Vec<Vec<ClassItem>>,
	f64,
);

fn parse_action(spec: &[Value]) -> Result<ActionDescription, CacheError> {
	if spec.len() != 2 && spec.len() != 3 {
		return Err(CacheError::BadActionSpec);
	}
	let name: String = serde_json::from_value(spec[0].clone())?;
	let crud_tags: String = serde_json::from_value(spec[1].clone())?;
	// A missing version means 1; some services announce the version as a
	// quoted decimal string.
	let version = match spec.get(2) {
		None => 1,
		Some(v) => match serde_json::from_value::<VersionField>(v.clone())? {
			VersionField::Int(n) => n,
			VersionField::Str(s) => s
				.parse()
				.map_err(|_| CacheError::BadActionSpec)?,
		},
	};
	Ok(ActionDescription {
		name,
		crud_tags,
		version,
	})
}

impl ServiceProxy {
	/// Parses the nine-element positional class-record array together with
	/// the record's PEM certificate and wrapped signature.
	pub fn parse(
		class_records: &[u8],
		cert: &[u8],
		sig: &[u8],
	) -> Result<ServiceProxy, CacheError> {
		let (
			version,
			ident,
			sector,
			weight,
			announce_interval,
			connspec,
			raw_protocols,
			raw_classes,
			timestamp,
		): RawRecord = serde_json::from_slice(class_records)?;

		let mut protocols = Vec::new();
		let mut extension = None;
		for entry in raw_protocols {
			match entry {
				ProtocolEntry::Name(name) => protocols.push(name),
				ProtocolEntry::Extension(ext) => extension = Some(ext),
			}
		}

		let mut classes = Vec::with_capacity(raw_classes.len());
		for raw_class in raw_classes {
			let mut items = raw_class.into_iter();
			let Some(ClassItem::Name(name)) = items.next() else {
				return Err(CacheError::BadClassSpec);
			};
			let mut actions = Vec::new();
			for item in items {
				let ClassItem::Action(spec) = item else {
					return Err(CacheError::BadClassSpec);
				};
				actions.push(parse_action(&spec)?);
			}
			classes.push(ProxyClass { name, actions });
		}

		Ok(ServiceProxy {
			version,
			ident,
			sector,
			weight,
			announce_interval,
			connspec,
			protocols,
			extension,
			classes,
			timestamp,
			raw_class_records: class_records.to_vec(),
			raw_cert: cert.to_vec(),
			raw_sig: sig.to_vec(),
			client: Mutex::new(None),
		})
	}

	/// Used by a local service describing itself for announcement.
	pub(crate) fn new_local(
		ident: String,
		sector: String,
		connspec: String,
		announce_interval: i64,
		classes: Vec<ProxyClass>,
		timestamp: f64,
	) -> ServiceProxy {
		ServiceProxy {
			version: 3,
			ident,
			sector,
			weight: 1,
			announce_interval,
			connspec,
			protocols: vec!["json".to_string()],
			extension: None,
			classes,
			timestamp,
			raw_class_records: Vec::new(),
			raw_cert: Vec::new(),
			raw_sig: Vec::new(),
			client: Mutex::new(None),
		}
	}

	pub fn version(&self) -> i64 {
		self.version
	}

	pub fn ident(&self) -> &str {
		&self.ident
	}

	pub fn sector(&self) -> &str {
		&self.sector
	}

	pub fn weight(&self) -> i64 {
		self.weight
	}

	pub fn announce_interval(&self) -> i64 {
		self.announce_interval
	}

	pub fn connspec(&self) -> &str {
		&self.connspec
	}

	pub fn protocols(&self) -> &[String] {
		&self.protocols
	}

	pub fn extension(&self) -> Option<&DiscoveryExtension> {
		self.extension.as_ref()
	}

	pub fn classes(&self) -> &[ProxyClass] {
		&self.classes
	}

	pub fn timestamp(&self) -> f64 {
		self.timestamp
	}

	pub fn raw_cert(&self) -> &[u8] {
		&self.raw_cert
	}

	/// Serializes the nine-element positional form. For records parsed
	/// from a cache file this re-marshals the parsed fields, not the raw
	/// bytes.
	pub fn class_records_json(&self) -> Result<Vec<u8>, serde_json::Error> {
		let classes: Vec<Value> = self
			.classes
			.iter()
			.map(|class| {
				let mut entry = vec![json!(class.name)];
				for action in &class.actions {
					entry.push(json!([action.name, action.crud_tags, action.version]));
				}
				Value::Array(entry)
			})
			.collect();
		serde_json::to_vec(&json!([
			self.version,
			self.ident,
			self.sector,
			self.weight,
			self.announce_interval,
			self.connspec,
			self.protocols,
			classes,
			self.timestamp,
		]))
	}

	/// Checks the record's RSA signature over the raw class records against
	/// the public key in the embedded certificate. Returns the cert's
	/// SHA-1 fingerprint on success.
	pub fn validate(&self) -> Result<String, CacheError> {
		let key = crypto::rsa_public_key_from_cert_pem(&self.raw_cert)?;
		crypto::verify_sha256(&self.raw_class_records, &self.raw_sig, &key)?;
		Ok(crypto::cert_fingerprint_from_pem(&self.raw_cert)?)
	}

	/// The client for this proxy, dialing on first use and redialing if
	/// the cached client has closed since.
	pub async fn get_client(self: &Arc<Self>) -> Result<Arc<Client>, CacheError> {
		let mut slot = self.client.lock().await;
		if slot.as_ref().is_none_or(|c| c.is_closed()) {
			let url = Url::parse(&self.connspec)
				.map_err(|_| CacheError::Connspec(self.connspec.clone()))?;
			let (Some(host), Some(port)) = (url.host_str(), url.port()) else {
				return Err(CacheError::Connspec(self.connspec.clone()));
			};
			let client = Client::dial(&format!("{host}:{port}"))
				.await
				.map_err(crate::client::ClientError::from)?;
			client.set_origin(Arc::downgrade(self));
			*slot = Some(client);
		}
		Ok(slot.as_ref().expect("client slot was just filled").clone())
	}

	/// Pending requests on the cached client, used to order candidates.
	pub async fn open_request_count(&self) -> usize {
		match self.client.lock().await.as_ref() {
			Some(client) if !client.is_closed() => client.open_request_count(),
			_ => 0,
		}
	}

	/// Drops the cached-client slot if it still holds `client`.
	pub(crate) async fn clear_client(&self, client: &Client) {
		let mut slot = self.client.lock().await;
		if let Some(cached) = slot.as_ref() {
			if std::ptr::eq(Arc::as_ptr(cached), client) {
				*slot = None;
			} else {
				warn!(ident = %self.ident, "stale client tried to clear proxy slot");
			}
		}
	}
}

impl std::fmt::Debug for ServiceProxy {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ServiceProxy")
			.field("ident", &self.ident)
			.field("sector", &self.sector)
			.field("connspec", &self.connspec)
			.field("classes", &self.classes)
			.finish_non_exhaustive()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_minimal_record() {
		let raw = br#"[3,"logger-abc","main",1,2500,"beepish+tls://10.0.0.1:30100",["json"],[["Logging",["info","",1]]],10.0]"#;
		let proxy = ServiceProxy::parse(raw, b"", b"").unwrap();
		assert_eq!(proxy.ident(), "logger-abc");
		assert_eq!(proxy.sector(), "main");
		assert_eq!(proxy.protocols(), &["json".to_string()][..]);
		assert_eq!(proxy.classes().len(), 1);
		assert_eq!(proxy.classes()[0].name, "Logging");
		assert_eq!(proxy.classes()[0].actions[0].name, "info");
		assert_eq!(proxy.timestamp(), 10.0);
	}

	#[test]
	fn missing_action_version_defaults_to_one() {
		let raw = br#"[3,"x","main",1,2500,"beepish+tls://h:1",["json"],[["C",["a",""]]],1.0]"#;
		let proxy = ServiceProxy::parse(raw, b"", b"").unwrap();
		assert_eq!(proxy.classes()[0].actions[0].version, 1);
	}

	#[test]
	fn quoted_action_version_parses() {
		let raw = br#"[3,"x","main",1,2500,"beepish+tls://h:1",["json"],[["C",["a","","5"]]],1.0]"#;
		let proxy = ServiceProxy::parse(raw, b"", b"").unwrap();
		assert_eq!(proxy.classes()[0].actions[0].version, 5);
	}

	#[test]
	fn extension_object_is_preserved_not_indexed() {
		let raw = br#"[3,"x","main",1,2500,"beepish+tls://h:1",["json",{"vmin":0,"vmaj":4}],[["C",["a","",1]]],1.0]"#;
		let proxy = ServiceProxy::parse(raw, b"", b"").unwrap();
		assert_eq!(proxy.protocols(), &["json".to_string()][..]);
		let ext = proxy.extension().unwrap();
		assert_eq!(ext.vmaj, 4);
	}

	#[test]
	fn wrong_arity_is_rejected() {
		let raw = br#"[3,"x","main",1,2500,"beepish+tls://h:1",["json"],[["C",["a","",1]]]]"#;
		assert!(ServiceProxy::parse(raw, b"", b"").is_err());
	}

	#[test]
	fn marshal_parse_round_trip() {
		let raw = br#"[3,"logger-abc","main",1,2500,"beepish+tls://10.0.0.1:30100",["json"],[["Logging",["info","",1],["warn","",2]]],10.0]"#;
		let proxy = ServiceProxy::parse(raw, b"", b"").unwrap();
		let marshalled = proxy.class_records_json().unwrap();
		let back = ServiceProxy::parse(&marshalled, b"", b"").unwrap();
		assert_eq!(back.ident(), proxy.ident());
		assert_eq!(back.sector(), proxy.sector());
		assert_eq!(back.weight(), proxy.weight());
		assert_eq!(back.announce_interval(), proxy.announce_interval());
		assert_eq!(back.connspec(), proxy.connspec());
		assert_eq!(back.protocols(), proxy.protocols());
		assert_eq!(back.classes(), proxy.classes());
		assert_eq!(back.timestamp(), proxy.timestamp());
	}
}
