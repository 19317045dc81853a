//! A bus service: TLS listener, per-peer dispatch, and the signed
//! announce form consumed by the discovery layer.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand::RngCore;
use ring::signature::RsaKeyPair;
use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::cache::proxy::{ActionDescription, ProxyClass, ServiceProxy};
use crate::client::Client;
use crate::config::Config;
use crate::conn::Connection;
use crate::crypto::{self, CryptoError};
use crate::message::Message;
use crate::wire::header::Envelope;
use action::{ActionFn, ActionHandler, ActionOptions, VerifiedAction};

pub mod action;

/// Idle peers are dropped after this long without a request.
const DISPATCH_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// How long `stop` waits for in-flight clients to drain.
const STOP_GRACE_PERIOD: Duration = Duration::from_secs(30);

const STATS_INTERVAL: Duration = Duration::from_secs(15);

/// Announce interval advertised inside the record, in the units the
/// historical record format uses.
const ANNOUNCE_INTERVAL_FIELD: i64 = 2500;

const MAX_HUMAN_NAME: usize = 18;

#[derive(thiserror::Error, Debug)]
pub enum ServiceError {
	#[error("name `{0}` is too long, must be at most 18 bytes")]
	NameTooLong(String),
	#[error("cannot register handlers while service is running")]
	AlreadyRunning,
	#[error("bad action name: `{0}` (no dot found)")]
	BadActionName(String),
	#[error(transparent)]
	Io(#[from] io::Error),
	#[error(transparent)]
	Crypto(#[from] CryptoError),
	#[error("tls: {0}")]
	Tls(#[from] rustls::Error),
	#[error("could not marshal announce record: {0}")]
	Marshal(#[from] serde_json::Error),
}

struct ServiceAction {
	handler: Arc<dyn ActionHandler>,
	crud_tags: String,
	version: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ServiceStats {
	pub total_clients_accepted: u64,
	pub open_connections: u64,
}

pub struct Service {
	sector: String,
	human_name: String,
	name: String,
	listener: Mutex<Option<TcpListener>>,
	listener_ip: IpAddr,
	listener_port: u16,
	acceptor: TlsAcceptor,
	pem_cert: Vec<u8>,
	signing_key: RsaKeyPair,
	actions: RwLock<HashMap<String, ServiceAction>>,
	running: AtomicBool,
	clients: Mutex<Vec<Arc<Client>>>,
	connections_accepted: AtomicU64,
	announce_cache: Mutex<Option<Vec<u8>>>,
	remarshal: AtomicBool,
	cancel: CancellationToken,
}

impl Service {
	/// Binds a TLS listener on `service_spec` using the keypair at the
	/// given paths. The human name (at most 18 bytes) seeds the unique
	/// instance ident.
	pub async fn new(
		sector: &str,
		service_spec: &str,
		human_name: &str,
		key_path: impl AsRef<std::path::Path>,
		cert_path: impl AsRef<std::path::Path>,
	) -> Result<Arc<Service>, ServiceError> {
		let key_pem = std::fs::read(key_path.as_ref())?;
		let cert_pem = std::fs::read(cert_path.as_ref())?;
		Service::with_keypair(sector, service_spec, human_name, &key_pem, &cert_pem).await
	}

	/// Like [`Service::new`], resolving key and cert locations through the
	/// configuration (`<name>.soa_key` / `<name>.soa_cert`).
	pub async fn from_config(
		config: &Config,
		sector: &str,
		service_spec: &str,
		human_name: &str,
	) -> Result<Arc<Service>, ServiceError> {
		Service::new(
			sector,
			service_spec,
			human_name,
			config.service_key_path(human_name),
			config.service_cert_path(human_name),
		)
		.await
	}

	/// Construction from explicit PEM bytes.
	pub async fn with_keypair(
		sector: &str,
		service_spec: &str,
		human_name: &str,
		key_pem: &[u8],
		cert_pem: &[u8],
	) -> Result<Arc<Service>, ServiceError> {
		if human_name.len() > MAX_HUMAN_NAME {
			return Err(ServiceError::NameTooLong(human_name.to_string()));
		}

		let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &cert_pem[..])
			.collect::<Result<_, _>>()?;
		let key: PrivateKeyDer<'static> =
			rustls_pemfile::private_key(&mut &key_pem[..])?.ok_or(CryptoError::Pem)?;
		let tls_config = ServerConfig::builder()
			.with_no_client_auth()
			.with_single_cert(certs, key)?;
		let signing_key = crypto::rsa_private_key_from_pem(key_pem)?;

		info!(%service_spec, "starting service");
		let listener = TcpListener::bind(service_spec).await?;
		let local = listener.local_addr()?;
		info!(addr = %local, "service now listening");

		let listener_ip = announce_ip(&local.ip());

		Ok(Arc::new(Service {
			sector: sector.to_string(),
			human_name: human_name.to_string(),
			name: generate_unique_name(human_name),
			listener: Mutex::new(Some(listener)),
			listener_ip,
			listener_port: local.port(),
			acceptor: TlsAcceptor::from(Arc::new(tls_config)),
			pem_cert: cert_pem.trim_ascii().to_vec(),
			signing_key,
			actions: RwLock::new(HashMap::new()),
			running: AtomicBool::new(false),
			clients: Mutex::new(Vec::new()),
			connections_accepted: AtomicU64::new(0),
			announce_cache: Mutex::new(None),
			remarshal: AtomicBool::new(false),
			cancel: CancellationToken::new(),
		}))
	}

	/// The unique instance ident, `<human>:<base64(18 random bytes)>`.
	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn human_name(&self) -> &str {
		&self.human_name
	}

	pub fn sector(&self) -> &str {
		&self.sector
	}

	pub fn listener_addr(&self) -> (IpAddr, u16) {
		(self.listener_ip, self.listener_port)
	}

	/// The address peers should dial, as announced.
	pub fn connspec(&self) -> String {
		format!("beepish+tls://{}:{}", self.listener_ip, self.listener_port)
	}

	/// Registers a handler under `Class.Action`. Rejected once the service
	/// is running. Options turn on ticket verification; declaring
	/// privileges turns it on regardless.
	pub fn register(
		&self,
		name: &str,
		handler: impl ActionHandler,
		options: ActionOptions,
	) -> Result<(), ServiceError> {
		if self.running.load(Ordering::SeqCst) {
			return Err(ServiceError::AlreadyRunning);
		}
		if !name.contains('.') {
			return Err(ServiceError::BadActionName(name.to_string()));
		}

		let handler: Arc<dyn ActionHandler> = if options.requires_verification() {
			Arc::new(VerifiedAction::new(Arc::new(handler), options))
		} else {
			Arc::new(handler)
		};

		let mut actions = self.actions.write().expect("actions lock poisoned");
		actions.insert(
			name.to_string(),
			ServiceAction {
				handler,
				crud_tags: String::new(),
				version: 1,
			},
		);
		self.remarshal.store(true, Ordering::SeqCst);
		Ok(())
	}

	/// [`Service::register`] for plain async closures, with default
	/// options.
	pub fn register_fn<F, Fut>(&self, name: &str, f: F) -> Result<(), ServiceError>
	where
		F: Fn(Message, Arc<Client>) -> Fut + Send + Sync + 'static,
		Fut: std::future::Future<Output = ()> + Send + 'static,
	{
		self.register(name, ActionFn(f), ActionOptions::default())
	}

	/// Accept loop. Each peer gets a connection, a client, and a dispatch
	/// task; runs until [`Service::stop`].
	pub async fn run(self: Arc<Self>) {
		let listener = self.listener.lock().expect("listener lock poisoned").take();
		let Some(listener) = listener else {
			warn!(name = %self.name, "service already ran");
			return;
		};
		self.running.store(true, Ordering::SeqCst);

		let stats = self.clone();
		tokio::spawn(async move { stats.stats_loop().await });

		loop {
			let accepted = tokio::select! {
				_ = self.cancel.cancelled() => break,
				accepted = listener.accept() => accepted,
			};
			let (tcp, peer) = match accepted {
				Ok(pair) => pair,
				Err(e) => {
					debug!(error = %e, "exiting service accept loop");
					break;
				},
			};
			trace!(%peer, "accepted new connection");
			self.connections_accepted.fetch_add(1, Ordering::SeqCst);

			let service = self.clone();
			tokio::spawn(async move { service.serve_peer(tcp).await });
		}

		// Drain: closing a client also removes it from the list.
		let clients: Vec<Arc<Client>> = {
			let clients = self.clients.lock().expect("clients lock poisoned");
			clients.clone()
		};
		for client in clients {
			client.close().await;
		}
		self.running.store(false, Ordering::SeqCst);
	}

	async fn serve_peer(self: Arc<Self>, tcp: TcpStream) {
		let stream = match self.acceptor.accept(tcp).await {
			Ok(stream) => stream,
			Err(e) => {
				debug!(error = %e, "tls handshake failed");
				return;
			},
		};
		let (conn, inbound) = Connection::new(TlsStream::Server(stream));
		let client = Client::new(conn, inbound);
		client.set_service(Arc::downgrade(&self));
		self
			.clients
			.lock()
			.expect("clients lock poisoned")
			.push(client.clone());

		self.dispatch(client).await;
	}

	/// Reads inbound requests from one client and routes them to their
	/// handlers until the client idles out or disconnects.
	async fn dispatch(&self, client: Arc<Client>) {
		let Some(mut requests) = client.take_requests() else {
			warn!("client request stream already consumed");
			return;
		};

		loop {
			let msg = match tokio::time::timeout(DISPATCH_IDLE_TIMEOUT, requests.recv()).await {
				Err(_) => {
					debug!("client idle timeout");
					break;
				},
				Ok(None) => break,
				Ok(Some(msg)) => msg,
			};

			let handler = {
				let actions = self.actions.read().expect("actions lock poisoned");
				actions.get(&msg.action).map(|a| a.handler.clone())
			};
			match handler {
				Some(handler) => handler.call(msg, client.clone()).await,
				None => {
					error!(action = %msg.action, "do not know how to handle action");
					let mut reply = Message::reply();
					reply.envelope = Envelope::Json;
					reply.request_id = msg.request_id;
					reply.write(br#"{"error": "no such action"}"#);
					if client.send(&mut reply).await.is_err() {
						break;
					}
				},
			}
		}

		client.close().await;
	}

	/// Drops a closing client from the tracked list.
	pub(crate) fn remove_client(&self, client: &Client) {
		let mut clients = self.clients.lock().expect("clients lock poisoned");
		let before = clients.len();
		clients.retain(|entry| !std::ptr::eq(Arc::as_ptr(entry), client));
		if clients.len() == before {
			warn!("tried removing a client that was not being tracked");
		}
	}

	/// Stops accepting, then waits up to the grace period for in-flight
	/// clients to finish. Idempotent.
	pub async fn stop(&self) {
		{
			let clients = self.clients.lock().expect("clients lock poisoned");
			info!(
				waiting = clients.len(),
				name = %self.name,
				"service is stopping",
			);
		}
		self.cancel.cancel();

		let deadline = tokio::time::Instant::now() + STOP_GRACE_PERIOD;
		loop {
			let open = self.clients.lock().expect("clients lock poisoned").len();
			if open == 0 {
				break;
			}
			if tokio::time::Instant::now() >= deadline {
				info!(
					open,
					grace = ?STOP_GRACE_PERIOD,
					"timed out waiting for clients",
				);
				break;
			}
			tokio::time::sleep(Duration::from_millis(50)).await;
		}
		info!(name = %self.name, "service stopped");
	}

	pub fn stats(&self) -> ServiceStats {
		ServiceStats {
			total_clients_accepted: self.connections_accepted.load(Ordering::SeqCst),
			open_connections: self.clients.lock().expect("clients lock poisoned").len() as u64,
		}
	}

	async fn stats_loop(&self) {
		let mut tick = tokio::time::interval(STATS_INTERVAL);
		tick.reset();
		loop {
			tokio::select! {
				_ = self.cancel.cancelled() => break,
				_ = tick.tick() => {
					if let Ok(stats) = serde_json::to_string(&self.stats()) {
						trace!(name = %self.name, %stats, "periodic service stats");
					}
				},
			}
		}
	}

	/// This service described as a discovery record.
	pub fn as_proxy(&self) -> ServiceProxy {
		let mut grouped: BTreeMap<String, Vec<ActionDescription>> = BTreeMap::new();
		{
			let actions = self.actions.read().expect("actions lock poisoned");
			for (name, action) in actions.iter() {
				let (class, action_name) = name
					.rsplit_once('.')
					.expect("registration enforces a dot");
				grouped.entry(class.to_string()).or_default().push(ActionDescription {
					name: action_name.to_string(),
					crud_tags: action.crud_tags.clone(),
					version: action.version,
				});
			}
		}
		let classes = grouped
			.into_iter()
			.map(|(name, mut actions)| {
				actions.sort_by(|a, b| a.name.cmp(&b.name));
				ProxyClass { name, actions }
			})
			.collect();

		ServiceProxy::new_local(
			self.name.clone(),
			self.sector.clone(),
			self.connspec(),
			ANNOUNCE_INTERVAL_FIELD,
			classes,
			high_res_timestamp(),
		)
	}

	/// Forces the next [`Service::marshal_text`] to re-serialize and
	/// re-sign.
	pub fn set_remarshal(&self) {
		self.remarshal.store(true, Ordering::SeqCst);
	}

	/// The signed announce form: class records, PEM cert, and 76-column
	/// wrapped base64url signature, blank-line separated. Cached until the
	/// action set changes.
	pub fn marshal_text(&self) -> Result<Vec<u8>, ServiceError> {
		let mut cache = self.announce_cache.lock().expect("announce cache poisoned");
		if !self.remarshal.swap(false, Ordering::SeqCst) {
			if let Some(cached) = cache.as_ref() {
				return Ok(cached.clone());
			}
		}

		let class_records = self.as_proxy().class_records_json()?;
		let sig = crypto::sign_sha256(&class_records, &self.signing_key)?;

		let mut out = Vec::with_capacity(class_records.len() + self.pem_cert.len() + sig.len() + 8);
		out.extend_from_slice(&class_records);
		out.extend_from_slice(b"\n\n");
		out.extend_from_slice(&self.pem_cert);
		out.extend_from_slice(b"\n\n");
		for row in crypto::wrap_rows(&sig, 76) {
			out.extend_from_slice(row.as_bytes());
			out.push(b'\n');
		}
		out.push(b'\n');

		*cache = Some(out.clone());
		Ok(out)
	}
}

fn generate_unique_name(human_name: &str) -> String {
	let mut suffix = [0u8; 18];
	rand::rng().fill_bytes(&mut suffix);
	format!("{human_name}:{}", STANDARD.encode(suffix))
}

/// The IPv4 address to advertise in announce records: a non-loopback
/// interface address when one exists, otherwise whatever the listener
/// bound to.
fn announce_ip(bound: &IpAddr) -> IpAddr {
	match local_ip_address::local_ip() {
		Ok(ip) => ip,
		Err(e) => {
			warn!(error = %e, "could not pick an announce address; using listener address");
			if bound.is_unspecified() {
				IpAddr::from([127, 0, 0, 1])
			} else {
				*bound
			}
		},
	}
}

fn high_res_timestamp() -> f64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_secs_f64())
		.unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn unique_name_shape() {
		let name = generate_unique_name("logger");
		let (human, suffix) = name.split_once(':').unwrap();
		assert_eq!(human, "logger");
		// 18 random bytes base64-encode to 24 chars.
		assert_eq!(suffix.len(), 24);
		let other = generate_unique_name("logger");
		assert_ne!(name, other);
	}

	#[test]
	fn high_res_timestamp_is_recent() {
		let ts = high_res_timestamp();
		assert!(ts > 1_500_000_000.0);
	}
}
