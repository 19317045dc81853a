//! Request/reply multiplexing on top of a [`Connection`].
//!
//! A client stamps outbound request ids, registers a one-shot waiter per
//! request, and splits the connection's inbound stream into requests (for
//! service dispatch) and replies (routed to their waiters).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{mpsc, oneshot};
use tracing::{trace, warn};

use crate::cache::proxy::ServiceProxy;
use crate::conn::{Connection, ConnectionError};
use crate::message::Message;
use crate::service::Service;
use crate::wire::header::MessageType;

const REQUEST_DEPTH: usize = 16;

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
	#[error("client already closed")]
	Closed,
	#[error(transparent)]
	Connection(#[from] ConnectionError),
}

pub struct Client {
	conn: Arc<Connection>,
	requests_rx: Mutex<Option<mpsc::Receiver<Message>>>,
	open_replies: Mutex<HashMap<u64, oneshot::Sender<Message>>>,
	send_state: tokio::sync::Mutex<u64>,
	closed: AtomicBool,
	service: Mutex<Option<Weak<Service>>>,
	origin: Mutex<Option<Weak<ServiceProxy>>>,
}

impl Client {
	/// Dials a peer and wraps the connection in a new client.
	pub async fn dial(connspec: &str) -> Result<Arc<Client>, ConnectionError> {
		let (conn, inbound) = Connection::dial(connspec).await?;
		Ok(Client::new(conn, inbound))
	}

	/// Starts the demultiplexer task over the connection's inbound stream.
	pub fn new(conn: Arc<Connection>, inbound: mpsc::Receiver<Message>) -> Arc<Client> {
		let (requests_tx, requests_rx) = mpsc::channel(REQUEST_DEPTH);
		let client = Arc::new(Client {
			conn,
			requests_rx: Mutex::new(Some(requests_rx)),
			open_replies: Mutex::new(HashMap::new()),
			send_state: tokio::sync::Mutex::new(0),
			closed: AtomicBool::new(false),
			service: Mutex::new(None),
			origin: Mutex::new(None),
		});
		tokio::spawn(demux(client.clone(), inbound, requests_tx));
		client
	}

	/// Stamps the next request id and sends. For request-type messages the
	/// returned waiter resolves with the reply, or closes without a value
	/// if the client shuts down first. Reply-type sends return no waiter.
	///
	/// The waiter is registered under the send lock, atomically with the
	/// bytes going out.
	pub async fn send(
		&self,
		msg: &mut Message,
	) -> Result<Option<oneshot::Receiver<Message>>, ClientError> {
		if self.is_closed() {
			return Err(ClientError::Closed);
		}

		// Replies carry the id of the request they answer; only requests get
		// a fresh id stamped here.
		let mut next_request_id = self.send_state.lock().await;
		let waiter = if msg.message_type == MessageType::Request {
			*next_request_id += 1;
			msg.request_id = *next_request_id;
			let (tx, rx) = oneshot::channel();
			self
				.open_replies
				.lock()
				.expect("open replies lock poisoned")
				.insert(msg.request_id, tx);
			Some(rx)
		} else {
			None
		};

		if let Err(e) = self.conn.send(msg).await {
			if waiter.is_some() {
				self
					.open_replies
					.lock()
					.expect("open replies lock poisoned")
					.remove(&msg.request_id);
			}
			return Err(e.into());
		}
		Ok(waiter)
	}

	/// The stream of inbound request messages, consumed once by the
	/// service-side dispatch loop.
	pub fn take_requests(&self) -> Option<mpsc::Receiver<Message>> {
		self.requests_rx.lock().expect("requests lock poisoned").take()
	}

	/// Requests sent through this client that still await a reply.
	pub fn open_request_count(&self) -> usize {
		self.open_replies.lock().expect("open replies lock poisoned").len()
	}

	pub fn fingerprint(&self) -> Option<&str> {
		self.conn.fingerprint()
	}

	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::SeqCst)
	}

	pub(crate) fn set_service(&self, service: Weak<Service>) {
		*self.service.lock().expect("service lock poisoned") = Some(service);
	}

	pub(crate) fn set_origin(&self, proxy: Weak<ServiceProxy>) {
		*self.origin.lock().expect("origin lock poisoned") = Some(proxy);
	}

	/// Idempotent. Closes the connection, abandons every pending waiter,
	/// detaches from the owning service, and clears the originating
	/// proxy's cached-client slot.
	pub async fn close(&self) {
		if self.closed.swap(true, Ordering::SeqCst) {
			return;
		}
		trace!("closing client");
		self.conn.close().await;
		self
			.open_replies
			.lock()
			.expect("open replies lock poisoned")
			.clear();

		let service = self.service.lock().expect("service lock poisoned").take();
		if let Some(service) = service.and_then(|w| w.upgrade()) {
			service.remove_client(self);
		}
		let origin = self.origin.lock().expect("origin lock poisoned").take();
		if let Some(proxy) = origin.and_then(|w| w.upgrade()) {
			proxy.clear_client(self).await;
		}
	}
}

async fn demux(
	client: Arc<Client>,
	mut inbound: mpsc::Receiver<Message>,
	requests_tx: mpsc::Sender<Message>,
) {
	while let Some(msg) = inbound.recv().await {
		match msg.message_type {
			MessageType::Request => {
				if requests_tx.send(msg).await.is_err() {
					// Nobody is dispatching requests for this client.
					break;
				}
			},
			MessageType::Reply => {
				let waiter = client
					.open_replies
					.lock()
					.expect("open replies lock poisoned")
					.remove(&msg.request_id);
				match waiter {
					Some(tx) => {
						let _ = tx.send(msg);
					},
					None => {
						warn!(
							request_id = msg.request_id,
							"got an unexpected reply; dropping"
						);
					},
				}
			},
		}
	}

	// Inbound stream closed: dropping requests_tx closes the request
	// stream, and clearing the waiters signals abandonment.
	drop(requests_tx);
	client
		.open_replies
		.lock()
		.expect("open replies lock poisoned")
		.clear();
	client.close().await;
}
