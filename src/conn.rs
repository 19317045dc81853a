//! One mutually-trusted TLS connection carrying multiplexed messages.
//!
//! A connection owns exactly one TLS socket. One reader task de-interleaves
//! inbound packets into per-msgno assemblies and delivers completed
//! messages on a channel; all outbound bytes (including ACKs) go through a
//! single writer lock so each message's packets are contiguous on the wire.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use once_cell::sync::Lazy;
use rustls::ClientConfig;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::{TlsConnector, TlsStream};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::crypto;
use crate::message::Message;
use crate::wire::{FrameError, Packet, PacketCodec, PacketType};

/// TCP connect deadline when dialing a peer.
const DIAL_TIMEOUT: Duration = Duration::from_millis(100);

/// Transient write errors are retried this many times before the send
/// fails.
const RETRY_LIMIT: usize = 50;

/// Inbound message channel depth per connection.
const INBOUND_DEPTH: usize = 16;

#[derive(thiserror::Error, Debug)]
pub enum ConnectionError {
	#[error(transparent)]
	Frame(#[from] FrameError),
	#[error("out of sequence msgno: expected {expected} but got {got}")]
	OutOfSequence { expected: u64, got: u64 },
	#[error("bad HEADER; already tracking msgno {0}")]
	DuplicateHeader(u64),
	#[error("not tracking msgno {0}")]
	UnknownMsgNo(u64),
	#[error("connection already closed")]
	Closed,
	#[error("dial timed out after {0:?}")]
	DialTimeout(Duration),
	#[error("invalid connspec `{0}`")]
	InvalidConnspec(String),
	#[error("transport error: {0}")]
	Transport(#[from] io::Error),
	#[error("write failed after {attempts} attempts: {source}")]
	RetriesExhausted { attempts: usize, source: io::Error },
}

struct WriterState {
	sink: FramedWrite<WriteHalf<TlsStream<TcpStream>>, PacketCodec>,
	next_msg_no: u64,
}

pub struct Connection {
	fingerprint: Option<String>,
	writer: Arc<tokio::sync::Mutex<WriterState>>,
	cancel: CancellationToken,
	closed: AtomicBool,
}

impl Connection {
	/// Dials `connspec` (`host:port`) with the connect deadline, completes
	/// the TLS handshake, and starts the reader task. Peer certificates are
	/// not checked against web PKI; trust comes from signed announce
	/// records, so the dial side records the peer fingerprint instead.
	pub async fn dial(
		connspec: &str,
	) -> Result<(Arc<Connection>, mpsc::Receiver<Message>), ConnectionError> {
		trace!(%connspec, "dialing connection");
		let tcp = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(connspec))
			.await
			.map_err(|_| ConnectionError::DialTimeout(DIAL_TIMEOUT))??;
		tcp.set_nodelay(true)?;

		let host = connspec
			.rsplit_once(':')
			.map(|(host, _)| host)
			.unwrap_or(connspec);
		let server_name = ServerName::try_from(host.to_string())
			.map_err(|_| ConnectionError::InvalidConnspec(connspec.to_string()))?;

		let connector = TlsConnector::from(insecure::client_config());
		let stream = connector.connect(server_name, tcp).await?;
		Ok(Connection::new(TlsStream::Client(stream)))
	}

	/// Wraps an established TLS stream (either side of the handshake) and
	/// starts the reader task. Returns the connection and the stream of
	/// completed inbound messages.
	pub fn new(stream: TlsStream<TcpStream>) -> (Arc<Connection>, mpsc::Receiver<Message>) {
		let fingerprint = {
			let (_, state) = stream.get_ref();
			match state.peer_certificates() {
				Some(certs) if certs.len() == 1 => Some(crypto::sha1_fingerprint(certs[0].as_ref())),
				_ => None,
			}
		};

		let (read_half, write_half) = tokio::io::split(stream);
		let reader = FramedRead::new(read_half, PacketCodec::new());
		let writer = Arc::new(tokio::sync::Mutex::new(WriterState {
			sink: FramedWrite::new(write_half, PacketCodec::new()),
			next_msg_no: 0,
		}));
		let (tx, rx) = mpsc::channel(INBOUND_DEPTH);
		let cancel = CancellationToken::new();

		let conn = Arc::new(Connection {
			fingerprint,
			writer: writer.clone(),
			cancel: cancel.clone(),
			closed: AtomicBool::new(false),
		});
		tokio::spawn(read_loop(reader, writer, tx, cancel));
		(conn, rx)
	}

	/// SHA-1 hex fingerprint of the peer's end-entity certificate, when the
	/// peer presented exactly one.
	pub fn fingerprint(&self) -> Option<&str> {
		self.fingerprint.as_deref()
	}

	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::SeqCst)
	}

	/// Sends one message. Msgno allocation and the packet writes happen in
	/// one critical section so two senders cannot interleave packets.
	pub async fn send(&self, msg: &Message) -> Result<(), ConnectionError> {
		if self.is_closed() {
			return Err(ConnectionError::Closed);
		}

		let mut writer = self.writer.lock().await;
		let msg_no = writer.next_msg_no;
		writer.next_msg_no += 1;
		trace!(msg_no, "sending message");

		for pkt in msg.to_packets(msg_no) {
			if let Err(e) = writer.sink.feed(pkt).await {
				self.fail();
				return Err(e.into());
			}
		}

		let mut attempts = 0;
		loop {
			match writer.sink.flush().await {
				Ok(()) => return Ok(()),
				Err(FrameError::Io(e)) => {
					if is_fatal_io(&e) {
						self.fail();
						return Err(ConnectionError::Transport(e));
					}
					if attempts >= RETRY_LIMIT {
						self.fail();
						return Err(ConnectionError::RetriesExhausted {
							attempts,
							source: e,
						});
					}
					attempts += 1;
					debug!(attempts, error = %e, "error writing packet (retrying)");
				},
				Err(e) => {
					self.fail();
					return Err(e.into());
				},
			}
		}
	}

	/// Marks the connection dead without touching the socket; the reader
	/// notices the cancellation and closes the inbound stream.
	fn fail(&self) {
		self.closed.store(true, Ordering::SeqCst);
		self.cancel.cancel();
	}

	/// Idempotent. Shuts the TLS socket down; the reader exits and the
	/// inbound stream closes exactly once.
	pub async fn close(&self) {
		if self.closed.swap(true, Ordering::SeqCst) {
			return;
		}
		trace!("connection closing");
		self.cancel.cancel();
		let mut writer = self.writer.lock().await;
		let _ = writer.sink.get_mut().shutdown().await;
	}
}

/// Fatal kinds terminate a send immediately; everything else is treated as
/// transient and retried.
fn is_fatal_io(e: &io::Error) -> bool {
	matches!(
		e.kind(),
		io::ErrorKind::BrokenPipe
			| io::ErrorKind::ConnectionReset
			| io::ErrorKind::ConnectionAborted
			| io::ErrorKind::NotConnected
			| io::ErrorKind::UnexpectedEof
	)
}

async fn read_loop(
	mut reader: FramedRead<ReadHalf<TlsStream<TcpStream>>, PacketCodec>,
	writer: Arc<tokio::sync::Mutex<WriterState>>,
	tx: mpsc::Sender<Message>,
	cancel: CancellationToken,
) {
	let mut assemblies: HashMap<u64, Message> = HashMap::new();
	let mut next_msg_no: u64 = 0;

	loop {
		let pkt = tokio::select! {
			_ = cancel.cancelled() => break,
			frame = reader.next() => match frame {
				None => break,
				Some(Err(e)) => {
					debug!(error = %e, "packet read error");
					break;
				},
				Some(Ok(pkt)) => pkt,
			},
		};

		match route_packet(pkt, &mut assemblies, &mut next_msg_no, &writer, &tx).await {
			Ok(()) => {},
			Err(e) => {
				debug!(error = %e, "closing connection");
				break;
			},
		}
	}
	// Dropping tx closes the inbound stream; outstanding assemblies are
	// abandoned with it.
}

async fn route_packet(
	pkt: Packet,
	assemblies: &mut HashMap<u64, Message>,
	next_msg_no: &mut u64,
	writer: &tokio::sync::Mutex<WriterState>,
	tx: &mpsc::Sender<Message>,
) -> Result<(), ConnectionError> {
	match pkt.packet_type {
		PacketType::Header => {
			if pkt.msg_no != *next_msg_no {
				return Err(ConnectionError::OutOfSequence {
					expected: *next_msg_no,
					got: pkt.msg_no,
				});
			}
			if assemblies.contains_key(&pkt.msg_no) {
				return Err(ConnectionError::DuplicateHeader(pkt.msg_no));
			}
			let header = pkt.header.as_ref().ok_or(FrameError::MissingHeader)?;
			assemblies.insert(pkt.msg_no, Message::from_header(header));
			*next_msg_no += 1;
		},
		PacketType::Data => {
			let msg = assemblies
				.get_mut(&pkt.msg_no)
				.ok_or(ConnectionError::UnknownMsgNo(pkt.msg_no))?;
			msg.write(&pkt.body);
			let acked = msg.bytes_written();
			write_ack(writer, pkt.msg_no, acked).await;
		},
		PacketType::TxErr => {
			let mut msg = assemblies
				.remove(&pkt.msg_no)
				.ok_or(ConnectionError::UnknownMsgNo(pkt.msg_no))?;
			msg.error = if pkt.body.is_empty() {
				"There was an unknown error with the connection".to_string()
			} else {
				String::from_utf8_lossy(&pkt.body).into_owned()
			};
			msg.write(&pkt.body);
			write_ack(writer, pkt.msg_no, msg.bytes_written()).await;
			deliver(tx, msg).await?;
		},
		PacketType::Eof => {
			let msg = assemblies
				.remove(&pkt.msg_no)
				.ok_or(ConnectionError::UnknownMsgNo(pkt.msg_no))?;
			deliver(tx, msg).await?;
		},
		PacketType::Ack => {
			// Flow-control hook; nothing consumes the tally yet.
			trace!(msg_no = pkt.msg_no, bytes = pkt.body.len(), "ack received");
		},
	}
	Ok(())
}

async fn deliver(tx: &mpsc::Sender<Message>, msg: Message) -> Result<(), ConnectionError> {
	tx.send(msg).await.map_err(|_| ConnectionError::Closed)
}

async fn write_ack(writer: &tokio::sync::Mutex<WriterState>, msg_no: u64, byte_count: u64) {
	let mut writer = writer.lock().await;
	if let Err(e) = writer.sink.send(Packet::ack(msg_no, byte_count)).await {
		warn!(msg_no, error = %e, "could not write ack");
	}
}

pub(crate) mod insecure {
	//! Dial-side TLS configuration. The bus does not rely on web-PKI chain
	//! validation; announce-record signatures establish trust, so the
	//! client accepts any server certificate and records its fingerprint.

	use std::sync::Arc;

	use rustls::DigitallySignedStruct;
	use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
	use rustls::pki_types::{CertificateDer, ServerName, UnixTime};

	use super::*;

	static CLIENT_CONFIG: Lazy<Arc<ClientConfig>> = Lazy::new(|| {
		let config = ClientConfig::builder()
			.dangerous()
			.with_custom_certificate_verifier(Arc::new(NoVerifier))
			.with_no_client_auth();
		Arc::new(config)
	});

	pub(crate) fn client_config() -> Arc<ClientConfig> {
		CLIENT_CONFIG.clone()
	}

	#[derive(Debug)]
	pub(crate) struct NoVerifier;

	impl ServerCertVerifier for NoVerifier {
		fn verify_server_cert(
			&self,
			_end_entity: &CertificateDer<'_>,
			_intermediates: &[CertificateDer<'_>],
			_server_name: &ServerName<'_>,
			_ocsp_response: &[u8],
			_now: UnixTime,
		) -> Result<ServerCertVerified, rustls::Error> {
			Ok(ServerCertVerified::assertion())
		}

		fn verify_tls12_signature(
			&self,
			_message: &[u8],
			_cert: &CertificateDer<'_>,
			_dss: &DigitallySignedStruct,
		) -> Result<HandshakeSignatureValid, rustls::Error> {
			Ok(HandshakeSignatureValid::assertion())
		}

		fn verify_tls13_signature(
			&self,
			_message: &[u8],
			_cert: &CertificateDer<'_>,
			_dss: &DigitallySignedStruct,
		) -> Result<HandshakeSignatureValid, rustls::Error> {
			Ok(HandshakeSignatureValid::assertion())
		}

		fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
			rustls::crypto::ring::default_provider()
				.signature_verification_algorithms
				.supported_schemes()
		}
	}
}
