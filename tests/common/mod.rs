//! Shared helpers for the integration suites.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use scamp::Service;

pub fn fixture(name: &str) -> PathBuf {
	PathBuf::from(env!("CARGO_MANIFEST_DIR"))
		.join("tests/fixtures")
		.join(name)
}

pub fn fixture_bytes(name: &str) -> Vec<u8> {
	std::fs::read(fixture(name)).expect("fixture readable")
}

/// A service bound to an ephemeral localhost port. Register handlers,
/// then call [`start`]. Returns the service and the address test clients
/// should dial.
pub async fn bind_service(sector: &str, human_name: &str) -> (Arc<Service>, String) {
	let service = Service::new(
		sector,
		"127.0.0.1:0",
		human_name,
		fixture("service.key"),
		fixture("service.crt"),
	)
	.await
	.expect("service construction");
	let (_, port) = service.listener_addr();
	(service, format!("127.0.0.1:{port}"))
}

/// Starts the accept loop. Registration must be done by now.
pub fn start(service: &Arc<Service>) {
	tokio::spawn(service.clone().run());
}

/// Signs a ticket body with the ticket fixture key, yielding a full token
/// string the verifier fixture accepts.
pub fn sign_ticket(body: &str) -> String {
	let key =
		scamp::crypto::rsa_private_key_from_pem(&fixture_bytes("ticket_sign.key")).expect("ticket key");
	let sig = scamp::crypto::sign_sha256(body.as_bytes(), &key).expect("ticket signature");
	format!("{body},{sig}")
}

pub mod raw_tls {
	//! A bare TLS connection speaking the packet framing directly, for
	//! protocol-conformance tests that need to misbehave.

	use std::sync::Arc;

	use rustls::ClientConfig;
	use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
	use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
	use rustls::DigitallySignedStruct;
	use tokio::net::TcpStream;
	use tokio_rustls::TlsConnector;
	use tokio_util::codec::Framed;

	use scamp::wire::PacketCodec;

	#[derive(Debug)]
	struct NoVerifier;

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

	pub type RawFramed = Framed<tokio_rustls::client::TlsStream<TcpStream>, PacketCodec>;

	pub async fn connect(addr: &str) -> RawFramed {
		let config = ClientConfig::builder()
			.dangerous()
			.with_custom_certificate_verifier(Arc::new(NoVerifier))
			.with_no_client_auth();
		let tcp = TcpStream::connect(addr).await.expect("tcp connect");
		let connector = TlsConnector::from(Arc::new(config));
		let host = addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(addr);
		let server_name = ServerName::try_from(host.to_string()).expect("server name");
		let stream = connector.connect(server_name, tcp).await.expect("tls handshake");
		Framed::new(stream, PacketCodec::new())
	}
}
