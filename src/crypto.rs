//! RSA signing/verification and certificate fingerprinting shared by the
//! announce, cache, and ticket paths.
//!
//! Signatures are SHA-256 PKCS#1 v1.5, encoded base64url without padding.
//! Fingerprints are lowercase hex SHA-1 over the certificate DER.

use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ring::digest;
use ring::rand::SystemRandom;
use ring::signature::{self, RsaKeyPair};
use rustls::pki_types::PrivateKeyDer;
use x509_parser::prelude::FromDer;

#[derive(thiserror::Error, Debug)]
pub enum CryptoError {
	#[error("could not find a valid PEM block")]
	Pem,
	#[error("failed to parse certificate: {0}")]
	Cert(String),
	#[error("expected an RSA key")]
	KeyType,
	#[error("decode signature: {0}")]
	SignatureEncoding(#[from] base64::DecodeError),
	#[error("signature verification failed")]
	Verify,
	#[error("signing failed")]
	Sign,
	#[error(transparent)]
	Io(#[from] std::io::Error),
}

/// Lowercase hex SHA-1 of a DER-encoded certificate.
pub fn sha1_fingerprint(der: &[u8]) -> String {
	let digest = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, der);
	hex::encode(digest.as_ref())
}

/// Fingerprint of the first certificate in a PEM blob.
pub fn cert_fingerprint_from_pem(pem: &[u8]) -> Result<String, CryptoError> {
	let (_, doc) = x509_parser::pem::parse_x509_pem(pem).map_err(|e| CryptoError::Cert(e.to_string()))?;
	Ok(sha1_fingerprint(&doc.contents))
}

/// Extracts the RSA public key (PKCS#1 DER) from a PEM certificate.
pub fn rsa_public_key_from_cert_pem(pem: &[u8]) -> Result<Vec<u8>, CryptoError> {
	let (_, doc) = x509_parser::pem::parse_x509_pem(pem).map_err(|e| CryptoError::Cert(e.to_string()))?;
	let cert = doc
		.parse_x509()
		.map_err(|e| CryptoError::Cert(e.to_string()))?;
	let spki = cert.public_key();
	match spki.parsed() {
		Ok(x509_parser::public_key::PublicKey::RSA(_)) => {},
		_ => return Err(CryptoError::KeyType),
	}
	Ok(spki.subject_public_key.data.to_vec())
}

/// Extracts the RSA public key (PKCS#1 DER) from a standalone
/// `PUBLIC KEY` (SubjectPublicKeyInfo) PEM blob.
pub fn rsa_public_key_from_spki_pem(pem: &[u8]) -> Result<Vec<u8>, CryptoError> {
	let (_, doc) = x509_parser::pem::parse_x509_pem(pem).map_err(|_| CryptoError::Pem)?;
	let (_, spki) = x509_parser::x509::SubjectPublicKeyInfo::from_der(&doc.contents)
		.map_err(|e| CryptoError::Cert(e.to_string()))?;
	Ok(spki.subject_public_key.data.to_vec())
}

/// Verifies a base64url-unpadded SHA-256 RSA signature over `message`.
/// Embedded whitespace in the signature (76-column wrapping) is ignored.
pub fn verify_sha256(
	message: &[u8],
	signature_b64: &[u8],
	rsa_public_key_der: &[u8],
) -> Result<(), CryptoError> {
	let compact: Vec<u8> = signature_b64
		.iter()
		.copied()
		.filter(|b| !b.is_ascii_whitespace())
		.collect();
	let signature = URL_SAFE_NO_PAD.decode(&compact)?;
	let key = signature::UnparsedPublicKey::new(
		&signature::RSA_PKCS1_2048_8192_SHA256,
		rsa_public_key_der,
	);
	key.verify(message, &signature).map_err(|_| CryptoError::Verify)
}

/// Signs `message` with SHA-256 PKCS#1 v1.5, returning the
/// base64url-unpadded signature.
pub fn sign_sha256(message: &[u8], key: &RsaKeyPair) -> Result<String, CryptoError> {
	let mut signature = vec![0u8; key.public().modulus_len()];
	key
		.sign(
			&signature::RSA_PKCS1_SHA256,
			&SystemRandom::new(),
			message,
			&mut signature,
		)
		.map_err(|_| CryptoError::Sign)?;
	Ok(URL_SAFE_NO_PAD.encode(&signature))
}

pub fn rsa_private_key_from_pem(pem: &[u8]) -> Result<RsaKeyPair, CryptoError> {
	let key = rustls_pemfile::private_key(&mut &pem[..])?.ok_or(CryptoError::Pem)?;
	match &key {
		PrivateKeyDer::Pkcs8(der) => {
			RsaKeyPair::from_pkcs8(der.secret_pkcs8_der()).map_err(|_| CryptoError::KeyType)
		},
		PrivateKeyDer::Pkcs1(der) => {
			RsaKeyPair::from_der(der.secret_pkcs1_der()).map_err(|_| CryptoError::KeyType)
		},
		_ => Err(CryptoError::KeyType),
	}
}

pub fn load_rsa_private_key(path: &Path) -> Result<RsaKeyPair, CryptoError> {
	let pem = std::fs::read(path)?;
	rsa_private_key_from_pem(&pem)
}

/// Splits a signature string into rows of at most `width` characters, the
/// shape the discovery-file format expects.
pub fn wrap_rows(input: &str, width: usize) -> Vec<&str> {
	let mut rows = Vec::with_capacity(input.len().div_ceil(width.max(1)));
	let mut rest = input;
	loop {
		if rest.len() <= width {
			rows.push(rest);
			return rows;
		}
		let (row, tail) = rest.split_at(width);
		rows.push(row);
		rest = tail;
	}
}
