//! Verification of signed, time-limited authorization tickets.
//!
//! A ticket is comma-separated ASCII (`version,userID,clientID,timestamp,
//! ttl,privBits,sig`) with a trailing base64url-unpadded RSA signature
//! over everything before it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;

use crate::crypto::{self, CryptoError};

pub const DEFAULT_TICKET_KEY_PATH: &str = "/etc/GT/auth/ticket_verify_public_key.pem";

/// Verify keys are loaded once per path and cached for the process
/// lifetime.
static VERIFY_KEYS: Lazy<Mutex<HashMap<String, Arc<Vec<u8>>>>> =
	Lazy::new(|| Mutex::new(HashMap::new()));

#[derive(thiserror::Error, Debug)]
pub enum TicketError {
	#[error("ticket missing parts, wanted 6 parts, have {0}")]
	MissingParts(usize),
	#[error("`{path}` verify key not readable: {source}")]
	KeyUnreadable { path: String, source: CryptoError },
	#[error("unable to verify ticket: {0}")]
	BadSignature(CryptoError),
	#[error("invalid version")]
	InvalidVersion,
	#[error("parse {field} (`{value}`)")]
	BadField {
		field: &'static str,
		value: String,
	},
	#[error("ticket expired")]
	Expired,
	#[error("missing privileges: {0:?}")]
	MissingPrivileges(Vec<u32>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
	pub version: u32,
	pub user_id: u64,
	pub client_id: u64,
	pub timestamp: i64,
	pub ttl: i64,
	pub privileges: HashSet<u32>,
}

impl Ticket {
	/// A ticket is valid while `timestamp + ttl` has not passed.
	pub fn expired(&self) -> bool {
		self.timestamp + self.ttl < now_unix()
	}

	/// Returns the set difference between `privs` and the ticket's
	/// privilege bits; any missing bit is an error naming all of them.
	pub fn check_privs(&self, privs: &[u32]) -> Result<(), TicketError> {
		let missing: Vec<u32> = privs
			.iter()
			.copied()
			.filter(|p| !self.privileges.contains(p))
			.collect();
		if missing.is_empty() {
			Ok(())
		} else {
			Err(TicketError::MissingPrivileges(missing))
		}
	}
}

fn now_unix() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_secs() as i64)
		.unwrap_or(0)
}

fn verify_key(path: &str) -> Result<Arc<Vec<u8>>, TicketError> {
	let mut keys = VERIFY_KEYS.lock().expect("verify key cache poisoned");
	if let Some(key) = keys.get(path) {
		return Ok(key.clone());
	}
	let load = || -> Result<Vec<u8>, CryptoError> {
		let pem = std::fs::read(path)?;
		crypto::rsa_public_key_from_spki_pem(&pem)
	};
	let key = Arc::new(load().map_err(|source| TicketError::KeyUnreadable {
		path: path.to_string(),
		source,
	})?);
	keys.insert(path.to_string(), key.clone());
	Ok(key)
}

fn parse_field<T: std::str::FromStr>(field: &'static str, value: &str) -> Result<T, TicketError> {
	value.parse().map_err(|_| TicketError::BadField {
		field,
		value: value.to_string(),
	})
}

/// Parses and verifies a ticket token. An empty `key_path` falls back to
/// [`DEFAULT_TICKET_KEY_PATH`].
pub fn verify_ticket(token: &str, key_path: &str) -> Result<Ticket, TicketError> {
	let key_path = if key_path.is_empty() {
		DEFAULT_TICKET_KEY_PATH
	} else {
		key_path
	};

	let mut parts: Vec<&str> = token.trim().split(',').collect();
	if parts.len() < 6 {
		return Err(TicketError::MissingParts(parts.len()));
	}
	let sig = parts.pop().expect("at least six parts");
	let message = parts.join(",");

	let key = verify_key(key_path)?;
	crypto::verify_sha256(message.as_bytes(), sig.as_bytes(), &key)
		.map_err(TicketError::BadSignature)?;

	if parts[0] != "1" {
		return Err(TicketError::InvalidVersion);
	}

	let mut ticket = Ticket {
		version: 1,
		user_id: parse_field("user id", parts[1])?,
		client_id: parse_field("client id", parts[2])?,
		timestamp: parse_field("timestamp", parts[3])?,
		ttl: parse_field("ttl", parts[4])?,
		privileges: HashSet::new(),
	};

	if parts.len() > 5 && !parts[5].is_empty() {
		for priv_bit in parts[5].split('+') {
			ticket.privileges.insert(parse_field("priv", priv_bit)?);
		}
	}

	if ticket.expired() {
		return Err(TicketError::Expired);
	}

	Ok(ticket)
}
