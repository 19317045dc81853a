//! Ticket verification against the fixture keypair.

mod common;

use std::time::{SystemTime, UNIX_EPOCH};

use scamp::ticket::{TicketError, verify_ticket};

fn now_unix() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap()
		.as_secs() as i64
}

fn key_path() -> String {
	common::fixture("ticket_verify_public_key.pem")
		.to_string_lossy()
		.into_owned()
}

#[test]
fn valid_ticket_parses_fields() {
	let issued = now_unix() - 10;
	let token = common::sign_ticket(&format!("1,604,1296,{issued},3600,20+61"));
	let ticket = verify_ticket(&token, &key_path()).unwrap();

	assert_eq!(ticket.version, 1);
	assert_eq!(ticket.user_id, 604);
	assert_eq!(ticket.client_id, 1296);
	assert_eq!(ticket.timestamp, issued);
	assert_eq!(ticket.ttl, 3600);
	assert!(ticket.privileges.contains(&20));
	assert!(ticket.privileges.contains(&61));
	assert_eq!(ticket.privileges.len(), 2);
}

#[test]
fn expiry_is_checked_against_now() {
	// One second past expiry.
	let token = common::sign_ticket(&format!("1,604,1296,{},9,20", now_unix() - 10));
	let err = verify_ticket(&token, &key_path()).unwrap_err();
	assert!(matches!(err, TicketError::Expired));

	// One second of validity left.
	let token = common::sign_ticket(&format!("1,604,1296,{},11,20", now_unix() - 10));
	assert!(verify_ticket(&token, &key_path()).is_ok());
}

#[test]
fn missing_privilege_names_the_bit() {
	let token = common::sign_ticket(&format!("1,604,1296,{},3600,20+61", now_unix()));
	let ticket = verify_ticket(&token, &key_path()).unwrap();

	let err = ticket.check_privs(&[20, 33]).unwrap_err();
	match err {
		TicketError::MissingPrivileges(bits) => assert_eq!(bits, vec![33]),
		other => panic!("expected missing privileges, got {other:?}"),
	}
	assert!(err_string_contains_bit(&ticket));
}

fn err_string_contains_bit(ticket: &scamp::Ticket) -> bool {
	ticket
		.check_privs(&[33])
		.unwrap_err()
		.to_string()
		.contains("33")
}

#[test]
fn tampered_token_is_rejected() {
	let token = common::sign_ticket(&format!("1,604,1296,{},3600,20", now_unix()));
	// Bump the user id after signing.
	let tampered = token.replacen("604", "605", 1);
	let err = verify_ticket(&tampered, &key_path()).unwrap_err();
	assert!(matches!(err, TicketError::BadSignature(_)));
}

#[test]
fn wrong_version_is_rejected() {
	let token = common::sign_ticket(&format!("2,604,1296,{},3600,20", now_unix()));
	let err = verify_ticket(&token, &key_path()).unwrap_err();
	assert!(matches!(err, TicketError::InvalidVersion));
}

#[test]
fn garbage_numeric_fields_are_rejected() {
	let token = common::sign_ticket(&format!("1,notanumber,1296,{},3600,20", now_unix()));
	let err = verify_ticket(&token, &key_path()).unwrap_err();
	assert!(matches!(err, TicketError::BadField { field: "user id", .. }));
}
