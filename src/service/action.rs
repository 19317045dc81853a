//! Action handlers and the wrappers that gate them.
//!
//! A handler is the capability `call(message, client)`. The ticket-verify
//! and privilege-check guards implement the same capability by delegating,
//! so they compose as values.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};

use crate::client::Client;
use crate::message::Message;
use crate::ticket;

/// One registered RPC endpoint.
#[async_trait]
pub trait ActionHandler: Send + Sync + 'static {
	async fn call(&self, msg: Message, client: Arc<Client>);
}

/// Adapter for plain async closures.
pub struct ActionFn<F>(pub F);

#[async_trait]
impl<F, Fut> ActionHandler for ActionFn<F>
where
	F: Fn(Message, Arc<Client>) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = ()> + Send + 'static,
{
	async fn call(&self, msg: Message, client: Arc<Client>) {
		(self.0)(msg, client).await
	}
}

/// Per-action options controlling ticket verification.
#[derive(Debug, Clone, Default)]
pub struct ActionOptions {
	/// Require a valid ticket even when no privileges are declared.
	/// Defaults to off; any action that declares privileges is verified
	/// regardless.
	pub verify: bool,
	pub privs: Vec<u32>,
	/// Location of the ticket verify public key. Empty means the
	/// system-wide default path.
	pub ticket_verify_public_key: String,
}

impl ActionOptions {
	pub(crate) fn requires_verification(&self) -> bool {
		self.verify || !self.privs.is_empty()
	}
}

/// Wraps a handler with ticket verification and, when privileges are
/// declared, a privilege check.
pub struct VerifiedAction {
	inner: Arc<dyn ActionHandler>,
	options: ActionOptions,
}

impl VerifiedAction {
	pub fn new(inner: Arc<dyn ActionHandler>, options: ActionOptions) -> VerifiedAction {
		VerifiedAction { inner, options }
	}
}

#[async_trait]
impl ActionHandler for VerifiedAction {
	async fn call(&self, msg: Message, client: Arc<Client>) {
		if self.options.requires_verification() {
			let ticket =
				match ticket::verify_ticket(&msg.ticket, &self.options.ticket_verify_public_key) {
					Ok(ticket) => ticket,
					Err(e) => {
						reply_on_error(&msg, &client, "verification", &e.to_string()).await;
						return;
					},
				};
			if let Err(e) = ticket.check_privs(&self.options.privs) {
				reply_on_error(&msg, &client, "verification", &e.to_string()).await;
				return;
			}
		}
		self.inner.call(msg, client).await
	}
}

/// Sends an error reply carrying the request's id and the given error
/// code.
pub async fn reply_on_error(msg: &Message, client: &Arc<Client>, error_code: &str, error: &str) {
	if error.is_empty() {
		info!("did not reply to client, missing error");
		return;
	}

	let mut reply = Message::reply_to(msg);
	reply.error_code = error_code.to_string();
	reply.error = error.to_string();

	if let Err(e) = client.send(&mut reply).await {
		error!(
			request_id = msg.request_id,
			action = %msg.action,
			error = %e,
			"send error",
		);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn declared_privs_force_verification() {
		let options = ActionOptions {
			verify: false,
			privs: vec![7],
			ticket_verify_public_key: String::new(),
		};
		assert!(options.requires_verification());
	}

	#[test]
	fn default_options_skip_verification() {
		assert!(!ActionOptions::default().requires_verification());
	}
}
