//! An assembled protocol message: header fields plus a body accumulated as
//! DATA-sized chunks.

use bytes::{Bytes, BytesMut};
use serde::Serialize;

use crate::wire::header::{ClientId, Envelope, MessageType, PacketHeader};
use crate::wire::Packet;

/// Maximum DATA packet payload. Larger bodies are split.
pub const MSG_CHUNK_SIZE: usize = 256 * 1024;

#[derive(Debug, Clone)]
pub struct Message {
	pub action: String,
	pub envelope: Envelope,
	pub version: i64,
	pub message_type: MessageType,
	pub request_id: u64,
	pub client_id: ClientId,
	pub ticket: String,
	pub identifying_token: String,
	pub error: String,
	pub error_code: String,
	chunks: Vec<Bytes>,
	bytes_written: u64,
	tx_error: Option<String>,
}

impl Message {
	fn new(message_type: MessageType) -> Self {
		Message {
			action: String::new(),
			envelope: Envelope::Json,
			version: 1,
			message_type,
			request_id: 0,
			client_id: ClientId::default(),
			ticket: String::new(),
			identifying_token: String::new(),
			error: String::new(),
			error_code: String::new(),
			chunks: Vec::new(),
			bytes_written: 0,
			tx_error: None,
		}
	}

	pub fn request() -> Self {
		Message::new(MessageType::Request)
	}

	pub fn reply() -> Self {
		Message::new(MessageType::Reply)
	}

	/// A reply pre-stamped for the given request: same request id and
	/// envelope, type flipped to reply.
	pub fn reply_to(request: &Message) -> Self {
		let mut msg = Message::reply();
		msg.request_id = request.request_id;
		msg.envelope = request.envelope;
		msg.version = request.version;
		msg
	}

	pub(crate) fn from_header(header: &PacketHeader) -> Self {
		Message {
			action: header.action.clone(),
			envelope: header.envelope,
			version: header.version,
			message_type: header.message_type,
			request_id: header.request_id,
			client_id: header.client_id,
			ticket: header.ticket.clone(),
			identifying_token: header.identifying_token.clone(),
			error: header.error.clone(),
			error_code: header.error_code.clone(),
			chunks: Vec::new(),
			bytes_written: 0,
			tx_error: None,
		}
	}

	pub(crate) fn header(&self) -> PacketHeader {
		PacketHeader {
			action: self.action.clone(),
			envelope: self.envelope,
			error: self.error.clone(),
			error_code: self.error_code.clone(),
			request_id: self.request_id,
			client_id: self.client_id,
			ticket: self.ticket.clone(),
			identifying_token: self.identifying_token.clone(),
			message_type: self.message_type,
			version: self.version,
		}
	}

	/// Appends body bytes, splitting into DATA-sized chunks.
	pub fn write(&mut self, blob: &[u8]) {
		self.bytes_written += blob.len() as u64;
		for chunk in blob.chunks(MSG_CHUNK_SIZE) {
			self.chunks.push(Bytes::copy_from_slice(chunk));
		}
	}

	/// Encodes `data` as JSON and appends it to the body.
	pub fn write_json<T: Serialize>(&mut self, data: &T) -> Result<(), serde_json::Error> {
		let encoded = serde_json::to_vec(data)?;
		self.write(&encoded);
		Ok(())
	}

	/// Marks the message to terminate with TXERR instead of EOF when sent.
	pub fn set_wire_error(&mut self, error: impl Into<String>) {
		self.tx_error = Some(error.into());
	}

	pub fn bytes_written(&self) -> u64 {
		self.bytes_written
	}

	/// The whole body, concatenated.
	pub fn body(&self) -> Bytes {
		match self.chunks.len() {
			0 => Bytes::new(),
			1 => self.chunks[0].clone(),
			_ => {
				let mut buf = BytesMut::with_capacity(self.bytes_written as usize);
				for chunk in &self.chunks {
					buf.extend_from_slice(chunk);
				}
				buf.freeze()
			},
		}
	}

	pub fn body_json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
		serde_json::from_slice(&self.body())
	}

	/// The full wire emission for this message under the given msgno:
	/// exactly one HEADER, the body DATA packets in order, then one EOF (or
	/// one TXERR on the error path).
	pub(crate) fn to_packets(&self, msg_no: u64) -> Vec<Packet> {
		let mut packets = Vec::with_capacity(self.chunks.len() + 2);
		packets.push(Packet::header(msg_no, self.header()));
		for chunk in &self.chunks {
			packets.push(Packet::data(msg_no, chunk.clone()));
		}
		match &self.tx_error {
			Some(error) => packets.push(Packet::txerr(msg_no, Bytes::from(error.clone()))),
			None => packets.push(Packet::eof(msg_no)),
		}
		packets
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::wire::PacketType;

	fn data_sizes(msg: &Message) -> Vec<usize> {
		msg
			.to_packets(0)
			.iter()
			.filter(|p| p.packet_type == PacketType::Data)
			.map(|p| p.body.len())
			.collect()
	}

	#[test]
	fn empty_body_is_header_then_eof() {
		let msg = Message::request();
		let packets = msg.to_packets(4);
		assert_eq!(packets.len(), 2);
		assert_eq!(packets[0].packet_type, PacketType::Header);
		assert_eq!(packets[1].packet_type, PacketType::Eof);
		assert!(packets.iter().all(|p| p.msg_no == 4));
	}

	#[test]
	fn single_byte_body_is_one_data_packet() {
		let mut msg = Message::request();
		msg.write(b"x");
		assert_eq!(data_sizes(&msg), vec![1]);
	}

	#[test]
	fn chunk_boundary_stays_one_packet() {
		let mut msg = Message::request();
		msg.write(&vec![0u8; MSG_CHUNK_SIZE]);
		assert_eq!(data_sizes(&msg), vec![MSG_CHUNK_SIZE]);
	}

	#[test]
	fn large_body_chunks_at_256k() {
		let mut msg = Message::request();
		msg.write(&vec![7u8; 600 * 1024]);
		assert_eq!(
			data_sizes(&msg),
			vec![MSG_CHUNK_SIZE, MSG_CHUNK_SIZE, 88 * 1024]
		);
		let packets = msg.to_packets(0);
		assert_eq!(packets.last().unwrap().packet_type, PacketType::Eof);
		assert_eq!(msg.body().len(), 600 * 1024);
	}

	#[test]
	fn wire_error_replaces_eof() {
		let mut msg = Message::reply();
		msg.set_wire_error("boom");
		let packets = msg.to_packets(1);
		let last = packets.last().unwrap();
		assert_eq!(last.packet_type, PacketType::TxErr);
		assert_eq!(&last.body[..], b"boom");
	}

	#[test]
	fn reply_to_copies_request_id_and_envelope() {
		let mut req = Message::request();
		req.request_id = 17;
		req.envelope = Envelope::JsonStore;
		let reply = Message::reply_to(&req);
		assert_eq!(reply.message_type, MessageType::Reply);
		assert_eq!(reply.request_id, 17);
		assert_eq!(reply.envelope, Envelope::JsonStore);
	}
}
