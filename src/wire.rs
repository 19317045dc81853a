//! Packet framing for the bus wire protocol.
//!
//! Each packet is a one-line ASCII preamble, a raw body, and a fixed
//! trailer:
//!
//! ```text
//! <TYPE> <msgNo> <bodyLen>\r\n
//! <bodyLen bytes of body>
//! END\r\n
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::wire::header::PacketHeader;

pub mod header;

const TRAILER: &[u8] = b"END\r\n";

#[derive(thiserror::Error, Debug)]
pub enum FrameError {
	#[error("packet preamble must have 3 parts")]
	MalformedPreamble,
	#[error("unknown packet type `{0}`")]
	UnknownType(String),
	#[error("packet was missing trailing bytes")]
	BadTrailer,
	#[error("HEADER packet without a header")]
	MissingHeader,
	#[error("invalid packet header: {0}")]
	Header(#[from] serde_json::Error),
	#[error(transparent)]
	Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
	Header,
	Data,
	Eof,
	TxErr,
	Ack,
}

impl PacketType {
	pub fn token(&self) -> &'static str {
		match self {
			PacketType::Header => "HEADER",
			PacketType::Data => "DATA",
			PacketType::Eof => "EOF",
			PacketType::TxErr => "TXERR",
			PacketType::Ack => "ACK",
		}
	}

	fn from_token(token: &str) -> Option<Self> {
		match token {
			"HEADER" => Some(PacketType::Header),
			"DATA" => Some(PacketType::Data),
			"EOF" => Some(PacketType::Eof),
			"TXERR" => Some(PacketType::TxErr),
			"ACK" => Some(PacketType::Ack),
			_ => None,
		}
	}
}

/// One wire packet. HEADER packets carry a parsed [`PacketHeader`] and an
/// empty body; every other type carries opaque body bytes.
#[derive(Debug, Clone)]
pub struct Packet {
	pub packet_type: PacketType,
	pub msg_no: u64,
	pub body: Bytes,
	pub header: Option<PacketHeader>,
}

impl Packet {
	pub fn header(msg_no: u64, header: PacketHeader) -> Self {
		Packet {
			packet_type: PacketType::Header,
			msg_no,
			body: Bytes::new(),
			header: Some(header),
		}
	}

	pub fn data(msg_no: u64, body: Bytes) -> Self {
		Packet {
			packet_type: PacketType::Data,
			msg_no,
			body,
			header: None,
		}
	}

	pub fn eof(msg_no: u64) -> Self {
		Packet {
			packet_type: PacketType::Eof,
			msg_no,
			body: Bytes::new(),
			header: None,
		}
	}

	pub fn txerr(msg_no: u64, body: Bytes) -> Self {
		Packet {
			packet_type: PacketType::TxErr,
			msg_no,
			body,
			header: None,
		}
	}

	pub fn ack(msg_no: u64, byte_count: u64) -> Self {
		Packet {
			packet_type: PacketType::Ack,
			msg_no,
			body: Bytes::from(byte_count.to_string()),
			header: None,
		}
	}
}

struct Preamble {
	packet_type: PacketType,
	msg_no: u64,
	body_len: usize,
}

/// Streaming codec for [`Packet`]s. Any malformed input is fatal to the
/// stream; the connection owning the codec tears down.
#[derive(Default)]
pub struct PacketCodec {
	pending: Option<Preamble>,
}

impl PacketCodec {
	pub fn new() -> Self {
		Self::default()
	}
}

fn parse_preamble(line: &[u8]) -> Result<Preamble, FrameError> {
	let line = std::str::from_utf8(line).map_err(|_| FrameError::MalformedPreamble)?;
	let mut fields = line.split_ascii_whitespace();
	let (Some(token), Some(msg_no), Some(body_len), None) = (
		fields.next(),
		fields.next(),
		fields.next(),
		fields.next(),
	) else {
		return Err(FrameError::MalformedPreamble);
	};
	let packet_type =
		PacketType::from_token(token).ok_or_else(|| FrameError::UnknownType(token.to_string()))?;
	let msg_no: u64 = msg_no.parse().map_err(|_| FrameError::MalformedPreamble)?;
	let body_len: usize = body_len.parse().map_err(|_| FrameError::MalformedPreamble)?;
	Ok(Preamble {
		packet_type,
		msg_no,
		body_len,
	})
}

impl Decoder for PacketCodec {
	type Item = Packet;
	type Error = FrameError;

	fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, FrameError> {
		if self.pending.is_none() {
			let Some(nl) = src.iter().position(|b| *b == b'\n') else {
				return Ok(None);
			};
			let mut line = src.split_to(nl + 1);
			line.truncate(nl);
			if line.last() == Some(&b'\r') {
				line.truncate(line.len() - 1);
			}
			self.pending = Some(parse_preamble(&line)?);
		}

		let preamble = self.pending.as_ref().expect("preamble was just set");
		if src.len() < preamble.body_len + TRAILER.len() {
			src.reserve(preamble.body_len + TRAILER.len() - src.len());
			return Ok(None);
		}
		let preamble = self.pending.take().expect("preamble was just set");

		let mut body = src.split_to(preamble.body_len).freeze();
		let trailer = src.split_to(TRAILER.len());
		if &trailer[..] != TRAILER {
			return Err(FrameError::BadTrailer);
		}

		let mut header = None;
		if preamble.packet_type == PacketType::Header {
			header = Some(serde_json::from_slice(&body)?);
			body = Bytes::new();
		}

		Ok(Some(Packet {
			packet_type: preamble.packet_type,
			msg_no: preamble.msg_no,
			body,
			header,
		}))
	}
}

impl Encoder<Packet> for PacketCodec {
	type Error = FrameError;

	fn encode(&mut self, pkt: Packet, dst: &mut BytesMut) -> Result<(), FrameError> {
		let body = match pkt.packet_type {
			PacketType::Header => {
				let header = pkt.header.as_ref().ok_or(FrameError::MissingHeader)?;
				Bytes::from(serde_json::to_vec(header)?)
			},
			_ => pkt.body,
		};

		let preamble = format!("{} {} {}\r\n", pkt.packet_type.token(), pkt.msg_no, body.len());
		dst.reserve(preamble.len() + body.len() + TRAILER.len());
		dst.put_slice(preamble.as_bytes());
		dst.put_slice(&body);
		dst.put_slice(TRAILER);
		Ok(())
	}
}
