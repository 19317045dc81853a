//! The JSON header carried by every HEADER packet.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

/// Payload encoding tag. The wire only knows these two; anything else is
/// rejected at header parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Envelope {
	#[default]
	Json,
	JsonStore,
}

impl Envelope {
	pub fn as_str(&self) -> &'static str {
		match self {
			Envelope::Json => "json",
			Envelope::JsonStore => "jsonstore",
		}
	}
}

impl fmt::Display for Envelope {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(thiserror::Error, Debug)]
#[error("unsupported envelope `{0}`")]
pub struct UnsupportedEnvelope(pub String);

impl FromStr for Envelope {
	type Err = UnsupportedEnvelope;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"json" => Ok(Envelope::Json),
			"jsonstore" => Ok(Envelope::JsonStore),
			other => Err(UnsupportedEnvelope(other.to_string())),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
	Request,
	Reply,
}

/// Client identifiers arrive as either a JSON integer or a JSON string
/// holding digits. Always emitted as an integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(transparent)]
pub struct ClientId(pub u64);

impl<'de> Deserialize<'de> for ClientId {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		#[derive(Deserialize)]
		#[serde(untagged)]
		enum Raw {
			Int(u64),
			Str(String),
		}

		match Raw::deserialize(deserializer)? {
			Raw::Int(v) => Ok(ClientId(v)),
			Raw::Str(s) => s
				.parse()
				.map(ClientId)
				.map_err(|_| serde::de::Error::custom(format!("could not parse `{s}` as int value"))),
		}
	}
}

/// Serialized to JSON and carried as the body of each HEADER packet.
/// Unknown keys are ignored on parse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketHeader {
	#[serde(default)]
	pub action: String,
	#[serde(default)]
	pub envelope: Envelope,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub error: String,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub error_code: String,
	#[serde(default)]
	pub request_id: u64,
	#[serde(default)]
	pub client_id: ClientId,
	#[serde(default)]
	pub ticket: String,
	#[serde(default)]
	pub identifying_token: String,
	#[serde(rename = "type")]
	pub message_type: MessageType,
	#[serde(default)]
	pub version: i64,
}
