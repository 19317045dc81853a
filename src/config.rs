//! Line-oriented `key = value` configuration.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/SCAMP/soa.conf";

const DEFAULT_GROUP_IP: Ipv4Addr = Ipv4Addr::new(239, 63, 248, 106);
const DEFAULT_GROUP_PORT: u16 = 5555;
const DEFAULT_KEYSTORE_DIR: &str = "/etc/GT_private/services";

static CONFIG_LINE: Lazy<Regex> =
	Lazy::new(|| Regex::new(r"^\s*([^\s=]+)\s*=\s*(\S+)").expect("config line regex"));

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
	#[error("couldn't read config from `{path}`: {source}")]
	Read {
		path: PathBuf,
		source: std::io::Error,
	},
	#[error("no such config param `{0}`")]
	MissingKey(&'static str),
}

#[derive(Debug, Clone, Default)]
pub struct Config {
	values: HashMap<String, String>,
}

impl Config {
	pub fn new() -> Config {
		Config::default()
	}

	/// Loads `key = value` pairs from the file at `path`. Lines that do not
	/// match the grammar are ignored.
	pub fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
		let path = path.as_ref();
		let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
			path: path.to_path_buf(),
			source,
		})?;
		let mut config = Config::new();
		config.parse(&text);
		Ok(config)
	}

	fn parse(&mut self, text: &str) {
		for line in text.lines() {
			if let Some(captures) = CONFIG_LINE.captures(line) {
				self
					.values
					.insert(captures[1].to_string(), captures[2].to_string());
			}
		}
	}

	pub fn get(&self, key: &str) -> Option<&str> {
		self.values.get(key).map(String::as_str)
	}

	pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
		self.values.insert(key.into(), value.into());
	}

	/// `discovery.cache_path`, mandatory for any participant that looks
	/// up peers.
	pub fn cache_path(&self) -> Result<&str, ConfigError> {
		self
			.get("discovery.cache_path")
			.ok_or(ConfigError::MissingKey("discovery.cache_path"))
	}

	/// `discovery.multicast_address`, falling back to the default group.
	pub fn discovery_multicast_ip(&self) -> Ipv4Addr {
		match self.get("discovery.multicast_address") {
			None => DEFAULT_GROUP_IP,
			Some(raw) => raw.parse().unwrap_or_else(|_| {
				warn!(raw, "could not parse discovery.multicast_address; falling back to default");
				DEFAULT_GROUP_IP
			}),
		}
	}

	/// `discovery.port`, falling back to the default group port.
	pub fn discovery_multicast_port(&self) -> u16 {
		match self.get("discovery.port") {
			None => DEFAULT_GROUP_PORT,
			Some(raw) => raw.parse().unwrap_or_else(|_| {
				warn!(raw, "could not parse discovery.port; falling back to default");
				DEFAULT_GROUP_PORT
			}),
		}
	}

	/// `discovery.local_multicast`: presence binds the announce socket to
	/// the group address itself.
	pub fn local_discovery_multicast(&self) -> bool {
		self.values.contains_key("discovery.local_multicast")
	}

	/// Where the private key for `service_name` lives: the
	/// `<name>.soa_key` override, or the conventional keystore path.
	pub fn service_key_path(&self, service_name: &str) -> PathBuf {
		match self.get(&format!("{service_name}.soa_key")) {
			Some(path) => PathBuf::from(path),
			None => Path::new(DEFAULT_KEYSTORE_DIR).join(format!("{service_name}.key")),
		}
	}

	/// Like [`Config::service_key_path`], for the `<name>.soa_cert`
	/// certificate.
	pub fn service_cert_path(&self, service_name: &str) -> PathBuf {
		match self.get(&format!("{service_name}.soa_cert")) {
			Some(path) => PathBuf::from(path),
			None => Path::new(DEFAULT_KEYSTORE_DIR).join(format!("{service_name}.crt")),
		}
	}

	/// `log.level`, used to seed the tracing filter at initialization.
	pub fn log_level(&self) -> Option<&str> {
		self.get("log.level")
	}

	/// `service.running_service_file_dir_path`, consumed by external
	/// liveness tooling; recognized but unused here.
	pub fn running_service_file_dir(&self) -> Option<&str> {
		self.get("service.running_service_file_dir_path")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn config_from(text: &str) -> Config {
		let mut config = Config::new();
		config.parse(text);
		config
	}

	#[test]
	fn parses_key_value_lines() {
		let config = config_from(
			"discovery.cache_path = /backplane/discovery/discovery\n\
			 log.level=debug\n\
			 # a comment line\n\
			 not a config line\n\
			 \tdiscovery.port  =  5556\n",
		);
		assert_eq!(
			config.cache_path().unwrap(),
			"/backplane/discovery/discovery"
		);
		assert_eq!(config.log_level(), Some("debug"));
		assert_eq!(config.discovery_multicast_port(), 5556);
		assert_eq!(config.get("not"), None);
	}

	#[test]
	fn multicast_defaults() {
		let config = config_from("");
		assert_eq!(config.discovery_multicast_ip(), Ipv4Addr::new(239, 63, 248, 106));
		assert_eq!(config.discovery_multicast_port(), 5555);
		assert!(!config.local_discovery_multicast());
	}

	#[test]
	fn bad_multicast_values_fall_back() {
		let config = config_from(
			"discovery.multicast_address = not-an-ip\ndiscovery.port = many\n",
		);
		assert_eq!(config.discovery_multicast_ip(), Ipv4Addr::new(239, 63, 248, 106));
		assert_eq!(config.discovery_multicast_port(), 5555);
	}

	#[test]
	fn key_and_cert_paths() {
		let config = config_from("logger.soa_key = /srv/keys/logger.key\n");
		assert_eq!(
			config.service_key_path("logger"),
			PathBuf::from("/srv/keys/logger.key")
		);
		assert_eq!(
			config.service_cert_path("logger"),
			PathBuf::from("/etc/GT_private/services/logger.crt")
		);
	}

	#[test]
	fn missing_cache_path_is_an_error() {
		let config = config_from("log.level = info\n");
		assert!(matches!(
			config.cache_path(),
			Err(ConfigError::MissingKey("discovery.cache_path"))
		));
	}

	#[test]
	fn local_multicast_flag() {
		let config = config_from("discovery.local_multicast = true\n");
		assert!(config.local_discovery_multicast());
	}
}
