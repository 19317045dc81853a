//! SCAMP bus runtime: framed RPC over persistent, mutually-trusted TLS
//! connections between services that discover one another through a
//! shared, signed discovery cache refreshed by multicast announces.

pub mod announce;
pub mod bus;
pub mod cache;
pub mod client;
pub mod config;
pub mod conn;
pub mod crypto;
pub mod message;
pub mod service;
pub mod ticket;
pub mod wire;

pub use announce::{AnnounceError, DiscoveryAnnouncer};
pub use bus::{Bus, BusError, RequestError, init_logging};
pub use cache::refresher::{CacheRefresher, RefresherOptions};
pub use cache::proxy::ServiceProxy;
pub use cache::{CacheError, ServiceCache};
pub use client::{Client, ClientError};
pub use config::{Config, ConfigError};
pub use conn::{Connection, ConnectionError};
pub use message::{MSG_CHUNK_SIZE, Message};
pub use service::action::{ActionFn, ActionHandler, ActionOptions};
pub use service::{Service, ServiceError, ServiceStats};
pub use ticket::{Ticket, TicketError, verify_ticket};
pub use wire::header::{ClientId, Envelope, MessageType, PacketHeader};
