//! Periodic multicast announcement of locally hosted services.
//!
//! Every tracked service's signed announce blob is written to the
//! configured UDPv4 group. A socket error stops the loop; the caller can
//! observe that through [`DiscoveryAnnouncer::has_stopped`] and restart.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::config::Config;
use crate::service::Service;

/// Seconds between announce rounds.
pub const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(5);

#[derive(thiserror::Error, Debug)]
pub enum AnnounceError {
	#[error("could not set up announce socket: {0}")]
	Socket(#[from] std::io::Error),
}

pub struct DiscoveryAnnouncer {
	services: Mutex<Vec<Arc<Service>>>,
	socket: UdpSocket,
	dest: SocketAddr,
	cancel: CancellationToken,
	started: AtomicBool,
	stopped: AtomicBool,
}

impl DiscoveryAnnouncer {
	pub fn new(config: &Config) -> Result<DiscoveryAnnouncer, AnnounceError> {
		let group = config.discovery_multicast_ip();
		let port = config.discovery_multicast_port();
		let dest = SocketAddr::new(IpAddr::V4(group), port);

		// The OS picks the source port; binding to the group address
		// itself is the local-multicast test mode.
		let bind_addr: SocketAddrV4 = if config.local_discovery_multicast() {
			SocketAddrV4::new(group, port)
		} else {
			SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)
		};

		let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
		socket.set_reuse_address(true)?;
		socket.bind(&bind_addr.into())?;
		socket.set_multicast_ttl_v4(1)?;
		socket.set_nonblocking(true)?;
		let socket = UdpSocket::from_std(socket.into())?;

		Ok(DiscoveryAnnouncer {
			services: Mutex::new(Vec::new()),
			socket,
			dest,
			cancel: CancellationToken::new(),
			started: AtomicBool::new(false),
			stopped: AtomicBool::new(false),
		})
	}

	/// Adds a service to the announce set.
	pub fn track(&self, service: Arc<Service>) {
		self
			.services
			.lock()
			.expect("announcer services lock poisoned")
			.push(service);
	}

	/// Spawns the announce loop. Only the first call starts anything.
	pub fn start(self: &Arc<Self>) {
		if self.started.swap(true, Ordering::SeqCst) {
			return;
		}
		let announcer = self.clone();
		tokio::spawn(async move { announcer.announce_loop().await });
	}

	/// Signals the loop to exit. Idempotent.
	pub fn stop(&self) {
		self.cancel.cancel();
	}

	/// True once the loop has exited, whether by [`DiscoveryAnnouncer::stop`]
	/// or a socket error. The caller owns any restart policy.
	pub fn has_stopped(&self) -> bool {
		self.stopped.load(Ordering::SeqCst)
	}

	async fn announce_loop(&self) {
		debug!(dest = %self.dest, "starting announce loop");
		let mut tick = tokio::time::interval(ANNOUNCE_INTERVAL);
		loop {
			tokio::select! {
				_ = self.cancel.cancelled() => break,
				_ = tick.tick() => {
					if let Err(e) = self.do_announce().await {
						error!(error = %e, "announce failed; stopping announce loop");
						break;
					}
				},
			}
		}
		self.stopped.store(true, Ordering::SeqCst);
	}

	async fn do_announce(&self) -> Result<(), std::io::Error> {
		let services: Vec<Arc<Service>> = {
			let services = self
				.services
				.lock()
				.expect("announcer services lock poisoned");
			services.clone()
		};
		for service in services {
			let blob = match service.marshal_text() {
				Ok(blob) => blob,
				Err(e) => {
					// A service that cannot marshal is skipped, not fatal.
					error!(name = %service.name(), error = %e, "failed to marshal service announce");
					continue;
				},
			};
			self.socket.send_to(&blob, self.dest).await?;
			trace!(name = %service.name(), bytes = blob.len(), "announced service");
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn announcer_constructs_with_defaults() {
		let config = Config::new();
		let announcer = DiscoveryAnnouncer::new(&config).unwrap();
		assert!(!announcer.has_stopped());
		assert_eq!(
			announcer.dest,
			SocketAddr::new(IpAddr::V4(Ipv4Addr::new(239, 63, 248, 106)), 5555)
		);
	}

	#[tokio::test]
	async fn stop_is_idempotent_and_observable() {
		let config = Config::new();
		let announcer = Arc::new(DiscoveryAnnouncer::new(&config).unwrap());
		announcer.start();
		announcer.start();
		announcer.stop();
		announcer.stop();
		tokio::time::sleep(Duration::from_millis(50)).await;
		assert!(announcer.has_stopped());
	}
}
