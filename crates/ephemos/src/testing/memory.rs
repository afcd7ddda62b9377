use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use ephemos_core::drain;
use ephemos_core::drain::{DrainMode, DrainTrigger, DrainWatcher};
use ephemos_core::strng::Strng;
use tracing::warn;

use crate::identity::Identity;
use crate::identity::policy::PeerRole;
use crate::transport::{
	ClientConnection, IdentityClient, IdentityMaterial, IdentityServer, ServiceRegistrar, TlsState,
	Transport, TransportError,
};

/// An in-process transport that performs the identity checks a real mTLS
/// handshake would, without any I/O: certificates must be unexpired and each
/// side's policy must accept the other's URI-SAN identity.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
	inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
	// Keyed by the serving workload's name; rotation replaces the entry.
	listeners: parking_lot::Mutex<HashMap<Strng, Arc<MemoryServer>>>,
}

#[async_trait]
impl Transport for MemoryTransport {
	async fn create_server(
		&self,
		material: IdentityMaterial,
	) -> Result<Arc<dyn IdentityServer>, TransportError> {
		let (trigger, watcher) = drain::new();
		let server = Arc::new(MemoryServer {
			material,
			started: AtomicBool::new(false),
			stopped: AtomicBool::new(false),
			healthy: AtomicBool::new(true),
			services: Default::default(),
			drain_trigger: parking_lot::Mutex::new(Some(trigger)),
			drain_watcher: parking_lot::Mutex::new(Some(watcher)),
		});
		let name = server.material.policy.local().name().clone();
		self.inner.listeners.lock().insert(name, server.clone());
		Ok(server)
	}

	async fn create_client(
		&self,
		material: IdentityMaterial,
	) -> Result<Arc<dyn IdentityClient>, TransportError> {
		Ok(Arc::new(MemoryClient {
			material,
			transport: self.clone(),
			closed: AtomicBool::new(false),
			healthy: AtomicBool::new(true),
		}))
	}
}

pub struct MemoryServer {
	material: IdentityMaterial,
	started: AtomicBool,
	stopped: AtomicBool,
	healthy: AtomicBool,
	services: parking_lot::Mutex<Vec<Arc<dyn ServiceRegistrar>>>,
	drain_trigger: parking_lot::Mutex<Option<DrainTrigger>>,
	drain_watcher: parking_lot::Mutex<Option<DrainWatcher>>,
}

impl MemoryServer {
	pub fn local_identity(&self) -> &Identity {
		self.material.policy.local().uri()
	}

	pub fn is_stopped(&self) -> bool {
		self.stopped.load(Ordering::Relaxed)
	}

	/// Force the next health check to fail.
	pub fn set_healthy(&self, healthy: bool) {
		self.healthy.store(healthy, Ordering::Relaxed);
	}

	pub fn service_names(&self) -> Vec<Strng> {
		self.services.lock().iter().map(|s| s.service_name()).collect()
	}

	fn check_available(&self) -> Result<(), TransportError> {
		if self.stopped.load(Ordering::Relaxed) {
			return Err(TransportError::Unavailable("server stopped".to_string()));
		}
		if self.material.cert.is_expired(SystemTime::now()) {
			return Err(TransportError::Unavailable(
				"server certificate expired".to_string(),
			));
		}
		Ok(())
	}
}

#[async_trait]
impl IdentityServer for MemoryServer {
	async fn start(&self, _listener: tokio::net::TcpListener) -> Result<(), TransportError> {
		self.check_available()?;
		self.started.store(true, Ordering::Relaxed);
		Ok(())
	}

	async fn stop(&self, grace: Duration) -> Result<(), TransportError> {
		if self.stopped.swap(true, Ordering::Relaxed) {
			return Ok(());
		}
		let trigger = self.drain_trigger.lock().take();
		// The server's own watcher must not hold the drain open.
		let _ = self.drain_watcher.lock().take();
		if let Some(trigger) = trigger {
			if tokio::time::timeout(grace, trigger.start_drain_and_wait(DrainMode::Graceful))
				.await
				.is_err()
			{
				warn!("server drain exceeded the grace period, abandoning connections");
			}
		}
		Ok(())
	}

	fn register_service(&self, registrar: Arc<dyn ServiceRegistrar>) {
		self.services.lock().push(registrar);
	}

	fn certificate(&self) -> Arc<crate::identity::WorkloadCertificate> {
		self.material.cert.clone()
	}

	async fn health_check(&self) -> Result<(), TransportError> {
		self.check_available()?;
		if !self.healthy.load(Ordering::Relaxed) {
			return Err(TransportError::Unavailable("server unhealthy".to_string()));
		}
		Ok(())
	}
}

impl std::fmt::Debug for MemoryServer {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("MemoryServer")
			.field("identity", self.local_identity())
			.field("started", &self.started.load(Ordering::Relaxed))
			.field("stopped", &self.stopped.load(Ordering::Relaxed))
			.finish_non_exhaustive()
	}
}

#[derive(Debug)]
pub struct MemoryClient {
	material: IdentityMaterial,
	transport: MemoryTransport,
	closed: AtomicBool,
	healthy: AtomicBool,
}

impl MemoryClient {
	pub fn set_healthy(&self, healthy: bool) {
		self.healthy.store(healthy, Ordering::Relaxed);
	}
}

#[async_trait]
impl IdentityClient for MemoryClient {
	async fn connect(
		&self,
		service_name: &str,
		_address: &str,
	) -> Result<Arc<dyn ClientConnection>, TransportError> {
		if self.closed.load(Ordering::Relaxed) {
			return Err(TransportError::Unavailable("client closed".to_string()));
		}
		let server = self
			.transport
			.inner
			.listeners
			.lock()
			.get(service_name)
			.cloned()
			.ok_or_else(|| {
				TransportError::Unavailable(format!("no server listening for {service_name}"))
			})?;
		server.check_available()?;

		// What a real handshake enforces: fresh certs on both sides and
		// mutual policy acceptance of the peer's URI-SAN identity.
		let now = SystemTime::now();
		if self.material.cert.is_expired(now) {
			return Err(TransportError::HandshakeRejected(
				"client certificate expired".to_string(),
			));
		}
		let client_id = self
			.material
			.cert
			.to_spiffe_id()
			.ok_or_else(|| TransportError::HandshakeRejected("client has no identity".to_string()))?;
		let server_id = server
			.material
			.cert
			.to_spiffe_id()
			.ok_or_else(|| TransportError::HandshakeRejected("server has no identity".to_string()))?;
		if !server.material.policy.allows(client_id, PeerRole::Client) {
			return Err(TransportError::HandshakeRejected(format!(
				"server rejected client identity {client_id}"
			)));
		}
		if !self.material.policy.allows(server_id, PeerRole::Server) {
			return Err(TransportError::HandshakeRejected(format!(
				"client rejected server identity {server_id}"
			)));
		}

		// Hold the server's drain open for the lifetime of the connection.
		let watcher = server.drain_watcher.lock().clone();
		Ok(Arc::new(MemoryConnection {
			peer: server_id.clone(),
			tls: TlsState {
				handshake_complete: true,
				peer_certificates: server.material.cert.cert_and_chain(),
				negotiated_protocol: Some("h2".into()),
			},
			watcher: parking_lot::Mutex::new(watcher),
		}))
	}

	fn certificate(&self) -> Arc<crate::identity::WorkloadCertificate> {
		self.material.cert.clone()
	}

	async fn health_check(&self) -> Result<(), TransportError> {
		if self.closed.load(Ordering::Relaxed) {
			return Err(TransportError::Unavailable("client closed".to_string()));
		}
		if !self.healthy.load(Ordering::Relaxed) {
			return Err(TransportError::Unavailable("client unhealthy".to_string()));
		}
		if self.material.cert.is_expired(SystemTime::now()) {
			return Err(TransportError::Unavailable(
				"client certificate expired".to_string(),
			));
		}
		Ok(())
	}

	async fn close(&self, _grace: Duration) -> Result<(), TransportError> {
		self.closed.store(true, Ordering::Relaxed);
		Ok(())
	}
}

#[derive(Debug)]
pub struct MemoryConnection {
	peer: Identity,
	tls: TlsState,
	watcher: parking_lot::Mutex<Option<DrainWatcher>>,
}

#[async_trait]
impl ClientConnection for MemoryConnection {
	fn peer_identity(&self) -> Option<Identity> {
		Some(self.peer.clone())
	}

	fn tls_state(&self) -> TlsState {
		self.tls.clone()
	}

	async fn close(&self) -> Result<(), TransportError> {
		// Dropping the watcher releases the server's drain.
		let _ = self.watcher.lock().take();
		Ok(())
	}
}
