use std::fmt::Debug;

use async_trait::async_trait;
use ephemos_core::prelude::*;
use rustls_pki_types::CertificateDer;

use crate::identity::policy::AuthenticationPolicy;
use crate::identity::{Identity, TrustBundle, WorkloadCertificate};

pub mod tls;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
	#[error("tls: {0}")]
	Tls(#[from] tls::Error),
	#[error("handshake rejected: {0}")]
	HandshakeRejected(String),
	#[error("unavailable: {0}")]
	Unavailable(String),
	#[error("{0}")]
	Internal(String),
}

/// Everything a transport needs to terminate or originate mTLS on behalf of
/// the local workload: its SVID, the trust anchors, and the peer policy.
#[derive(Debug, Clone)]
pub struct IdentityMaterial {
	pub cert: Arc<WorkloadCertificate>,
	pub bundle: Arc<TrustBundle>,
	pub policy: Arc<AuthenticationPolicy>,
}

/// Snapshot of the TLS layer's view of one established session.
#[derive(Debug, Clone, Default)]
pub struct TlsState {
	pub handshake_complete: bool,
	pub peer_certificates: Vec<CertificateDer<'static>>,
	pub negotiated_protocol: Option<Strng>,
}

impl TlsState {
	pub fn from_connection(conn: &rustls::CommonState) -> TlsState {
		TlsState {
			handshake_complete: !conn.is_handshaking(),
			peer_certificates: conn
				.peer_certificates()
				.map(|certs| certs.to_vec())
				.unwrap_or_default(),
			negotiated_protocol: conn
				.alpn_protocol()
				.map(|p| String::from_utf8_lossy(p).into_owned().into()),
		}
	}
}

/// Transport builds ready-to-serve servers and connect-ready clients from
/// identity material. The implementation performs mTLS with the supplied cert
/// and bundle and rejects peers the policy does not accept.
#[async_trait]
pub trait Transport: Send + Sync + Debug {
	async fn create_server(
		&self,
		material: IdentityMaterial,
	) -> Result<Arc<dyn IdentityServer>, TransportError>;
	async fn create_client(
		&self,
		material: IdentityMaterial,
	) -> Result<Arc<dyn IdentityClient>, TransportError>;
}

/// Handle to a service implementation the server exposes once started.
pub trait ServiceRegistrar: Send + Sync {
	fn service_name(&self) -> Strng;
}

#[async_trait]
pub trait IdentityServer: Send + Sync + Debug {
	async fn start(&self, listener: tokio::net::TcpListener) -> Result<(), TransportError>;
	/// Stop accepting and drain existing work, up to the grace period.
	async fn stop(&self, grace: Duration) -> Result<(), TransportError>;
	fn register_service(&self, registrar: Arc<dyn ServiceRegistrar>);
	/// The SVID this server currently presents.
	fn certificate(&self) -> Arc<WorkloadCertificate>;
	async fn health_check(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait IdentityClient: Send + Sync + Debug {
	async fn connect(
		&self,
		service_name: &str,
		address: &str,
	) -> Result<Arc<dyn ClientConnection>, TransportError>;
	/// The SVID this client currently presents.
	fn certificate(&self) -> Arc<WorkloadCertificate>;
	async fn health_check(&self) -> Result<(), TransportError>;
	async fn close(&self, grace: Duration) -> Result<(), TransportError>;
}

#[async_trait]
pub trait ClientConnection: Send + Sync + Debug {
	fn peer_identity(&self) -> Option<Identity>;
	fn tls_state(&self) -> TlsState;
	async fn close(&self) -> Result<(), TransportError>;
}

/// Builds the material tuple used to hand a transport its TLS inputs.
pub fn material(
	cert: Arc<WorkloadCertificate>,
	bundle: Arc<TrustBundle>,
	policy: Arc<AuthenticationPolicy>,
) -> IdentityMaterial {
	IdentityMaterial {
		cert,
		bundle,
		policy,
	}
}
