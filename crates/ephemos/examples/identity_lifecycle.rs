//! A tour of the identity lifecycle against in-process doubles: fetch and
//! cache an SVID, gate it with the production checks, stand up an mTLS
//! server and client, register the session, and sweep it for invariant
//! violations.
//!
//! Run with: cargo run --example identity_lifecycle --features testing

use std::sync::Arc;
use std::time::Duration;

use ephemos::IdentityService;
use ephemos::config;
use ephemos::connection::invariants::{EnforcerConfig, InvariantEnforcer};
use ephemos::connection::registry::{ConnectionRegistry, RegistryConfig};
use ephemos::connection::rotation::{ContinuityPolicy, RotationController, RotationTarget};
use ephemos::connection::{CertificateSource, ObserverSet};
use ephemos::identity::ServiceIdentity;
use ephemos::identity::validator::Validator;
use ephemos::testing::{MemoryTransport, MockAgent, TestCa};
use ephemos::transport::TlsState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	ephemos::telemetry::setup_logging();

	let cfg = config::parse_config(
		r#"
service:
  name: payment
  domain: prod.company.com
"#,
	)?;
	cfg.is_production_ready()?;

	// In a real deployment the provider speaks to the agent over its Unix
	// socket; here a scripted agent mints SVIDs from a throwaway CA.
	let ca = Arc::new(TestCa::new("example-root"));
	let identity = ServiceIdentity::new("payment", "prod.company.com")?;
	let agent = MockAgent::new(ca.clone(), &identity);
	let transport = MemoryTransport::default();
	let service = Arc::new(IdentityService::new(
		&cfg,
		agent,
		Arc::new(transport.clone()),
	)?);

	// Server and client share the cached material.
	let server = service.create_server_identity().await?;
	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
	server.start(listener).await?;

	let client = service.create_client_identity().await?;
	let conn = client.connect("payment", "127.0.0.1:0").await?;
	println!(
		"connected to {}",
		conn.peer_identity().expect("peer presented an identity")
	);

	// Track the session and keep it honest.
	let observers = Arc::new(ObserverSet::default());
	let controller = Arc::new(RotationController::new(
		ContinuityPolicy::default(),
		service.clone() as Arc<dyn CertificateSource>,
		Arc::new(transport.clone()),
		Arc::new(Validator::default()),
		observers,
	));
	let registry = ConnectionRegistry::new(RegistryConfig::default(), controller);
	registry.establish_connection(
		"payment-to-orders".into(),
		"spiffe://prod.company.com/orders".parse()?,
		server.certificate(),
		service.identity().clone(),
		TlsState {
			handshake_complete: true,
			peer_certificates: server.certificate().cert_and_chain(),
			negotiated_protocol: Some("h2".into()),
		},
		RotationTarget::Server(server),
	);

	let enforcer = InvariantEnforcer::new(registry.clone(), EnforcerConfig::default());
	let violations = enforcer.sweep().await;
	println!("invariant violations: {}", violations.len());

	conn.close().await?;
	registry.shutdown();
	service.shutdown().await;

	tokio::time::sleep(Duration::from_millis(50)).await;
	println!("cache metrics: {:?}", service.cache_metrics());
	Ok(())
}
