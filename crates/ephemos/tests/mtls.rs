use std::sync::Arc;
use std::time::Duration;

use ephemos::identity::policy::AuthenticationPolicy;
use ephemos::identity::{Identity, ServiceIdentity};
use ephemos::testing::TestCa;
use ephemos::transport::tls;
use ephemos::transport::{IdentityMaterial, material};

const HOUR: Duration = Duration::from_secs(3600);

fn workload(ca: &TestCa, name: &str, domain: &str) -> IdentityMaterial {
	let identity = ServiceIdentity::new(name, domain).unwrap();
	let cert = ca.issue(&identity.uri().to_string(), HOUR);
	material(
		Arc::new(cert),
		Arc::new(ca.bundle()),
		Arc::new(AuthenticationPolicy::same_trust_domain(identity)),
	)
}

/// Runs a full rustls handshake between the two workloads over an in-memory
/// pipe, returning the peer identity each side observed.
async fn handshake(
	server: &IdentityMaterial,
	client: &IdentityMaterial,
) -> (
	Result<Option<Identity>, tls::Error>,
	Result<Option<Identity>, tls::Error>,
) {
	let sc = Arc::new(tls::server_config(server).unwrap());
	let cc = Arc::new(tls::client_config(client).unwrap());
	let (client_io, server_io) = tokio::io::duplex(16 * 1024);
	let (client_res, server_res) =
		tokio::join!(tls::connect(client_io, cc), tls::accept(server_io, sc));
	(
		client_res.map(|stream| {
			let (_, conn) = stream.get_ref();
			tls::identity_from_connection(conn)
		}),
		server_res.map(|stream| {
			let (_, conn) = stream.get_ref();
			tls::identity_from_connection(conn)
		}),
	)
}

#[tokio::test]
async fn same_trust_domain_workloads_complete_mtls() {
	let ca = TestCa::new("root");
	let server = workload(&ca, "payment", "prod.company.com");
	let client = workload(&ca, "orders", "prod.company.com");

	let (client_res, server_res) = handshake(&server, &client).await;
	// Each side sees the other's URI-SAN identity.
	assert_eq!(
		client_res.unwrap().unwrap().to_string(),
		"spiffe://prod.company.com/payment"
	);
	assert_eq!(
		server_res.unwrap().unwrap().to_string(),
		"spiffe://prod.company.com/orders"
	);
}

#[tokio::test]
async fn server_rejects_clients_from_other_trust_domains() {
	let ca = TestCa::new("root");
	let server = workload(&ca, "payment", "prod.company.com");
	let client = workload(&ca, "web", "staging.company.com");

	let (_client_res, server_res) = handshake(&server, &client).await;
	assert!(server_res.is_err(), "foreign-domain client must be rejected");
}

#[tokio::test]
async fn server_rejects_certs_from_an_untrusted_ca() {
	let ca = TestCa::new("root");
	let rogue = TestCa::new("rogue");
	let server = workload(&ca, "payment", "prod.company.com");
	// Client presents a rogue-signed cert but trusts the real CA.
	let client_identity = ServiceIdentity::new("orders", "prod.company.com").unwrap();
	let client = material(
		Arc::new(rogue.issue(&client_identity.uri().to_string(), HOUR)),
		Arc::new(ca.bundle()),
		Arc::new(AuthenticationPolicy::same_trust_domain(client_identity)),
	);

	let (_client_res, server_res) = handshake(&server, &client).await;
	assert!(server_res.is_err(), "untrusted chain must be rejected");
}

#[tokio::test]
async fn client_rejects_servers_outside_its_policy() {
	let ca = TestCa::new("root");
	let server = workload(&ca, "payment", "prod.company.com");

	let client_identity = ServiceIdentity::new("orders", "prod.company.com").unwrap();
	let policy = AuthenticationPolicy::builder(client_identity.clone())
		.trusted_servers(["spiffe://prod.company.com/db"])
		.build()
		.unwrap();
	let client = material(
		Arc::new(ca.issue(&client_identity.uri().to_string(), HOUR)),
		Arc::new(ca.bundle()),
		Arc::new(policy),
	);

	let (client_res, _server_res) = handshake(&server, &client).await;
	assert!(
		client_res.is_err(),
		"server outside the trusted set must be rejected"
	);
}

#[tokio::test]
async fn expired_client_certs_fail_the_handshake() {
	let ca = TestCa::new("root");
	let server = workload(&ca, "payment", "prod.company.com");
	let client_identity = ServiceIdentity::new("orders", "prod.company.com").unwrap();
	let client = material(
		Arc::new(ca.issue_expired(&client_identity.uri().to_string())),
		Arc::new(ca.bundle()),
		Arc::new(AuthenticationPolicy::same_trust_domain(client_identity)),
	);

	let (_client_res, server_res) = handshake(&server, &client).await;
	assert!(server_res.is_err(), "expired client cert must be rejected");
}
