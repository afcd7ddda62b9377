use std::sync::Arc;
use std::time::Duration;

use ephemos::IdentityService;
use ephemos::identity::ServiceIdentity;
use ephemos::testing::{MemoryTransport, MockAgent, TestCa};

mod common;
use common::*;

/// Two identity services sharing one trust domain, CA, and transport.
fn pair(
	server_name: &str,
	client_name: &str,
) -> (Arc<IdentityService>, Arc<IdentityService>, MemoryTransport) {
	let ca = Arc::new(TestCa::new("root"));
	let transport = MemoryTransport::default();

	let build = |name: &str| {
		let cfg = config(name);
		let identity = ServiceIdentity::new(name, DOMAIN).unwrap();
		let agent = MockAgent::new(ca.clone(), &identity);
		Arc::new(IdentityService::new(&cfg, agent, Arc::new(transport.clone())).unwrap())
	};
	let server = build(server_name);
	let client = build(client_name);
	(server, client, transport)
}

#[tokio::test]
async fn same_domain_workloads_connect() {
	let (server_svc, client_svc, _transport) = pair("payment", "orders");

	let server = server_svc.create_server_identity().await.unwrap();
	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
	server.start(listener).await.unwrap();

	let client = client_svc.create_client_identity().await.unwrap();
	let conn = client.connect("payment", "127.0.0.1:0").await.unwrap();

	assert_eq!(
		conn.peer_identity().unwrap().to_string(),
		"spiffe://prod.company.com/payment"
	);
	let tls = conn.tls_state();
	assert!(tls.handshake_complete);
	assert!(!tls.peer_certificates.is_empty());

	conn.close().await.unwrap();
}

#[tokio::test]
async fn unauthorized_clients_are_rejected_at_handshake() {
	let ca = Arc::new(TestCa::new("root"));
	let transport = MemoryTransport::default();

	// The server only accepts the web frontend.
	let mut server_cfg = config("payment");
	server_cfg.authorized_clients = vec!["spiffe://prod.company.com/web".into()];
	let server_identity = ServiceIdentity::new("payment", DOMAIN).unwrap();
	let server_agent = MockAgent::new(ca.clone(), &server_identity);
	let server_svc = Arc::new(
		IdentityService::new(&server_cfg, server_agent, Arc::new(transport.clone())).unwrap(),
	);

	let client_cfg = config("orders");
	let client_identity = ServiceIdentity::new("orders", DOMAIN).unwrap();
	let client_agent = MockAgent::new(ca.clone(), &client_identity);
	let client_svc = Arc::new(
		IdentityService::new(&client_cfg, client_agent, Arc::new(transport.clone())).unwrap(),
	);

	let server = server_svc.create_server_identity().await.unwrap();
	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
	server.start(listener).await.unwrap();

	let client = client_svc.create_client_identity().await.unwrap();
	let err = client.connect("payment", "127.0.0.1:0").await.unwrap_err();
	assert!(err.to_string().contains("rejected"), "got: {err}");
}

#[tokio::test]
async fn stopped_servers_refuse_connections() {
	let (server_svc, client_svc, _transport) = pair("payment", "orders");

	let server = server_svc.create_server_identity().await.unwrap();
	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
	server.start(listener).await.unwrap();
	server.stop(Duration::from_millis(100)).await.unwrap();

	let client = client_svc.create_client_identity().await.unwrap();
	assert!(client.connect("payment", "127.0.0.1:0").await.is_err());
}

#[tokio::test(start_paused = true)]
async fn open_connections_hold_the_drain_until_closed() {
	let (server_svc, client_svc, _transport) = pair("payment", "orders");

	let server = server_svc.create_server_identity().await.unwrap();
	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
	server.start(listener).await.unwrap();

	let client = client_svc.create_client_identity().await.unwrap();
	let conn = client.connect("payment", "127.0.0.1:0").await.unwrap();

	// The open connection keeps the drain from completing; stop still
	// returns once the grace period lapses.
	let start = tokio::time::Instant::now();
	server.stop(Duration::from_millis(200)).await.unwrap();
	assert!(start.elapsed() >= Duration::from_millis(200));

	conn.close().await.unwrap();
}
