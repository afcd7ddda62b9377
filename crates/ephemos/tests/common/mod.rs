#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use ephemos::IdentityService;
use ephemos::config::Config;
use ephemos::identity::ServiceIdentity;
use ephemos::testing::{MemoryTransport, MockAgent, TestCa};

pub const DOMAIN: &str = "prod.company.com";

pub fn config(name: &str) -> Config {
	Config {
		service_name: name.into(),
		trust_domain: Some(DOMAIN.parse().unwrap()),
		socket_path: "/run/sockets/agent.sock".into(),
		cache_ttl: Duration::from_secs(30 * 60),
		proactive_refresh: Duration::from_secs(10 * 60),
		authorized_clients: vec![],
		trusted_servers: vec![],
		debug: false,
	}
}

pub struct Harness {
	pub ca: Arc<TestCa>,
	pub agent: Arc<MockAgent>,
	pub transport: MemoryTransport,
	pub service: Arc<IdentityService>,
}

pub fn harness(name: &str) -> Harness {
	harness_with(config(name))
}

pub fn harness_with(cfg: Config) -> Harness {
	let ca = Arc::new(TestCa::new("root"));
	let identity = ServiceIdentity::new(&cfg.service_name, DOMAIN).unwrap();
	let agent = MockAgent::new(ca.clone(), &identity);
	let transport = MemoryTransport::default();
	let service = Arc::new(
		IdentityService::new(&cfg, agent.clone(), Arc::new(transport.clone()))
			.expect("service builds from valid config"),
	);
	Harness {
		ca,
		agent,
		transport,
		service,
	}
}

/// Drives paused-clock tests until `done` returns true or the budget runs out.
pub async fn wait_for(mut done: impl FnMut() -> bool) {
	for _ in 0..1000 {
		if done() {
			return;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	panic!("condition not reached in time");
}
