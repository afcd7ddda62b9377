use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use ephemos::IdentityError;
use ephemos::identity::CertificateError;
use ephemos::testing::TestCa;

mod common;
use common::*;

const HOUR: Duration = Duration::from_secs(3600);

#[tokio::test(start_paused = true)]
async fn happy_path_serves_from_cache_for_twenty_minutes() {
	let h = harness("payment");
	let server = h.service.create_server_identity().await.unwrap();
	server.health_check().await.unwrap();

	for _ in 0..20 {
		tokio::time::advance(Duration::from_secs(60)).await;
		h.service.get_certificate().await.unwrap();
	}

	// One fetch served every read in the TTL window.
	assert_eq!(h.agent.cert_calls(), 1);
	let metrics = h.service.cache_metrics();
	assert!(metrics.cert_cache_hits >= 20, "got {metrics:?}");
	assert!(metrics.cert_cache_misses >= 1);
}

#[tokio::test]
async fn proactive_refresh_swaps_the_cert_before_expiry() {
	let h = harness("payment");
	// The agent's first cert has only 9 minutes left; the refresh window is 10.
	h.agent.plan_validity(Duration::from_secs(9 * 60));

	let first = h.service.get_certificate().await.unwrap();
	let second = h.service.get_certificate().await.unwrap();

	assert_eq!(h.agent.cert_calls(), 2);
	assert!(second.expiry().not_after > first.expiry().not_after);

	// The replacement is now a plain cache hit.
	let third = h.service.get_certificate().await.unwrap();
	assert_eq!(h.agent.cert_calls(), 2);
	assert_eq!(second.leaf().der, third.leaf().der);
}

#[tokio::test(start_paused = true)]
async fn transient_agent_failures_are_retried() {
	let h = harness("payment");
	h.agent.plan_fail(2, "agent restarting");

	let start = tokio::time::Instant::now();
	h.service.get_certificate().await.unwrap();

	assert!(start.elapsed() >= Duration::from_millis(300));
	assert_eq!(h.agent.cert_calls(), 3);
	assert_eq!(h.service.cache_metrics().retries, 2);
}

#[tokio::test]
async fn agent_failure_after_retries_is_surfaced() {
	let h = harness("payment");
	h.agent.plan_fail(3, "agent gone");

	let err = h.service.get_certificate().await.unwrap_err();
	let msg = err.to_string();
	// The caller sees the service name and the attempt count.
	assert!(msg.contains("payment"), "got: {msg}");
	assert!(msg.contains("3 attempts"), "got: {msg}");
}

#[tokio::test]
async fn identity_mismatch_clears_the_cache() {
	let h = harness("payment");
	h.agent.set_uri("spiffe://prod.company.com/fraud");

	let err = h.service.create_server_identity().await.unwrap_err();
	assert_matches!(
		err,
		IdentityError::Certificate {
			source: CertificateError::IdMismatch { .. },
			..
		}
	);

	// The bad cert was evicted: the next call re-fetches and succeeds.
	h.agent.set_uri("spiffe://prod.company.com/payment");
	h.service.create_server_identity().await.unwrap();
	assert_eq!(h.agent.cert_calls(), 2);
}

#[tokio::test]
async fn chain_verification_failure_yields_no_server() {
	let h = harness("payment");
	// Certs now come from a CA the trust bundle does not anchor.
	h.agent.set_issuer(Arc::new(TestCa::new("rogue")));

	let err = h.service.create_server_identity().await.unwrap_err();
	assert_matches!(
		err,
		IdentityError::Certificate {
			source: CertificateError::ChainInvalid(_),
			..
		}
	);
}

#[tokio::test]
async fn client_and_server_share_the_cached_material() {
	let h = harness("payment");
	let _server = h.service.create_server_identity().await.unwrap();
	let _client = h.service.create_client_identity().await.unwrap();
	assert_eq!(h.agent.cert_calls(), 1);
	assert_eq!(h.agent.bundle_calls(), 1);
}

#[tokio::test]
async fn trust_bundle_is_exposed_directly() {
	let h = harness("payment");
	let bundle = h.service.get_trust_bundle().await.unwrap();
	assert_eq!(bundle.len(), 1);
}

#[tokio::test]
async fn pushed_certificates_reach_the_cache() {
	let h = harness("payment");
	// Prime the bundle so pushed certs can be chain-verified.
	h.service.get_trust_bundle().await.unwrap();

	h.service.spawn_watch_task().await.unwrap();
	let pushed = Arc::new(h.ca.issue("spiffe://prod.company.com/payment", HOUR));
	let want = pushed.leaf().serial.clone();
	h.agent.push_update(pushed);

	for _ in 0..100 {
		tokio::time::sleep(Duration::from_millis(10)).await;
		let current = h.service.get_certificate().await.unwrap();
		if current.leaf().serial == want {
			return;
		}
	}
	panic!("pushed certificate never became current");
}

#[tokio::test]
async fn invalid_pushed_certificates_are_dropped() {
	let h = harness("payment");
	h.service.get_trust_bundle().await.unwrap();
	h.service.spawn_watch_task().await.unwrap();

	let bogus = Arc::new(h.ca.issue("spiffe://prod.company.com/fraud", HOUR));
	h.agent.push_update(bogus);
	tokio::time::sleep(Duration::from_millis(100)).await;

	// The service still fetches a proper cert on demand.
	let current = h.service.get_certificate().await.unwrap();
	assert_eq!(
		current.to_spiffe_id().unwrap().to_string(),
		"spiffe://prod.company.com/payment"
	);
}

#[tokio::test]
async fn near_expiry_material_emits_a_warning_event() {
	ephemos::telemetry::testing::setup_test_logging();
	let h = harness("payment");
	h.agent.plan_validity(Duration::from_secs(9 * 60));
	h.service.get_certificate().await.unwrap();

	let found =
		ephemos::telemetry::testing::find(&[("message", "certificate approaching expiry")]);
	assert!(!found.is_empty(), "expected a near-expiry warning event");
}

#[tokio::test]
async fn shutdown_releases_the_agent() {
	let h = harness("payment");
	h.service.shutdown().await;
	assert!(h.agent.is_closed());
}

#[test]
fn cache_metrics_serialize_for_introspection() {
	let h = harness("payment");
	let json = serde_json::to_string(&h.service.cache_metrics()).unwrap();
	assert!(json.contains("certCacheHits"), "got: {json}");
}
