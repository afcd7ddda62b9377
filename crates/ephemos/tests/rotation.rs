use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use ephemos::connection::registry::{ConnectionRegistry, RegistryConfig, RotationPolicy};
use ephemos::connection::rotation::{ContinuityPolicy, RotationController, RotationTarget};
use ephemos::connection::{
	CertificateSource, ConnectionState, MtlsSession, ObserverSet, RotationError, RotationObserver,
	RotationReason,
};
use ephemos::identity::Identity;
use ephemos::identity::WorkloadCertificate;
use ephemos::identity::validator::Validator;
use ephemos::strng::Strng;
use ephemos::transport::{IdentityServer, TlsState};

mod common;
use common::*;

#[derive(Default)]
struct RecordingObserver {
	started: AtomicU32,
	completed: AtomicU32,
	failed: AtomicU32,
}

impl RotationObserver for RecordingObserver {
	fn on_rotation_started(&self, _session: &Strng, _reason: RotationReason) {
		self.started.fetch_add(1, Ordering::SeqCst);
	}

	fn on_rotation_completed(
		&self,
		_session: &Strng,
		_old: &WorkloadCertificate,
		_new: &WorkloadCertificate,
	) {
		self.completed.fetch_add(1, Ordering::SeqCst);
	}

	fn on_rotation_failed(&self, _session: &Strng, _err: &RotationError) {
		self.failed.fetch_add(1, Ordering::SeqCst);
	}
}

fn quick_continuity() -> ContinuityPolicy {
	ContinuityPolicy {
		preparation_timeout: Duration::from_secs(5),
		overlap_duration: Duration::from_millis(200),
		overlap_check_interval: Duration::from_millis(50),
		validation_timeout: Duration::from_secs(5),
		graceful_shutdown_timeout: Duration::from_secs(1),
		max_concurrent_rotations: 2,
		retry_backoff: Duration::from_millis(500),
	}
}

fn quick_registry_cfg() -> RegistryConfig {
	RegistryConfig {
		monitor_interval: Duration::from_millis(50),
		rotation: RotationPolicy::default(),
	}
}

fn build_registry(
	h: &Harness,
	continuity: ContinuityPolicy,
	cfg: RegistryConfig,
	observers: Arc<ObserverSet>,
) -> Arc<ConnectionRegistry> {
	let controller = Arc::new(RotationController::new(
		continuity,
		h.service.clone() as Arc<dyn CertificateSource>,
		Arc::new(h.transport.clone()),
		Arc::new(Validator::default()),
		observers,
	));
	ConnectionRegistry::new(cfg, controller)
}

/// A harness whose cache refresh window is wider than the pre-rotation
/// threshold, so a rotation's fetch always yields fresh material.
fn rotation_harness() -> Harness {
	let mut cfg = config("payment");
	cfg.proactive_refresh = Duration::from_secs(16 * 60);
	harness_with(cfg)
}

fn remote() -> Identity {
	"spiffe://prod.company.com/orders".parse().unwrap()
}

fn tls_for(server: &Arc<dyn IdentityServer>) -> TlsState {
	TlsState {
		handshake_complete: true,
		peer_certificates: server.certificate().cert_and_chain(),
		negotiated_protocol: Some("h2".into()),
	}
}

async fn establish(
	registry: &Arc<ConnectionRegistry>,
	h: &Harness,
	server: Arc<dyn IdentityServer>,
	id: &str,
) -> Arc<MtlsSession> {
	registry.establish_connection(
		id.into(),
		remote(),
		server.certificate(),
		h.service.identity().clone(),
		tls_for(&server),
		RotationTarget::Server(server),
	)
}

#[tokio::test(start_paused = true)]
async fn near_expiry_session_rotates_with_overlap() {
	let h = rotation_harness();
	// The session's first cert sits exactly at the pre-rotation threshold.
	h.agent.plan_validity(Duration::from_secs(15 * 60));
	let server = h.service.create_server_identity().await.unwrap();
	let old_not_after = server.certificate().expiry().not_after;

	let observers = Arc::new(ObserverSet::default());
	let recorder = Arc::new(RecordingObserver::default());
	observers.register(recorder.clone());
	let registry = build_registry(&h, quick_continuity(), quick_registry_cfg(), observers);

	let session = establish(&registry, &h, server.clone(), "sess-1").await;
	wait_for(|| recorder.completed.load(Ordering::SeqCst) >= 1).await;

	// Exactly one rotation ran, through all four phases.
	assert_eq!(recorder.started.load(Ordering::SeqCst), 1);
	assert_eq!(recorder.completed.load(Ordering::SeqCst), 1);
	assert_eq!(recorder.failed.load(Ordering::SeqCst), 0);

	// The session came back Active on fresh material.
	assert_eq!(session.state(), ConnectionState::Active);
	assert!(session.certificate().expiry().not_after > old_not_after);
	assert!(session.age_since_rotation() < Duration::from_secs(60));

	// The old entity was shut down within the grace period.
	assert!(server.health_check().await.is_err());

	registry.shutdown();
}

#[tokio::test(start_paused = true)]
async fn failed_rotation_retains_the_old_entity_and_retries() {
	let h = rotation_harness();
	h.agent.plan_validity(Duration::from_secs(14 * 60));
	let server = h.service.create_server_identity().await.unwrap();
	// The rotation's fetch yields an expired cert, failing preparation.
	h.agent.plan_expired();

	let observers = Arc::new(ObserverSet::default());
	let recorder = Arc::new(RecordingObserver::default());
	observers.register(recorder.clone());
	let registry = build_registry(&h, quick_continuity(), quick_registry_cfg(), observers);

	let session = establish(&registry, &h, server.clone(), "sess-1").await;
	wait_for(|| recorder.failed.load(Ordering::SeqCst) >= 1).await;

	// The old entity is still the live one.
	assert_eq!(session.state(), ConnectionState::Failed);
	assert!(server.health_check().await.is_ok());

	// After the retry backoff the next attempt succeeds on fresh material.
	wait_for(|| recorder.completed.load(Ordering::SeqCst) >= 1).await;
	assert_eq!(session.state(), ConnectionState::Active);
	assert!(server.health_check().await.is_err());

	registry.shutdown();
}

#[tokio::test(start_paused = true)]
async fn rotations_queue_on_the_concurrency_cap() {
	let h = rotation_harness();
	// Both servers start on near-expiry certs: the second create refreshes
	// proactively and consumes the second planned cert.
	h.agent.plan_validity(Duration::from_secs(15 * 60));
	h.agent.plan_validity(Duration::from_secs(15 * 60));
	let server_a = h.service.create_server_identity().await.unwrap();
	let server_b = h.service.create_server_identity().await.unwrap();

	let observers = Arc::new(ObserverSet::default());
	let recorder = Arc::new(RecordingObserver::default());
	observers.register(recorder.clone());
	let mut continuity = quick_continuity();
	continuity.max_concurrent_rotations = 1;
	let registry = build_registry(&h, continuity, quick_registry_cfg(), observers);

	let a = establish(&registry, &h, server_a, "sess-a").await;
	let b = establish(&registry, &h, server_b, "sess-b").await;

	wait_for(|| recorder.completed.load(Ordering::SeqCst) >= 2).await;
	assert_eq!(a.state(), ConnectionState::Active);
	assert_eq!(b.state(), ConnectionState::Active);

	registry.shutdown();
}

#[tokio::test(start_paused = true)]
async fn fresh_sessions_are_left_alone() {
	let h = harness("payment");
	let server = h.service.create_server_identity().await.unwrap();

	let observers = Arc::new(ObserverSet::default());
	let recorder = Arc::new(RecordingObserver::default());
	observers.register(recorder.clone());
	let registry = build_registry(&h, quick_continuity(), quick_registry_cfg(), observers);

	let session = establish(&registry, &h, server, "sess-1").await;
	// Give the monitor plenty of ticks.
	tokio::time::sleep(Duration::from_secs(2)).await;

	assert_eq!(recorder.started.load(Ordering::SeqCst), 0);
	assert_eq!(session.state(), ConnectionState::Active);

	registry.shutdown();
}

#[tokio::test(start_paused = true)]
async fn observers_can_be_unregistered() {
	let h = rotation_harness();
	h.agent.plan_validity(Duration::from_secs(15 * 60));
	let server = h.service.create_server_identity().await.unwrap();

	let observers = Arc::new(ObserverSet::default());
	let recorder = Arc::new(RecordingObserver::default());
	let silenced = Arc::new(RecordingObserver::default());
	observers.register(recorder.clone());
	let silenced_dyn: Arc<dyn RotationObserver> = silenced.clone();
	observers.register(silenced_dyn.clone());
	observers.unregister(&silenced_dyn);

	let registry = build_registry(&h, quick_continuity(), quick_registry_cfg(), observers);
	let _session = establish(&registry, &h, server, "sess-1").await;
	wait_for(|| recorder.completed.load(Ordering::SeqCst) >= 1).await;

	assert_eq!(silenced.started.load(Ordering::SeqCst), 0);

	registry.shutdown();
}

#[tokio::test]
async fn close_connection_is_idempotent() {
	let h = harness("payment");
	let server = h.service.create_server_identity().await.unwrap();

	let observers = Arc::new(ObserverSet::default());
	let registry = build_registry(
		&h,
		quick_continuity(),
		RegistryConfig {
			monitor_interval: Duration::from_secs(3600),
			rotation: RotationPolicy::default(),
		},
		observers,
	);

	let session = establish(&registry, &h, server, "sess-1").await;
	assert!(registry.get_connection("sess-1").is_some());
	assert_eq!(registry.list_connections().len(), 1);

	assert!(registry.close_connection("sess-1"));
	// The second close is a harmless no-op.
	assert!(!registry.close_connection("sess-1"));
	assert!(registry.get_connection("sess-1").is_none());
	assert_eq!(session.state(), ConnectionState::Closed);
}
