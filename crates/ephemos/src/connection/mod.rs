use std::fmt::Debug;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::SystemTime;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use ephemos_core::prelude::*;
use prometheus_client::encoding::{EncodeLabelValue, LabelValueEncoder};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::identity::service::IdentityError;
use crate::identity::{Identity, ServiceIdentity, WorkloadCertificate};
use crate::transport::{IdentityMaterial, TlsState};

pub mod invariants;
pub mod registry;
pub mod rotation;

pub use rotation::{RotationError, RotationPhase};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
	Active,
	Rotating,
	Failed,
	Closed,
}

/// Why a session's certificate is being rotated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationReason {
	/// The certificate is inside the pre-rotation window.
	NearExpiry,
	/// The session went too long without a rotation.
	ForceInterval,
	/// The session is in the Failed state and needs fresh material.
	FailedState,
}

impl RotationReason {
	pub fn as_str(&self) -> &'static str {
		match self {
			RotationReason::NearExpiry => "near_expiry",
			RotationReason::ForceInterval => "force_interval",
			RotationReason::FailedState => "failed_state",
		}
	}
}

impl EncodeLabelValue for RotationReason {
	fn encode(&self, writer: &mut LabelValueEncoder) -> Result<(), std::fmt::Error> {
		use std::fmt::Write;
		writer.write_str(self.as_str())
	}
}

impl std::fmt::Display for RotationReason {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// One live mutually-authenticated session. The certificate is replaced
/// atomically on rotation; everything else is immutable after the handshake.
pub struct MtlsSession {
	id: Strng,
	local: ServiceIdentity,
	remote: Identity,
	cert: ArcSwap<WorkloadCertificate>,
	tls: TlsState,
	established_at: SystemTime,
	last_rotated: parking_lot::Mutex<tokio::time::Instant>,
	state: parking_lot::Mutex<ConnectionState>,
	violations: AtomicU32,
	on_close: parking_lot::Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl MtlsSession {
	pub fn new(
		id: Strng,
		local: ServiceIdentity,
		remote: Identity,
		cert: Arc<WorkloadCertificate>,
		tls: TlsState,
	) -> Arc<MtlsSession> {
		Arc::new(MtlsSession {
			id,
			local,
			remote,
			cert: ArcSwap::new(cert),
			tls,
			established_at: SystemTime::now(),
			last_rotated: parking_lot::Mutex::new(tokio::time::Instant::now()),
			state: parking_lot::Mutex::new(ConnectionState::Active),
			violations: AtomicU32::new(0),
			on_close: parking_lot::Mutex::new(None),
		})
	}

	pub fn id(&self) -> &Strng {
		&self.id
	}

	pub fn local_identity(&self) -> &ServiceIdentity {
		&self.local
	}

	pub fn remote_identity(&self) -> &Identity {
		&self.remote
	}

	pub fn certificate(&self) -> Arc<WorkloadCertificate> {
		self.cert.load_full()
	}

	pub fn tls_state(&self) -> &TlsState {
		&self.tls
	}

	pub fn established_at(&self) -> SystemTime {
		self.established_at
	}

	pub fn state(&self) -> ConnectionState {
		*self.state.lock()
	}

	pub(crate) fn set_state(&self, next: ConnectionState) {
		let mut state = self.state.lock();
		// Closed is terminal.
		if *state == ConnectionState::Closed {
			return;
		}
		*state = next;
	}

	/// Atomically replaces the session certificate and stamps the rotation.
	pub(crate) fn install_certificate(&self, cert: Arc<WorkloadCertificate>) {
		self.cert.store(cert);
		*self.last_rotated.lock() = tokio::time::Instant::now();
	}

	pub fn age_since_rotation(&self) -> Duration {
		self.last_rotated.lock().elapsed()
	}

	pub fn violations(&self) -> u32 {
		self.violations.load(Ordering::Relaxed)
	}

	pub(crate) fn record_violation(&self) -> u32 {
		self.violations.fetch_add(1, Ordering::Relaxed) + 1
	}

	pub(crate) fn reset_violations(&self) {
		self.violations.store(0, Ordering::Relaxed);
	}

	/// Registers cleanup run when the session closes: transports hang their
	/// connection-close handle here.
	pub fn set_close_handle(&self, f: Box<dyn FnOnce() + Send>) {
		*self.on_close.lock() = Some(f);
	}

	/// Transitions to Closed and releases the transport handle. Idempotent.
	pub(crate) fn close(&self) {
		{
			let mut state = self.state.lock();
			if *state == ConnectionState::Closed {
				return;
			}
			*state = ConnectionState::Closed;
		}
		if let Some(f) = self.on_close.lock().take() {
			f();
		}
	}
}

impl Drop for MtlsSession {
	fn drop(&mut self) {
		// Sessions must not leak their transport handles.
		if let Some(f) = self.on_close.lock().take() {
			f();
		}
	}
}

impl Debug for MtlsSession {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("MtlsSession")
			.field("id", &self.id)
			.field("local", &self.local.uri())
			.field("remote", &self.remote)
			.field("state", &self.state())
			.finish_non_exhaustive()
	}
}

/// Observers are notified synchronously after each rotation state transition,
/// in phase order for a given rotation. They must not block.
pub trait RotationObserver: Send + Sync {
	fn on_rotation_started(&self, session: &Strng, reason: RotationReason);
	fn on_rotation_completed(
		&self,
		session: &Strng,
		old: &WorkloadCertificate,
		new: &WorkloadCertificate,
	);
	fn on_rotation_failed(&self, session: &Strng, err: &RotationError);
}

/// Copy-on-iterate observer list, so observers can be registered while a
/// rotation is notifying.
#[derive(Default)]
pub struct ObserverSet {
	observers: parking_lot::Mutex<Vec<Arc<dyn RotationObserver>>>,
}

impl ObserverSet {
	pub fn register(&self, observer: Arc<dyn RotationObserver>) {
		self.observers.lock().push(observer);
	}

	pub fn unregister(&self, observer: &Arc<dyn RotationObserver>) {
		self
			.observers
			.lock()
			.retain(|o| !Arc::ptr_eq(o, observer));
	}

	fn snapshot(&self) -> Vec<Arc<dyn RotationObserver>> {
		self.observers.lock().clone()
	}

	pub(crate) fn rotation_started(&self, session: &Strng, reason: RotationReason) {
		for o in self.snapshot() {
			o.on_rotation_started(session, reason);
		}
	}

	pub(crate) fn rotation_completed(
		&self,
		session: &Strng,
		old: &WorkloadCertificate,
		new: &WorkloadCertificate,
	) {
		for o in self.snapshot() {
			o.on_rotation_completed(session, old, new);
		}
	}

	pub(crate) fn rotation_failed(&self, session: &Strng, err: &RotationError) {
		for o in self.snapshot() {
			o.on_rotation_failed(session, err);
		}
	}
}

impl Debug for ObserverSet {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ObserverSet")
			.field("count", &self.observers.lock().len())
			.finish()
	}
}

/// CertificateSource is the narrow view of the identity service the
/// connection layer depends on. The registry must not own the service
/// (the service may observe the registry), so it talks through this
/// lookup handle instead.
#[async_trait]
pub trait CertificateSource: Send + Sync + Debug {
	fn local_identity(&self) -> ServiceIdentity;
	/// Freshly validated (cert, bundle, policy), suitable for building a
	/// replacement entity.
	async fn identity_material(
		&self,
		ct: &CancellationToken,
	) -> Result<IdentityMaterial, IdentityError>;
}
