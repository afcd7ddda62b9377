use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use ephemos_core::prelude::*;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::connection::{CertificateSource, MtlsSession, ObserverSet, RotationReason};
use crate::connection::ConnectionState;
use crate::identity::validator::{CertValidator, ValidationOptions};
use crate::identity::WorkloadCertificate;
use crate::metrics::{Metrics, RotationLabels, RotationOutcome as RotationOutcomeLabel};
use crate::transport::{IdentityClient, IdentityServer, Transport, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationPhase {
	Preparation,
	Overlap,
	Validation,
	Completion,
	Failed,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("rotation failed during {phase:?}: {reason}")]
pub struct RotationError {
	pub phase: RotationPhase,
	pub reason: String,
}

impl RotationError {
	fn new(phase: RotationPhase, reason: impl Into<String>) -> Self {
		RotationError {
			phase,
			reason: reason.into(),
		}
	}
}

/// The entity being rotated: a serving endpoint or an outbound client, both
/// bearing an SVID that is about to be replaced.
#[derive(Clone)]
pub enum RotationTarget {
	Server(Arc<dyn IdentityServer>),
	Client(Arc<dyn IdentityClient>),
}

impl RotationTarget {
	pub fn certificate(&self) -> Arc<WorkloadCertificate> {
		match self {
			RotationTarget::Server(s) => s.certificate(),
			RotationTarget::Client(c) => c.certificate(),
		}
	}

	pub async fn health_check(&self) -> Result<(), TransportError> {
		match self {
			RotationTarget::Server(s) => s.health_check().await,
			RotationTarget::Client(c) => c.health_check().await,
		}
	}

	pub async fn shutdown(&self, grace: Duration) -> Result<(), TransportError> {
		match self {
			RotationTarget::Server(s) => s.stop(grace).await,
			RotationTarget::Client(c) => c.close(grace).await,
		}
	}

	fn kind(&self) -> &'static str {
		match self {
			RotationTarget::Server(_) => "server",
			RotationTarget::Client(_) => "client",
		}
	}
}

impl Debug for RotationTarget {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.kind())
	}
}

/// One in-flight rotation: the old and new entities and their certificates.
#[derive(Debug)]
pub struct RotationPair {
	pub rotation_id: Strng,
	pub session_id: Strng,
	pub old: RotationTarget,
	pub new: Option<RotationTarget>,
	pub old_cert: Arc<WorkloadCertificate>,
	pub new_cert: Option<Arc<WorkloadCertificate>>,
	pub phase: RotationPhase,
	pub started_at: Instant,
}

#[derive(Debug, Clone)]
pub struct ContinuityPolicy {
	/// Budget for constructing and validating the replacement entity.
	pub preparation_timeout: Duration,
	/// How long old and new entities are simultaneously live.
	pub overlap_duration: Duration,
	/// Cadence of health re-checks during the overlap.
	pub overlap_check_interval: Duration,
	/// Budget for the final validation of the new entity.
	pub validation_timeout: Duration,
	/// How long the old entity gets to drain on completion.
	pub graceful_shutdown_timeout: Duration,
	/// Process-wide cap; further rotation requests queue.
	pub max_concurrent_rotations: usize,
	/// How long a failed session waits before another attempt.
	pub retry_backoff: Duration,
}

impl Default for ContinuityPolicy {
	fn default() -> Self {
		ContinuityPolicy {
			preparation_timeout: Duration::from_secs(30),
			overlap_duration: Duration::from_secs(5 * 60),
			overlap_check_interval: Duration::from_secs(60),
			validation_timeout: Duration::from_secs(30),
			graceful_shutdown_timeout: Duration::from_secs(30),
			max_concurrent_rotations: 2,
			retry_backoff: Duration::from_secs(30),
		}
	}
}

#[derive(Debug, Clone)]
pub enum RotationOutcome {
	/// The new live entity; the caller should replace its handle to the old one.
	Completed(RotationTarget),
	Failed,
	/// A failed rotation is still inside its retry backoff.
	Deferred,
}

/// RotationController runs the overlap protocol: Preparation -> Overlap ->
/// Validation -> Completion, aborting to Failed from any phase. The old
/// entity stays live until the new one has proven itself.
pub struct RotationController {
	policy: ContinuityPolicy,
	permits: Arc<Semaphore>,
	source: Arc<dyn CertificateSource>,
	transport: Arc<dyn Transport>,
	validator: Arc<dyn CertValidator>,
	observers: Arc<ObserverSet>,
	metrics: Option<Arc<Metrics>>,
	ids: AtomicU64,
	retry_after: parking_lot::Mutex<HashMap<Strng, Instant>>,
}

impl RotationController {
	pub fn new(
		policy: ContinuityPolicy,
		source: Arc<dyn CertificateSource>,
		transport: Arc<dyn Transport>,
		validator: Arc<dyn CertValidator>,
		observers: Arc<ObserverSet>,
	) -> Self {
		RotationController {
			permits: Arc::new(Semaphore::new(policy.max_concurrent_rotations)),
			policy,
			source,
			transport,
			validator,
			observers,
			metrics: None,
			ids: AtomicU64::new(0),
			retry_after: Default::default(),
		}
	}

	pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
		self.metrics = Some(metrics);
		self
	}

	pub fn policy(&self) -> &ContinuityPolicy {
		&self.policy
	}

	pub fn observers(&self) -> &Arc<ObserverSet> {
		&self.observers
	}

	/// Rotates one session's entity. Queues on the process-wide concurrency
	/// cap; returns Deferred when the session is still inside its retry
	/// backoff from an earlier failure.
	pub async fn rotate(
		&self,
		session: &Arc<MtlsSession>,
		old: RotationTarget,
		reason: RotationReason,
		ct: &CancellationToken,
	) -> RotationOutcome {
		if let Some(at) = self.retry_after.lock().get(session.id()) {
			if Instant::now() < *at {
				return RotationOutcome::Deferred;
			}
		}
		let _permit = self
			.permits
			.acquire()
			.await
			.expect("rotation semaphore is never closed");

		let rotation_id = strng::format!("rotation-{}", self.ids.fetch_add(1, Ordering::Relaxed) + 1);
		let old_cert = old.certificate();
		let mut pair = RotationPair {
			rotation_id: rotation_id.clone(),
			session_id: session.id().clone(),
			old,
			new: None,
			old_cert: old_cert.clone(),
			new_cert: None,
			phase: RotationPhase::Preparation,
			started_at: Instant::now(),
		};

		session.set_state(ConnectionState::Rotating);
		self.observers.rotation_started(session.id(), reason);
		self.record(RotationOutcomeLabel::Started);
		info!(
			session = %session.id(),
			rotation = %rotation_id,
			kind = pair.old.kind(),
			%reason,
			"rotation started"
		);

		match self.run(&mut pair, session, ct).await {
			Ok((new_target, new_cert)) => {
				session.install_certificate(new_cert.clone());
				session.reset_violations();
				session.set_state(ConnectionState::Active);
				self.retry_after.lock().remove(session.id());
				self
					.observers
					.rotation_completed(session.id(), &old_cert, &new_cert);
				self.record(RotationOutcomeLabel::Completed);
				info!(
					session = %session.id(),
					rotation = %rotation_id,
					took_ms = pair.started_at.elapsed().as_millis() as u64,
					"rotation completed"
				);
				RotationOutcome::Completed(new_target)
			},
			Err(err) => {
				pair.phase = RotationPhase::Failed;
				session.set_state(ConnectionState::Failed);
				self
					.retry_after
					.lock()
					.insert(session.id().clone(), Instant::now() + self.policy.retry_backoff);
				self.observers.rotation_failed(session.id(), &err);
				self.record(RotationOutcomeLabel::Failed);
				warn!(
					session = %session.id(),
					rotation = %rotation_id,
					retry_in_secs = self.policy.retry_backoff.as_secs(),
					"rotation failed, old entity retained: {err}"
				);
				RotationOutcome::Failed
			},
		}
	}

	async fn run(
		&self,
		pair: &mut RotationPair,
		session: &Arc<MtlsSession>,
		ct: &CancellationToken,
	) -> Result<(RotationTarget, Arc<WorkloadCertificate>), RotationError> {
		// Preparation: build a replacement entity with freshly fetched,
		// freshly validated material.
		pair.phase = RotationPhase::Preparation;
		let prepared = tokio::select! {
			_ = ct.cancelled() => {
				return Err(RotationError::new(RotationPhase::Preparation, "cancelled"));
			},
			r = tokio::time::timeout(self.policy.preparation_timeout, self.prepare(&pair.old, ct)) => {
				r.map_err(|_| RotationError::new(RotationPhase::Preparation, "timed out"))??
			},
		};
		let (new_target, new_cert) = prepared;
		pair.new = Some(new_target.clone());
		pair.new_cert = Some(new_cert.clone());

		// Overlap: both entities live; exercise the new one until the window
		// closes. Cancellation here skips ahead to completion so the old
		// entity still drains gracefully.
		pair.phase = RotationPhase::Overlap;
		let deadline = Instant::now() + self.policy.overlap_duration;
		let mut cancelled_in_overlap = false;
		loop {
			let now = Instant::now();
			if now >= deadline {
				break;
			}
			let step = self.policy.overlap_check_interval.min(deadline - now);
			tokio::select! {
				_ = ct.cancelled() => {
					cancelled_in_overlap = true;
					break;
				},
				_ = tokio::time::sleep(step) => {},
			}
			new_target
				.health_check()
				.await
				.map_err(|e| RotationError::new(RotationPhase::Overlap, e.to_string()))?;
			self
				.validator
				.validate(Some(&new_cert), &ValidationOptions::expiry_only())
				.map_err(|e| RotationError::new(RotationPhase::Overlap, e.to_string()))?;
		}

		// Validation: the last gate before the swap.
		if !cancelled_in_overlap {
			pair.phase = RotationPhase::Validation;
			let validation = async {
				new_target
					.health_check()
					.await
					.map_err(|e| RotationError::new(RotationPhase::Validation, e.to_string()))?;
				self
					.validator
					.validate(Some(&new_cert), &ValidationOptions::expiry_only())
					.map_err(|e| RotationError::new(RotationPhase::Validation, e.to_string()))
			};
			tokio::select! {
				_ = ct.cancelled() => {
					return Err(RotationError::new(RotationPhase::Validation, "cancelled"));
				},
				r = tokio::time::timeout(self.policy.validation_timeout, validation) => {
					r.map_err(|_| RotationError::new(RotationPhase::Validation, "timed out"))??
				},
			}
		}

		// Completion: drain the old entity and swap. A stubborn old entity is
		// forcibly abandoned after the grace period; the swap still happens.
		pair.phase = RotationPhase::Completion;
		if let Err(e) = pair
			.old
			.shutdown(self.policy.graceful_shutdown_timeout)
			.await
		{
			warn!(
				session = %session.id(),
				rotation = %pair.rotation_id,
				"old entity did not stop cleanly: {e}"
			);
		}
		Ok((new_target, new_cert))
	}

	async fn prepare(
		&self,
		old: &RotationTarget,
		ct: &CancellationToken,
	) -> Result<(RotationTarget, Arc<WorkloadCertificate>), RotationError> {
		let material = self
			.source
			.identity_material(ct)
			.await
			.map_err(|e| RotationError::new(RotationPhase::Preparation, e.to_string()))?;
		let cert = material.cert.clone();
		let target = match old {
			RotationTarget::Server(_) => RotationTarget::Server(
				self
					.transport
					.create_server(material)
					.await
					.map_err(|e| RotationError::new(RotationPhase::Preparation, e.to_string()))?,
			),
			RotationTarget::Client(_) => RotationTarget::Client(
				self
					.transport
					.create_client(material)
					.await
					.map_err(|e| RotationError::new(RotationPhase::Preparation, e.to_string()))?,
			),
		};
		Ok((target, cert))
	}

	fn record(&self, outcome: RotationOutcomeLabel) {
		if let Some(m) = &self.metrics {
			m.rotations.get_or_create(&RotationLabels { outcome }).inc();
		}
	}
}

impl Debug for RotationController {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RotationController")
			.field("policy", &self.policy)
			.field("available_permits", &self.permits.available_permits())
			.finish_non_exhaustive()
	}
}
