use std::time::SystemTime;

use ephemos_core::prelude::*;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::connection::registry::ConnectionRegistry;
use crate::connection::{ConnectionState, MtlsSession};
use crate::metrics::{Metrics, ViolationLabels};

#[derive(Debug, Clone, thiserror::Error)]
#[error("invariant {invariant} violated for session {session}: {detail}")]
pub struct InvariantViolation {
	pub session: Strng,
	pub invariant: &'static str,
	pub detail: String,
}

fn violated(session: &MtlsSession, invariant: &'static str, detail: impl Into<String>) -> InvariantViolation {
	InvariantViolation {
		session: session.id().clone(),
		invariant,
		detail: detail.into(),
	}
}

/// Ambient facts a check may consult.
#[derive(Debug, Clone)]
pub struct CheckContext {
	pub now: SystemTime,
	pub pre_rotation_threshold: Duration,
	/// A session must not go longer than this without fresh material.
	pub max_rotation_age: Duration,
}

/// A security property every live session must satisfy.
pub trait Invariant: Send + Sync {
	fn name(&self) -> &'static str;
	fn check(&self, session: &MtlsSession, cx: &CheckContext) -> Result<(), InvariantViolation>;
}

/// NotBefore <= now <= NotAfter for the session's current certificate.
pub struct CertificateValidity;

impl Invariant for CertificateValidity {
	fn name(&self) -> &'static str {
		"certificate_validity"
	}

	fn check(&self, session: &MtlsSession, cx: &CheckContext) -> Result<(), InvariantViolation> {
		let cert = session.certificate();
		let expiry = cert.expiry();
		if cx.now < expiry.not_before {
			return Err(violated(session, self.name(), "certificate not yet valid"));
		}
		if cx.now > expiry.not_after {
			return Err(violated(session, self.name(), "certificate expired"));
		}
		Ok(())
	}
}

/// The TLS layer completed the handshake and the peer presented a certificate.
pub struct MutualAuthentication;

impl Invariant for MutualAuthentication {
	fn name(&self) -> &'static str {
		"mutual_authentication"
	}

	fn check(&self, session: &MtlsSession, _cx: &CheckContext) -> Result<(), InvariantViolation> {
		let tls = session.tls_state();
		if !tls.handshake_complete {
			return Err(violated(session, self.name(), "handshake not complete"));
		}
		if tls.peer_certificates.is_empty() {
			return Err(violated(session, self.name(), "peer presented no certificates"));
		}
		Ok(())
	}
}

/// Both endpoints carry a non-empty trust domain.
pub struct TrustDomainValidity;

impl Invariant for TrustDomainValidity {
	fn name(&self) -> &'static str {
		"trust_domain_validity"
	}

	fn check(&self, session: &MtlsSession, _cx: &CheckContext) -> Result<(), InvariantViolation> {
		if session.local_identity().trust_domain().as_str().is_empty() {
			return Err(violated(session, self.name(), "local trust domain is empty"));
		}
		if session.remote_identity().trust_domain().as_str().is_empty() {
			return Err(violated(session, self.name(), "remote trust domain is empty"));
		}
		Ok(())
	}
}

/// Expiring sessions must be rotating, and no session may run on old material.
pub struct RotationFreshness;

impl Invariant for RotationFreshness {
	fn name(&self) -> &'static str {
		"rotation_freshness"
	}

	fn check(&self, session: &MtlsSession, cx: &CheckContext) -> Result<(), InvariantViolation> {
		let cert = session.certificate();
		if cert.is_expiring_within(cx.pre_rotation_threshold)
			&& session.state() != ConnectionState::Rotating
		{
			return Err(violated(
				session,
				self.name(),
				"certificate near expiry but session is not rotating",
			));
		}
		if session.age_since_rotation() > cx.max_rotation_age {
			return Err(violated(
				session,
				self.name(),
				"session exceeded the maximum age without rotation",
			));
		}
		Ok(())
	}
}

/// The certificate's URI SAN names the session's local identity.
pub struct IdentityMatching;

impl Invariant for IdentityMatching {
	fn name(&self) -> &'static str {
		"identity_matching"
	}

	fn check(&self, session: &MtlsSession, _cx: &CheckContext) -> Result<(), InvariantViolation> {
		let cert = session.certificate();
		match cert.to_spiffe_id() {
			None => Err(violated(session, self.name(), "certificate has no spiffe identity")),
			Some(id) if id != session.local_identity().uri() => Err(violated(
				session,
				self.name(),
				format!(
					"certificate identity {id} does not match local identity {}",
					session.local_identity().uri()
				),
			)),
			Some(_) => Ok(()),
		}
	}
}

pub fn default_invariants() -> Vec<Arc<dyn Invariant>> {
	vec![
		Arc::new(CertificateValidity),
		Arc::new(MutualAuthentication),
		Arc::new(TrustDomainValidity),
		Arc::new(RotationFreshness),
		Arc::new(IdentityMatching),
	]
}

/// What to do once a session has accumulated `max_violations`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ViolationPolicy {
	#[default]
	LogOnly,
	AlertOnly,
	CloseConnection,
	RestartService,
}

#[derive(Debug, Clone)]
pub struct EnforcerConfig {
	pub interval: Duration,
	pub max_violations: u32,
	pub policy: ViolationPolicy,
	pub pre_rotation_threshold: Duration,
	pub max_rotation_age: Duration,
}

impl Default for EnforcerConfig {
	fn default() -> Self {
		EnforcerConfig {
			interval: Duration::from_secs(30),
			max_violations: 3,
			policy: ViolationPolicy::default(),
			pre_rotation_threshold: Duration::from_secs(15 * 60),
			max_rotation_age: Duration::from_secs(60 * 60),
		}
	}
}

/// InvariantEnforcer periodically sweeps every live session against the
/// registered invariants. Violations never surface on the request path; they
/// are logged, counted, and acted on per the violation policy.
pub struct InvariantEnforcer {
	registry: Arc<ConnectionRegistry>,
	invariants: Vec<Arc<dyn Invariant>>,
	cfg: EnforcerConfig,
	metrics: Option<Arc<Metrics>>,
	/// Host restart requests are delivered here under the RestartService policy.
	restart: Option<mpsc::Sender<Strng>>,
	cancel: CancellationToken,
}

impl InvariantEnforcer {
	pub fn new(registry: Arc<ConnectionRegistry>, cfg: EnforcerConfig) -> Self {
		InvariantEnforcer {
			registry,
			invariants: default_invariants(),
			cfg,
			metrics: None,
			restart: None,
			cancel: CancellationToken::new(),
		}
	}

	pub fn with_invariants(mut self, invariants: Vec<Arc<dyn Invariant>>) -> Self {
		self.invariants = invariants;
		self
	}

	pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
		self.metrics = Some(metrics);
		self
	}

	pub fn with_restart_signal(mut self, tx: mpsc::Sender<Strng>) -> Self {
		self.restart = Some(tx);
		self
	}

	pub fn cancellation_token(&self) -> CancellationToken {
		self.cancel.clone()
	}

	pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
		tokio::spawn(async move {
			let mut interval = tokio::time::interval(self.cfg.interval);
			interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
			interval.tick().await;
			loop {
				tokio::select! {
					_ = self.cancel.cancelled() => return,
					_ = interval.tick() => {},
				}
				self.sweep().await;
			}
		})
	}

	/// One pass over every live session. Returns the violations found.
	pub async fn sweep(&self) -> Vec<InvariantViolation> {
		let cx = CheckContext {
			now: SystemTime::now(),
			pre_rotation_threshold: self.cfg.pre_rotation_threshold,
			max_rotation_age: self.cfg.max_rotation_age,
		};
		let mut found = Vec::new();
		for session in self.registry.list_connections() {
			if session.state() == ConnectionState::Closed {
				continue;
			}
			for invariant in &self.invariants {
				if let Err(violation) = invariant.check(&session, &cx) {
					self.handle(&session, &violation);
					found.push(violation);
				}
			}
		}
		found
	}

	fn handle(&self, session: &Arc<MtlsSession>, violation: &InvariantViolation) {
		if let Some(m) = &self.metrics {
			m.invariant_violations
				.get_or_create(&ViolationLabels {
					invariant: violation.invariant.into(),
				})
				.inc();
		}
		let count = session.record_violation();
		if count < self.cfg.max_violations {
			debug!(
				session = %violation.session,
				invariant = violation.invariant,
				count,
				"invariant violation recorded"
			);
			return;
		}
		match self.cfg.policy {
			ViolationPolicy::LogOnly => {
				warn!(
					session = %violation.session,
					invariant = violation.invariant,
					count,
					"{violation}"
				);
			},
			ViolationPolicy::AlertOnly => {
				error!(
					target: "ephemos::alert",
					session = %violation.session,
					invariant = violation.invariant,
					count,
					"{violation}"
				);
			},
			ViolationPolicy::CloseConnection => {
				warn!(
					session = %violation.session,
					invariant = violation.invariant,
					"closing session after repeated violations"
				);
				self.registry.close_connection(&violation.session);
			},
			ViolationPolicy::RestartService => {
				error!(
					session = %violation.session,
					invariant = violation.invariant,
					"signaling host restart after repeated violations"
				);
				if let Some(tx) = &self.restart {
					let _ = tx.try_send(violation.session.clone());
				}
			},
		}
	}
}

impl Debug for InvariantEnforcer {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("InvariantEnforcer")
			.field("interval", &self.cfg.interval)
			.field("policy", &self.cfg.policy)
			.field("invariants", &self.invariants.len())
			.finish_non_exhaustive()
	}
}
