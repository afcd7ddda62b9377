use std::collections::HashMap;

use ephemos_core::prelude::*;
use tokio_util::sync::CancellationToken;

use crate::connection::rotation::{RotationController, RotationOutcome, RotationTarget};
use crate::connection::{
	ConnectionState, MtlsSession, ObserverSet, RotationObserver, RotationReason,
};
use crate::identity::{Identity, ServiceIdentity, WorkloadCertificate};
use crate::transport::TlsState;

/// When a live session's certificate must be rotated.
#[derive(Debug, Clone)]
pub struct RotationPolicy {
	/// Rotate once this little validity remains.
	pub pre_rotation_threshold: Duration,
	/// Rotate regardless once the material has been in use this long.
	pub force_rotation_interval: Duration,
}

impl Default for RotationPolicy {
	fn default() -> Self {
		RotationPolicy {
			pre_rotation_threshold: Duration::from_secs(15 * 60),
			force_rotation_interval: Duration::from_secs(30 * 60),
		}
	}
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
	pub monitor_interval: Duration,
	pub rotation: RotationPolicy,
}

impl Default for RegistryConfig {
	fn default() -> Self {
		RegistryConfig {
			monitor_interval: Duration::from_secs(60),
			rotation: RotationPolicy::default(),
		}
	}
}

struct SessionEntry {
	session: Arc<MtlsSession>,
	entity: RotationTarget,
	monitor: tokio::task::JoinHandle<()>,
}

/// ConnectionRegistry tracks every live mTLS session, monitors each for
/// rotation pressure, and fans rotation events out to observers.
pub struct ConnectionRegistry {
	sessions: parking_lot::RwLock<HashMap<Strng, SessionEntry>>,
	observers: Arc<ObserverSet>,
	rotations: Arc<RotationController>,
	cfg: RegistryConfig,
	cancel: CancellationToken,
}

impl ConnectionRegistry {
	pub fn new(cfg: RegistryConfig, rotations: Arc<RotationController>) -> Arc<ConnectionRegistry> {
		Arc::new(ConnectionRegistry {
			sessions: Default::default(),
			observers: rotations.observers().clone(),
			rotations,
			cfg,
			cancel: CancellationToken::new(),
		})
	}

	/// Records a freshly established session and starts monitoring it.
	pub fn establish_connection(
		self: &Arc<Self>,
		id: Strng,
		remote: Identity,
		cert: Arc<WorkloadCertificate>,
		local: ServiceIdentity,
		tls: TlsState,
		entity: RotationTarget,
	) -> Arc<MtlsSession> {
		let session = MtlsSession::new(id.clone(), local, remote, cert, tls);
		let monitor = tokio::spawn(Arc::clone(self).monitor(id.clone()));
		let entry = SessionEntry {
			session: session.clone(),
			entity,
			monitor,
		};
		if let Some(old) = self.sessions.write().insert(id.clone(), entry) {
			// A reused id replaces the previous session outright.
			warn!(session = %id, "replacing existing session with the same id");
			old.monitor.abort();
			old.session.close();
		}
		debug!(session = %id, remote = %session.remote_identity(), "session established");
		session
	}

	pub fn get_connection(&self, id: &str) -> Option<Arc<MtlsSession>> {
		self.sessions.read().get(id).map(|e| e.session.clone())
	}

	pub fn list_connections(&self) -> Vec<Arc<MtlsSession>> {
		self
			.sessions
			.read()
			.values()
			.map(|e| e.session.clone())
			.collect()
	}

	/// Closes and forgets a session. Closing an unknown or already-closed id
	/// succeeds as a no-op.
	pub fn close_connection(&self, id: &str) -> bool {
		let Some(entry) = self.sessions.write().remove(id) else {
			return false;
		};
		entry.monitor.abort();
		entry.session.close();
		debug!(session = %id, "session closed");
		true
	}

	pub fn register_observer(&self, observer: Arc<dyn RotationObserver>) {
		self.observers.register(observer);
	}

	pub fn unregister_observer(&self, observer: &Arc<dyn RotationObserver>) {
		self.observers.unregister(observer);
	}

	pub fn rotation_controller(&self) -> &Arc<RotationController> {
		&self.rotations
	}

	/// Stops all monitors and closes every session.
	pub fn shutdown(&self) {
		self.cancel.cancel();
		let mut sessions = self.sessions.write();
		for (_, entry) in sessions.drain() {
			entry.monitor.abort();
			entry.session.close();
		}
	}

	async fn monitor(self: Arc<Self>, id: Strng) {
		let mut interval = tokio::time::interval(self.cfg.monitor_interval);
		interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		// The first tick fires immediately; the session was just established.
		interval.tick().await;
		loop {
			tokio::select! {
				_ = self.cancel.cancelled() => return,
				_ = interval.tick() => {},
			}
			if !self.check_and_rotate(&id).await {
				return;
			}
		}
	}

	/// One monitor tick: consult the rotation policy and trigger the
	/// continuity controller when rotation is due. Returns false once the
	/// session is gone and the monitor should stop.
	async fn check_and_rotate(&self, id: &Strng) -> bool {
		let Some((session, entity)) = self
			.sessions
			.read()
			.get(id)
			.map(|e| (e.session.clone(), e.entity.clone()))
		else {
			return false;
		};
		match session.state() {
			ConnectionState::Closed => return false,
			ConnectionState::Rotating => return true,
			ConnectionState::Active | ConnectionState::Failed => {},
		}
		let Some(reason) = self.should_rotate(&session) else {
			return true;
		};
		let outcome = self
			.rotations
			.rotate(&session, entity, reason, &self.cancel)
			.await;
		if let RotationOutcome::Completed(new_entity) = outcome {
			// Future rotations must work on the entity that is now live.
			if let Some(entry) = self.sessions.write().get_mut(id) {
				entry.entity = new_entity;
			}
		}
		true
	}

	fn should_rotate(&self, session: &MtlsSession) -> Option<RotationReason> {
		if session.state() == ConnectionState::Failed {
			return Some(RotationReason::FailedState);
		}
		let policy = &self.cfg.rotation;
		if session
			.certificate()
			.is_expiring_within(policy.pre_rotation_threshold)
		{
			return Some(RotationReason::NearExpiry);
		}
		if session.age_since_rotation() >= policy.force_rotation_interval {
			return Some(RotationReason::ForceInterval);
		}
		None
	}
}

impl Drop for ConnectionRegistry {
	fn drop(&mut self) {
		self.cancel.cancel();
		for (_, entry) in self.sessions.write().drain() {
			entry.monitor.abort();
			entry.session.close();
		}
	}
}

impl Debug for ConnectionRegistry {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ConnectionRegistry")
			.field("sessions", &self.sessions.read().len())
			.field("monitor_interval", &self.cfg.monitor_interval)
			.finish_non_exhaustive()
	}
}
