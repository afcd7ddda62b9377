use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::control::{
	AgentError, IdentityProvider, IdentityWatch, IdentityWatchSender,
};
use crate::identity::{ServiceIdentity, TrustBundle, WorkloadCertificate};
use crate::testing::TestCa;

/// A scripted response for an upcoming `get_certificate` call. When the plan
/// queue is empty the agent mints a cert with its current URI and validity.
pub enum Planned {
	Fail(String),
	Validity(Duration),
	Expired,
}

/// MockAgent plays the identity agent: it mints real SVIDs from a [`TestCa`]
/// on demand, can be scripted to fail or to hand out unusual certificates,
/// and counts every call.
pub struct MockAgent {
	ca: Arc<TestCa>,
	issuer: parking_lot::Mutex<Arc<TestCa>>,
	identity: ServiceIdentity,
	uri: parking_lot::Mutex<String>,
	validity: parking_lot::Mutex<Duration>,
	planned: parking_lot::Mutex<VecDeque<Planned>>,
	cert_calls: AtomicU32,
	bundle_calls: AtomicU32,
	closed: AtomicBool,
	watch: parking_lot::Mutex<Option<IdentityWatchSender>>,
}

impl MockAgent {
	pub fn new(ca: Arc<TestCa>, identity: &ServiceIdentity) -> Arc<MockAgent> {
		Arc::new(MockAgent {
			issuer: parking_lot::Mutex::new(ca.clone()),
			ca,
			identity: identity.clone(),
			uri: parking_lot::Mutex::new(identity.uri().to_string()),
			validity: parking_lot::Mutex::new(Duration::from_secs(3600)),
			planned: Default::default(),
			cert_calls: AtomicU32::new(0),
			bundle_calls: AtomicU32::new(0),
			closed: AtomicBool::new(false),
			watch: Default::default(),
		})
	}

	/// Certificates minted from now on carry this URI SAN.
	pub fn set_uri(&self, uri: &str) {
		*self.uri.lock() = uri.to_string();
	}

	/// Certificates minted from now on are signed by this CA, while the trust
	/// bundle keeps anchoring the original one.
	pub fn set_issuer(&self, ca: Arc<TestCa>) {
		*self.issuer.lock() = ca;
	}

	pub fn set_validity(&self, validity: Duration) {
		*self.validity.lock() = validity;
	}

	/// The next `n` certificate fetches fail with a transient error.
	pub fn plan_fail(&self, n: u32, msg: &str) {
		let mut planned = self.planned.lock();
		for _ in 0..n {
			planned.push_back(Planned::Fail(msg.to_string()));
		}
	}

	/// The next certificate fetch succeeds with this validity.
	pub fn plan_validity(&self, validity: Duration) {
		self.planned.lock().push_back(Planned::Validity(validity));
	}

	/// The next certificate fetch returns an already-expired certificate.
	pub fn plan_expired(&self) {
		self.planned.lock().push_back(Planned::Expired);
	}

	pub fn cert_calls(&self) -> u32 {
		self.cert_calls.load(Ordering::Relaxed)
	}

	pub fn bundle_calls(&self) -> u32 {
		self.bundle_calls.load(Ordering::Relaxed)
	}

	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::Relaxed)
	}

	/// Pushes a certificate through the watch stream, as an agent with push
	/// support would on rotation.
	pub fn push_update(&self, cert: Arc<WorkloadCertificate>) {
		if let Some(tx) = self.watch.lock().as_ref() {
			tx.offer(cert);
		}
	}

	fn issuer(&self) -> Arc<TestCa> {
		self.issuer.lock().clone()
	}

	fn mint(&self) -> WorkloadCertificate {
		self.issuer().issue(&self.uri.lock(), *self.validity.lock())
	}
}

#[async_trait]
impl IdentityProvider for MockAgent {
	async fn get_service_identity(&self) -> Result<ServiceIdentity, AgentError> {
		Ok(self.identity.clone())
	}

	async fn get_certificate(&self) -> Result<WorkloadCertificate, AgentError> {
		self.cert_calls.fetch_add(1, Ordering::Relaxed);
		match self.planned.lock().pop_front() {
			Some(Planned::Fail(msg)) => Err(AgentError::Unavailable(msg)),
			Some(Planned::Validity(validity)) => Ok(self.issuer().issue(&self.uri.lock(), validity)),
			Some(Planned::Expired) => Ok(self.issuer().issue_expired(&self.uri.lock())),
			None => Ok(self.mint()),
		}
	}

	async fn get_trust_bundle(&self) -> Result<TrustBundle, AgentError> {
		self.bundle_calls.fetch_add(1, Ordering::Relaxed);
		Ok(self.ca.bundle())
	}

	async fn watch_identity_changes(&self) -> Result<IdentityWatch, AgentError> {
		let (tx, rx) = IdentityWatch::channel();
		*self.watch.lock() = Some(tx);
		Ok(rx)
	}

	async fn close(&self) -> Result<(), AgentError> {
		self.closed.store(true, Ordering::Relaxed);
		Ok(())
	}
}

impl std::fmt::Debug for MockAgent {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("MockAgent")
			.field("identity", &self.identity.uri())
			.field("cert_calls", &self.cert_calls())
			.finish_non_exhaustive()
	}
}
