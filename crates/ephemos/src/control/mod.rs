use std::fmt::Debug;

use async_trait::async_trait;
use ephemos_core::prelude::*;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_stream::wrappers::ReceiverStream;

use crate::identity::{ServiceIdentity, TrustBundle, WorkloadCertificate};

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
	#[error("identity agent unavailable: {0}")]
	Unavailable(String),
	#[error("agent protocol: {0}")]
	Protocol(String),
	#[error("{service}: agent fetch failed after {attempts} attempts: {source}")]
	RetriesExhausted {
		service: Strng,
		attempts: u32,
		#[source]
		source: Box<AgentError>,
	},
	#[error("{service}: agent fetch cancelled")]
	Cancelled { service: Strng },
}

/// How many pushed certificate updates may sit unconsumed before the newest
/// are dropped.
pub const IDENTITY_WATCH_DEPTH: usize = 10;

/// IdentityProvider is the port to the local identity agent. Implementations
/// connect to a Unix-domain socket (conventionally `/run/sockets/agent.sock`
/// or `/tmp/spire-agent/public/api.sock`) and speak whatever protocol the
/// agent offers; the wire protocol is not this crate's concern.
///
/// Implementations must be safe to call from many tasks concurrently.
#[async_trait]
pub trait IdentityProvider: Send + Sync + Debug {
	async fn get_service_identity(&self) -> Result<ServiceIdentity, AgentError>;
	async fn get_certificate(&self) -> Result<WorkloadCertificate, AgentError>;
	async fn get_trust_bundle(&self) -> Result<TrustBundle, AgentError>;
	/// Stream of replacement certificates pushed by the agent. Providers that
	/// cannot push return a stream that ends immediately.
	async fn watch_identity_changes(&self) -> Result<IdentityWatch, AgentError> {
		Ok(IdentityWatch::disabled())
	}
	async fn close(&self) -> Result<(), AgentError>;
}

/// Consumer half of the agent push stream.
#[derive(Debug)]
pub struct IdentityWatch {
	rx: mpsc::Receiver<Arc<WorkloadCertificate>>,
}

impl IdentityWatch {
	pub fn channel() -> (IdentityWatchSender, IdentityWatch) {
		let (tx, rx) = mpsc::channel(IDENTITY_WATCH_DEPTH);
		(IdentityWatchSender { tx }, IdentityWatch { rx })
	}

	/// A watch that never yields, for providers without push support.
	pub fn disabled() -> IdentityWatch {
		let (_, rx) = mpsc::channel(1);
		IdentityWatch { rx }
	}

	pub async fn recv(&mut self) -> Option<Arc<WorkloadCertificate>> {
		self.rx.recv().await
	}

	pub fn into_stream(self) -> ReceiverStream<Arc<WorkloadCertificate>> {
		ReceiverStream::new(self.rx)
	}
}

/// Producer half of the agent push stream.
#[derive(Debug, Clone)]
pub struct IdentityWatchSender {
	tx: mpsc::Sender<Arc<WorkloadCertificate>>,
}

impl IdentityWatchSender {
	/// Enqueue an update without blocking. A slow consumer loses the newest
	/// update rather than stalling the agent reader.
	pub fn offer(&self, cert: Arc<WorkloadCertificate>) {
		match self.tx.try_send(cert) {
			Ok(()) => {},
			Err(TrySendError::Full(cert)) => {
				warn!(
					identity = cert.to_spiffe_id().map(|i| i.to_string()).as_deref(),
					queue_depth = IDENTITY_WATCH_DEPTH,
					"identity watch queue full, dropping update"
				);
			},
			Err(TrySendError::Closed(_)) => {
				debug!("identity watch consumer is gone");
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn disabled_watch_ends_immediately() {
		let mut watch = IdentityWatch::disabled();
		assert!(watch.recv().await.is_none());
	}
}
