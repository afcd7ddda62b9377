use async_trait::async_trait;
use ephemos_core::prelude::*;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::connection::CertificateSource;
use crate::control::{AgentError, IdentityProvider};
use crate::identity::cache::{CacheConfig, CacheError, CacheMetrics, IdentityCache};
use crate::identity::policy::{AuthenticationPolicy, PolicyError};
use crate::identity::validator::{CertValidator, ValidationOptions, Validator};
use crate::identity::{
	CertificateError, ServiceIdentity, TrustBundle, ValidationError, WorkloadCertificate,
};
use crate::metrics::Metrics;
use crate::transport::{
	IdentityClient, IdentityMaterial, IdentityServer, Transport, TransportError,
};

/// Warn once less than this much validity remains on a freshly read cert.
const DEFAULT_EXPIRY_WARNING: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
	#[error(transparent)]
	Validation(#[from] ValidationError),
	#[error("{service}: certificate validation failed: {source}")]
	Certificate {
		service: Strng,
		#[source]
		source: CertificateError,
	},
	#[error(transparent)]
	Agent(#[from] AgentError),
	#[error(transparent)]
	Policy(#[from] PolicyError),
	#[error("{service}: transport: {source}")]
	Transport {
		service: Strng,
		#[source]
		source: TransportError,
	},
}

impl From<CacheError> for IdentityError {
	fn from(e: CacheError) -> Self {
		match e {
			CacheError::Validation(v) => IdentityError::Validation(v),
			CacheError::Agent(a) => IdentityError::Agent(a),
		}
	}
}

/// IdentityService owns the process identity and assembles transport-ready
/// `(cert, bundle, policy)` tuples from the cache, the validator, and the
/// authorization policy. One instance per process identity; tests
/// instantiate as many as they need.
pub struct IdentityService {
	identity: ServiceIdentity,
	provider: Arc<dyn IdentityProvider>,
	transport: Arc<dyn Transport>,
	validator: Arc<dyn CertValidator>,
	policy: Arc<AuthenticationPolicy>,
	cache: Arc<IdentityCache>,
	cache_cfg: CacheConfig,
	metrics: Option<Arc<Metrics>>,
	warning_threshold: Duration,
	cancel: CancellationToken,
}

impl IdentityService {
	/// Builds the service from configuration carrying an explicit trust
	/// domain. Invalid configuration is rejected here, not at first use.
	pub fn new(
		cfg: &Config,
		provider: Arc<dyn IdentityProvider>,
		transport: Arc<dyn Transport>,
	) -> Result<IdentityService, IdentityError> {
		let Some(domain) = &cfg.trust_domain else {
			return Err(IdentityError::Validation(ValidationError::new(
				"service.domain",
				"",
				"no trust domain configured; use from_agent to resolve it from the agent",
			)));
		};
		let identity = ServiceIdentity::new(&cfg.service_name, domain.as_str())?;
		Self::with_identity(identity, cfg, provider, transport)
	}

	/// Like `new`, but resolves the identity from the agent when the
	/// configuration does not pin a trust domain.
	pub async fn from_agent(
		cfg: &Config,
		provider: Arc<dyn IdentityProvider>,
		transport: Arc<dyn Transport>,
	) -> Result<IdentityService, IdentityError> {
		let identity = match &cfg.trust_domain {
			Some(domain) => ServiceIdentity::new(&cfg.service_name, domain.as_str())?,
			None => provider.get_service_identity().await?,
		};
		Self::with_identity(identity, cfg, provider, transport)
	}

	fn with_identity(
		identity: ServiceIdentity,
		cfg: &Config,
		provider: Arc<dyn IdentityProvider>,
		transport: Arc<dyn Transport>,
	) -> Result<IdentityService, IdentityError> {
		let policy = Arc::new(build_policy(&identity, cfg)?);
		let validator: Arc<dyn CertValidator> = Arc::new(Validator::default());
		let cache_cfg = CacheConfig {
			service: cfg.service_name.clone(),
			socket_path: cfg.socket_path.clone(),
			ttl: cfg.cache_ttl,
			proactive_refresh: cfg.proactive_refresh,
		};
		let cache = Arc::new(IdentityCache::new(
			cache_cfg.clone(),
			provider.clone(),
			validator.clone(),
		)?);
		info!(identity = %identity, "identity service initialized");
		Ok(IdentityService {
			identity,
			provider,
			transport,
			validator,
			policy,
			cache,
			cache_cfg,
			metrics: None,
			warning_threshold: DEFAULT_EXPIRY_WARNING,
			cancel: CancellationToken::new(),
		})
	}

	/// Replaces the validator (a test seam). Resets the cache, which consults
	/// the validator on every read.
	pub fn with_validator(mut self, validator: Arc<dyn CertValidator>) -> IdentityService {
		self.validator = validator;
		self.rebuild_cache();
		self
	}

	pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> IdentityService {
		self.metrics = Some(metrics);
		self.rebuild_cache();
		self
	}

	fn rebuild_cache(&mut self) {
		let cache = IdentityCache::new(
			self.cache_cfg.clone(),
			self.provider.clone(),
			self.validator.clone(),
		)
		.expect("cache config was already validated");
		self.cache = Arc::new(match &self.metrics {
			Some(m) => cache.with_metrics(m.clone()),
			None => cache,
		});
	}

	pub fn identity(&self) -> &ServiceIdentity {
		&self.identity
	}

	pub fn policy(&self) -> &Arc<AuthenticationPolicy> {
		&self.policy
	}

	pub fn cancellation_token(&self) -> CancellationToken {
		self.cancel.clone()
	}

	/// A ready-to-serve mTLS server bound to the process identity.
	pub async fn create_server_identity(&self) -> Result<Arc<dyn IdentityServer>, IdentityError> {
		let material = self.material(&self.cancel).await?;
		self
			.transport
			.create_server(material)
			.await
			.map_err(|source| IdentityError::Transport {
				service: self.identity.name().clone(),
				source,
			})
	}

	/// A connect-ready mTLS client bound to the process identity.
	pub async fn create_client_identity(&self) -> Result<Arc<dyn IdentityClient>, IdentityError> {
		let material = self.material(&self.cancel).await?;
		self
			.transport
			.create_client(material)
			.await
			.map_err(|source| IdentityError::Transport {
				service: self.identity.name().clone(),
				source,
			})
	}

	/// The validated workload certificate, for consumers that manage their
	/// own TLS setup.
	pub async fn get_certificate(&self) -> Result<Arc<WorkloadCertificate>, IdentityError> {
		Ok(self.material(&self.cancel).await?.cert)
	}

	pub async fn get_trust_bundle(&self) -> Result<Arc<TrustBundle>, IdentityError> {
		Ok(self.cache.trust_bundle(&self.cancel).await?)
	}

	pub fn cache_metrics(&self) -> CacheMetrics {
		self.cache.cache_metrics()
	}

	/// Bridges the agent's push stream into the cache. Pushed certificates
	/// are validated like fetched ones; invalid updates are dropped with a
	/// warning. The task ends when the service shuts down or the agent stops
	/// pushing.
	pub async fn spawn_watch_task(
		self: &Arc<Self>,
	) -> Result<tokio::task::JoinHandle<()>, IdentityError> {
		let mut watch = self.provider.watch_identity_changes().await?;
		let svc = self.clone();
		Ok(tokio::spawn(async move {
			loop {
				let next = tokio::select! {
					_ = svc.cancel.cancelled() => return,
					next = watch.recv() => next,
				};
				let Some(cert) = next else {
					debug!(identity = %svc.identity, "identity watch stream ended");
					return;
				};
				svc.accept_pushed_certificate(cert).await;
			}
		}))
	}

	async fn accept_pushed_certificate(&self, cert: Arc<WorkloadCertificate>) {
		let bundle = match self.cache.trust_bundle(&self.cancel).await {
			Ok(b) => b,
			Err(e) => {
				warn!(identity = %self.identity, "dropping pushed certificate, no trust bundle: {e}");
				return;
			},
		};
		let opts = ValidationOptions::full(&self.identity, &bundle, self.warning_threshold);
		match self.validator.validate(Some(&cert), &opts) {
			Ok(()) => {
				info!(
					identity = %self.identity,
					serial = cert.leaf().serial.as_str(),
					"installed agent-pushed certificate"
				);
				self.cache.store_certificate(cert).await;
			},
			Err(e) => {
				warn!(identity = %self.identity, "dropping invalid pushed certificate: {e}");
			},
		}
	}

	async fn material(&self, ct: &CancellationToken) -> Result<IdentityMaterial, IdentityError> {
		let bundle = self.cache.trust_bundle(ct).await?;
		let cert = self.cache.certificate(ct).await?;
		let opts = ValidationOptions::full(&self.identity, &bundle, self.warning_threshold);
		if let Err(source) = self.validator.validate(Some(&cert), &opts) {
			// Fatal for this call, but clearing the slot lets the next call
			// fetch a replacement instead of re-serving the bad cert.
			self.cache.clear_certificate().await;
			return Err(IdentityError::Certificate {
				service: self.identity.name().clone(),
				source,
			});
		}
		Ok(IdentityMaterial {
			cert,
			bundle,
			policy: self.policy.clone(),
		})
	}

	/// Cancels outstanding work and releases the agent connection.
	pub async fn shutdown(&self) {
		self.cancel.cancel();
		if let Err(e) = self.provider.close().await {
			warn!(identity = %self.identity, "agent close failed: {e}");
		}
	}
}

#[async_trait]
impl CertificateSource for IdentityService {
	fn local_identity(&self) -> ServiceIdentity {
		self.identity.clone()
	}

	async fn identity_material(
		&self,
		ct: &CancellationToken,
	) -> Result<IdentityMaterial, IdentityError> {
		self.material(ct).await
	}
}

impl Debug for IdentityService {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("IdentityService")
			.field("identity", &self.identity.uri())
			.finish_non_exhaustive()
	}
}

/// Default authorization: explicit lists when configured, otherwise
/// trust-domain membership when a domain was pinned, otherwise any valid SVID.
fn build_policy(identity: &ServiceIdentity, cfg: &Config) -> Result<AuthenticationPolicy, PolicyError> {
	if !cfg.authorized_clients.is_empty() || !cfg.trusted_servers.is_empty() {
		return AuthenticationPolicy::builder(identity.clone())
			.authorized_clients(cfg.authorized_clients.iter().cloned())
			.trusted_servers(cfg.trusted_servers.iter().cloned())
			.build();
	}
	if cfg.trust_domain.is_some() {
		return Ok(AuthenticationPolicy::same_trust_domain(identity.clone()));
	}
	Ok(AuthenticationPolicy::any_valid(identity.clone()))
}
