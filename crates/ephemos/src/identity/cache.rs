use std::sync::atomic::{AtomicU64, Ordering};

use ephemos_core::prelude::*;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::control::{AgentError, IdentityProvider};
use crate::identity::validator::{CertValidator, ValidationOptions};
use crate::identity::{CertificateError, TrustBundle, ValidationError, WorkloadCertificate};
use crate::metrics::{CacheKind, CacheReadLabels, Metrics, ReadResult, RefreshLabels, RefreshReason};

pub const MIN_TTL: Duration = Duration::from_secs(60);
pub const MAX_TTL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_TTL: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_PROACTIVE_REFRESH: Duration = Duration::from_secs(10 * 60);

pub const FETCH_ATTEMPTS: u32 = 3;
pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
	#[error(transparent)]
	Validation(#[from] ValidationError),
	#[error(transparent)]
	Agent(#[from] AgentError),
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
	/// Service name, used to attribute agent failures.
	pub service: Strng,
	/// Agent socket path. An empty path fails fast at fetch time.
	pub socket_path: Strng,
	pub ttl: Duration,
	pub proactive_refresh: Duration,
}

impl CacheConfig {
	pub fn new(service: Strng, socket_path: Strng) -> Self {
		CacheConfig {
			service,
			socket_path,
			ttl: DEFAULT_TTL,
			proactive_refresh: DEFAULT_PROACTIVE_REFRESH,
		}
	}

	pub fn validate(&self) -> Result<(), ValidationError> {
		if self.ttl < MIN_TTL || self.ttl > MAX_TTL {
			return Err(ValidationError::new(
				"service.cache.ttl_minutes",
				format!("{}m", self.ttl.as_secs() / 60),
				"must be between 1 and 60 minutes",
			));
		}
		if self.proactive_refresh.is_zero() || self.proactive_refresh >= self.ttl {
			return Err(ValidationError::new(
				"service.cache.proactive_refresh_minutes",
				format!("{}m", self.proactive_refresh.as_secs() / 60),
				"must be positive and less than the cache ttl",
			));
		}
		Ok(())
	}
}

struct CacheEntry<T> {
	payload: Arc<T>,
	cached_at: Instant,
}

struct Slot<T> {
	entry: Option<CacheEntry<T>>,
}

impl<T> Default for Slot<T> {
	fn default() -> Self {
		Slot { entry: None }
	}
}

/// Point-in-time view of the cache counters. Reads are lock-free.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetrics {
	pub cert_cache_hits: u64,
	pub cert_cache_misses: u64,
	pub bundle_cache_hits: u64,
	pub bundle_cache_misses: u64,
	pub refreshes: u64,
	pub retries: u64,
	pub cert_hit_ratio: f64,
	pub bundle_hit_ratio: f64,
}

#[derive(Default)]
struct Counters {
	cert_hits: AtomicU64,
	cert_misses: AtomicU64,
	bundle_hits: AtomicU64,
	bundle_misses: AtomicU64,
	refreshes: AtomicU64,
	retries: AtomicU64,
}

/// IdentityCache keeps the workload certificate and trust bundle fresh:
/// entries live for at most `ttl`, certificates are refreshed proactively
/// before expiry, and agent fetches retry with exponential backoff.
///
/// Each slot is guarded by its own async mutex, so concurrent readers of one
/// slot serialize (only one fetch per slot is ever in flight) while the two
/// slots refresh independently.
pub struct IdentityCache {
	provider: Arc<dyn IdentityProvider>,
	validator: Arc<dyn CertValidator>,
	cfg: CacheConfig,
	cert: AsyncMutex<Slot<WorkloadCertificate>>,
	bundle: AsyncMutex<Slot<TrustBundle>>,
	counters: Counters,
	metrics: Option<Arc<Metrics>>,
}

impl IdentityCache {
	pub fn new(
		cfg: CacheConfig,
		provider: Arc<dyn IdentityProvider>,
		validator: Arc<dyn CertValidator>,
	) -> Result<Self, ValidationError> {
		cfg.validate()?;
		Ok(IdentityCache {
			provider,
			validator,
			cfg,
			cert: Default::default(),
			bundle: Default::default(),
			counters: Default::default(),
			metrics: None,
		})
	}

	pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
		self.metrics = Some(metrics);
		self
	}

	pub fn config(&self) -> &CacheConfig {
		&self.cfg
	}

	/// Returns the cached certificate, fetching a fresh one when the slot is
	/// empty, TTL-aged, expired, or inside the proactive-refresh window.
	pub async fn certificate(
		&self,
		ct: &CancellationToken,
	) -> Result<Arc<WorkloadCertificate>, CacheError> {
		let mut slot = self.cert.lock().await;
		let mut reason = RefreshReason::Initial;
		if let Some(entry) = slot.entry.take() {
			if entry.cached_at.elapsed() < self.cfg.ttl {
				let expired = matches!(
					self
						.validator
						.validate(Some(&entry.payload), &ValidationOptions::expiry_only()),
					Err(CertificateError::Expired { .. })
				);
				if expired {
					reason = RefreshReason::Expired;
				} else if entry.payload.is_expiring_within(self.cfg.proactive_refresh) {
					reason = RefreshReason::Proactive;
				} else {
					let payload = entry.payload.clone();
					slot.entry = Some(entry);
					self.counters.cert_hits.fetch_add(1, Ordering::Relaxed);
					self.record_read(CacheKind::Certificate, ReadResult::Hit);
					return Ok(payload);
				}
			} else {
				reason = RefreshReason::CacheMiss;
			}
		}

		self.counters.cert_misses.fetch_add(1, Ordering::Relaxed);
		self.record_read(CacheKind::Certificate, ReadResult::Miss);
		self.check_socket()?;

		let start = Instant::now();
		let provider = self.provider.clone();
		let fetched = self
			.fetch_with_retry(ct, move || {
				let provider = provider.clone();
				async move { provider.get_certificate().await }
			})
			.await?;
		let payload = Arc::new(fetched);
		slot.entry = Some(CacheEntry {
			payload: payload.clone(),
			cached_at: Instant::now(),
		});
		self.record_refresh(CacheKind::Certificate, reason, start.elapsed());
		info!(
			service = %self.cfg.service,
			reason = reason.as_str(),
			serial = payload.leaf().serial.as_str(),
			"refreshed workload certificate"
		);
		Ok(payload)
	}

	/// Returns the cached trust bundle, fetching when empty or TTL-aged.
	pub async fn trust_bundle(&self, ct: &CancellationToken) -> Result<Arc<TrustBundle>, CacheError> {
		let mut slot = self.bundle.lock().await;
		let mut reason = RefreshReason::Initial;
		if let Some(entry) = slot.entry.take() {
			if entry.cached_at.elapsed() < self.cfg.ttl {
				let payload = entry.payload.clone();
				slot.entry = Some(entry);
				self.counters.bundle_hits.fetch_add(1, Ordering::Relaxed);
				self.record_read(CacheKind::Bundle, ReadResult::Hit);
				return Ok(payload);
			}
			reason = RefreshReason::CacheMiss;
		}

		self.counters.bundle_misses.fetch_add(1, Ordering::Relaxed);
		self.record_read(CacheKind::Bundle, ReadResult::Miss);
		self.check_socket()?;

		let start = Instant::now();
		let provider = self.provider.clone();
		let fetched = self
			.fetch_with_retry(ct, move || {
				let provider = provider.clone();
				async move { provider.get_trust_bundle().await }
			})
			.await?;
		let payload = Arc::new(fetched);
		slot.entry = Some(CacheEntry {
			payload: payload.clone(),
			cached_at: Instant::now(),
		});
		self.record_refresh(CacheKind::Bundle, reason, start.elapsed());
		info!(
			service = %self.cfg.service,
			reason = reason.as_str(),
			roots = payload.len(),
			"refreshed trust bundle"
		);
		Ok(payload)
	}

	/// Installs an externally supplied certificate, e.g. one pushed by the
	/// agent watch stream. Callers validate before storing.
	pub async fn store_certificate(&self, payload: Arc<WorkloadCertificate>) {
		let mut slot = self.cert.lock().await;
		slot.entry = Some(CacheEntry {
			payload,
			cached_at: Instant::now(),
		});
	}

	/// Drops the cached certificate so the next read fetches a fresh one.
	pub async fn clear_certificate(&self) {
		self.cert.lock().await.entry = None;
	}

	pub async fn clear_trust_bundle(&self) {
		self.bundle.lock().await.entry = None;
	}

	pub fn cache_metrics(&self) -> CacheMetrics {
		let cert_hits = self.counters.cert_hits.load(Ordering::Relaxed);
		let cert_misses = self.counters.cert_misses.load(Ordering::Relaxed);
		let bundle_hits = self.counters.bundle_hits.load(Ordering::Relaxed);
		let bundle_misses = self.counters.bundle_misses.load(Ordering::Relaxed);
		CacheMetrics {
			cert_cache_hits: cert_hits,
			cert_cache_misses: cert_misses,
			bundle_cache_hits: bundle_hits,
			bundle_cache_misses: bundle_misses,
			refreshes: self.counters.refreshes.load(Ordering::Relaxed),
			retries: self.counters.retries.load(Ordering::Relaxed),
			cert_hit_ratio: ratio(cert_hits, cert_misses),
			bundle_hit_ratio: ratio(bundle_hits, bundle_misses),
		}
	}

	fn check_socket(&self) -> Result<(), ValidationError> {
		if self.cfg.socket_path.is_empty() {
			return Err(ValidationError::new(
				"agent.socket_path",
				"",
				"must not be empty",
			));
		}
		Ok(())
	}

	/// Calls the agent, retrying transient failures with exponential backoff:
	/// no delay before the first attempt, then 100ms, then 200ms. The final
	/// failure carries the service name and attempt count.
	async fn fetch_with_retry<T, F, Fut>(
		&self,
		ct: &CancellationToken,
		fetch: F,
	) -> Result<T, AgentError>
	where
		F: Fn() -> Fut,
		Fut: Future<Output = Result<T, AgentError>>,
	{
		let cancelled = || AgentError::Cancelled {
			service: self.cfg.service.clone(),
		};
		let mut last_err = None;
		for attempt in 1..=FETCH_ATTEMPTS {
			if attempt > 1 {
				let delay = RETRY_BASE_DELAY * 2u32.pow(attempt - 2);
				tokio::select! {
					_ = ct.cancelled() => return Err(cancelled()),
					_ = tokio::time::sleep(delay) => {},
				}
				self.counters.retries.fetch_add(1, Ordering::Relaxed);
				if let Some(m) = &self.metrics {
					m.fetch_retries.inc();
				}
			}
			let result = tokio::select! {
				_ = ct.cancelled() => return Err(cancelled()),
				r = fetch() => r,
			};
			match result {
				Ok(v) => return Ok(v),
				Err(e) => {
					warn!(service = %self.cfg.service, attempt, "agent fetch failed: {e}");
					last_err = Some(e);
				},
			}
		}
		Err(AgentError::RetriesExhausted {
			service: self.cfg.service.clone(),
			attempts: FETCH_ATTEMPTS,
			source: Box::new(last_err.expect("at least one attempt ran")),
		})
	}

	fn record_read(&self, kind: CacheKind, result: ReadResult) {
		if let Some(m) = &self.metrics {
			m.cache_reads.get_or_create(&CacheReadLabels { kind, result }).inc();
		}
	}

	fn record_refresh(&self, kind: CacheKind, reason: RefreshReason, took: Duration) {
		self.counters.refreshes.fetch_add(1, Ordering::Relaxed);
		if let Some(m) = &self.metrics {
			let labels = RefreshLabels { kind, reason };
			m.refreshes.get_or_create(&labels).inc();
			m.refresh_duration
				.get_or_create(&labels)
				.observe(took.as_secs_f64());
		}
	}
}

impl std::fmt::Debug for IdentityCache {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("IdentityCache")
			.field("service", &self.cfg.service)
			.field("ttl", &self.cfg.ttl)
			.field("proactive_refresh", &self.cfg.proactive_refresh)
			.finish_non_exhaustive()
	}
}

fn ratio(hits: u64, misses: u64) -> f64 {
	let total = hits + misses;
	if total == 0 {
		return 0.0;
	}
	hits as f64 / total as f64
}

#[cfg(test)]
#[path = "cache_tests.rs"]
mod tests;
