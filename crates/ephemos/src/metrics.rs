use ephemos_core::strng::RichStrng;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue, LabelValueEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;

#[derive(Copy, Clone, Hash, Debug, PartialEq, Eq)]
pub enum CacheKind {
	Certificate,
	Bundle,
}

impl CacheKind {
	pub fn as_str(&self) -> &'static str {
		match self {
			CacheKind::Certificate => "certificate",
			CacheKind::Bundle => "bundle",
		}
	}
}

impl EncodeLabelValue for CacheKind {
	fn encode(&self, writer: &mut LabelValueEncoder) -> Result<(), std::fmt::Error> {
		use std::fmt::Write;
		writer.write_str(self.as_str())
	}
}

#[derive(Copy, Clone, Hash, Debug, PartialEq, Eq)]
pub enum ReadResult {
	Hit,
	Miss,
}

impl EncodeLabelValue for ReadResult {
	fn encode(&self, writer: &mut LabelValueEncoder) -> Result<(), std::fmt::Error> {
		use std::fmt::Write;
		writer.write_str(match self {
			ReadResult::Hit => "hit",
			ReadResult::Miss => "miss",
		})
	}
}

/// Why a cache slot was (re)filled.
#[derive(Copy, Clone, Hash, Debug, PartialEq, Eq)]
pub enum RefreshReason {
	/// The slot had never been filled.
	Initial,
	/// The cached certificate failed the expiry check.
	Expired,
	/// The cached certificate was within the proactive-refresh window.
	Proactive,
	/// The entry aged past the cache TTL.
	CacheMiss,
}

impl RefreshReason {
	pub fn as_str(&self) -> &'static str {
		match self {
			RefreshReason::Initial => "initial",
			RefreshReason::Expired => "expired",
			RefreshReason::Proactive => "proactive",
			RefreshReason::CacheMiss => "cache_miss",
		}
	}
}

impl EncodeLabelValue for RefreshReason {
	fn encode(&self, writer: &mut LabelValueEncoder) -> Result<(), std::fmt::Error> {
		use std::fmt::Write;
		writer.write_str(self.as_str())
	}
}

#[derive(Copy, Clone, Hash, Debug, PartialEq, Eq)]
pub enum RotationOutcome {
	Started,
	Completed,
	Failed,
}

impl EncodeLabelValue for RotationOutcome {
	fn encode(&self, writer: &mut LabelValueEncoder) -> Result<(), std::fmt::Error> {
		use std::fmt::Write;
		writer.write_str(match self {
			RotationOutcome::Started => "started",
			RotationOutcome::Completed => "completed",
			RotationOutcome::Failed => "failed",
		})
	}
}

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct CacheReadLabels {
	pub kind: CacheKind,
	pub result: ReadResult,
}

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct RefreshLabels {
	pub kind: CacheKind,
	pub reason: RefreshReason,
}

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct RotationLabels {
	pub outcome: RotationOutcome,
}

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct ViolationLabels {
	pub invariant: RichStrng,
}

#[derive(Debug)]
pub struct Metrics {
	pub cache_reads: Family<CacheReadLabels, Counter>,
	pub refreshes: Family<RefreshLabels, Counter>,
	pub refresh_duration: Family<RefreshLabels, Histogram>,
	pub fetch_retries: Counter,
	pub rotations: Family<RotationLabels, Counter>,
	pub invariant_violations: Family<ViolationLabels, Counter>,
}

impl Metrics {
	pub fn new(registry: &mut Registry) -> Self {
		let cache_reads = Family::default();
		registry.register(
			"identity_cache_reads",
			"The total number of identity cache reads, by result",
			cache_reads.clone(),
		);

		let refreshes = Family::default();
		registry.register(
			"identity_refreshes",
			"The total number of identity refreshes, by reason",
			refreshes.clone(),
		);

		let refresh_duration: Family<RefreshLabels, Histogram> =
			Family::new_with_constructor(|| Histogram::new(exponential_buckets(0.001, 2.0, 14)));
		registry.register(
			"identity_refresh_duration_seconds",
			"Time spent fetching fresh identity material from the agent",
			refresh_duration.clone(),
		);

		let fetch_retries = Counter::default();
		registry.register(
			"agent_fetch_retries",
			"The total number of retried agent fetch attempts",
			fetch_retries.clone(),
		);

		let rotations = Family::default();
		registry.register(
			"rotations",
			"The total number of certificate rotation events, by outcome",
			rotations.clone(),
		);

		let invariant_violations = Family::default();
		registry.register(
			"invariant_violations",
			"The total number of connection invariant violations, by invariant",
			invariant_violations.clone(),
		);

		Metrics {
			cache_reads,
			refreshes,
			refresh_duration,
			fetch_retries,
			rotations,
			invariant_violations,
		}
	}
}

#[cfg(test)]
mod tests {
	use prometheus_client::encoding::text::encode;
	use prometheus_client::registry::Registry;

	use super::*;

	#[test]
	fn refresh_reasons_encode_as_snake_case_labels() {
		let mut registry = Registry::default();
		let metrics = Metrics::new(ephemos_core::metrics::sub_registry(&mut registry));
		metrics
			.refreshes
			.get_or_create(&RefreshLabels {
				kind: CacheKind::Certificate,
				reason: RefreshReason::Proactive,
			})
			.inc();
		let mut out = String::new();
		encode(&mut out, &registry).unwrap();
		assert!(out.contains("reason=\"proactive\""), "got: {out}");
		assert!(out.contains("kind=\"certificate\""), "got: {out}");
	}
}
