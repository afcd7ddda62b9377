use std::fmt::Debug;
use std::time::{Duration, SystemTime};

use rustls_pki_types::{CertificateDer, UnixTime};
use tracing::warn;

use crate::identity::{CertificateError, ServiceIdentity, TrustBundle, WorkloadCertificate};
use crate::transport::tls;

/// What a single validation pass should check. The zero-value checks
/// everything it can and warns on nothing.
#[derive(Debug, Default)]
pub struct ValidationOptions<'a> {
	/// When set, the leaf's URI SAN must name exactly this identity.
	pub expected_identity: Option<&'a ServiceIdentity>,
	/// Emit a warning event (not a failure) when less than this much validity remains.
	pub warning_threshold: Option<Duration>,
	/// Trust anchors for chain verification.
	pub trust_bundle: Option<&'a TrustBundle>,
	pub skip_expiry: bool,
	pub skip_chain_verify: bool,
}

impl<'a> ValidationOptions<'a> {
	/// Options for a read-time freshness check: expiry only.
	pub fn expiry_only() -> Self {
		ValidationOptions {
			skip_chain_verify: true,
			..Default::default()
		}
	}

	/// Options for a full post-fetch check against the local identity.
	pub fn full(
		expected: &'a ServiceIdentity,
		bundle: &'a TrustBundle,
		warning_threshold: Duration,
	) -> Self {
		ValidationOptions {
			expected_identity: Some(expected),
			warning_threshold: Some(warning_threshold),
			trust_bundle: Some(bundle),
			..Default::default()
		}
	}
}

/// CertValidator decides whether an SVID is acceptable. Pure and stateless;
/// replaceable for testing.
pub trait CertValidator: Send + Sync + Debug {
	fn validate(
		&self,
		cert: Option<&WorkloadCertificate>,
		opts: &ValidationOptions,
	) -> Result<(), CertificateError>;
}

/// The default webpki-backed validator. Checks run in order, short-circuiting
/// on the first failure: presence, expiry, identity match, chain verification.
#[derive(Debug, Clone, Default)]
pub struct Validator {}

impl CertValidator for Validator {
	fn validate(
		&self,
		cert: Option<&WorkloadCertificate>,
		opts: &ValidationOptions,
	) -> Result<(), CertificateError> {
		let Some(cert) = cert else {
			return Err(CertificateError::Missing);
		};

		if !opts.skip_expiry {
			check_expiry(cert, opts.warning_threshold)?;
		}

		if let Some(expected) = opts.expected_identity {
			check_identity(cert, expected)?;
		}

		if !opts.skip_chain_verify {
			let Some(bundle) = opts.trust_bundle else {
				return Err(CertificateError::ChainInvalid(
					"no trust bundle provided".to_string(),
				));
			};
			check_chain(cert, bundle)?;
		}

		Ok(())
	}
}

fn check_expiry(
	cert: &WorkloadCertificate,
	warning_threshold: Option<Duration>,
) -> Result<(), CertificateError> {
	let now = SystemTime::now();
	let expiry = cert.expiry();
	if now < expiry.not_before {
		return Err(CertificateError::NotYetValid {
			not_before: expiry.not_before,
		});
	}
	if now > expiry.not_after {
		return Err(CertificateError::Expired {
			not_after: expiry.not_after,
		});
	}
	if let Some(threshold) = warning_threshold {
		if let Ok(remaining) = expiry.not_after.duration_since(now) {
			if remaining < threshold {
				warn!(
					identity = cert.to_spiffe_id().map(|i| i.to_string()).as_deref(),
					serial = cert.leaf().serial.as_str(),
					remaining_secs = remaining.as_secs(),
					"certificate approaching expiry"
				);
			}
		}
	}
	Ok(())
}

fn check_identity(
	cert: &WorkloadCertificate,
	expected: &ServiceIdentity,
) -> Result<(), CertificateError> {
	let Some(id) = cert.to_spiffe_id() else {
		return Err(CertificateError::MissingSpiffeId);
	};
	if id == expected.uri() {
		return Ok(());
	}
	if id.trust_domain() != expected.trust_domain() {
		return Err(CertificateError::TrustDomainMismatch {
			expected: expected.trust_domain().to_string(),
			actual: id.trust_domain().to_string(),
		});
	}
	Err(CertificateError::IdMismatch {
		expected: expected.uri().to_string(),
		actual: id.to_string(),
	})
}

fn check_chain(cert: &WorkloadCertificate, bundle: &TrustBundle) -> Result<(), CertificateError> {
	let roots = bundle.create_cert_pool()?;
	let leaf = rustls::server::ParsedCertificate::try_from(&cert.leaf().der)
		.map_err(|e| CertificateError::ChainInvalid(e.to_string()))?;
	let intermediates: Vec<CertificateDer> =
		cert.intermediates().iter().map(|c| c.der.clone()).collect();
	let algs = tls::provider().signature_verification_algorithms;
	rustls::client::verify_server_cert_signed_by_trust_anchor(
		&leaf,
		&roots,
		&intermediates,
		UnixTime::now(),
		algs.all,
	)
	.map_err(|e| CertificateError::ChainInvalid(e.to_string()))?;
	Ok(())
}

#[cfg(test)]
#[path = "validator_tests.rs"]
mod tests;
