use std::time::Duration;

use assert_matches::assert_matches;

use super::*;
use crate::identity::ServiceIdentity;
use crate::testing::TestCa;

const URI: &str = "spiffe://prod.company.com/payment";
const HOUR: Duration = Duration::from_secs(3600);

fn local() -> ServiceIdentity {
	ServiceIdentity::new("payment", "prod.company.com").unwrap()
}

#[test]
fn valid_certificate_passes() {
	let ca = TestCa::new("root");
	let cert = ca.issue(URI, HOUR);
	let bundle = ca.bundle();
	let local = local();
	let opts = ValidationOptions::full(&local, &bundle, Duration::from_secs(15 * 60));
	Validator::default().validate(Some(&cert), &opts).unwrap();
}

#[test]
fn missing_certificate() {
	let err = Validator::default()
		.validate(None, &ValidationOptions::default())
		.unwrap_err();
	assert_matches!(err, CertificateError::Missing);
}

#[test]
fn expired_certificate() {
	let ca = TestCa::new("root");
	let cert = ca.issue_expired(URI);
	let err = Validator::default()
		.validate(Some(&cert), &ValidationOptions::expiry_only())
		.unwrap_err();
	assert_matches!(err, CertificateError::Expired { .. });
}

#[test]
fn not_yet_valid_certificate() {
	let ca = TestCa::new("root");
	let cert = ca.issue_not_yet_valid(URI);
	let err = Validator::default()
		.validate(Some(&cert), &ValidationOptions::expiry_only())
		.unwrap_err();
	assert_matches!(err, CertificateError::NotYetValid { .. });
}

#[test]
fn skip_expiry_lets_an_expired_cert_through() {
	let ca = TestCa::new("root");
	let cert = ca.issue_expired(URI);
	let opts = ValidationOptions {
		skip_expiry: true,
		skip_chain_verify: true,
		..Default::default()
	};
	Validator::default().validate(Some(&cert), &opts).unwrap();
}

#[test]
fn missing_spiffe_id() {
	let ca = TestCa::new("root");
	let cert = ca.issue_without_san(HOUR);
	let local = local();
	let opts = ValidationOptions {
		expected_identity: Some(&local),
		skip_chain_verify: true,
		..Default::default()
	};
	let err = Validator::default().validate(Some(&cert), &opts).unwrap_err();
	assert_matches!(err, CertificateError::MissingSpiffeId);
}

#[test]
fn id_mismatch_within_trust_domain() {
	let ca = TestCa::new("root");
	let cert = ca.issue("spiffe://prod.company.com/fraud", HOUR);
	let local = local();
	let opts = ValidationOptions {
		expected_identity: Some(&local),
		skip_chain_verify: true,
		..Default::default()
	};
	let err = Validator::default().validate(Some(&cert), &opts).unwrap_err();
	assert_matches!(err, CertificateError::IdMismatch { .. });
}

#[test]
fn trust_domain_mismatch() {
	let ca = TestCa::new("root");
	let cert = ca.issue("spiffe://staging.company.com/payment", HOUR);
	let local = local();
	let opts = ValidationOptions {
		expected_identity: Some(&local),
		skip_chain_verify: true,
		..Default::default()
	};
	let err = Validator::default().validate(Some(&cert), &opts).unwrap_err();
	assert_matches!(err, CertificateError::TrustDomainMismatch { .. });
}

#[test]
fn chain_invalid_with_foreign_ca() {
	let trusted = TestCa::new("trusted-root");
	let rogue = TestCa::new("rogue-root");
	let cert = rogue.issue(URI, HOUR);
	let bundle = trusted.bundle();
	let local = local();
	let opts = ValidationOptions::full(&local, &bundle, Duration::from_secs(15 * 60));
	let err = Validator::default().validate(Some(&cert), &opts).unwrap_err();
	assert_matches!(err, CertificateError::ChainInvalid(_));
}

#[test]
fn chain_verifies_through_an_intermediate() {
	let root = TestCa::new("root");
	let intermediate = root.intermediate("intermediate");
	let cert = intermediate.issue(URI, HOUR);
	assert_eq!(cert.intermediates().len(), 1);
	let bundle = intermediate.bundle();
	let local = local();
	let opts = ValidationOptions::full(&local, &bundle, Duration::from_secs(15 * 60));
	Validator::default().validate(Some(&cert), &opts).unwrap();
}

#[test]
fn chain_verify_requires_a_bundle() {
	let ca = TestCa::new("root");
	let cert = ca.issue(URI, HOUR);
	let err = Validator::default()
		.validate(Some(&cert), &ValidationOptions::default())
		.unwrap_err();
	assert_matches!(err, CertificateError::ChainInvalid(_));
}

#[test]
fn checks_short_circuit_in_order() {
	// Expired and mismatched: expiry is checked first.
	let ca = TestCa::new("root");
	let cert = ca.issue_expired("spiffe://prod.company.com/fraud");
	let local = local();
	let opts = ValidationOptions {
		expected_identity: Some(&local),
		skip_chain_verify: true,
		..Default::default()
	};
	let err = Validator::default().validate(Some(&cert), &opts).unwrap_err();
	assert_matches!(err, CertificateError::Expired { .. });
}
