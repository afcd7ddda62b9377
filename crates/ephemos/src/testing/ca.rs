use std::time::Duration;

use rcgen::{
	BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
	KeyPair, KeyUsagePurpose, SanType,
};
use time::OffsetDateTime;

use crate::identity::{TrustBundle, WorkloadCertificate};

/// A certificate authority for tests: issues real, chain-verifiable SVIDs
/// with arbitrary validity windows and URI SANs.
pub struct TestCa {
	name: String,
	key: KeyPair,
	cert: rcgen::Certificate,
	/// PEMs handed to issued certs as their intermediate chain.
	chain: Vec<String>,
	/// The root anchoring this CA (itself, for a root).
	root_pem: String,
}

impl TestCa {
	pub fn new(name: &str) -> TestCa {
		let key = KeyPair::generate().expect("keypair generates");
		let params = ca_params(name);
		let cert = params.self_signed(&key).expect("root CA self-signs");
		let root_pem = cert.pem();
		TestCa {
			name: name.to_string(),
			key,
			cert,
			chain: Vec::new(),
			root_pem,
		}
	}

	/// An intermediate CA chained under this one. Certs it issues carry the
	/// intermediate in their chain and still verify against this CA's root.
	pub fn intermediate(&self, name: &str) -> TestCa {
		let key = KeyPair::generate().expect("keypair generates");
		let params = ca_params(name);
		let cert = params
			.signed_by(&key, &self.cert, &self.key)
			.expect("intermediate CA signs");
		let mut chain = vec![cert.pem()];
		chain.extend(self.chain.iter().cloned());
		TestCa {
			name: name.to_string(),
			key,
			cert,
			chain,
			root_pem: self.root_pem.clone(),
		}
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	/// The trust bundle a workload would be given to verify this CA's certs.
	pub fn bundle(&self) -> TrustBundle {
		TrustBundle::from_pem(self.root_pem.as_bytes()).expect("root parses")
	}

	/// An SVID valid from one minute ago until `validity` from now.
	pub fn issue(&self, uri: &str, validity: Duration) -> WorkloadCertificate {
		let now = OffsetDateTime::now_utc();
		self.issue_with_window(Some(uri), now - Duration::from_secs(60), now + validity)
	}

	pub fn issue_expired(&self, uri: &str) -> WorkloadCertificate {
		let now = OffsetDateTime::now_utc();
		self.issue_with_window(
			Some(uri),
			now - Duration::from_secs(2 * 3600),
			now - Duration::from_secs(3600),
		)
	}

	pub fn issue_not_yet_valid(&self, uri: &str) -> WorkloadCertificate {
		let now = OffsetDateTime::now_utc();
		self.issue_with_window(
			Some(uri),
			now + Duration::from_secs(3600),
			now + Duration::from_secs(2 * 3600),
		)
	}

	pub fn issue_without_san(&self, validity: Duration) -> WorkloadCertificate {
		let now = OffsetDateTime::now_utc();
		self.issue_with_window(None, now - Duration::from_secs(60), now + validity)
	}

	pub fn issue_with_window(
		&self,
		uri: Option<&str>,
		not_before: OffsetDateTime,
		not_after: OffsetDateTime,
	) -> WorkloadCertificate {
		let key = KeyPair::generate().expect("keypair generates");
		let mut params = CertificateParams::default();
		params.not_before = not_before;
		params.not_after = not_after;
		params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
		params.extended_key_usages = vec![
			ExtendedKeyUsagePurpose::ServerAuth,
			ExtendedKeyUsagePurpose::ClientAuth,
		];
		// Avoid setting CN. rcgen defaults it to "rcgen self signed cert" which we don't want
		params.distinguished_name = DistinguishedName::new();
		if let Some(uri) = uri {
			params.subject_alt_names = vec![SanType::URI(
				uri.try_into().expect("URI SAN is a valid IA5 string"),
			)];
		}
		let cert = params
			.signed_by(&key, &self.cert, &self.key)
			.expect("leaf signs");
		WorkloadCertificate::new(
			key.serialize_pem().as_bytes(),
			cert.pem().as_bytes(),
			self.chain.iter().map(|c| c.as_bytes()).collect(),
		)
		.expect("issued certificate parses")
	}
}

fn ca_params(name: &str) -> CertificateParams {
	let mut params = CertificateParams::default();
	let now = OffsetDateTime::now_utc();
	params.not_before = now - Duration::from_secs(3600);
	params.not_after = now + Duration::from_secs(24 * 3600);
	params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
	params.key_usages = vec![
		KeyUsagePurpose::KeyCertSign,
		KeyUsagePurpose::CrlSign,
		KeyUsagePurpose::DigitalSignature,
	];
	let mut dn = DistinguishedName::new();
	dn.push(DnType::CommonName, name);
	params.distinguished_name = dn;
	params
}

impl std::fmt::Debug for TestCa {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TestCa")
			.field("name", &self.name)
			.field("chain_len", &self.chain.len())
			.finish_non_exhaustive()
	}
}
