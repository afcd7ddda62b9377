use std::fmt;
use std::fmt::Formatter;
use std::str::FromStr;

use ephemos_core::prelude::*;
use prometheus_client::encoding::{EncodeLabelValue, LabelValueEncoder};
use serde::Serialize;

pub mod cache;
mod cert;
pub mod policy;
pub mod service;
pub mod validator;

pub use cert::{CertificateError, Expiry, ParsedCertificate, TrustBundle, WorkloadCertificate};

const URI_PREFIX: &str = "spiffe://";

/// ValidationError reports a rejected value at a construction or configuration boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {field} {value:?}: {message}")]
pub struct ValidationError {
	pub field: &'static str,
	pub value: String,
	pub message: String,
}

impl ValidationError {
	pub fn new(field: &'static str, value: impl Into<String>, message: impl Into<String>) -> Self {
		Self {
			field,
			value: value.into(),
			message: message.into(),
		}
	}
}

/// TrustDomain is the administrative namespace an identity belongs to,
/// formatted as a DNS-like label sequence.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Hash, Serialize)]
pub struct TrustDomain(Strng);

impl TrustDomain {
	pub fn as_str(&self) -> &str {
		self.0.as_str()
	}

	pub fn to_strng(&self) -> Strng {
		self.0.clone()
	}
}

impl FromStr for TrustDomain {
	type Err = ValidationError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		if s.is_empty() {
			return Err(ValidationError::new(
				"trust_domain",
				s,
				"must not be empty",
			));
		}
		for label in s.split('.') {
			if label.is_empty() {
				return Err(ValidationError::new("trust_domain", s, "empty label"));
			}
			if !label
				.chars()
				.all(|c| c.is_ascii_alphanumeric() || c == '-')
			{
				return Err(ValidationError::new(
					"trust_domain",
					s,
					"labels must be alphanumeric or '-'",
				));
			}
			if label.starts_with('-') || label.ends_with('-') {
				return Err(ValidationError::new(
					"trust_domain",
					s,
					"labels must not start or end with '-'",
				));
			}
		}
		Ok(TrustDomain(s.into()))
	}
}

impl fmt::Display for TrustDomain {
	fn fmt(&self, f: &mut Formatter) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Identity is a `spiffe://<trust-domain>/<path>` workload name.
/// Two identities are equal exactly when their canonical URIs are byte-equal.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Hash)]
pub enum Identity {
	Spiffe { trust_domain: TrustDomain, path: Strng },
}

impl Identity {
	/// Builds `spiffe://<domain>/<name>` from a service name and trust domain.
	pub fn from_parts(name: &str, domain: &TrustDomain) -> Result<Identity, ValidationError> {
		if name.is_empty() {
			return Err(ValidationError::new("name", name, "must not be empty"));
		}
		Ok(Identity::Spiffe {
			trust_domain: domain.clone(),
			path: name.into(),
		})
	}

	pub fn trust_domain(&self) -> &TrustDomain {
		match self {
			Identity::Spiffe { trust_domain, .. } => trust_domain,
		}
	}

	pub fn path(&self) -> &str {
		match self {
			Identity::Spiffe { path, .. } => path,
		}
	}

	/// The first path segment, used as the service name.
	pub fn name(&self) -> &str {
		let path = self.path();
		path.split('/').next().unwrap_or(path)
	}

	pub fn to_strng(&self) -> Strng {
		match self {
			Identity::Spiffe { trust_domain, path } => {
				strng::format!("{URI_PREFIX}{trust_domain}/{path}")
			},
		}
	}
}

impl FromStr for Identity {
	type Err = ValidationError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let Some(rest) = s.strip_prefix(URI_PREFIX) else {
			return Err(ValidationError::new(
				"identity",
				s,
				"must start with spiffe://",
			));
		};
		let (domain, path) = match rest.split_once('/') {
			Some((domain, path)) => (domain, path),
			None => (rest, ""),
		};
		if path.is_empty() {
			return Err(ValidationError::new("identity", s, "empty path"));
		}
		let trust_domain = TrustDomain::from_str(domain)?;
		Ok(Identity::Spiffe {
			trust_domain,
			path: path.into(),
		})
	}
}

impl fmt::Display for Identity {
	fn fmt(&self, f: &mut Formatter) -> fmt::Result {
		match self {
			Identity::Spiffe { trust_domain, path } => {
				write!(f, "{URI_PREFIX}{trust_domain}/{path}")
			},
		}
	}
}

impl Serialize for Identity {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: serde::Serializer,
	{
		serializer.collect_str(self)
	}
}

impl EncodeLabelValue for Identity {
	fn encode(&self, writer: &mut LabelValueEncoder) -> Result<(), std::fmt::Error> {
		use std::fmt::Write;
		writer.write_str(&self.to_strng())
	}
}

/// ServiceIdentity is the immutable identity of the local process: a name, the
/// trust domain it belongs to, and the canonical URI binding the two.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ServiceIdentity {
	name: Strng,
	trust_domain: TrustDomain,
	uri: Identity,
}

impl ServiceIdentity {
	pub fn new(name: &str, domain: &str) -> Result<Self, ValidationError> {
		let trust_domain = TrustDomain::from_str(domain)?;
		let uri = Identity::from_parts(name, &trust_domain)?;
		Ok(Self {
			name: name.into(),
			trust_domain,
			uri,
		})
	}

	/// Derives a service identity from an existing URI. An identity whose first
	/// path segment is empty names an unknown service.
	pub fn from_uri(uri: Identity) -> Self {
		let name = match uri.name() {
			"" => strng::literal!("unknown"),
			name => name.into(),
		};
		Self {
			name,
			trust_domain: uri.trust_domain().clone(),
			uri,
		}
	}

	pub fn name(&self) -> &Strng {
		&self.name
	}

	pub fn trust_domain(&self) -> &TrustDomain {
		&self.trust_domain
	}

	pub fn uri(&self) -> &Identity {
		&self.uri
	}
}

impl fmt::Display for ServiceIdentity {
	fn fmt(&self, f: &mut Formatter) -> fmt::Result {
		write!(f, "{}", self.uri)
	}
}

/// AgentSocket is the filesystem path of the local identity agent endpoint,
/// stored without the `unix://` scheme it is presented with on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSocket(Strng);

pub const DEFAULT_AGENT_SOCKET: &str = "/run/sockets/agent.sock";

impl AgentSocket {
	pub fn new(path: &str) -> Result<Self, ValidationError> {
		let path = path.strip_prefix("unix://").unwrap_or(path);
		if path.is_empty() {
			return Err(ValidationError::new(
				"agent.socket_path",
				path,
				"must not be empty",
			));
		}
		if !path.starts_with('/') {
			return Err(ValidationError::new(
				"agent.socket_path",
				path,
				"must be an absolute path",
			));
		}
		Ok(AgentSocket(path.into()))
	}

	pub fn path(&self) -> &str {
		&self.0
	}

	/// The socket address in the form the agent expects.
	pub fn to_uri(&self) -> String {
		format!("unix://{}", self.0)
	}

	/// Production deployments keep agent sockets under the conventional
	/// runtime directories.
	pub fn is_production_path(&self) -> bool {
		["/run/", "/var/run/", "/tmp/"]
			.iter()
			.any(|prefix| self.0.starts_with(prefix))
	}
}

impl fmt::Display for AgentSocket {
	fn fmt(&self, f: &mut Formatter) -> fmt::Result {
		f.write_str(&self.0)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn identity_parse_roundtrip() {
		let id = Identity::from_str("spiffe://prod.company.com/payment").unwrap();
		assert_eq!(id.trust_domain().as_str(), "prod.company.com");
		assert_eq!(id.name(), "payment");
		assert_eq!(id.to_string(), "spiffe://prod.company.com/payment");
	}

	#[test]
	fn identity_parse_nested_path() {
		let id = Identity::from_str("spiffe://td.example/ns/default/sa/payment").unwrap();
		assert_eq!(id.path(), "ns/default/sa/payment");
		assert_eq!(id.name(), "ns");
	}

	#[test]
	fn identity_rejects_bad_uris() {
		assert!(Identity::from_str("http://td/payment").is_err());
		assert!(Identity::from_str("spiffe://td").is_err());
		assert!(Identity::from_str("spiffe:///payment").is_err());
		assert!(Identity::from_str("spiffe://td/").is_err());
	}

	#[test]
	fn identity_equality_is_uri_equality() {
		let a = Identity::from_str("spiffe://td.example/a").unwrap();
		let b = Identity::from_parts("a", &TrustDomain::from_str("td.example").unwrap()).unwrap();
		assert_eq!(a, b);
		let c = Identity::from_str("spiffe://td.example/b").unwrap();
		assert_ne!(a, c);
	}

	#[test]
	fn trust_domain_validation() {
		assert!(TrustDomain::from_str("prod.company.com").is_ok());
		assert!(TrustDomain::from_str("a-b.c").is_ok());
		assert!(TrustDomain::from_str("").is_err());
		assert!(TrustDomain::from_str("a..b").is_err());
		assert!(TrustDomain::from_str("-a.b").is_err());
		assert!(TrustDomain::from_str("a b").is_err());
	}

	#[test]
	fn service_identity_from_parts() {
		let id = ServiceIdentity::new("payment", "prod.company.com").unwrap();
		assert_eq!(id.name().as_str(), "payment");
		assert_eq!(id.uri().to_string(), "spiffe://prod.company.com/payment");
		assert!(ServiceIdentity::new("", "prod.company.com").is_err());
		assert!(ServiceIdentity::new("payment", "").is_err());
	}

	#[test]
	fn agent_socket_scheme_and_paths() {
		let s = AgentSocket::new("unix:///run/sockets/agent.sock").unwrap();
		assert_eq!(s.path(), "/run/sockets/agent.sock");
		assert_eq!(s.to_uri(), "unix:///run/sockets/agent.sock");
		assert!(s.is_production_path());

		let home = AgentSocket::new("/home/dev/agent.sock").unwrap();
		assert!(!home.is_production_path());

		assert!(AgentSocket::new("").is_err());
		assert!(AgentSocket::new("relative/agent.sock").is_err());
	}
}
