use std::collections::HashSet;
use std::str::FromStr;

use ephemos_core::prelude::*;
use serde::Serialize;

use crate::identity::{Identity, ServiceIdentity, TrustDomain, ValidationError};

#[derive(Debug, Clone, thiserror::Error)]
pub enum PolicyError {
	#[error("wildcard entries are not allowed in {field}: {value:?}")]
	Wildcard { field: &'static str, value: String },
	#[error("unparseable identity in {field}: {source}")]
	InvalidIdentity {
		field: &'static str,
		#[source]
		source: ValidationError,
	},
	#[error("peer {peer} is not authorized: {reason}")]
	Unauthorized { peer: String, reason: &'static str },
}

/// The role the *peer* plays in the handshake being authorized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
	Client,
	Server,
}

/// AuthenticationPolicy gates which peer identities may complete an mTLS
/// handshake with us. Immutable once built; updates require a new instance.
///
/// Rules are evaluated in order: exact identity set, trust-domain membership,
/// role-specific exact sets, then accept-any-valid-SVID.
#[derive(Debug, Clone, Serialize)]
pub struct AuthenticationPolicy {
	local: ServiceIdentity,
	allowed_ids: HashSet<Identity>,
	trust_domain: Option<TrustDomain>,
	authorized_clients: HashSet<Identity>,
	trusted_servers: HashSet<Identity>,
}

impl AuthenticationPolicy {
	/// Accept any peer presenting a chain-valid SVID.
	pub fn any_valid(local: ServiceIdentity) -> Self {
		AuthenticationPolicy {
			local,
			allowed_ids: Default::default(),
			trust_domain: None,
			authorized_clients: Default::default(),
			trusted_servers: Default::default(),
		}
	}

	/// Accept any chain-valid peer within the local identity's trust domain.
	pub fn same_trust_domain(local: ServiceIdentity) -> Self {
		let td = local.trust_domain().clone();
		AuthenticationPolicy {
			trust_domain: Some(td),
			..Self::any_valid(local)
		}
	}

	pub fn builder(local: ServiceIdentity) -> PolicyBuilder {
		PolicyBuilder {
			local,
			allowed_ids: Vec::new(),
			trust_domain: None,
			authorized_clients: Vec::new(),
			trusted_servers: Vec::new(),
		}
	}

	pub fn local(&self) -> &ServiceIdentity {
		&self.local
	}

	pub fn trust_domain(&self) -> Option<&TrustDomain> {
		self.trust_domain.as_ref()
	}

	pub fn authorize(&self, peer: &Identity, role: PeerRole) -> Result<(), PolicyError> {
		if !self.allowed_ids.is_empty() {
			return if self.allowed_ids.contains(peer) {
				Ok(())
			} else {
				Err(deny(peer, "not in the allowed identity set"))
			};
		}
		if let Some(td) = &self.trust_domain {
			return if peer.trust_domain() == td {
				Ok(())
			} else {
				Err(deny(peer, "outside the trust domain"))
			};
		}
		match role {
			PeerRole::Client if !self.authorized_clients.is_empty() => {
				if self.authorized_clients.contains(peer) {
					Ok(())
				} else {
					Err(deny(peer, "not an authorized client"))
				}
			},
			PeerRole::Server if !self.trusted_servers.is_empty() => {
				if self.trusted_servers.contains(peer) {
					Ok(())
				} else {
					Err(deny(peer, "not a trusted server"))
				}
			},
			// No rules configured: any peer with a chain-valid SVID is accepted.
			_ => Ok(()),
		}
	}

	pub fn allows(&self, peer: &Identity, role: PeerRole) -> bool {
		match self.authorize(peer, role) {
			Ok(()) => true,
			Err(e) => {
				debug!(local = %self.local, "{e}");
				false
			},
		}
	}
}

fn deny(peer: &Identity, reason: &'static str) -> PolicyError {
	PolicyError::Unauthorized {
		peer: peer.to_string(),
		reason,
	}
}

pub struct PolicyBuilder {
	local: ServiceIdentity,
	allowed_ids: Vec<Strng>,
	trust_domain: Option<TrustDomain>,
	authorized_clients: Vec<Strng>,
	trusted_servers: Vec<Strng>,
}

impl PolicyBuilder {
	pub fn allowed_ids<I: IntoIterator<Item = S>, S: Into<Strng>>(mut self, ids: I) -> Self {
		self.allowed_ids.extend(ids.into_iter().map(Into::into));
		self
	}

	pub fn trust_domain(mut self, td: TrustDomain) -> Self {
		self.trust_domain = Some(td);
		self
	}

	pub fn authorized_clients<I: IntoIterator<Item = S>, S: Into<Strng>>(mut self, ids: I) -> Self {
		self
			.authorized_clients
			.extend(ids.into_iter().map(Into::into));
		self
	}

	pub fn trusted_servers<I: IntoIterator<Item = S>, S: Into<Strng>>(mut self, ids: I) -> Self {
		self.trusted_servers.extend(ids.into_iter().map(Into::into));
		self
	}

	pub fn build(self) -> Result<AuthenticationPolicy, PolicyError> {
		Ok(AuthenticationPolicy {
			local: self.local,
			allowed_ids: parse_list("allowed_ids", &self.allowed_ids)?,
			trust_domain: self.trust_domain,
			authorized_clients: parse_list("authorized_clients", &self.authorized_clients)?,
			trusted_servers: parse_list("trusted_servers", &self.trusted_servers)?,
		})
	}
}

fn parse_list(field: &'static str, entries: &[Strng]) -> Result<HashSet<Identity>, PolicyError> {
	entries
		.iter()
		.map(|raw| {
			if raw.contains('*') {
				return Err(PolicyError::Wildcard {
					field,
					value: raw.to_string(),
				});
			}
			Identity::from_str(raw).map_err(|source| PolicyError::InvalidIdentity { field, source })
		})
		.collect()
}

#[cfg(test)]
#[path = "policy_tests.rs"]
mod tests;
