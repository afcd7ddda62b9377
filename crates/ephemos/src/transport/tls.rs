use std::str::FromStr;
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::{ClientConfig, ServerConfig};
use tracing::warn;
use x509_parser::certificate::X509Certificate;

use crate::identity::Identity;
use crate::transport::IdentityMaterial;

pub static ALL_TLS_VERSIONS: &[&rustls::SupportedProtocolVersion] =
	&[&rustls::version::TLS12, &rustls::version::TLS13];

pub fn provider() -> Arc<CryptoProvider> {
	Arc::new(CryptoProvider {
		// Limit to the subset of ciphers that are FIPS compatible
		cipher_suites: vec![
			rustls::crypto::ring::cipher_suite::TLS13_AES_256_GCM_SHA384,
			rustls::crypto::ring::cipher_suite::TLS13_AES_128_GCM_SHA256,
		],
		..rustls::crypto::ring::default_provider()
	})
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("tls handshake error: {0:?}")]
	Handshake(std::io::Error),
	#[error("rustls: {0}")]
	Rustls(#[from] rustls::Error),
	#[error("rustls verifier: {0}")]
	Verifier(#[from] rustls::server::VerifierBuilderError),
	#[error("{0}")]
	Invalid(String),
}

/// Builds a server-side rustls config terminating mTLS with the workload's
/// SVID and enforcing the authorization policy on client certificates.
pub fn server_config(material: &IdentityMaterial) -> Result<ServerConfig, Error> {
	let roots = Arc::new(
		material
			.bundle
			.create_cert_pool()
			.map_err(|e| Error::Invalid(e.to_string()))?,
	);
	let raw_client_cert_verifier =
		rustls::server::WebPkiClientVerifier::builder_with_provider(roots, provider()).build()?;
	let client_cert_verifier =
		PolicyVerifier::new(raw_client_cert_verifier, material.policy.clone());
	let sc = ServerConfig::builder_with_provider(provider())
		.with_protocol_versions(ALL_TLS_VERSIONS)
		.expect("server config must be valid")
		.with_client_cert_verifier(client_cert_verifier)
		.with_single_cert(material.cert.cert_and_chain(), material.cert.private_key())?;
	Ok(sc)
}

/// Builds a client-side rustls config presenting the workload's SVID and
/// verifying the server against the trust bundle and the policy's URI-SAN
/// rules instead of DNS hostnames.
pub fn client_config(material: &IdentityMaterial) -> Result<ClientConfig, Error> {
	let roots = Arc::new(
		material
			.bundle
			.create_cert_pool()
			.map_err(|e| Error::Invalid(e.to_string()))?,
	);
	let verifier = IdentityVerifier {
		roots,
		policy: material.policy.clone(),
	};
	let mut cc = ClientConfig::builder_with_provider(provider())
		.with_protocol_versions(ALL_TLS_VERSIONS)
		.expect("client config must be valid")
		.dangerous() // Custom verifier requires "dangerous" opt-in
		.with_custom_certificate_verifier(Arc::new(verifier))
		.with_client_auth_cert(material.cert.cert_and_chain(), material.cert.private_key())?;
	cc.resumption = rustls::client::Resumption::disabled();
	cc.enable_sni = false;
	Ok(cc)
}

/// Terminates mTLS on an accepted stream with a config from [`server_config`].
pub async fn accept<IO>(
	io: IO,
	cfg: Arc<rustls::ServerConfig>,
) -> Result<tokio_rustls::server::TlsStream<IO>, Error>
where
	IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
	tokio_rustls::TlsAcceptor::from(cfg)
		.accept(io)
		.await
		.map_err(Error::Handshake)
}

/// Originates mTLS on a connected stream with a config from [`client_config`].
/// The server is authenticated by URI-SAN identity, not by name; SNI is
/// disabled and the server name is a placeholder.
pub async fn connect<IO>(
	io: IO,
	cfg: Arc<rustls::ClientConfig>,
) -> Result<tokio_rustls::client::TlsStream<IO>, Error>
where
	IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
	let name =
		rustls::pki_types::ServerName::try_from("ephemos").expect("static server name is valid");
	tokio_rustls::TlsConnector::from(cfg)
		.connect(name, io)
		.await
		.map_err(Error::Handshake)
}

/// The identity presented by the peer of an established connection.
pub fn identity_from_connection(conn: &rustls::CommonState) -> Option<Identity> {
	use x509_parser::prelude::*;
	conn
		.peer_certificates()
		.and_then(|certs| certs.first())
		.and_then(|cert| match X509Certificate::from_der(cert) {
			Ok((_, c)) => Some(c),
			Err(e) => {
				warn!("invalid peer certificate: {e}");
				None
			},
		})
		.and_then(|cert| identities(&cert).into_iter().next())
}

pub(crate) fn identities(cert: &X509Certificate) -> Vec<Identity> {
	let names = cert
		.subject_alternative_name()
		.ok()
		.flatten()
		.map(|x| &x.value.general_names);

	let Some(names) = names else {
		return Vec::default();
	};
	names
		.iter()
		.filter_map(|n| {
			let uri = match n {
				x509_parser::extensions::GeneralName::URI(uri) => uri,
				_ => return None,
			};
			match Identity::from_str(uri) {
				Ok(id) => Some(id),
				Err(err) => {
					warn!("SAN {n} could not be parsed: {err}");
					None
				},
			}
		})
		.collect()
}

fn peer_identities(der: &rustls::pki_types::CertificateDer<'_>) -> Result<Vec<Identity>, rustls::Error> {
	use x509_parser::prelude::*;
	let (_, cert) = X509Certificate::from_der(der)
		.map_err(|_e| rustls::Error::InvalidCertificate(rustls::CertificateError::BadEncoding))?;
	Ok(identities(&cert))
}

fn unauthorized(detail: String) -> rustls::Error {
	rustls::Error::InvalidCertificate(rustls::CertificateError::Other(rustls::OtherError(
		Arc::new(LocalError::Invalid(detail)),
	)))
}

#[derive(thiserror::Error, Debug)]
enum LocalError {
	#[error("{0}")]
	Invalid(String),
}

fn display_list<T: ToString>(i: &[T]) -> String {
	use itertools::Itertools;
	i.iter().map(|id| id.to_string()).join(",")
}

pub mod policy_verifier {

	use std::fmt::Debug;
	use std::sync::Arc;

	use rustls::client::danger::HandshakeSignatureValid;
	use rustls::pki_types::{CertificateDer, UnixTime};
	use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
	use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};
	use tracing::trace;

	use super::{display_list, peer_identities, unauthorized};
	use crate::identity::policy::{AuthenticationPolicy, PeerRole};

	/// Wraps the webpki client verifier with the authorization policy: after
	/// the chain verifies, the client's URI-SAN identity must be accepted.
	#[derive(Debug)]
	pub struct PolicyVerifier {
		base: Arc<dyn ClientCertVerifier>,
		policy: Arc<AuthenticationPolicy>,
	}

	impl PolicyVerifier {
		pub fn new(base: Arc<dyn ClientCertVerifier>, policy: Arc<AuthenticationPolicy>) -> Arc<Self> {
			Arc::new(Self { base, policy })
		}

		fn verify_policy(&self, client_cert: &CertificateDer<'_>) -> Result<(), rustls::Error> {
			let ids = peer_identities(client_cert)?;
			trace!(
				"verifying client identities {ids:?} against policy of {}",
				self.policy.local()
			);
			ids
				.iter()
				.find(|id| self.policy.allows(id, PeerRole::Client))
				.ok_or_else(|| {
					unauthorized(format!(
						"identity verification error: peer identities ({}) are not authorized",
						display_list(&ids)
					))
				})
				.map(|_| ())
		}
	}

	// Implement our custom ClientCertVerifier logic. We only want to add an extra check, but
	// need a decent amount of boilerplate to do so.
	impl ClientCertVerifier for PolicyVerifier {
		fn root_hint_subjects(&self) -> &[DistinguishedName] {
			self.base.root_hint_subjects()
		}

		fn verify_client_cert(
			&self,
			end_entity: &CertificateDer<'_>,
			intermediates: &[CertificateDer<'_>],
			now: UnixTime,
		) -> Result<ClientCertVerified, rustls::Error> {
			let res = self
				.base
				.verify_client_cert(end_entity, intermediates, now)?;
			self.verify_policy(end_entity)?;
			Ok(res)
		}

		fn verify_tls12_signature(
			&self,
			message: &[u8],
			cert: &CertificateDer<'_>,
			dss: &DigitallySignedStruct,
		) -> Result<HandshakeSignatureValid, rustls::Error> {
			self.base.verify_tls12_signature(message, cert, dss)
		}

		fn verify_tls13_signature(
			&self,
			message: &[u8],
			cert: &CertificateDer<'_>,
			dss: &DigitallySignedStruct,
		) -> Result<HandshakeSignatureValid, rustls::Error> {
			self.base.verify_tls13_signature(message, cert, dss)
		}

		fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
			self.base.supported_verify_schemes()
		}
	}
}

pub use policy_verifier::PolicyVerifier;

pub mod identity_verifier {

	use std::fmt::Debug;
	use std::sync::Arc;

	use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
	use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
	use rustls::server::ParsedCertificate;
	use rustls::{DigitallySignedStruct, SignatureScheme};
	use tracing::{debug, trace};

	use super::{display_list, peer_identities, provider, unauthorized};
	use crate::identity::policy::{AuthenticationPolicy, PeerRole};

	/// Rustls doesn't natively validate URI SAN; verify the chain against the
	/// trust bundle, then check the server's identity against the policy.
	#[derive(Debug)]
	pub struct IdentityVerifier {
		pub roots: Arc<rustls::RootCertStore>,
		pub policy: Arc<AuthenticationPolicy>,
	}

	impl IdentityVerifier {
		fn verify_full_san(&self, server_cert: &CertificateDer<'_>) -> Result<(), rustls::Error> {
			let ids = peer_identities(server_cert)?;
			trace!(
				"verifying server identities {ids:?} against policy of {}",
				self.policy.local()
			);
			for ident in ids.iter() {
				if self.policy.allows(ident, PeerRole::Server) {
					return Ok(());
				}
			}
			debug!("identity mismatch: {ids:?} not authorized");
			Err(unauthorized(format!(
				"identity verification error: server identities ({}) are not trusted",
				display_list(&ids)
			)))
		}
	}

	impl ServerCertVerifier for IdentityVerifier {
		/// Will verify the certificate is valid in the following ways:
		/// - Signed by a trusted `RootCertStore` CA
		/// - Not expired
		/// - Presents a URI SAN identity the policy accepts
		fn verify_server_cert(
			&self,
			end_entity: &CertificateDer<'_>,
			intermediates: &[CertificateDer<'_>],
			_sn: &ServerName,
			ocsp_response: &[u8],
			now: UnixTime,
		) -> Result<ServerCertVerified, rustls::Error> {
			let cert = ParsedCertificate::try_from(end_entity)?;

			let algs = provider().signature_verification_algorithms;
			rustls::client::verify_server_cert_signed_by_trust_anchor(
				&cert,
				&self.roots,
				intermediates,
				now,
				algs.all,
			)?;

			if !ocsp_response.is_empty() {
				trace!("unvalidated OCSP response: {ocsp_response:?}");
			}

			self.verify_full_san(end_entity)?;

			Ok(ServerCertVerified::assertion())
		}

		fn verify_tls12_signature(
			&self,
			message: &[u8],
			cert: &CertificateDer<'_>,
			dss: &DigitallySignedStruct,
		) -> Result<HandshakeSignatureValid, rustls::Error> {
			rustls::crypto::verify_tls12_signature(
				message,
				cert,
				dss,
				&provider().signature_verification_algorithms,
			)
		}

		fn verify_tls13_signature(
			&self,
			message: &[u8],
			cert: &CertificateDer<'_>,
			dss: &DigitallySignedStruct,
		) -> Result<HandshakeSignatureValid, rustls::Error> {
			rustls::crypto::verify_tls13_signature(
				message,
				cert,
				dss,
				&provider().signature_verification_algorithms,
			)
		}

		fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
			provider()
				.signature_verification_algorithms
				.supported_schemes()
		}
	}
}

pub use identity_verifier::IdentityVerifier;
