//! Ephemos gives a service a cryptographic workload identity issued by a
//! local identity agent and keeps it healthy for the lifetime of the process:
//! a caching, proactively-refreshing identity store; a certificate and chain
//! validator; peer authorization policies; and a connection registry that
//! rotates live mTLS sessions before their certificates expire.

pub mod config;
pub mod connection;
pub mod control;
pub mod identity;
pub mod metrics;
pub mod transport;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use ephemos_core::strng;
pub use ephemos_core::strng::Strng;
pub use ephemos_core::telemetry;

pub use identity::service::{IdentityError, IdentityService};
pub use identity::{Identity, ServiceIdentity, TrustDomain, TrustBundle, WorkloadCertificate};
