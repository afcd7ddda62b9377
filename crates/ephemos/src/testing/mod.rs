//! Test doubles: an rcgen-backed CA issuing real SVIDs, a scriptable agent,
//! and an in-memory transport. Compiled for tests and behind the `testing`
//! feature.

mod agent;
mod ca;
mod memory;

pub use agent::MockAgent;
pub use ca::TestCa;
pub use memory::{MemoryClient, MemoryConnection, MemoryServer, MemoryTransport};
