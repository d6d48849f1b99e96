//! Rate-limited topology discovery: per-node backoff, a global send
//! cooldown, and atomic on-disk retry state.

mod manager;
mod persistence;

pub use manager::{TracerouteManager, TracerouteManagerSettings};
pub use persistence::{PersistenceError, TraceroutePersistence, TracerouteStateDoc};
