//! Radio session lifecycle, health probing, and reconnection policy.

mod manager;

pub use manager::{ConnectionError, ConnectionInfo, ConnectionManager, ConnectionState};
