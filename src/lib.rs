//! # Network Simulation Bridge Broker
//!
//! A message broker that decouples applications from discrete-event network
//! simulators. Applications submit payloads addressed to logical node
//! identifiers; a simulator consumes those payloads, models their transit
//! through a simulated network, and hands them back for delivery to the
//! receiving application.
//!
//! The broker provides identifier-based routing, in-memory buffering,
//! optional off-socket payload storage, and two delivery disciplines
//! (client-pull and broker-push).

pub mod buffer;
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod store;
pub mod utils;

pub use buffer::{MessageBuffer, MessageEntry, PayloadRef};
pub use cli::Args;
pub use config::{BrokerConfig, SimulatorMode, SystemMode};
pub use protocol::{Envelope, Manifest, Metadata, Operation, Originator, StatusCode};
pub use registry::{ClientDetails, ClientRole, Registry};
pub use server::Broker;
pub use store::{MemoryStore, PayloadStore, StoreHandle};

/// The current version of the broker
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    /// Default listen address (loopback only)
    pub const LISTEN_ADDRESS: &str = "127.0.0.1";

    /// Default listen port
    pub const LISTEN_PORT: u16 = 65432;

    /// Upper bound on a single wire frame
    pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

    /// Bounded tick for the accept loop's readiness wait
    pub const ACCEPT_TICK: Duration = Duration::from_secs(10);

    /// Timeout for writes on peer channels (push forwarding)
    pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

    /// Timeout for payload store operations
    pub const STORE_TIMEOUT: Duration = Duration::from_secs(2);
}
