//! Multiplexed Tunnel Core
//!
//! Creates a fully transparent multiplexed tunnel for TCP stream
//! connections between two instances of itself, both built around a single
//! open transport stream. The side establishing the tunnel logs in with
//! user and secret; the waiting side checks the secret against its
//! configured allow-set. Once up, either side can `connect()` new direct
//! streams which are multiplexed transparently through the tunnel, up to
//! 16 million tunneled streams per transport.

pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod registry;

pub use config::{Config, ConfigBuilder};
pub use connection::{Connection, TunnelSender, MAX_MESSAGE_QUEUE_SIZE};
pub use engine::{Credentials, Tunnel};
pub use error::EngineError;
pub use registry::{Connections, RegistryError};
