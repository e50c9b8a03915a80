//! Stream abstractions for the tunnel
//!
//! The tunnel core moves bytes between a shared transport stream and many
//! direct streams. Both are represented by the [`TunnelStream`] trait; this
//! crate ships a TCP implementation and an in-memory duplex pair for tests.

pub mod memory;
pub mod tcp;
pub mod transport;

pub use tcp::TcpTunnelStream;
pub use transport::{Interest, Readiness, TunnelStream};
