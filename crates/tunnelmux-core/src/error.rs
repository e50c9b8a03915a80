//! Error types for the tunnel engine

use thiserror::Error;
use tunnelmux_proto::{ChannelId, ProtoError};

use crate::registry::RegistryError;

/// Engine errors. Protocol violations and handshake failures are fatal to
/// the tunnel; registry failures only refuse the one connection involved.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("protocol: {0}")]
    Proto(#[from] ProtoError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("registry: {0}")]
    Registry(#[from] RegistryError),

    #[error("login failed")]
    LoginFailed,

    #[error("expected login, got {0}")]
    ExpectedLogin(&'static str),

    #[error("malformed login payload")]
    MalformedLogin,

    #[error("invalid secret from {0}")]
    InvalidSecret(String),

    #[error("[{0}]: received control message on non-zero channel")]
    ControlOnDataChannel(ChannelId),

    #[error("received login handshake in an established tunnel")]
    UnexpectedHandshakeMessage,

    #[error("received invalid message type")]
    InvalidMessageKind,

    #[error("tunnel transport is gone")]
    TransportGone,

    #[error("timed out waiting for the tunnel transport")]
    Timeout,

    #[error("invalid direct stream")]
    BadDirectStream,

    #[error("[{0}]: cannot write to direct stream")]
    DirectWriteFailed(ChannelId),
}
