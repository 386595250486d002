//! Error taxonomy for the device client.
//!
//! Errors are split in two layers:
//!
//! **Transport errors** (`TransportError`) are produced by a transport session
//! and describe what went wrong on the wire. Each kind is either transient
//! (network failures, timeouts, a busy or throttling hub) or permanent
//! (bad credentials, a removed device, protocol violations).
//!
//! **Client errors** (`ClientError`) are what callers of the client observe.
//! They wrap transport errors and add usage errors (operation before open,
//! operation after close), cancellation and local failures such as
//! configuration or serialization problems.
//!
//! The retry machinery never inspects error messages. It asks
//! [`ClientError::is_transient`] (through a classifier) and pattern-matches on
//! the kind to pick a connection status reason.
//!
//! # Usage
//!
//! ```ignore
//! match client.send_event(&message, &cancel).await {
//!     Ok(()) => {}
//!     Err(ClientError::Transport(TransportError::Unauthorized(msg))) => {
//!         eprintln!("credentials rejected: {msg}");
//!     }
//!     Err(ClientError::Disposed) => return,
//!     Err(e) => eprintln!("send failed: {e}"),
//! }
//! ```

use thiserror::Error;

use crate::features::Feature;

/// Failure reported by a transport session.
///
/// Both error types are `Clone` so a single outcome can be handed to several
/// waiters (see the shared open in the connection kernel).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Socket-level failure: connection reset, refused, DNS, broken pipe.
    #[error("Network error: {0}")]
    Network(String),

    /// The hub did not answer in time.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// The hub is up but cannot serve the request right now.
    #[error("Server busy: {0}")]
    ServerBusy(String),

    /// Request rate exceeded the hub's limits.
    #[error("Throttled by hub: {0}")]
    Throttled(String),

    /// The hub failed internally (5xx class).
    #[error("Hub server error: {0}")]
    ServerError(String),

    /// The session closed while the operation was pending.
    #[error("Session closed: {0}")]
    SessionClosed(String),

    /// Credentials were rejected.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The device (or module) does not exist or has been disabled.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Daily message quota for the hub is exhausted.
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Payload larger than the hub or the session accepts.
    #[error("Message too large: {size} bytes (limit {limit})")]
    MessageTooLarge { size: usize, limit: usize },

    /// The lock token no longer refers to a locked message.
    #[error("Message lock lost: {0}")]
    LockLost(String),

    /// Unexpected frame, malformed reply or TLS failure.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Session could not be constructed from its configuration.
    #[error("Transport configuration error: {0}")]
    Configuration(String),

    /// The operation has no meaning for this transport.
    #[error("Operation not supported by this transport: {0}")]
    Unsupported(String),
}

impl TransportError {
    /// Returns true if retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::Network(_)
                | TransportError::Timeout(_)
                | TransportError::ServerBusy(_)
                | TransportError::Throttled(_)
                | TransportError::ServerError(_)
                | TransportError::SessionClosed(_)
        )
    }

    /// Maps a hub status code (as carried in twin and method replies) to an error.
    ///
    /// Returns `None` for 2xx codes.
    pub fn from_status(status: u16, context: impl Into<String>) -> Option<Self> {
        let context = context.into();
        let err = match status {
            200..=299 => return None,
            401 => TransportError::Unauthorized(context),
            403 => TransportError::QuotaExceeded(context),
            404 => TransportError::DeviceNotFound(context),
            408 | 504 => TransportError::Timeout(context),
            429 => TransportError::Throttled(context),
            503 => TransportError::ServerBusy(context),
            500..=599 => TransportError::ServerError(context),
            _ => TransportError::Protocol(format!("status {status}: {context}")),
        };
        Some(err)
    }
}

/// Errors returned by client operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    /// An operation was attempted before `open` ever succeeded.
    #[error("The client must be opened before performing operations")]
    NotOpened,

    /// The transport disconnected and recovery is underway.
    #[error("The transport is reconnecting")]
    Reconnecting,

    /// The transport disconnected and automatic recovery has ended.
    #[error("The transport has disconnected; call open to reconnect")]
    ConnectionLost,

    /// The client was closed; a new instance is required.
    #[error("The client has been closed and cannot be used")]
    Disposed,

    /// The caller's cancellation token fired.
    #[error("Operation cancelled")]
    Cancelled,

    /// Enable on an already-enabled feature, or disable on a disabled one.
    #[error("Feature {feature} is already {}", state_word(.enabled))]
    FeatureState { feature: Feature, enabled: bool },

    /// Failure reported by the transport session.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The client could not be assembled (credentials, TLS files, options).
    #[error("Client setup error: {0}")]
    ClientSetup(String),

    /// Configuration failed validation.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Payload could not be encoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Payload could not be decoded.
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Local I/O failure, e.g. while reading certificates or compressing.
    #[error("I/O error: {0}")]
    Io(String),
}

impl ClientError {
    /// Returns true if the failure may clear up on its own.
    ///
    /// Usage errors are permanent. `Reconnecting` is transient so that an
    /// operation issued during recovery waits for it instead of failing.
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Reconnecting => true,
            ClientError::Transport(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Returns true for misuse of the client rather than a runtime failure.
    pub fn is_usage(&self) -> bool {
        matches!(
            self,
            ClientError::NotOpened
                | ClientError::ConnectionLost
                | ClientError::Disposed
                | ClientError::FeatureState { .. }
        )
    }
}

fn state_word(enabled: &bool) -> &'static str {
    if *enabled {
        "enabled"
    } else {
        "disabled"
    }
}

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        ClientError::Io(e.to_string())
    }
}

impl From<validator::ValidationErrors> for ClientError {
    fn from(e: validator::ValidationErrors) -> Self {
        ClientError::Config(e.to_string())
    }
}

/// Convenience result alias used across the crate.
pub type Result<T> = std::result::Result<T, ClientError>;
