//! Connection status reported to applications.
//!
//! Every transition of the connection kernel produces a [`ConnectionStatusInfo`]:
//! a [`ConnectionState`] paired with the [`ConnectionStatusChangeReason`] that
//! caused it. Applications observe these values through a callback registered
//! at construction time (the status sink) or through a watch channel.
//!
//! Typical sequences:
//!
//! ```text
//! open ok                 -> Connected / ConnectionOk
//! transient open failure  -> DisconnectedRetrying / CommunicationError -> ... -> Connected / ConnectionOk
//! link dropped, recovered -> DisconnectedRetrying / CommunicationError -> Connected / ConnectionOk
//! retries exhausted       -> Disconnected / RetryExpired
//! bad SAS key             -> Disconnected / BadCredential
//! close                   -> Disabled / ClientClosed
//! ```
//!
//! # Examples
//!
//! ```ignore
//! use skylink_client::state::{ConnectionState, ConnectionStatusInfo};
//!
//! let sink = std::sync::Arc::new(|info: ConnectionStatusInfo| {
//!     println!("status: {info}"); // "status: Connected (ConnectionOk)"
//! });
//! ```

use std::{fmt, sync::Arc};

use tokio::sync::watch;
use tracing::{info, warn};

/// Externally observable status of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No usable connection. Either never opened or recovery gave up.
    Disconnected,

    /// Connected with every enabled subscription in place.
    Connected,

    /// The connection dropped and the client is trying to restore it.
    ///
    /// Operations issued now wait for recovery (or fail with a transient
    /// error that the retry policy absorbs).
    DisconnectedRetrying,

    /// The client was closed by the application.
    Disabled,
}

impl ConnectionState {
    /// Returns a short static identifier, suitable for logs and metrics labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connected => "Connected",
            ConnectionState::DisconnectedRetrying => "DisconnectedRetrying",
            ConnectionState::Disabled => "Disabled",
        }
    }

    /// Checks if the connection is currently usable.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the connection state changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatusChangeReason {
    /// The connection (and all subscriptions) are in place.
    ConnectionOk,
    /// A network or hub failure interrupted the connection.
    CommunicationError,
    /// The retry policy gave up.
    RetryExpired,
    /// The application closed the client.
    ClientClosed,
    /// The hub rejected the credentials.
    BadCredential,
    /// The device identity was disabled or deleted.
    DeviceDisabled,
}

impl ConnectionStatusChangeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatusChangeReason::ConnectionOk => "ConnectionOk",
            ConnectionStatusChangeReason::CommunicationError => "CommunicationError",
            ConnectionStatusChangeReason::RetryExpired => "RetryExpired",
            ConnectionStatusChangeReason::ClientClosed => "ClientClosed",
            ConnectionStatusChangeReason::BadCredential => "BadCredential",
            ConnectionStatusChangeReason::DeviceDisabled => "DeviceDisabled",
        }
    }
}

impl fmt::Display for ConnectionStatusChangeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single status notification: state plus reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionStatusInfo {
    pub state: ConnectionState,
    pub reason: ConnectionStatusChangeReason,
}

impl ConnectionStatusInfo {
    pub fn new(state: ConnectionState, reason: ConnectionStatusChangeReason) -> Self {
        Self { state, reason }
    }
}

impl Default for ConnectionStatusInfo {
    /// A client that was never opened.
    fn default() -> Self {
        Self::new(
            ConnectionState::Disconnected,
            ConnectionStatusChangeReason::ClientClosed,
        )
    }
}

impl fmt::Display for ConnectionStatusInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.state, self.reason)
    }
}

/// Callback receiving every status transition.
///
/// Invoked inline from whichever task observed the transition, possibly from
/// several tasks at once. It must be cheap and must not block.
pub type ConnectionStatusSink = Arc<dyn Fn(ConnectionStatusInfo) + Send + Sync>;

/// Fans a transition out to the sink, the watch channel and the log.
pub(crate) struct StatusReporter {
    sink: Option<ConnectionStatusSink>,
    tx: watch::Sender<ConnectionStatusInfo>,
}

impl StatusReporter {
    pub(crate) fn new(sink: Option<ConnectionStatusSink>) -> Self {
        let (tx, _rx) = watch::channel(ConnectionStatusInfo::default());
        Self { sink, tx }
    }

    pub(crate) fn report(&self, state: ConnectionState, reason: ConnectionStatusChangeReason) {
        let status = ConnectionStatusInfo::new(state, reason);
        match state {
            ConnectionState::Connected | ConnectionState::Disabled => {
                info!(state = %state, reason = %reason, "Connection status changed")
            }
            _ => warn!(state = %state, reason = %reason, "Connection status changed"),
        }
        if let Some(sink) = &self.sink {
            sink(status);
        }
        self.tx.send_replace(status);
    }

    pub(crate) fn current(&self) -> ConnectionStatusInfo {
        *self.tx.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ConnectionStatusInfo> {
        self.tx.subscribe()
    }
}
