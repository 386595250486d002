//! Tracks whether the device may publish.
//!
//! Readiness follows the client's connection status: `Connected` means
//! ready, every other status means waiting, with the cause attached.
//! Components wait on [`Readiness::wait_ready`] before doing hub work.

use std::{fmt, sync::Arc};

use skylink_client::{ConnectionState, ConnectionStatusInfo};
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ReadinessState {
    /// No connection status seen yet.
    #[default]
    Unknown,
    Waiting(String),
    Ready,
}

impl ReadinessState {
    pub fn is_ready(&self) -> bool {
        *self == ReadinessState::Ready
    }

    /// Why the device is waiting, if it is.
    pub fn cause(&self) -> Option<&str> {
        match self {
            ReadinessState::Waiting(cause) => Some(cause),
            _ => None,
        }
    }
}

impl fmt::Display for ReadinessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadinessState::Unknown => f.write_str("unknown"),
            ReadinessState::Waiting(cause) => write!(f, "waiting: {cause}"),
            ReadinessState::Ready => f.write_str("ready"),
        }
    }
}

impl From<ConnectionStatusInfo> for ReadinessState {
    fn from(status: ConnectionStatusInfo) -> Self {
        let cause = match status.state {
            ConnectionState::Connected => return ReadinessState::Ready,
            ConnectionState::DisconnectedRetrying => format!("reconnecting ({})", status.reason),
            ConnectionState::Disconnected => format!("disconnected ({})", status.reason),
            ConnectionState::Disabled => "client closed".to_string(),
        };
        ReadinessState::Waiting(cause)
    }
}

/// Shared readiness tracker. Clones observe the same state.
#[derive(Debug, Clone)]
pub struct Readiness {
    tx: Arc<watch::Sender<ReadinessState>>,
}

impl Readiness {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ReadinessState::Unknown);
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> watch::Receiver<ReadinessState> {
        self.tx.subscribe()
    }

    pub fn current_state(&self) -> ReadinessState {
        self.tx.borrow().clone()
    }

    pub fn set_state(&self, state: ReadinessState) {
        let previous = self.tx.send_replace(state.clone());
        debug!(from = %previous, to = %state, "Readiness changed");
    }

    /// Mirrors `status` into this tracker from a background task until the
    /// client drops its status channel.
    pub fn start_listening(&self, status: watch::Receiver<ConnectionStatusInfo>) {
        tokio::spawn(self.clone().follow(status));
    }

    async fn follow(self, mut status: watch::Receiver<ConnectionStatusInfo>) {
        loop {
            let info = *status.borrow_and_update();
            debug!(connection = %info, "Connection status observed");
            self.set_state(info.into());
            if status.changed().await.is_err() {
                break;
            }
        }
        debug!("Connection status channel closed");
    }

    /// Resolves once ready. Returns false if the tracker was dropped first.
    pub async fn wait_ready(&self) -> bool {
        self.subscribe()
            .wait_for(ReadinessState::is_ready)
            .await
            .is_ok()
    }
}

impl Default for Readiness {
    fn default() -> Self {
        Self::new()
    }
}
