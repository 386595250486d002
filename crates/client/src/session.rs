//! Transport session contract.
//!
//! A [`TransportSession`] is one live connection to the hub over a specific
//! protocol. Sessions are single-use: once their [`ClosedSignal`] fires they
//! are dead and a new one must be built by the [`SessionFactory`].
//!
//! Optional subscriptions (methods, twin patches, module events, cloud-to-device
//! messages) are modelled as sub-channels: enabling a feature creates its
//! sub-channel, disabling it closes it again.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{
    credentials::AuthToken,
    error::TransportError,
    message::{Message, MethodResponse, Twin, TwinCollection},
};

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseCause {
    /// Closed through [`TransportSession::close`].
    Local,
    /// Lost: network failure, hub disconnect, or the session was dropped.
    Remote(String),
}

impl fmt::Display for CloseCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseCause::Local => write!(f, "closed locally"),
            CloseCause::Remote(reason) => write!(f, "{reason}"),
        }
    }
}

/// Firing side of a session's closed notification.
///
/// Fires at most once; later calls to [`ClosedNotifier::notify`] are ignored.
/// Dropping the notifier without firing counts as a remote close.
#[derive(Debug)]
pub struct ClosedNotifier {
    tx: watch::Sender<Option<CloseCause>>,
}

impl ClosedNotifier {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Records the close cause. Returns false if the notifier already fired.
    pub fn notify(&self, cause: CloseCause) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(cause);
            true
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// A waiter for this notification. Subscribing after it fired still
    /// observes the close.
    pub fn signal(&self) -> ClosedSignal {
        ClosedSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for ClosedNotifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Waiting side of a session's closed notification.
#[derive(Debug, Clone)]
pub struct ClosedSignal {
    rx: watch::Receiver<Option<CloseCause>>,
}

impl ClosedSignal {
    /// A signal that has already fired.
    pub fn fired(cause: CloseCause) -> Self {
        let (_tx, rx) = watch::channel(Some(cause));
        Self { rx }
    }

    pub fn is_closed(&self) -> bool {
        self.rx.borrow().is_some() || self.rx.has_changed().is_err()
    }

    /// Resolves once the session is closed.
    pub async fn wait(mut self) -> CloseCause {
        loop {
            if let Some(cause) = self.rx.borrow_and_update().clone() {
                return cause;
            }
            if self.rx.changed().await.is_err() {
                return self
                    .rx
                    .borrow()
                    .clone()
                    .unwrap_or_else(|| CloseCause::Remote("session dropped".into()));
            }
        }
    }
}

/// A subscription channel within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubchannelKind {
    Methods,
    TwinPatch,
    /// Module events; `edge_module` selects the edge input routing.
    Events { edge_module: bool },
    C2dReceive,
}

impl fmt::Display for SubchannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubchannelKind::Methods => write!(f, "methods"),
            SubchannelKind::TwinPatch => write!(f, "twin_patch"),
            SubchannelKind::Events { edge_module: true } => write!(f, "events(edge)"),
            SubchannelKind::Events { edge_module: false } => write!(f, "events"),
            SubchannelKind::C2dReceive => write!(f, "c2d_receive"),
        }
    }
}

/// An opened sub-channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subchannel {
    pub kind: SubchannelKind,
    /// Transport-specific address (topic filter, link path).
    pub address: String,
}

/// One connection to the hub.
///
/// Only the connection kernel (through its handler chain) calls `open`,
/// `close` and the sub-channel operations. Data operations may run
/// concurrently with each other.
#[async_trait]
pub trait TransportSession: Send + Sync {
    /// Connects and authenticates.
    async fn open(&self, cancel: &CancellationToken) -> Result<(), TransportError>;

    /// Disconnects. Idempotent.
    async fn close(&self) -> Result<(), TransportError>;

    /// Notification that fires exactly once when the session ends.
    fn closed(&self) -> ClosedSignal;

    async fn create_subchannel(&self, kind: SubchannelKind) -> Result<Subchannel, TransportError>;

    async fn close_subchannel(&self, kind: SubchannelKind) -> Result<(), TransportError>;

    /// Obtains a fresh token and applies it where the protocol allows.
    async fn refresh_credentials(&self) -> Result<AuthToken, TransportError>;

    async fn send_event(&self, message: &Message) -> Result<(), TransportError>;

    async fn send_events(&self, messages: &[Message]) -> Result<(), TransportError> {
        for message in messages {
            self.send_event(message).await?;
        }
        Ok(())
    }

    /// Waits for the next cloud-to-device message.
    async fn receive_message(&self) -> Result<Message, TransportError>;

    async fn send_method_response(&self, response: &MethodResponse) -> Result<(), TransportError>;

    async fn get_twin(&self) -> Result<Twin, TransportError>;

    /// Patches reported properties and returns the new reported version.
    async fn patch_twin(&self, reported: &TwinCollection) -> Result<i64, TransportError>;

    async fn complete(&self, lock_token: &str) -> Result<(), TransportError>;

    async fn abandon(&self, lock_token: &str) -> Result<(), TransportError>;

    async fn reject(&self, lock_token: &str) -> Result<(), TransportError>;
}

/// Builds a new, unopened session per connection attempt.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create(&self) -> Result<Arc<dyn TransportSession>, TransportError>;
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_signal_fires_once() {
        let notifier = ClosedNotifier::new();
        let signal = notifier.signal();
        assert!(!signal.is_closed());

        assert!(notifier.notify(CloseCause::Remote("reset".into())));
        assert!(!notifier.notify(CloseCause::Local));

        assert_eq!(signal.wait().await, CloseCause::Remote("reset".into()));
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_close() {
        let notifier = ClosedNotifier::new();
        notifier.notify(CloseCause::Local);

        let signal = notifier.signal();
        assert!(signal.is_closed());
        assert_eq!(signal.wait().await, CloseCause::Local);
    }

    #[tokio::test]
    async fn test_dropped_notifier_counts_as_closed() {
        let notifier = ClosedNotifier::new();
        let signal = notifier.signal();
        drop(notifier);

        let cause = tokio::time::timeout(Duration::from_secs(1), signal.wait())
            .await
            .unwrap();
        assert!(matches!(cause, CloseCause::Remote(_)));
    }

    #[tokio::test]
    async fn test_wait_is_woken_from_another_task() {
        let notifier = Arc::new(ClosedNotifier::new());
        let signal = notifier.signal();

        let firing = notifier.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            firing.notify(CloseCause::Remote("hub went away".into()));
        });

        let cause = tokio::time::timeout(Duration::from_secs(1), signal.wait())
            .await
            .unwrap();
        assert_eq!(cause.to_string(), "hub went away");
    }

    #[tokio::test]
    async fn test_pre_fired_signal() {
        let signal = ClosedSignal::fired(CloseCause::Local);
        assert!(signal.is_closed());
        assert_eq!(signal.wait().await, CloseCause::Local);
    }
}
