//! Connection kernel: retry orchestration and disconnect recovery.
//!
//! [`ConnectionKernel`] sits in front of the handler chain and gives every
//! public operation the same treatment:
//!
//! - operations run under the current [`RetryPolicy`] and stop on cancellation;
//! - `open` is single-flight: concurrent callers share one transport open;
//! - once open, a disconnect watcher waits for the session's closed
//!   notification, rebuilds the session and re-enables every subscription
//!   that was on before reporting `Connected` again;
//! - `close` is idempotent and ends every background task it started.
//!
//! Lifecycle:
//!
//! ```text
//! Unopened --open--> Connected --link lost--> Reconnecting --ok--> Connected
//!                        ^                         |
//!                        |                     gave up
//!                        +--------open-------- Lost
//! any --close--> Closed (terminal)
//! ```
//!
//! The open/close/recovery/feature bookkeeping is serialized by one async
//! gate. Data operations only hold it for a state check, so they proceed
//! concurrently once the connection is up.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex as StdMutex, PoisonError, RwLock,
    },
};

use futures_util::future::try_join_all;
use tokio::{
    sync::{watch, Mutex, MutexGuard},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::{
    backoff::RetryDecision,
    error::{ClientError, Result, TransportError},
    features::{Feature, FeatureFlags},
    handler::DeviceHandler,
    message::{Message, MethodResponse, Twin, TwinCollection},
    retry::{RetryExecutor, RetryPolicy},
    session::ClosedSignal,
    state::{
        ConnectionState, ConnectionStatusChangeReason as Reason, ConnectionStatusInfo,
        ConnectionStatusSink, StatusReporter,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Unopened,
    Connected,
    Reconnecting,
    Lost,
    Closed,
}

struct Gate {
    link: LinkState,
    /// Set once an open succeeded; close only releases the transport after that.
    open_called: bool,
    features: FeatureFlags,
    /// Outcome of the last open, handed to callers that waited on it.
    last_open: Option<Result<()>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatcherExit {
    /// Stopped by close.
    ClosedByClient,
    Recovered,
    RetryExpired,
    Failed,
}

struct DisconnectWatcher {
    scope: CancellationToken,
    handle: JoinHandle<WatcherExit>,
}

struct Shared {
    next: Box<dyn DeviceHandler>,
    gate: Mutex<Gate>,
    connected: AtomicBool,
    disposed: AtomicBool,
    open_epoch: AtomicU64,
    policy: RwLock<RetryPolicy>,
    status: StatusReporter,
    lifetime: CancellationToken,
    watcher: StdMutex<Option<DisconnectWatcher>>,
}

/// Resilient front of the device client.
///
/// # Examples
///
/// ```ignore
/// let kernel = ConnectionKernel::new(Box::new(DefaultHandler::new(factory)), Some(sink))
///     .with_retry_policy(RetryPolicy::default());
/// let cancel = CancellationToken::new();
///
/// kernel.open(&cancel).await?;
/// kernel.enable_methods(&cancel).await?;
/// kernel.send_event(&Message::new("hello"), &cancel).await?;
/// kernel.close(&cancel).await?;
/// ```
pub struct ConnectionKernel {
    shared: Arc<Shared>,
}

impl ConnectionKernel {
    pub fn new(next: Box<dyn DeviceHandler>, sink: Option<ConnectionStatusSink>) -> Self {
        Self {
            shared: Arc::new(Shared {
                next,
                gate: Mutex::new(Gate {
                    link: LinkState::Unopened,
                    open_called: false,
                    features: FeatureFlags::default(),
                    last_open: None,
                }),
                connected: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                open_epoch: AtomicU64::new(0),
                policy: RwLock::new(RetryPolicy::default()),
                status: StatusReporter::new(sink),
                lifetime: CancellationToken::new(),
                watcher: StdMutex::new(None),
            }),
        }
    }

    pub fn with_retry_policy(self, policy: RetryPolicy) -> Self {
        self.set_retry_policy(policy);
        self
    }

    /// Replaces the retry policy. Operations already running keep the
    /// policy they started with.
    pub fn set_retry_policy(&self, policy: RetryPolicy) {
        *self
            .shared
            .policy
            .write()
            .unwrap_or_else(PoisonError::into_inner) = policy;
        debug!("Retry policy replaced");
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.shared.policy()
    }

    /// Last reported status.
    pub fn status(&self) -> ConnectionStatusInfo {
        self.shared.status.current()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatusInfo> {
        self.shared.status.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    pub async fn features(&self) -> FeatureFlags {
        self.shared.gate.lock().await.features
    }

    /// Opens the connection.
    ///
    /// Returns at once if already connected. Callers that arrive while another
    /// open is running wait for it and get its outcome.
    ///
    /// # Errors
    /// - `ClientError::Disposed` after [`close`](Self::close)
    /// - `ClientError::Cancelled` if `cancel` fires
    /// - the last transport failure when it is permanent or retries ran out
    pub async fn open(&self, cancel: &CancellationToken) -> Result<()> {
        let shared = &*self.shared;
        shared.ensure_not_disposed()?;
        if shared.connected.load(Ordering::Acquire) {
            return Ok(());
        }

        let epoch = shared.open_epoch.load(Ordering::Acquire);
        let mut gate = shared.lock_gate(cancel).await?;
        shared.ensure_not_disposed()?;
        if gate.link == LinkState::Connected {
            return Ok(());
        }
        if shared.open_epoch.load(Ordering::Acquire) != epoch {
            // another caller's cancellation is not ours to share
            let shared_outcome = gate
                .last_open
                .clone()
                .filter(|outcome| outcome != &Err(ClientError::Cancelled));
            if let Some(outcome) = shared_outcome {
                debug!("Returning the outcome of a concurrent open");
                return outcome;
            }
        }

        // after a lost connection the new session needs the old subscriptions
        let features = gate.features;
        info!(features = %features, "Opening connection");
        let outcome = tokio::select! {
            biased;
            _ = shared.lifetime.cancelled() => Err(ClientError::Disposed),
            outcome = shared.open_internal(features, cancel) => outcome,
        };

        match &outcome {
            Ok(()) => {
                shared.set_link(&mut gate, LinkState::Connected);
                gate.open_called = true;
                self.shared.spawn_watcher();
                shared
                    .status
                    .report(ConnectionState::Connected, Reason::ConnectionOk);
            }
            Err(ClientError::Disposed) => debug!("Client closed while opening"),
            Err(err) => {
                error!(error = %err, "Failed to open connection");
                shared.report_failure(err, true);
            }
        }

        gate.last_open = Some(outcome.clone());
        shared.open_epoch.fetch_add(1, Ordering::AcqRel);
        outcome
    }

    /// Closes the client for good.
    ///
    /// Stops the disconnect watcher, releases the transport and reports
    /// `Disabled / ClientClosed` once. Closing twice, or before any open,
    /// does nothing.
    ///
    /// The release runs to completion even if `cancel` fires; a failed
    /// transport close is reported as `Disconnected / CommunicationError`
    /// and does not keep the client from closing.
    pub async fn close(&self, cancel: &CancellationToken) -> Result<()> {
        let shared = &*self.shared;
        if shared.disposed.swap(true, Ordering::AcqRel) {
            debug!("Client already closed");
            return Ok(());
        }
        shared.lifetime.cancel();

        // opens and recoveries holding the gate stop on `lifetime`
        let mut gate = shared.gate.lock().await;
        let was_opened = gate.open_called;
        shared.set_link(&mut gate, LinkState::Closed);
        if !was_opened {
            debug!("Client closed before it was opened");
            return Ok(());
        }

        let released = shared.next.close(cancel).await;
        drop(gate);
        if let Err(err) = released {
            warn!(error = %err, "Failed to close the transport cleanly");
            shared
                .status
                .report(ConnectionState::Disconnected, Reason::CommunicationError);
        }

        if let Some(watcher) = shared.take_watcher() {
            watcher.scope.cancel();
            let exit = watcher.handle.await.unwrap_or(WatcherExit::Failed);
            debug!(?exit, "Disconnect watcher finished");
        }
        shared
            .status
            .report(ConnectionState::Disabled, Reason::ClientClosed);
        info!("Client closed");
        Ok(())
    }

    pub async fn send_event(&self, message: &Message, cancel: &CancellationToken) -> Result<()> {
        self.shared
            .guarded(cancel, |next| next.send_event(message, cancel))
            .await
    }

    pub async fn send_events(&self, messages: &[Message], cancel: &CancellationToken) -> Result<()> {
        self.shared
            .guarded(cancel, |next| next.send_events(messages, cancel))
            .await
    }

    /// Waits for the next cloud-to-device message.
    pub async fn receive_message(&self, cancel: &CancellationToken) -> Result<Message> {
        self.shared
            .guarded(cancel, |next| next.receive_message(cancel))
            .await
    }

    pub async fn send_method_response(
        &self,
        response: &MethodResponse,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.shared
            .guarded(cancel, |next| next.send_method_response(response, cancel))
            .await
    }

    pub async fn get_twin(&self, cancel: &CancellationToken) -> Result<Twin> {
        self.shared
            .guarded(cancel, |next| next.get_twin(cancel))
            .await
    }

    /// Patches reported properties; returns the new reported version.
    pub async fn patch_twin(
        &self,
        reported: &TwinCollection,
        cancel: &CancellationToken,
    ) -> Result<i64> {
        self.shared
            .guarded(cancel, |next| next.patch_twin(reported, cancel))
            .await
    }

    pub async fn complete(&self, lock_token: &str, cancel: &CancellationToken) -> Result<()> {
        self.shared
            .guarded(cancel, |next| next.complete(lock_token, cancel))
            .await
    }

    pub async fn abandon(&self, lock_token: &str, cancel: &CancellationToken) -> Result<()> {
        self.shared
            .guarded(cancel, |next| next.abandon(lock_token, cancel))
            .await
    }

    pub async fn reject(&self, lock_token: &str, cancel: &CancellationToken) -> Result<()> {
        self.shared
            .guarded(cancel, |next| next.reject(lock_token, cancel))
            .await
    }

    pub async fn enable_methods(&self, cancel: &CancellationToken) -> Result<()> {
        self.toggle(Feature::Methods, true, false, cancel).await
    }

    pub async fn disable_methods(&self, cancel: &CancellationToken) -> Result<()> {
        self.toggle(Feature::Methods, false, false, cancel).await
    }

    pub async fn enable_twin_patch(&self, cancel: &CancellationToken) -> Result<()> {
        self.toggle(Feature::TwinPatch, true, false, cancel).await
    }

    pub async fn disable_twin_patch(&self, cancel: &CancellationToken) -> Result<()> {
        self.toggle(Feature::TwinPatch, false, false, cancel).await
    }

    /// Enables module events; `edge_module` selects edge input routing.
    pub async fn enable_events(&self, edge_module: bool, cancel: &CancellationToken) -> Result<()> {
        self.toggle(Feature::Events, true, edge_module, cancel).await
    }

    pub async fn disable_events(&self, edge_module: bool, cancel: &CancellationToken) -> Result<()> {
        self.toggle(Feature::Events, false, edge_module, cancel).await
    }

    pub async fn enable_c2d_receive(&self, cancel: &CancellationToken) -> Result<()> {
        self.toggle(Feature::C2dReceive, true, false, cancel).await
    }

    pub async fn disable_c2d_receive(&self, cancel: &CancellationToken) -> Result<()> {
        self.toggle(Feature::C2dReceive, false, false, cancel).await
    }

    async fn toggle(
        &self,
        feature: Feature,
        enable: bool,
        edge_module: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let shared = &*self.shared;
        shared
            .executor()
            .run(cancel, move || async move {
                shared.ensure_open(cancel).await?;
                let mut gate = shared.lock_gate(cancel).await?;
                shared.check_link(&gate)?;
                if gate.features.is_enabled(feature) == enable {
                    return Err(ClientError::FeatureState {
                        feature,
                        enabled: enable,
                    });
                }

                if enable {
                    shared.enable_next(feature, edge_module, cancel).await?;
                } else {
                    shared.disable_next(feature, edge_module, cancel).await?;
                }
                gate.features.set(feature, enable);
                if feature == Feature::Events {
                    gate.features.set_edge_module(edge_module);
                }
                info!(feature = %feature, enabled = enable, "Feature updated");
                Ok(())
            })
            .await
    }
}

impl Drop for ConnectionKernel {
    fn drop(&mut self) {
        if let Some(watcher) = self.shared.take_watcher() {
            watcher.scope.cancel();
        }
        self.shared.lifetime.cancel();
    }
}

impl Shared {
    fn policy(&self) -> RetryPolicy {
        self.policy
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn executor<'a>(&self) -> RetryExecutor<'a> {
        RetryExecutor::new(self.policy())
    }

    fn ensure_not_disposed(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            Err(ClientError::Disposed)
        } else {
            Ok(())
        }
    }

    async fn lock_gate(&self, cancel: &CancellationToken) -> Result<MutexGuard<'_, Gate>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ClientError::Cancelled),
            gate = self.gate.lock() => Ok(gate),
        }
    }

    fn set_link(&self, gate: &mut Gate, link: LinkState) {
        gate.link = link;
        self.connected
            .store(link == LinkState::Connected, Ordering::Release);
    }

    fn check_link(&self, gate: &Gate) -> Result<()> {
        match gate.link {
            LinkState::Connected => Ok(()),
            LinkState::Reconnecting => Err(ClientError::Reconnecting),
            LinkState::Lost => Err(ClientError::ConnectionLost),
            LinkState::Unopened => Err(ClientError::NotOpened),
            LinkState::Closed => Err(ClientError::Disposed),
        }
    }

    /// Fails unless the connection is usable. Waits while a recovery holds
    /// the gate.
    async fn ensure_open(&self, cancel: &CancellationToken) -> Result<()> {
        self.ensure_not_disposed()?;
        if self.connected.load(Ordering::Acquire) {
            return Ok(());
        }
        let gate = self.lock_gate(cancel).await?;
        self.check_link(&gate)
    }

    async fn guarded<'a, T, F, Fut>(&'a self, cancel: &'a CancellationToken, op: F) -> Result<T>
    where
        F: Fn(&'a dyn DeviceHandler) -> Fut,
        Fut: Future<Output = Result<T>> + 'a,
    {
        let next: &'a dyn DeviceHandler = &*self.next;
        self.executor()
            .run(cancel, || {
                let call = op(next);
                async move {
                    self.ensure_open(cancel).await?;
                    call.await
                }
            })
            .await
    }

    async fn open_internal(&self, features: FeatureFlags, cancel: &CancellationToken) -> Result<()> {
        self.executor()
            .on_retry(|err, _, _| self.report_failure(err, false))
            .run(cancel, || self.recover(features, cancel))
            .await
    }

    fn report_failure(&self, err: &ClientError, exhausted: bool) {
        let (state, reason) = match err {
            ClientError::Transport(TransportError::Unauthorized(_)) => {
                (ConnectionState::Disconnected, Reason::BadCredential)
            }
            ClientError::Transport(TransportError::DeviceNotFound(_)) => {
                (ConnectionState::Disconnected, Reason::DeviceDisabled)
            }
            e if self.policy().is_transient(e) => {
                if exhausted {
                    (ConnectionState::Disconnected, Reason::RetryExpired)
                } else {
                    (ConnectionState::DisconnectedRetrying, Reason::CommunicationError)
                }
            }
            _ => (ConnectionState::Disconnected, Reason::CommunicationError),
        };
        self.status.report(state, reason);
    }

    async fn enable_next(
        &self,
        feature: Feature,
        edge_module: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match feature {
            Feature::Methods => self.next.enable_methods(cancel).await,
            Feature::TwinPatch => self.next.enable_twin_patch(cancel).await,
            Feature::Events => self.next.enable_events(edge_module, cancel).await,
            Feature::C2dReceive => self.next.enable_c2d_receive(cancel).await,
        }
    }

    async fn disable_next(
        &self,
        feature: Feature,
        edge_module: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match feature {
            Feature::Methods => self.next.disable_methods(cancel).await,
            Feature::TwinPatch => self.next.disable_twin_patch(cancel).await,
            Feature::Events => self.next.disable_events(edge_module, cancel).await,
            Feature::C2dReceive => self.next.disable_c2d_receive(cancel).await,
        }
    }

    fn take_watcher(&self) -> Option<DisconnectWatcher> {
        self.watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Starts watching the session opened last. Called with the gate held.
    fn spawn_watcher(self: &Arc<Self>) {
        let scope = self.lifetime.child_token();
        let closed = self.next.closed();
        let handle = tokio::spawn(
            Arc::clone(self)
                .watch_disconnect(closed, scope.clone())
                .in_current_span(),
        );

        let mut slot = self.watcher.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = slot.replace(DisconnectWatcher { scope, handle }) {
            debug!(finished = previous.handle.is_finished(), "Replaced disconnect watcher");
        }
    }

    /// `close` reports `Disabled / ClientClosed` once the watcher is done.
    fn closed_by_client(&self) -> WatcherExit {
        debug!("Disconnect watcher stopped by close");
        WatcherExit::ClosedByClient
    }

    /// Re-opens the transport and replays every enabled subscription.
    async fn recover(&self, features: FeatureFlags, cancel: &CancellationToken) -> Result<()> {
        self.next.open(cancel).await?;
        let edge_module = features.is_edge_module();
        try_join_all(
            features
                .enabled()
                .into_iter()
                .map(|feature| self.enable_next(feature, edge_module, cancel)),
        )
        .await?;
        Ok(())
    }

    async fn watch_disconnect(self: Arc<Self>, closed: ClosedSignal, scope: CancellationToken) -> WatcherExit {
        let cause = tokio::select! {
            biased;
            _ = scope.cancelled() => return self.closed_by_client(),
            cause = closed.wait() => cause,
        };
        warn!(cause = %cause, "Transport session closed unexpectedly");

        let mut gate = tokio::select! {
            biased;
            _ = scope.cancelled() => return self.closed_by_client(),
            gate = self.gate.lock() => gate,
        };
        if gate.link == LinkState::Closed {
            return self.closed_by_client();
        }
        self.set_link(&mut gate, LinkState::Reconnecting);

        let policy = self.policy();
        let trigger = ClientError::Transport(TransportError::Network(format!(
            "transport closed: {cause}"
        )));
        let delay = match policy.decide(0, &trigger) {
            RetryDecision::Retry(delay) => delay,
            RetryDecision::Stop => {
                self.set_link(&mut gate, LinkState::Lost);
                error!("Retry policy does not allow reconnecting");
                self.status
                    .report(ConnectionState::Disconnected, Reason::RetryExpired);
                return WatcherExit::RetryExpired;
            }
        };
        self.status
            .report(ConnectionState::DisconnectedRetrying, Reason::CommunicationError);

        if !delay.is_zero() {
            tokio::select! {
                biased;
                _ = scope.cancelled() => return self.closed_by_client(),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let features = gate.features;
        info!(features = %features, "Reconnecting");
        let shared: &Shared = &self;
        let scope_ref = &scope;
        let result = RetryExecutor::new(policy)
            .starting_at(1)
            .run(scope_ref, move || shared.recover(features, scope_ref))
            .await;

        match result {
            Ok(()) if scope.is_cancelled() => self.closed_by_client(),
            Ok(()) => {
                self.set_link(&mut gate, LinkState::Connected);
                self.spawn_watcher();
                info!("Connection recovered");
                self.status
                    .report(ConnectionState::Connected, Reason::ConnectionOk);
                WatcherExit::Recovered
            }
            Err(ClientError::Cancelled) => self.closed_by_client(),
            Err(err) => {
                self.set_link(&mut gate, LinkState::Lost);
                error!(error = %err, "Reconnection failed");
                self.report_failure(&err, true);
                WatcherExit::Failed
            }
        }
    }
}
