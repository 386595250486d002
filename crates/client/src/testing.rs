//! Scripted in-memory transport used by the unit tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{
    credentials::AuthToken,
    error::TransportError,
    message::{Message, MethodResponse, Twin, TwinCollection},
    session::{
        CloseCause, ClosedNotifier, ClosedSignal, SessionFactory, Subchannel, SubchannelKind,
        TransportSession,
    },
};

#[derive(Default)]
struct Script {
    open_failures: VecDeque<TransportError>,
    subchannel_failures: HashMap<SubchannelKind, VecDeque<TransportError>>,
    open_delay: Duration,
    open_calls: usize,
    close_failures: VecDeque<TransportError>,
}

/// Factory whose sessions follow a shared failure script.
#[derive(Default)]
pub(crate) struct MockFactory {
    script: Arc<Mutex<Script>>,
    sessions: Mutex<Vec<Arc<MockSession>>>,
}

impl MockFactory {
    /// Queues failures returned by the next session opens, in order.
    pub(crate) fn fail_opens(&self, errors: impl IntoIterator<Item = TransportError>) {
        self.script.lock().unwrap().open_failures.extend(errors);
    }

    /// Queues failures for creating a given sub-channel on any session.
    pub(crate) fn fail_subchannel(
        &self,
        kind: SubchannelKind,
        errors: impl IntoIterator<Item = TransportError>,
    ) {
        self.script
            .lock()
            .unwrap()
            .subchannel_failures
            .entry(kind)
            .or_default()
            .extend(errors);
    }

    /// Queues failures returned by the next session closes, in order.
    pub(crate) fn fail_closes(&self, errors: impl IntoIterator<Item = TransportError>) {
        self.script.lock().unwrap().close_failures.extend(errors);
    }

    pub(crate) fn set_open_delay(&self, delay: Duration) {
        self.script.lock().unwrap().open_delay = delay;
    }

    pub(crate) fn open_calls(&self) -> usize {
        self.script.lock().unwrap().open_calls
    }

    pub(crate) fn created(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub(crate) fn last_session(&self) -> Option<Arc<MockSession>> {
        self.sessions.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl SessionFactory for MockFactory {
    async fn create(&self) -> Result<Arc<dyn TransportSession>, TransportError> {
        let session = Arc::new(MockSession::new(self.script.clone()));
        self.sessions.lock().unwrap().push(session.clone());
        Ok(session)
    }
}

pub(crate) struct MockSession {
    script: Arc<Mutex<Script>>,
    notifier: ClosedNotifier,
    subchannels: Mutex<Vec<SubchannelKind>>,
    sent: Mutex<Vec<Message>>,
    close_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
}

impl MockSession {
    fn new(script: Arc<Mutex<Script>>) -> Self {
        Self {
            script,
            notifier: ClosedNotifier::new(),
            subchannels: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            close_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
        }
    }

    /// Simulates the hub dropping the connection.
    pub(crate) fn drop_connection(&self, reason: &str) {
        self.notifier.notify(CloseCause::Remote(reason.into()));
    }

    pub(crate) fn subchannels(&self) -> Vec<SubchannelKind> {
        self.subchannels.lock().unwrap().clone()
    }

    pub(crate) fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub(crate) fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    fn check_alive(&self) -> Result<(), TransportError> {
        if self.notifier.is_closed() {
            Err(TransportError::SessionClosed("mock session closed".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl TransportSession for MockSession {
    async fn open(&self, _cancel: &CancellationToken) -> Result<(), TransportError> {
        let (delay, failure) = {
            let mut script = self.script.lock().unwrap();
            script.open_calls += 1;
            (script.open_delay, script.open_failures.pop_front())
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match failure {
            Some(err) => {
                self.notifier.notify(CloseCause::Remote(err.to_string()));
                Err(err)
            }
            None => Ok(()),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.notifier.notify(CloseCause::Local);
        match self.script.lock().unwrap().close_failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn closed(&self) -> ClosedSignal {
        self.notifier.signal()
    }

    async fn create_subchannel(&self, kind: SubchannelKind) -> Result<Subchannel, TransportError> {
        self.check_alive()?;
        let failure = self
            .script
            .lock()
            .unwrap()
            .subchannel_failures
            .get_mut(&kind)
            .and_then(VecDeque::pop_front);
        if let Some(err) = failure {
            return Err(err);
        }
        let mut channels = self.subchannels.lock().unwrap();
        if !channels.contains(&kind) {
            channels.push(kind);
        }
        Ok(Subchannel {
            kind,
            address: format!("mock/{kind}"),
        })
    }

    async fn close_subchannel(&self, kind: SubchannelKind) -> Result<(), TransportError> {
        self.check_alive()?;
        self.subchannels.lock().unwrap().retain(|k| *k != kind);
        Ok(())
    }

    async fn refresh_credentials(&self) -> Result<AuthToken, TransportError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        Ok(AuthToken::new("mock-token", None))
    }

    async fn send_event(&self, message: &Message) -> Result<(), TransportError> {
        self.check_alive()?;
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }

    async fn receive_message(&self) -> Result<Message, TransportError> {
        self.check_alive()?;
        Ok(Message::new("from the cloud").with_message_id("c2d-1"))
    }

    async fn send_method_response(&self, _response: &MethodResponse) -> Result<(), TransportError> {
        self.check_alive()
    }

    async fn get_twin(&self) -> Result<Twin, TransportError> {
        self.check_alive()?;
        Ok(Twin::default())
    }

    async fn patch_twin(&self, _reported: &TwinCollection) -> Result<i64, TransportError> {
        self.check_alive()?;
        Ok(2)
    }

    async fn complete(&self, _lock_token: &str) -> Result<(), TransportError> {
        self.check_alive()
    }

    async fn abandon(&self, _lock_token: &str) -> Result<(), TransportError> {
        self.check_alive()
    }

    async fn reject(&self, _lock_token: &str) -> Result<(), TransportError> {
        self.check_alive()
    }
}
