//! Handler chain between the connection kernel and a transport session.
//!
//! [`DeviceHandler`] is the full client operation surface. The
//! [`ConnectionKernel`](crate::connection::ConnectionKernel) owns the next
//! stage as a `Box<dyn DeviceHandler>`; the terminal stage is
//! [`DefaultHandler`], which builds a fresh session from a
//! [`SessionFactory`] on every open and forwards operations to it.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::{ClientError, Result, TransportError},
    message::{Message, MethodResponse, Twin, TwinCollection},
    session::{CloseCause, ClosedSignal, SessionFactory, SubchannelKind, TransportSession},
};

/// Operations every stage of the handler chain supports.
#[async_trait]
pub trait DeviceHandler: Send + Sync {
    async fn open(&self, cancel: &CancellationToken) -> Result<()>;
    async fn close(&self, cancel: &CancellationToken) -> Result<()>;

    /// Closed notification of the session opened last.
    fn closed(&self) -> ClosedSignal;

    async fn send_event(&self, message: &Message, cancel: &CancellationToken) -> Result<()>;
    async fn send_events(&self, messages: &[Message], cancel: &CancellationToken) -> Result<()>;
    async fn receive_message(&self, cancel: &CancellationToken) -> Result<Message>;

    async fn enable_methods(&self, cancel: &CancellationToken) -> Result<()>;
    async fn disable_methods(&self, cancel: &CancellationToken) -> Result<()>;
    async fn enable_twin_patch(&self, cancel: &CancellationToken) -> Result<()>;
    async fn disable_twin_patch(&self, cancel: &CancellationToken) -> Result<()>;
    async fn enable_events(&self, edge_module: bool, cancel: &CancellationToken) -> Result<()>;
    async fn disable_events(&self, edge_module: bool, cancel: &CancellationToken) -> Result<()>;
    async fn enable_c2d_receive(&self, cancel: &CancellationToken) -> Result<()>;
    async fn disable_c2d_receive(&self, cancel: &CancellationToken) -> Result<()>;

    async fn send_method_response(
        &self,
        response: &MethodResponse,
        cancel: &CancellationToken,
    ) -> Result<()>;
    async fn get_twin(&self, cancel: &CancellationToken) -> Result<Twin>;
    async fn patch_twin(&self, reported: &TwinCollection, cancel: &CancellationToken) -> Result<i64>;

    async fn complete(&self, lock_token: &str, cancel: &CancellationToken) -> Result<()>;
    async fn abandon(&self, lock_token: &str, cancel: &CancellationToken) -> Result<()>;
    async fn reject(&self, lock_token: &str, cancel: &CancellationToken) -> Result<()>;
}

/// Terminal stage: owns the current session and forwards to it.
pub struct DefaultHandler {
    factory: Arc<dyn SessionFactory>,
    session: Mutex<Option<Arc<dyn TransportSession>>>,
    refresh_interval: Option<Duration>,
    refresher: Mutex<Option<CancellationToken>>,
}

impl DefaultHandler {
    pub fn new(factory: Arc<dyn SessionFactory>) -> Self {
        Self {
            factory,
            session: Mutex::new(None),
            refresh_interval: None,
            refresher: Mutex::new(None),
        }
    }

    /// Refreshes session credentials every `interval` while a session is open.
    pub fn with_credential_refresh(mut self, interval: Duration) -> Self {
        self.refresh_interval = Some(interval).filter(|i| !i.is_zero());
        self
    }

    fn current(&self) -> Result<Arc<dyn TransportSession>> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| TransportError::SessionClosed("no active session".into()).into())
    }

    fn replace_session(
        &self,
        next: Option<Arc<dyn TransportSession>>,
    ) -> Option<Arc<dyn TransportSession>> {
        let mut slot = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *slot, next)
    }

    fn stop_refresher(&self) {
        if let Some(token) = self
            .refresher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            token.cancel();
        }
    }

    fn start_refresher(&self, session: Arc<dyn TransportSession>) {
        let Some(interval) = self.refresh_interval else {
            return;
        };
        let token = CancellationToken::new();
        let stop = token.clone();
        let closed = session.closed();

        tokio::spawn(async move {
            let closed = closed.wait();
            tokio::pin!(closed);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = &mut closed => break,
                    _ = tokio::time::sleep(interval) => {
                        match session.refresh_credentials().await {
                            Ok(fresh) => debug!(expires_at = ?fresh.expires_at(), "Credentials refreshed"),
                            Err(e) => warn!(error = %e, "Credential refresh failed"),
                        }
                    }
                }
            }
            debug!("Credential refresh loop stopped");
        });

        if let Some(previous) = self
            .refresher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(token)
        {
            previous.cancel();
        }
    }

    async fn create_subchannel(&self, kind: SubchannelKind) -> Result<()> {
        let channel = self.current()?.create_subchannel(kind).await?;
        debug!(kind = %channel.kind, address = %channel.address, "Subchannel opened");
        Ok(())
    }

    async fn close_subchannel(&self, kind: SubchannelKind) -> Result<()> {
        self.current()?.close_subchannel(kind).await?;
        debug!(kind = %kind, "Subchannel closed");
        Ok(())
    }
}

#[async_trait]
impl DeviceHandler for DefaultHandler {
    async fn open(&self, cancel: &CancellationToken) -> Result<()> {
        // a session that closed underneath us is unusable; build a new one
        self.stop_refresher();
        if let Some(stale) = self.replace_session(None) {
            if let Err(e) = stale.close().await {
                debug!(error = %e, "Discarding previous session failed");
            }
        }

        let session = self.factory.create().await?;
        session.open(cancel).await?;
        info!("Transport session opened");

        self.replace_session(Some(session.clone()));
        self.start_refresher(session);
        Ok(())
    }

    async fn close(&self, _cancel: &CancellationToken) -> Result<()> {
        self.stop_refresher();
        match self.replace_session(None) {
            Some(session) => {
                session.close().await?;
                info!("Transport session closed");
            }
            None => debug!("No session to close"),
        }
        Ok(())
    }

    fn closed(&self) -> ClosedSignal {
        match self.current() {
            Ok(session) => session.closed(),
            Err(_) => ClosedSignal::fired(CloseCause::Local),
        }
    }

    async fn send_event(&self, message: &Message, _cancel: &CancellationToken) -> Result<()> {
        Ok(self.current()?.send_event(message).await?)
    }

    async fn send_events(&self, messages: &[Message], _cancel: &CancellationToken) -> Result<()> {
        Ok(self.current()?.send_events(messages).await?)
    }

    async fn receive_message(&self, _cancel: &CancellationToken) -> Result<Message> {
        Ok(self.current()?.receive_message().await?)
    }

    async fn enable_methods(&self, _cancel: &CancellationToken) -> Result<()> {
        self.create_subchannel(SubchannelKind::Methods).await
    }

    async fn disable_methods(&self, _cancel: &CancellationToken) -> Result<()> {
        self.close_subchannel(SubchannelKind::Methods).await
    }

    async fn enable_twin_patch(&self, _cancel: &CancellationToken) -> Result<()> {
        self.create_subchannel(SubchannelKind::TwinPatch).await
    }

    async fn disable_twin_patch(&self, _cancel: &CancellationToken) -> Result<()> {
        self.close_subchannel(SubchannelKind::TwinPatch).await
    }

    async fn enable_events(&self, edge_module: bool, _cancel: &CancellationToken) -> Result<()> {
        self.create_subchannel(SubchannelKind::Events { edge_module })
            .await
    }

    async fn disable_events(&self, edge_module: bool, _cancel: &CancellationToken) -> Result<()> {
        self.close_subchannel(SubchannelKind::Events { edge_module })
            .await
    }

    async fn enable_c2d_receive(&self, _cancel: &CancellationToken) -> Result<()> {
        self.create_subchannel(SubchannelKind::C2dReceive).await
    }

    async fn disable_c2d_receive(&self, _cancel: &CancellationToken) -> Result<()> {
        self.close_subchannel(SubchannelKind::C2dReceive).await
    }

    async fn send_method_response(
        &self,
        response: &MethodResponse,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        Ok(self.current()?.send_method_response(response).await?)
    }

    async fn get_twin(&self, _cancel: &CancellationToken) -> Result<Twin> {
        Ok(self.current()?.get_twin().await?)
    }

    async fn patch_twin(&self, reported: &TwinCollection, _cancel: &CancellationToken) -> Result<i64> {
        Ok(self.current()?.patch_twin(reported).await?)
    }

    async fn complete(&self, lock_token: &str, _cancel: &CancellationToken) -> Result<()> {
        Ok(self.current()?.complete(lock_token).await?)
    }

    async fn abandon(&self, lock_token: &str, _cancel: &CancellationToken) -> Result<()> {
        Ok(self.current()?.abandon(lock_token).await?)
    }

    async fn reject(&self, lock_token: &str, _cancel: &CancellationToken) -> Result<()> {
        Ok(self.current()?.reject(lock_token).await?)
    }
}

impl Drop for DefaultHandler {
    fn drop(&mut self) {
        self.stop_refresher();
    }
}
