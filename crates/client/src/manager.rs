//! High-level entry point that wires a configured device client.
//!
//! [`DeviceManager`] turns a [`ClientConfig`] into a ready [`DeviceInstance`]:
//!
//! 1. validates the configuration
//! 2. builds the credential provider and the session factory (MQTT by default)
//! 3. wraps them in a [`DefaultHandler`] and a [`ConnectionKernel`] with the
//!    configured retry policy
//!
//! The instance is returned unopened; call `client().open()` to connect.
//!
//! # Typical Usage
//!
//! ```ignore
//! let device = DeviceManager::from_config(config)?
//!     .on_connection_status(Arc::new(|info| println!("{info}")))
//!     .build()?;
//!
//! device.client().open(&cancel).await?;
//! device.client().enable_methods(&cancel).await?;
//!
//! let message = device.telemetry(&reading).await?;
//! device.send(&message, &cancel).await?;
//!
//! device.shutdown(&cancel).await?;
//! ```

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use serde::Serialize;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    codec::MessageCodec,
    config::ClientConfig,
    connection::ConnectionKernel,
    error::{ClientError, Result},
    handler::DefaultHandler,
    message::{IncomingRequest, Message},
    session::SessionFactory,
    state::ConnectionStatusSink,
};

/// Counts in-flight sends so shutdown can wait for them.
#[derive(Debug, Default)]
pub struct SendDrain {
    inflight: AtomicUsize,
    notify: Notify,
}

impl SendDrain {
    pub fn enter(self: &Arc<Self>) -> SendGuard {
        self.inflight.fetch_add(1, Ordering::AcqRel);
        SendGuard {
            drain: self.clone(),
        }
    }

    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }

    pub async fn wait_idle(&self) {
        loop {
            let notified = self.notify.notified();
            if self.inflight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

pub struct SendGuard {
    drain: Arc<SendDrain>,
}

impl Drop for SendGuard {
    fn drop(&mut self) {
        if self.drain.inflight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drain.notify.notify_waiters();
        }
    }
}

/// Builder for a [`DeviceInstance`].
pub struct DeviceManager {
    config: ClientConfig,
    sink: Option<ConnectionStatusSink>,
    transport: Option<(Arc<dyn SessionFactory>, mpsc::Receiver<IncomingRequest>)>,
}

impl DeviceManager {
    /// Validates `config` and prepares a manager.
    pub fn from_config(config: ClientConfig) -> Result<Self> {
        config.validate_all()?;
        Ok(Self {
            config,
            sink: None,
            transport: None,
        })
    }

    /// Registers the callback invoked on every connection status change.
    pub fn on_connection_status(mut self, sink: ConnectionStatusSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Uses a custom transport instead of the built-in MQTT one. `requests`
    /// receives what the factory's sessions push to the device.
    pub fn with_session_factory(
        mut self,
        factory: Arc<dyn SessionFactory>,
        requests: mpsc::Receiver<IncomingRequest>,
    ) -> Self {
        self.transport = Some((factory, requests));
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn default_transport(
        &self,
    ) -> Result<(Arc<dyn SessionFactory>, mpsc::Receiver<IncomingRequest>)> {
        #[cfg(feature = "mqtt")]
        {
            let credentials = self.config.credential_provider()?;
            let (factory, requests) = crate::mqtt::MqttSessionFactory::new(
                Arc::new(self.config.clone()),
                credentials,
            );
            Ok((Arc::new(factory), requests))
        }
        #[cfg(not(feature = "mqtt"))]
        {
            Err(ClientError::ClientSetup(
                "no transport available: enable the `mqtt` feature or supply a session factory"
                    .into(),
            ))
        }
    }

    /// Builds the handler chain and the connection kernel.
    pub fn build(mut self) -> Result<DeviceInstance> {
        let (factory, requests) = match self.transport.take() {
            Some(transport) => transport,
            None => self.default_transport()?,
        };

        let mut handler = DefaultHandler::new(factory);
        if let Some(interval) = self.config.credential_refresh_interval() {
            handler = handler.with_credential_refresh(interval);
        }

        let policy = self.config.retry.policy();
        debug!(?policy, "Retry policy configured");
        let client = ConnectionKernel::new(Box::new(handler), self.sink.take())
            .with_retry_policy(policy);

        info!(
            client_id = %self.config.client_id(),
            host = %self.config.host,
            format = %self.config.serialization.format,
            "Device client built"
        );

        Ok(DeviceInstance {
            client: Arc::new(client),
            requests: Mutex::new(requests),
            codec: MessageCodec::new(&self.config.serialization),
            drain: Arc::new(SendDrain::default()),
        })
    }
}

/// A built device client plus its request stream and codec.
pub struct DeviceInstance {
    client: Arc<ConnectionKernel>,
    requests: Mutex<mpsc::Receiver<IncomingRequest>>,
    codec: MessageCodec,
    drain: Arc<SendDrain>,
}

impl DeviceInstance {
    pub fn client(&self) -> Arc<ConnectionKernel> {
        self.client.clone()
    }

    pub fn codec(&self) -> &MessageCodec {
        &self.codec
    }

    /// Waits for the next method call, desired patch, or module input.
    ///
    /// Returns `Ok(None)` once the transport is gone for good.
    pub async fn next_request(&self, cancel: &CancellationToken) -> Result<Option<IncomingRequest>> {
        let mut requests = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ClientError::Cancelled),
            guard = self.requests.lock() => guard,
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ClientError::Cancelled),
            request = requests.recv() => Ok(request),
        }
    }

    /// Encodes `value` as a telemetry message with a fresh message id.
    pub async fn telemetry<T: Serialize>(&self, value: &T) -> Result<Message> {
        let message = self.codec.encode(value).await?;
        Ok(message.with_message_id(Uuid::new_v4().to_string()))
    }

    /// Sends a telemetry message; tracked so `shutdown` waits for it.
    pub async fn send(&self, message: &Message, cancel: &CancellationToken) -> Result<()> {
        let _guard = self.drain.enter();
        self.client.send_event(message, cancel).await
    }

    /// Encodes and sends `value` in one step.
    pub async fn send_telemetry<T: Serialize>(
        &self,
        value: &T,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let message = self.telemetry(value).await?;
        self.send(&message, cancel).await
    }

    /// Waits for in-flight sends, then closes the client.
    pub async fn shutdown(&self, cancel: &CancellationToken) -> Result<()> {
        let pending = self.drain.inflight();
        if pending > 0 {
            info!(pending, "Waiting for in-flight sends before closing");
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => debug!("Send drain abandoned"),
            _ = self.drain.wait_idle() => {}
        }
        self.client.close(cancel).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::{
        config::AuthConfig,
        error::TransportError,
        message::MethodRequest,
        state::{ConnectionState, ConnectionStatusInfo},
        testing::MockFactory,
    };

    fn config() -> ClientConfig {
        ClientConfig {
            device_id: "dev-1".into(),
            auth: AuthConfig {
                sas_token: Some("SharedAccessSignature sr=x&sig=y&se=1".into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn device(factory: Arc<MockFactory>) -> (DeviceInstance, mpsc::Sender<IncomingRequest>) {
        let (tx, rx) = mpsc::channel(4);
        let device = DeviceManager::from_config(config())
            .unwrap()
            .with_session_factory(factory, rx)
            .build()
            .unwrap();
        (device, tx)
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = ClientConfig {
            device_id: String::new(),
            ..config()
        };
        assert!(matches!(
            DeviceManager::from_config(config),
            Err(ClientError::Config(_))
        ));
    }

    #[cfg(feature = "mqtt")]
    #[tokio::test]
    async fn test_builds_mqtt_transport_by_default() {
        let device = DeviceManager::from_config(config()).unwrap().build().unwrap();
        assert!(!device.client().is_connected());
    }

    #[tokio::test]
    async fn test_status_sink_is_wired() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let (_tx, rx) = mpsc::channel(1);
        let device = DeviceManager::from_config(config())
            .unwrap()
            .on_connection_status(Arc::new(move |info: ConnectionStatusInfo| {
                sink_seen.lock().unwrap().push(info.state);
            }))
            .with_session_factory(Arc::new(MockFactory::default()), rx)
            .build()
            .unwrap();

        let cancel = CancellationToken::new();
        device.client().open(&cancel).await.unwrap();
        device.shutdown(&cancel).await.unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![ConnectionState::Connected, ConnectionState::Disabled]
        );
    }

    #[tokio::test]
    async fn test_send_telemetry_reaches_session() {
        let factory = Arc::new(MockFactory::default());
        let (device, _tx) = device(factory.clone());
        let cancel = CancellationToken::new();

        device.client().open(&cancel).await.unwrap();
        device
            .send_telemetry(&json!({ "temperature": 20.1 }), &cancel)
            .await
            .unwrap();

        assert_eq!(factory.last_session().unwrap().sent_count(), 1);
        let message = device.telemetry(&json!({})).await.unwrap();
        assert!(message.message_id.is_some());
        assert_eq!(message.content_type.as_deref(), Some("application/json"));
    }

    #[tokio::test]
    async fn test_send_before_open_fails() {
        let (device, _tx) = device(Arc::new(MockFactory::default()));
        let err = device
            .send_telemetry(&json!({}), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, ClientError::NotOpened);
        assert_eq!(device.drain.inflight(), 0);
    }

    #[tokio::test]
    async fn test_next_request() {
        let (device, tx) = device(Arc::new(MockFactory::default()));
        let cancel = CancellationToken::new();

        let request = IncomingRequest::Method(MethodRequest {
            name: "Reboot".into(),
            request_id: "1".into(),
            payload: Default::default(),
        });
        tx.send(request.clone()).await.unwrap();
        assert_eq!(device.next_request(&cancel).await.unwrap(), Some(request));

        drop(tx);
        assert_eq!(device.next_request(&cancel).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_next_request_is_cancellable() {
        let (device, _tx) = device(Arc::new(MockFactory::default()));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        assert_eq!(
            device.next_request(&cancel).await.unwrap_err(),
            ClientError::Cancelled
        );
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_inflight_sends() {
        let (device, _tx) = device(Arc::new(MockFactory::default()));
        let cancel = CancellationToken::new();
        device.client().open(&cancel).await.unwrap();

        let guard = device.drain.enter();
        let drain = device.drain.clone();
        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            drop(guard);
        });

        device.shutdown(&cancel).await.unwrap();
        assert_eq!(drain.inflight(), 0);
        release.await.unwrap();

        let err = device
            .send_telemetry(&json!({}), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, ClientError::Disposed);
    }

    #[tokio::test]
    async fn test_permanent_open_failure_surfaces() {
        let factory = Arc::new(MockFactory::default());
        factory.fail_opens([TransportError::Unauthorized("bad key".into())]);
        let (device, _tx) = device(factory);

        let err = device.client().open(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Transport(TransportError::Unauthorized(_))
        ));
    }
}
