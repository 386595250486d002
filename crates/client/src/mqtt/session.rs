//! MQTT transport session.
//!
//! Each [`MqttSession`] owns one `rumqttc` client and spawns a driver task
//! that polls its event loop. The driver:
//!
//! - reports the CONNACK outcome back to `open`
//! - routes inbound publishes (methods, desired patches, module inputs,
//!   cloud-to-device messages, twin replies)
//! - fires the session's closed notification on the first error or
//!   disconnect and stops, leaving reconnection to the connection kernel

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, Outgoing, Packet, Publish,
    QoS,
};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use super::{
    options::{username, ClientBuilder},
    topics::{self, DeviceIdentity, TWIN_DESIRED_FILTER, TWIN_RESPONSE_FILTER},
};
use crate::{
    config::ClientConfig,
    credentials::{AuthToken, CredentialProvider},
    error::TransportError,
    message::{IncomingRequest, Message, MethodResponse, Twin, TwinCollection},
    session::{
        CloseCause, ClosedNotifier, ClosedSignal, SessionFactory, Subchannel, SubchannelKind,
        TransportSession,
    },
};

/// How long `close` waits for the driver to flush the DISCONNECT packet.
const DISCONNECT_GRACE: Duration = Duration::from_secs(5);

/// Builds MQTT sessions for one device identity.
///
/// Inbound requests and cloud-to-device messages from every session are
/// funnelled into channels owned by the factory, so nothing queued by the
/// application is lost when a session is replaced.
pub struct MqttSessionFactory {
    config: Arc<ClientConfig>,
    credentials: Arc<dyn CredentialProvider>,
    identity: DeviceIdentity,
    requests: mpsc::Sender<IncomingRequest>,
    c2d_tx: mpsc::Sender<Message>,
    c2d_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Message>>>,
}

impl MqttSessionFactory {
    /// Returns the factory and the receiver of inbound requests.
    pub fn new(
        config: Arc<ClientConfig>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> (Self, mpsc::Receiver<IncomingRequest>) {
        let capacity = config.request_channel_capacity.max(1);
        let (requests, requests_rx) = mpsc::channel(capacity);
        let (c2d_tx, c2d_rx) = mpsc::channel(capacity);
        let identity = DeviceIdentity::new(config.device_id.clone(), config.module_id.clone());

        let factory = Self {
            config,
            credentials,
            identity,
            requests,
            c2d_tx,
            c2d_rx: Arc::new(tokio::sync::Mutex::new(c2d_rx)),
        };
        (factory, requests_rx)
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }
}

#[async_trait]
impl SessionFactory for MqttSessionFactory {
    async fn create(&self) -> Result<Arc<dyn TransportSession>, TransportError> {
        let token = self.credentials.token().await?;
        let user = username(&self.config.host, &self.config.client_id());
        let (client, event_loop) = ClientBuilder::from_config(&self.config)
            .credentials(user, token.value())
            .build()?;

        debug!(identity = %self.identity, host = %self.config.host, "MQTT session created");

        let router = Arc::new(Router {
            identity: self.identity.clone(),
            notifier: ClosedNotifier::new(),
            pending: Mutex::new(HashMap::new()),
            requests: self.requests.clone(),
            c2d: self.c2d_tx.clone(),
        });

        Ok(Arc::new(MqttSession {
            client,
            event_loop: Mutex::new(Some(event_loop)),
            router,
            driver: Mutex::new(None),
            stop: CancellationToken::new(),
            credentials: self.credentials.clone(),
            c2d: self.c2d_rx.clone(),
            connection_timeout: self.config.connection_timeout(),
            operation_timeout: self.config.operation_timeout(),
            max_packet_size: self.config.max_packet_size,
        }))
    }
}

/// Reply on the twin response topic.
#[derive(Debug)]
struct TwinReply {
    status: u16,
    version: Option<i64>,
    payload: Bytes,
}

/// State shared between a session and its driver task.
struct Router {
    identity: DeviceIdentity,
    notifier: ClosedNotifier,
    pending: Mutex<HashMap<String, oneshot::Sender<TwinReply>>>,
    requests: mpsc::Sender<IncomingRequest>,
    c2d: mpsc::Sender<Message>,
}

impl Router {
    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<TwinReply>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fires the closed notification and fails every pending twin request.
    fn close(&self, cause: CloseCause) {
        if self.notifier.notify(cause.clone()) {
            info!(identity = %self.identity, cause = %cause, "MQTT session closed");
        }
        self.pending().clear();
    }

    fn forward(&self, request: IncomingRequest) {
        if let Err(e) = self.requests.try_send(request) {
            warn!(error = %e, "Dropping inbound request: request channel unavailable");
        }
    }

    fn route(&self, publish: Publish) {
        let topic = publish.topic.as_str();
        let payload = publish.payload;

        if let Some(reply) = topics::parse_twin_response(topic) {
            match self.pending().remove(&reply.request_id) {
                Some(waiter) => {
                    let _ = waiter.send(TwinReply {
                        status: reply.status,
                        version: reply.version,
                        payload,
                    });
                }
                None => debug!(rid = %reply.request_id, "Twin reply without a waiter"),
            }
        } else if let Some(request) = topics::parse_method(topic, payload.clone()) {
            debug!(method = %request.name, rid = %request.request_id, "Method invoked");
            self.forward(IncomingRequest::Method(request));
        } else if let Some(version) = topics::parse_desired_patch(topic) {
            match serde_json::from_slice::<TwinCollection>(&payload) {
                Ok(patch) => self.forward(IncomingRequest::DesiredProperties { version, patch }),
                Err(e) => warn!(error = %e, "Ignoring malformed desired properties patch"),
            }
        } else if let Some(request) = self.identity.parse_module_input(topic, payload.clone()) {
            self.forward(request);
        } else if let Some(message) = self.identity.parse_c2d(topic, payload) {
            if let Err(e) = self.c2d.try_send(message) {
                warn!(error = %e, "Dropping cloud-to-device message");
            }
        } else {
            trace!(topic, "Publish on unrouted topic");
        }
    }
}

/// One MQTT connection to the hub.
pub struct MqttSession {
    client: AsyncClient,
    event_loop: Mutex<Option<EventLoop>>,
    router: Arc<Router>,
    driver: Mutex<Option<JoinHandle<()>>>,
    stop: CancellationToken,
    credentials: Arc<dyn CredentialProvider>,
    c2d: Arc<tokio::sync::Mutex<mpsc::Receiver<Message>>>,
    connection_timeout: Duration,
    operation_timeout: Duration,
    max_packet_size: usize,
}

impl MqttSession {
    fn check_alive(&self) -> Result<(), TransportError> {
        if self.router.notifier.is_closed() {
            Err(TransportError::SessionClosed("MQTT session is closed".into()))
        } else {
            Ok(())
        }
    }

    fn take_driver(&self) -> Option<JoinHandle<()>> {
        self.driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    async fn subscribe(&self, filter: &str) -> Result<(), TransportError> {
        self.check_alive()?;
        self.client
            .subscribe(filter, QoS::AtLeastOnce)
            .await
            .map_err(request_error)?;
        debug!(filter, "Subscribed");
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError> {
        self.check_alive()?;
        self.client.unsubscribe(filter).await.map_err(request_error)?;
        debug!(filter, "Unsubscribed");
        Ok(())
    }

    fn filter_for(&self, kind: SubchannelKind) -> Result<String, TransportError> {
        match kind {
            SubchannelKind::Methods => Ok(topics::METHODS_FILTER.to_string()),
            SubchannelKind::TwinPatch => Ok(TWIN_DESIRED_FILTER.to_string()),
            SubchannelKind::C2dReceive => Ok(self.router.identity.c2d_filter()),
            SubchannelKind::Events { .. } => self.router.identity.inputs_filter().ok_or_else(|| {
                TransportError::Unsupported("module events require a module identity".into())
            }),
        }
    }

    /// Publishes a twin request and waits for the correlated reply.
    async fn twin_request(
        &self,
        topic: fn(&str) -> String,
        body: Vec<u8>,
    ) -> Result<TwinReply, TransportError> {
        self.check_alive()?;
        let rid = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.router.pending().insert(rid.clone(), tx);

        if let Err(e) = self
            .client
            .publish(topic(&rid), QoS::AtMostOnce, false, body)
            .await
        {
            self.router.pending().remove(&rid);
            return Err(request_error(e));
        }

        let reply = match tokio::time::timeout(self.operation_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => {
                return Err(TransportError::SessionClosed(
                    "session closed while awaiting twin reply".into(),
                ))
            }
            Err(_) => {
                self.router.pending().remove(&rid);
                return Err(TransportError::Timeout(format!("no twin reply for request {rid}")));
            }
        };

        match TransportError::from_status(reply.status, format!("twin request {rid}")) {
            Some(err) => Err(err),
            None => Ok(reply),
        }
    }
}

#[async_trait]
impl TransportSession for MqttSession {
    async fn open(&self, cancel: &CancellationToken) -> Result<(), TransportError> {
        let event_loop = self
            .event_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| TransportError::Protocol("MQTT session opened twice".into()))?;

        let (connack_tx, connack_rx) = oneshot::channel();
        let handle = tokio::spawn(drive(
            event_loop,
            self.router.clone(),
            connack_tx,
            self.stop.clone(),
        ));
        *self.driver.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.stop.cancel();
                return Err(TransportError::SessionClosed("open cancelled".into()));
            }
            outcome = tokio::time::timeout(self.connection_timeout, connack_rx) => outcome,
        };

        match outcome {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => {
                return Err(TransportError::SessionClosed(
                    "driver stopped before the connection was acknowledged".into(),
                ))
            }
            Err(_) => {
                self.stop.cancel();
                return Err(TransportError::Timeout(format!(
                    "no CONNACK within {:?}",
                    self.connection_timeout
                )));
            }
        }

        self.subscribe(TWIN_RESPONSE_FILTER).await?;
        info!(identity = %self.router.identity, "MQTT session connected");
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.router.notifier.is_closed() {
            self.stop.cancel();
            return Ok(());
        }

        if let Err(e) = self.client.disconnect().await {
            debug!(error = %e, "Error sending disconnect packet");
        }
        if let Some(handle) = self.take_driver() {
            if tokio::time::timeout(DISCONNECT_GRACE, handle).await.is_err() {
                warn!("MQTT driver did not stop in time");
            }
        }
        self.stop.cancel();
        self.router.close(CloseCause::Local);
        Ok(())
    }

    fn closed(&self) -> ClosedSignal {
        self.router.notifier.signal()
    }

    async fn create_subchannel(&self, kind: SubchannelKind) -> Result<Subchannel, TransportError> {
        let address = self.filter_for(kind)?;
        self.subscribe(&address).await?;
        Ok(Subchannel { kind, address })
    }

    async fn close_subchannel(&self, kind: SubchannelKind) -> Result<(), TransportError> {
        let address = self.filter_for(kind)?;
        self.unsubscribe(&address).await
    }

    /// The password of a live MQTT connection cannot change; the fresh token
    /// is used by the next session.
    async fn refresh_credentials(&self) -> Result<AuthToken, TransportError> {
        self.credentials.token().await
    }

    async fn send_event(&self, message: &Message) -> Result<(), TransportError> {
        self.check_alive()?;
        if message.len() > self.max_packet_size {
            return Err(TransportError::MessageTooLarge {
                size: message.len(),
                limit: self.max_packet_size,
            });
        }
        let topic = self.router.identity.telemetry_topic(message);
        self.client
            .publish_bytes(topic, QoS::AtLeastOnce, false, message.payload.clone())
            .await
            .map_err(request_error)
    }

    async fn receive_message(&self) -> Result<Message, TransportError> {
        self.check_alive()?;
        let closed = self.router.notifier.signal();
        let mut inbox = self.c2d.lock().await;
        tokio::select! {
            biased;
            cause = closed.wait() => Err(TransportError::SessionClosed(cause.to_string())),
            message = inbox.recv() => message.ok_or_else(|| {
                TransportError::SessionClosed("message channel closed".into())
            }),
        }
    }

    async fn send_method_response(&self, response: &MethodResponse) -> Result<(), TransportError> {
        self.check_alive()?;
        let topic = topics::method_response_topic(response.status, &response.request_id);
        self.client
            .publish_bytes(topic, QoS::AtMostOnce, false, response.payload.clone())
            .await
            .map_err(request_error)
    }

    async fn get_twin(&self) -> Result<Twin, TransportError> {
        let reply = self.twin_request(topics::twin_get_topic, Vec::new()).await?;
        serde_json::from_slice(&reply.payload)
            .map_err(|e| TransportError::Protocol(format!("malformed twin document: {e}")))
    }

    async fn patch_twin(&self, reported: &TwinCollection) -> Result<i64, TransportError> {
        let body = serde_json::to_vec(reported)
            .map_err(|e| TransportError::Protocol(format!("cannot encode reported properties: {e}")))?;
        let reply = self.twin_request(topics::twin_patch_topic, body).await?;
        reply
            .version
            .ok_or_else(|| TransportError::Protocol("twin patch reply without $version".into()))
    }

    /// Messages are acknowledged on receipt at QoS 1.
    async fn complete(&self, _lock_token: &str) -> Result<(), TransportError> {
        self.check_alive()
    }

    async fn abandon(&self, _lock_token: &str) -> Result<(), TransportError> {
        Err(TransportError::Unsupported("MQTT cannot abandon a message".into()))
    }

    async fn reject(&self, _lock_token: &str) -> Result<(), TransportError> {
        Err(TransportError::Unsupported("MQTT cannot reject a message".into()))
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Polls the event loop until the connection ends or `stop` fires.
async fn drive(
    mut event_loop: EventLoop,
    router: Arc<Router>,
    connack: oneshot::Sender<Result<(), TransportError>>,
    stop: CancellationToken,
) {
    let mut connack = Some(connack);

    let cause = loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break CloseCause::Local,
            event = event_loop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        if let Some(tx) = connack.take() {
                            let _ = tx.send(Ok(()));
                        }
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => router.route(publish),
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("Disconnected by hub");
                    break CloseCause::Remote("disconnected by hub".into());
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => break CloseCause::Local,
                Ok(event) => trace!(?event, "MQTT event"),
                Err(e) => {
                    let err = classify_connection_error(&e);
                    error!(error = %err, "MQTT connection failed");
                    // fired before `open` hears about the failure
                    router.close(CloseCause::Remote(err.to_string()));
                    if let Some(tx) = connack.take() {
                        let _ = tx.send(Err(err));
                    }
                    break CloseCause::Local;
                }
            }
        }
    };

    router.close(cause);
    debug!("MQTT driver stopped");
}

fn request_error(err: rumqttc::ClientError) -> TransportError {
    TransportError::SessionClosed(format!("MQTT request not accepted: {err}"))
}

/// Maps an event loop failure onto the transport taxonomy.
pub fn classify_connection_error(err: &ConnectionError) -> TransportError {
    let message = root_message(err);
    match err {
        ConnectionError::ConnectionRefused(code) => match code {
            ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized => {
                TransportError::Unauthorized(format!("connection refused: {code:?}"))
            }
            ConnectReturnCode::BadClientId => {
                TransportError::DeviceNotFound(format!("connection refused: {code:?}"))
            }
            ConnectReturnCode::ServiceUnavailable => {
                TransportError::ServerBusy(format!("connection refused: {code:?}"))
            }
            ConnectReturnCode::RefusedProtocolVersion => {
                TransportError::Protocol(format!("connection refused: {code:?}"))
            }
            #[allow(unreachable_patterns)]
            _ => TransportError::Network(format!("connection refused: {code:?}")),
        },

        // invalid certificates or an incompatible TLS setup
        ConnectionError::Tls(_) => TransportError::Protocol(message),

        ConnectionError::Io(e) => match e.kind() {
            std::io::ErrorKind::TimedOut => TransportError::Timeout(message),
            _ => TransportError::Network(message),
        },

        ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout => {
            TransportError::Timeout(message)
        }
        ConnectionError::MqttState(_) => TransportError::Network(message),
        ConnectionError::NotConnAck(_) => TransportError::Protocol(message),
        ConnectionError::RequestsDone => TransportError::SessionClosed(message),

        #[allow(unreachable_patterns)]
        _ => TransportError::Network(message),
    }
}

/// Innermost message of an error chain.
fn root_message(e: &dyn std::error::Error) -> String {
    let mut current = e;
    while let Some(source) = current.source() {
        current = source;
    }
    current.to_string().trim_matches('"').to_string()
}
