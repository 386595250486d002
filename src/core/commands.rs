//! Handling of cloud-to-device requests.
//!
//! Two ways to change the telemetry interval are supported: the
//! `SetTelemetryInterval` direct method, whose payload is a whole number of
//! seconds, and the `telemetryInterval` desired property. Accepted desired
//! values are acknowledged through the reported properties.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde_json::{json, Value};
use skylink_client::{
    ClientError, ConnectionKernel, DeviceInstance, IncomingRequest, MethodRequest, MethodResponse,
    TwinCollection,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::telemetry::IntervalControl;

pub const SET_INTERVAL_METHOD: &str = "SetTelemetryInterval";
pub const INTERVAL_PROPERTY: &str = "telemetryInterval";

/// Bounds accepted for a new interval, in seconds.
const MIN_INTERVAL: u64 = 1;
const MAX_INTERVAL: u64 = 86_400;

/// The subset of client operations needed to answer requests.
#[async_trait]
pub trait Responder: Send + Sync {
    async fn send_method_response(
        &self,
        response: &MethodResponse,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError>;

    async fn patch_twin(
        &self,
        reported: &TwinCollection,
        cancel: &CancellationToken,
    ) -> Result<i64, ClientError>;
}

#[async_trait]
impl Responder for ConnectionKernel {
    async fn send_method_response(
        &self,
        response: &MethodResponse,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        ConnectionKernel::send_method_response(self, response, cancel).await
    }

    async fn patch_twin(
        &self,
        reported: &TwinCollection,
        cancel: &CancellationToken,
    ) -> Result<i64, ClientError> {
        ConnectionKernel::patch_twin(self, reported, cancel).await
    }
}

pub struct CommandHandler {
    responder: Arc<dyn Responder>,
    interval: IntervalControl,
}

impl CommandHandler {
    pub fn new(responder: Arc<dyn Responder>, interval: IntervalControl) -> Self {
        Self {
            responder,
            interval,
        }
    }

    pub async fn handle(
        &self,
        request: IncomingRequest,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        match request {
            IncomingRequest::Method(method) => self.on_method(method, cancel).await,
            IncomingRequest::DesiredProperties { version, patch } => {
                self.on_desired(version, &patch, cancel).await
            }
            IncomingRequest::ModuleInput { input, message } => {
                debug!(input = %input, bytes = message.len(), "Ignoring module input");
                Ok(())
            }
        }
    }

    async fn on_method(
        &self,
        method: MethodRequest,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        let (status, body) = match method.name.as_str() {
            SET_INTERVAL_METHOD => match method.payload_json::<Value>().ok().and_then(|v| parse_seconds(&v)) {
                Some(seconds) => {
                    self.apply(seconds);
                    (200, json!({ "interval": seconds }))
                }
                None => {
                    warn!(request_id = %method.request_id, "Invalid interval payload");
                    (
                        400,
                        json!({ "error": format!("expected whole seconds between {MIN_INTERVAL} and {MAX_INTERVAL}") }),
                    )
                }
            },
            other => {
                warn!(method = other, "Unknown method");
                (404, json!({ "error": format!("unknown method {other}") }))
            }
        };

        let response = MethodResponse::json(method.request_id, status, &body)?;
        self.responder.send_method_response(&response, cancel).await
    }

    async fn on_desired(
        &self,
        version: Option<i64>,
        patch: &TwinCollection,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        let Some(value) = patch.get(INTERVAL_PROPERTY) else {
            debug!(?version, "Desired patch without telemetry settings");
            return Ok(());
        };

        let Some(seconds) = parse_seconds(value) else {
            warn!(?version, %value, "Ignoring invalid desired telemetry interval");
            return Ok(());
        };

        self.apply(seconds);
        let mut reported = TwinCollection::new();
        reported.insert(INTERVAL_PROPERTY.to_string(), json!(seconds));
        let reported_version = self.responder.patch_twin(&reported, cancel).await?;
        debug!(reported_version, "Reported telemetry interval");
        Ok(())
    }

    fn apply(&self, seconds: u64) {
        if self.interval.set(Duration::from_secs(seconds)) {
            info!(seconds, "Telemetry interval updated");
        }
    }
}

fn parse_seconds(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .filter(|s| (MIN_INTERVAL..=MAX_INTERVAL).contains(s))
}

/// Pulls requests off the device until cancelled or the client goes away.
pub async fn serve(device: Arc<DeviceInstance>, handler: CommandHandler, cancel: CancellationToken) {
    loop {
        match device.next_request(&cancel).await {
            Ok(Some(request)) => {
                if let Err(e) = handler.handle(request, &cancel).await {
                    warn!(error = %e, "Failed to answer request");
                }
            }
            Ok(None) => {
                info!("Request channel closed");
                break;
            }
            Err(_) => break,
        }
    }
}
