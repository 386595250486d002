//! # Skylink device client
//!
//! A device-side client for an IoT hub that keeps its connection alive on its
//! own. Applications open the client once; when the transport drops, the
//! client reconnects in the background with a configurable retry policy,
//! restores every subscription the application had enabled, and reports each
//! transition through a connection status callback.
//!
//! ## Layers
//!
//! ```text
//! DeviceManager / DeviceInstance      configuration, codec, request stream
//!        |
//! ConnectionKernel                    retry, single-flight open, disconnect watcher
//!        |
//! DeviceHandler (DefaultHandler)      session lifecycle, credential refresh
//!        |
//! TransportSession (MQTT, ...)        one connection; sub-channels per feature
//! ```
//!
//! ## Quick start
//!
//! ```ignore
//! use skylink_client::{ClientConfig, DeviceManager};
//! use tokio_util::sync::CancellationToken;
//!
//! let device = DeviceManager::from_config(config)?.build()?;
//! let cancel = CancellationToken::new();
//!
//! device.client().open(&cancel).await?;
//! device.client().enable_methods(&cancel).await?;
//! device.send_telemetry(&serde_json::json!({ "temperature": 21.4 }), &cancel).await?;
//! ```

pub mod backoff;
pub mod codec;
pub mod config;
pub mod connection;
pub mod credentials;
pub mod error;
pub mod features;
pub mod handler;
pub mod manager;
pub mod message;
pub mod retry;
pub mod session;
pub mod state;

#[cfg(feature = "mqtt")]
pub mod mqtt;

#[cfg(test)]
mod testing;

pub use backoff::{BackoffPolicy, ExponentialBackoff, FixedDelay, NoRetry, RetryDecision};
pub use codec::MessageCodec;
pub use config::{ClientConfig, CompressionType, SerializationFormat};
pub use connection::ConnectionKernel;
pub use error::{ClientError, Result, TransportError};
pub use features::{Feature, FeatureFlags};
pub use manager::{DeviceInstance, DeviceManager};
pub use message::{IncomingRequest, Message, MethodRequest, MethodResponse, Twin, TwinCollection};
pub use retry::{RetryExecutor, RetryPolicy, TransientClassifier};
pub use state::{ConnectionState, ConnectionStatusChangeReason, ConnectionStatusInfo, ConnectionStatusSink};
