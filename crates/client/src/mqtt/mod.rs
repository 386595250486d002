//! MQTT transport for the hub, built on `rumqttc`.

pub mod options;
pub mod session;
pub mod topics;

pub use options::ClientBuilder;
pub use session::{classify_connection_error, MqttSession, MqttSessionFactory};
pub use topics::DeviceIdentity;
