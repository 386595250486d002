//! Configuration of a device client.
//!
//! Every type here deserializes with serde (all fields have defaults) and is
//! checked with `validator`. Load the surrounding document with `toml`, then
//! call [`ClientConfig::validate_all`] before building a client: it runs the
//! field constraints and the checks that span several fields (credentials,
//! client certificate pair).
//!
//! # Examples
//!
//! ```toml
//! host = "myhub.azure-devices.net"
//! device_id = "thermostat-01"
//!
//! [auth]
//! shared_access_key = "bXlTaGFyZWRBY2Nlc3NLZXk="
//! token_ttl = 3600
//!
//! [retry]
//! strategy = "exponential"
//! max_retries = 10
//!
//! [serialization]
//! format = "json"
//! compression = "gzip"
//! compression_threshold = 1024
//! ```

use std::{fmt, path::Path, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::{
    backoff::{ExponentialBackoff, FixedDelay, NoRetry},
    credentials::{CredentialProvider, SharedAccessKeyProvider, StaticTokenProvider},
    error::{ClientError, Result},
    retry::RetryPolicy,
};

/// Connection settings for one device (or module) identity.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ClientConfig {
    /// Hub host name, e.g. `myhub.azure-devices.net`.
    #[validate(length(
        min = 1,
        max = 255,
        message = "Host must be between 1 and 255 characters"
    ))]
    pub host: String,

    /// Broker port. The hub accepts MQTT over TLS on 8883.
    #[validate(range(min = 1, message = "Port must be between 1 and 65535"))]
    pub port: u16,

    /// Device identity registered in the hub.
    #[validate(length(
        min = 1,
        max = 128,
        message = "Device id must be between 1 and 128 characters"
    ))]
    pub device_id: String,

    /// Module identity; set when running as a module of `device_id`.
    #[validate(length(
        min = 1,
        max = 128,
        message = "Module id must be between 1 and 128 characters"
    ))]
    pub module_id: Option<String>,

    #[validate(nested)]
    pub auth: AuthConfig,

    /// Seconds to wait for the connection to be accepted.
    #[validate(range(
        min = 1,
        max = 300,
        message = "Connection timeout must be between 1 and 300 seconds"
    ))]
    pub connection_timeout: u64,

    /// Seconds to wait for a twin response from the hub.
    #[validate(range(
        min = 1,
        max = 300,
        message = "Operation timeout must be between 1 and 300 seconds"
    ))]
    pub operation_timeout: u64,

    /// Keep-alive interval in seconds. The hub disconnects idle clients after
    /// roughly 1.5 times this value.
    #[validate(range(
        min = 5,
        max = 1740,
        message = "Keep alive must be between 5 and 1740 seconds"
    ))]
    pub keep_alive: u64,

    pub clean_session: bool,

    #[validate(range(
        min = 1,
        max = 1000,
        message = "Max inflight must be between 1 and 1000"
    ))]
    pub max_inflight: u16,

    /// Requests queued towards the event loop before senders wait.
    #[validate(range(
        min = 1,
        max = 1024,
        message = "Request channel capacity must be between 1 and 1024"
    ))]
    pub request_channel_capacity: usize,

    /// Largest packet accepted or sent, in bytes. The hub caps messages at 256 KiB.
    #[validate(range(
        min = 64,
        max = 262_144,
        message = "Max packet size must be between 64 and 262144 bytes"
    ))]
    pub max_packet_size: usize,

    /// Seconds between credential refreshes of an open session; 0 disables.
    pub credential_refresh_interval: u64,

    /// Plain TCP is only meant for local test brokers.
    pub use_tls: bool,

    /// TLS settings. Without a CA file the platform root store is used.
    #[validate(nested)]
    pub tls: Option<TlsConfig>,

    #[validate(nested)]
    pub retry: RetryConfig,

    #[validate(nested)]
    pub serialization: SerializationConfig,
}

impl Default for ClientConfig {
    /// Local development defaults. No credentials are set, so the result
    /// does not validate until `auth` is filled in.
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8883,
            device_id: "skylink-device".to_string(),
            module_id: None,
            auth: AuthConfig::default(),
            connection_timeout: 30,
            operation_timeout: 60,
            keep_alive: 230,
            clean_session: false,
            max_inflight: 100,
            request_channel_capacity: 32,
            max_packet_size: 262_144,
            credential_refresh_interval: 0,
            use_tls: true,
            tls: None,
            retry: RetryConfig::default(),
            serialization: SerializationConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Runs field constraints plus the TLS file checks.
    pub fn validate_all(&self) -> Result<()> {
        self.validate()?;
        if let Some(tls) = &self.tls {
            tls.validate_config()
                .map_err(|e| ClientError::Config(format!("tls: {e}")))?;
        }
        Ok(())
    }

    /// MQTT client id: `device` or `device/module`.
    pub fn client_id(&self) -> String {
        match &self.module_id {
            Some(module) => format!("{}/{}", self.device_id, module),
            None => self.device_id.clone(),
        }
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive)
    }

    pub fn credential_refresh_interval(&self) -> Option<Duration> {
        Some(self.credential_refresh_interval)
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    /// Builds the token source described by `auth`.
    pub fn credential_provider(&self) -> Result<Arc<dyn CredentialProvider>> {
        if let Some(token) = &self.auth.sas_token {
            return Ok(Arc::new(StaticTokenProvider::new(token.clone())));
        }
        let key = self.auth.shared_access_key.as_deref().ok_or_else(|| {
            ClientError::Config("either auth.shared_access_key or auth.sas_token is required".into())
        })?;

        let mut provider = SharedAccessKeyProvider::new(
            &self.host,
            &self.device_id,
            self.module_id.as_deref(),
            key,
            Duration::from_secs(self.auth.token_ttl),
        )?;
        if let Some(key_name) = &self.auth.key_name {
            provider = provider.with_key_name(key_name.clone());
        }
        Ok(Arc::new(provider))
    }
}

/// How the device authenticates. Exactly one of `shared_access_key` and
/// `sas_token` must be set.
#[derive(Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_auth"))]
pub struct AuthConfig {
    /// Base64 device (or module) key; tokens are signed locally.
    pub shared_access_key: Option<String>,

    /// Pre-generated `SharedAccessSignature ...` token, used as is.
    pub sas_token: Option<String>,

    /// Shared access policy name, for keys that belong to a hub policy.
    pub key_name: Option<String>,

    /// Lifetime of signed tokens in seconds.
    #[validate(range(
        min = 60,
        max = 2_592_000,
        message = "Token TTL must be between 60 seconds and 30 days"
    ))]
    pub token_ttl: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            shared_access_key: None,
            sas_token: None,
            key_name: None,
            token_ttl: 3600,
        }
    }
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "<redacted>");
        f.debug_struct("AuthConfig")
            .field("shared_access_key", &redact(&self.shared_access_key))
            .field("sas_token", &redact(&self.sas_token))
            .field("key_name", &self.key_name)
            .field("token_ttl", &self.token_ttl)
            .finish()
    }
}

fn validate_auth(auth: &AuthConfig) -> std::result::Result<(), ValidationError> {
    match (&auth.shared_access_key, &auth.sas_token) {
        (Some(_), Some(_)) => Err(ValidationError::new("ambiguous_credentials")
            .with_message("Set either shared_access_key or sas_token, not both".into())),
        (None, None) => Err(ValidationError::new("missing_credentials")
            .with_message("Either shared_access_key or sas_token is required".into())),
        (Some(key), None) if key.trim().is_empty() => Err(ValidationError::new("empty_key")
            .with_message("shared_access_key must not be empty".into())),
        (None, Some(token)) if !token.starts_with("SharedAccessSignature ") => {
            Err(ValidationError::new("malformed_token")
                .with_message("sas_token must start with 'SharedAccessSignature '".into()))
        }
        _ => Ok(()),
    }
}

/// TLS certificate files. Paths are checked when validated; the files are
/// read when the session is built.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct TlsConfig {
    /// CA certificate (PEM) used instead of the platform roots.
    #[validate(custom(
        function = "validate_file_path",
        message = "CA certificate file does not exist"
    ))]
    pub ca_cert_path: Option<String>,

    /// Client certificate (PEM) for X.509 authentication.
    #[validate(custom(
        function = "validate_file_path",
        message = "Client certificate file does not exist"
    ))]
    pub client_cert_path: Option<String>,

    /// Unencrypted client private key (PEM).
    #[validate(custom(
        function = "validate_file_path",
        message = "Client key file does not exist"
    ))]
    pub client_key_path: Option<String>,
}

impl TlsConfig {
    pub fn with_ca_only(ca_cert_path: impl Into<String>) -> Self {
        Self {
            ca_cert_path: Some(ca_cert_path.into()),
            ..Default::default()
        }
    }

    pub fn has_client_auth(&self) -> bool {
        self.client_cert_path.is_some() && self.client_key_path.is_some()
    }

    /// Checks the file paths and that client certificate and key come as a pair.
    pub fn validate_config(&self) -> std::result::Result<(), ValidationError> {
        for path in [&self.ca_cert_path, &self.client_cert_path, &self.client_key_path]
            .into_iter()
            .flatten()
        {
            validate_file_path(path)?;
        }

        if self.client_cert_path.is_some() != self.client_key_path.is_some() {
            return Err(ValidationError::new("incomplete_client_auth").with_message(
                "Both client certificate and key must be provided or neither".into(),
            ));
        }
        Ok(())
    }
}

fn validate_file_path(path: &str) -> std::result::Result<(), ValidationError> {
    if path.is_empty() {
        return Err(
            ValidationError::new("empty_path").with_message("File path cannot be empty".into())
        );
    }

    let path_obj = Path::new(path);
    if !path_obj.exists() {
        return Err(ValidationError::new("file_not_found")
            .with_message(format!("File does not exist: {path}").into()));
    }
    if !path_obj.is_file() {
        return Err(ValidationError::new("not_a_file")
            .with_message(format!("Path is not a file: {path}").into()));
    }
    Ok(())
}

/// Backoff schedule kind.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RetryStrategy {
    /// Growing delays between `min_backoff_ms` and `max_backoff_ms`.
    #[default]
    Exponential,
    /// Constant `fixed_delay_ms` between attempts.
    Fixed,
    /// Never retry.
    None,
}

/// Retry settings turned into a [`RetryPolicy`] by [`RetryConfig::policy`].
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_backoff_bounds"))]
pub struct RetryConfig {
    pub strategy: RetryStrategy,

    /// Retries after the first attempt; unlimited when absent.
    pub max_retries: Option<u32>,

    #[validate(range(max = 600_000, message = "Minimum backoff must not exceed 10 minutes"))]
    pub min_backoff_ms: u64,

    #[validate(range(
        min = 1,
        max = 3_600_000,
        message = "Maximum backoff must be between 1ms and 1 hour"
    ))]
    pub max_backoff_ms: u64,

    #[validate(range(max = 600_000, message = "Delta backoff must not exceed 10 minutes"))]
    pub delta_backoff_ms: u64,

    #[validate(range(max = 3_600_000, message = "Fixed delay must not exceed 1 hour"))]
    pub fixed_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            strategy: RetryStrategy::Exponential,
            max_retries: None,
            min_backoff_ms: 100,
            max_backoff_ms: 10_000,
            delta_backoff_ms: 100,
            fixed_delay_ms: 1_000,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        match self.strategy {
            RetryStrategy::Exponential => RetryPolicy::with_backoff(ExponentialBackoff::new(
                self.max_retries,
                Duration::from_millis(self.min_backoff_ms),
                Duration::from_millis(self.max_backoff_ms),
                Duration::from_millis(self.delta_backoff_ms),
            )),
            RetryStrategy::Fixed => RetryPolicy::with_backoff(FixedDelay::new(
                self.max_retries,
                Duration::from_millis(self.fixed_delay_ms),
            )),
            RetryStrategy::None => RetryPolicy::with_backoff(NoRetry),
        }
    }
}

fn validate_backoff_bounds(retry: &RetryConfig) -> std::result::Result<(), ValidationError> {
    if retry.min_backoff_ms > retry.max_backoff_ms {
        return Err(ValidationError::new("backoff_bounds")
            .with_message("min_backoff_ms must not exceed max_backoff_ms".into()));
    }
    Ok(())
}

/// Payload serialization formats.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SerializationFormat {
    #[default]
    Json,
    #[serde(rename = "msgpack")]
    MessagePack,
    Cbor,
}

impl SerializationFormat {
    /// Content type set on encoded messages.
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::MessagePack => "application/msgpack",
            Self::Cbor => "application/cbor",
        }
    }

    pub fn from_content_type(content_type: &str) -> Option<Self> {
        match content_type {
            "application/json" => Some(Self::Json),
            "application/msgpack" | "application/x-msgpack" => Some(Self::MessagePack),
            "application/cbor" => Some(Self::Cbor),
            _ => None,
        }
    }
}

impl fmt::Display for SerializationFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json => write!(f, "JSON"),
            Self::MessagePack => write!(f, "MessagePack"),
            Self::Cbor => write!(f, "CBOR"),
        }
    }
}

/// Payload compression applied after serialization.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    #[default]
    None,
    Gzip,
    Zstd,
}

impl CompressionType {
    /// Content encoding set on compressed messages.
    pub fn content_encoding(&self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Gzip => Some("gzip"),
            Self::Zstd => Some("zstd"),
        }
    }

    pub fn from_content_encoding(encoding: &str) -> Option<Self> {
        match encoding {
            "gzip" => Some(Self::Gzip),
            "zstd" => Some(Self::Zstd),
            _ => None,
        }
    }
}

impl fmt::Display for CompressionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Gzip => write!(f, "Gzip"),
            Self::Zstd => write!(f, "Zstd"),
        }
    }
}

/// How telemetry payloads are encoded.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SerializationConfig {
    pub format: SerializationFormat,
    pub compression: CompressionType,

    /// Payloads smaller than this many bytes are sent uncompressed.
    #[validate(range(
        min = 1,
        max = 262_144,
        message = "Compression threshold must be between 1B and 256KiB"
    ))]
    pub compression_threshold: u32,
}

impl Default for SerializationConfig {
    fn default() -> Self {
        Self {
            format: SerializationFormat::Json,
            compression: CompressionType::None,
            compression_threshold: 1024,
        }
    }
}

impl SerializationConfig {
    pub fn should_compress(&self, payload_size: usize) -> bool {
        self.compression != CompressionType::None
            && payload_size >= self.compression_threshold as usize
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;
    use crate::backoff::RetryDecision;

    const KEY: &str = "MDEyMzQ1Njc4OWFiY2RlZjAxMjM0NTY3ODlhYmNkZWY=";

    fn with_key() -> ClientConfig {
        ClientConfig {
            auth: AuthConfig {
                shared_access_key: Some(KEY.into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_require_credentials() {
        let err = ClientConfig::default().validate_all().unwrap_err();
        assert!(matches!(err, ClientError::Config(_)));
        assert!(with_key().validate_all().is_ok());
    }

    #[test]
    fn test_both_credentials_rejected() {
        let mut config = with_key();
        config.auth.sas_token = Some("SharedAccessSignature sr=a&sig=b&se=1".into());
        assert!(config.validate_all().is_err());
    }

    #[test]
    fn test_malformed_token_rejected() {
        let config = ClientConfig {
            auth: AuthConfig {
                sas_token: Some("token".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_from_toml() {
        let config: ClientConfig = toml::from_str(
            r#"
            host = "hub.example.net"
            device_id = "thermostat-01"
            module_id = "sensor"

            [auth]
            shared_access_key = "MDEyMzQ1Njc4OWFiY2RlZjAxMjM0NTY3ODlhYmNkZWY="

            [retry]
            strategy = "fixed"
            max_retries = 3
            fixed_delay_ms = 250

            [serialization]
            format = "msgpack"
            compression = "zstd"
            "#,
        )
        .unwrap();

        config.validate_all().unwrap();
        assert_eq!(config.port, 8883);
        assert_eq!(config.client_id(), "thermostat-01/sensor");
        assert_eq!(config.retry.strategy, RetryStrategy::Fixed);
        assert_eq!(config.serialization.format, SerializationFormat::MessagePack);
        assert_eq!(config.serialization.compression, CompressionType::Zstd);
    }

    #[test]
    fn test_out_of_range_values() {
        let mut config = with_key();
        config.keep_alive = 1;
        assert!(config.validate().is_err());

        let mut config = with_key();
        config.retry.min_backoff_ms = 20_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_policy_from_config() {
        let err = ClientError::Transport(crate::error::TransportError::Network("x".into()));

        let fixed = RetryConfig {
            strategy: RetryStrategy::Fixed,
            max_retries: Some(1),
            fixed_delay_ms: 250,
            ..Default::default()
        }
        .policy();
        assert_eq!(fixed.decide(0, &err), RetryDecision::Retry(Duration::from_millis(250)));
        assert_eq!(fixed.decide(1, &err), RetryDecision::Stop);

        let none = RetryConfig {
            strategy: RetryStrategy::None,
            ..Default::default()
        }
        .policy();
        assert_eq!(none.decide(0, &err), RetryDecision::Stop);

        let exponential = RetryConfig::default().policy();
        assert_eq!(
            exponential.decide(0, &err),
            RetryDecision::Retry(Duration::from_millis(100))
        );
    }

    #[test]
    fn test_tls_requires_existing_files() {
        let mut ca = NamedTempFile::new().unwrap();
        writeln!(ca, "-----BEGIN CERTIFICATE-----").unwrap();
        let ca_path = ca.path().to_string_lossy().into_owned();

        let mut config = with_key();
        config.tls = Some(TlsConfig::with_ca_only(ca_path.clone()));
        assert!(config.validate_all().is_ok());

        config.tls = Some(TlsConfig::with_ca_only("/nonexistent/ca.pem"));
        assert!(config.validate_all().is_err());

        config.tls = Some(TlsConfig {
            ca_cert_path: Some(ca_path.clone()),
            client_cert_path: Some(ca_path),
            client_key_path: None,
        });
        assert!(config.validate_all().is_err());
    }

    #[test]
    fn test_credential_provider_selection() {
        let provider = with_key().credential_provider();
        assert!(provider.is_ok());

        let err = ClientConfig::default().credential_provider().err();
        assert!(matches!(err, Some(ClientError::Config(_))));
    }

    #[test]
    fn test_debug_hides_secrets() {
        let rendered = format!("{:?}", with_key().auth);
        assert!(!rendered.contains(KEY));
    }

    #[test]
    fn test_compression_threshold() {
        let config = SerializationConfig {
            compression: CompressionType::Gzip,
            compression_threshold: 100,
            ..Default::default()
        };
        assert!(!config.should_compress(99));
        assert!(config.should_compress(100));
        assert!(!SerializationConfig::default().should_compress(10_000));
    }

    #[test]
    fn test_content_type_mapping() {
        for format in [
            SerializationFormat::Json,
            SerializationFormat::MessagePack,
            SerializationFormat::Cbor,
        ] {
            assert_eq!(SerializationFormat::from_content_type(format.content_type()), Some(format));
        }
        assert_eq!(CompressionType::from_content_encoding("gzip"), Some(CompressionType::Gzip));
        assert_eq!(CompressionType::None.content_encoding(), None);
    }
}
