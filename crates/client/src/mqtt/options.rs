//! Builds `rumqttc` clients for hub sessions.
//!
//! The hub expects:
//!
//! - client id `{device_id}` or `{device_id}/{module_id}`
//! - user name `{host}/{client_id}/?api-version=...`
//! - a shared access signature as the password (omitted for X.509 auth)
//! - TLS, verified against the platform roots unless a CA file is configured

use std::{fs, time::Duration};

use rumqttc::{AsyncClient, EventLoop, MqttOptions, TlsConfiguration, Transport};

use crate::{
    config::{ClientConfig, TlsConfig},
    error::TransportError,
};

pub const API_VERSION: &str = "2021-04-12";

/// Accumulates `MqttOptions` and the transport, then builds the client and
/// its event loop.
pub struct ClientBuilder {
    opts: MqttOptions,
    cap: usize,
    use_tls: bool,
    tls_config: Option<TlsConfig>,
}

impl ClientBuilder {
    pub fn new(client_id: impl Into<String>, host: impl Into<String>, port: u16, cap: usize) -> Self {
        Self {
            opts: MqttOptions::new(client_id, host, port),
            cap,
            use_tls: true,
            tls_config: None,
        }
    }

    /// Applies the connection settings of `config`. Credentials are set
    /// separately because the token is fetched per session.
    pub fn from_config(config: &ClientConfig) -> Self {
        let client_id = config.client_id();
        let mut builder = Self::new(
            client_id.clone(),
            config.host.clone(),
            config.port,
            config.request_channel_capacity,
        )
        .keep_alive(config.keep_alive())
        .clean_session(config.clean_session)
        .max_inflight(config.max_inflight)
        .max_packet_size(config.max_packet_size, config.max_packet_size);

        builder.use_tls = config.use_tls;
        builder.tls_config = config.tls.clone();
        builder.opts.set_credentials(username(&config.host, &client_id), "");
        builder
    }

    pub fn keep_alive(mut self, interval: Duration) -> Self {
        self.opts.set_keep_alive(interval);
        self
    }

    pub fn max_packet_size(mut self, incoming: usize, outgoing: usize) -> Self {
        self.opts.set_max_packet_size(incoming, outgoing);
        self
    }

    pub fn clean_session(mut self, clean: bool) -> Self {
        self.opts.set_clean_session(clean);
        self
    }

    pub fn max_inflight(mut self, max: u16) -> Self {
        self.opts.set_inflight(max);
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.opts.set_credentials(username, password);
        self
    }

    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.use_tls = true;
        self.tls_config = Some(tls);
        self
    }

    /// Plain TCP, for local test brokers.
    pub fn without_tls(mut self) -> Self {
        self.use_tls = false;
        self.tls_config = None;
        self
    }

    fn load_file(path: &str) -> Result<Vec<u8>, TransportError> {
        fs::read(path)
            .map_err(|e| TransportError::Configuration(format!("Cannot read {path}: {e}")))
    }

    fn build_transport(&self) -> Result<Transport, TransportError> {
        if !self.use_tls {
            return Ok(Transport::Tcp);
        }
        let Some(tls) = &self.tls_config else {
            return Ok(Transport::tls_with_default_config());
        };

        tls.validate_config()
            .map_err(|e| TransportError::Configuration(format!("Invalid TLS configuration: {e}")))?;

        let client_auth = match (&tls.client_cert_path, &tls.client_key_path) {
            (Some(cert), Some(key)) => Some((Self::load_file(cert)?, Self::load_file(key)?)),
            _ => None,
        };

        match &tls.ca_cert_path {
            Some(ca) => Ok(Transport::Tls(TlsConfiguration::Simple {
                ca: Self::load_file(ca)?,
                client_auth,
                alpn: None,
            })),
            None if client_auth.is_some() => Err(TransportError::Configuration(
                "A client certificate requires tls.ca_cert_path".into(),
            )),
            None => Ok(Transport::tls_with_default_config()),
        }
    }

    pub fn build(self) -> Result<(AsyncClient, EventLoop), TransportError> {
        let transport = self.build_transport()?;
        let mut opts = self.opts;
        opts.set_transport(transport);
        Ok(AsyncClient::new(opts, self.cap))
    }
}

/// MQTT user name the hub expects for `client_id`.
pub fn username(host: &str, client_id: &str) -> String {
    format!("{host}/{client_id}/?api-version={API_VERSION}")
}

#[cfg(test)]
mod tests {
    use std::{fs::File, io::Write};

    use tempfile::TempDir;

    use super::*;

    struct TestFiles {
        _temp_dir: TempDir,
        ca_cert: String,
        client_cert: String,
        client_key: String,
    }

    impl TestFiles {
        fn new() -> std::io::Result<Self> {
            let temp_dir = TempDir::new()?;
            let ca_cert = temp_dir.path().join("ca.crt");
            let client_cert = temp_dir.path().join("client.crt");
            let client_key = temp_dir.path().join("client.key");

            File::create(&ca_cert)?.write_all(b"ca certificate content")?;
            File::create(&client_cert)?.write_all(b"client certificate content")?;
            File::create(&client_key)?.write_all(b"client key content")?;

            Ok(TestFiles {
                _temp_dir: temp_dir,
                ca_cert: ca_cert.to_string_lossy().into_owned(),
                client_cert: client_cert.to_string_lossy().into_owned(),
                client_key: client_key.to_string_lossy().into_owned(),
            })
        }
    }

    #[test]
    fn test_username_format() {
        assert_eq!(
            username("hub.example.net", "dev-1/filter"),
            "hub.example.net/dev-1/filter/?api-version=2021-04-12"
        );
    }

    #[test]
    fn test_from_config_sets_identity() {
        let config = ClientConfig {
            host: "hub.example.net".into(),
            device_id: "dev-1".into(),
            ..Default::default()
        };
        let builder = ClientBuilder::from_config(&config);
        assert_eq!(builder.opts.client_id(), "dev-1");
        assert_eq!(builder.opts.keep_alive(), Duration::from_secs(230));
        assert_eq!(builder.cap, 32);
    }

    #[test]
    fn test_transport_selection() {
        let files = TestFiles::new().unwrap();

        let plain = ClientBuilder::new("c", "localhost", 1883, 10).without_tls();
        assert!(matches!(plain.build_transport(), Ok(Transport::Tcp)));

        let roots = ClientBuilder::new("c", "localhost", 8883, 10);
        assert!(matches!(roots.build_transport(), Ok(Transport::Tls(_))));

        let mutual = ClientBuilder::new("c", "localhost", 8883, 10).with_tls(TlsConfig {
            ca_cert_path: Some(files.ca_cert.clone()),
            client_cert_path: Some(files.client_cert.clone()),
            client_key_path: Some(files.client_key.clone()),
        });
        match mutual.build_transport() {
            Ok(Transport::Tls(TlsConfiguration::Simple { ca, client_auth, .. })) => {
                assert_eq!(ca, b"ca certificate content");
                assert!(client_auth.is_some());
            }
            _ => panic!("expected a simple TLS transport"),
        }
    }

    #[test]
    fn test_missing_files_fail_the_build() {
        let builder = ClientBuilder::new("c", "localhost", 8883, 10)
            .with_tls(TlsConfig::with_ca_only("/nonexistent/ca.pem"));
        assert!(matches!(
            builder.build(),
            Err(TransportError::Configuration(_))
        ));
    }

    #[test]
    fn test_client_cert_without_ca_is_rejected() {
        let files = TestFiles::new().unwrap();
        let builder = ClientBuilder::new("c", "localhost", 8883, 10).with_tls(TlsConfig {
            ca_cert_path: None,
            client_cert_path: Some(files.client_cert.clone()),
            client_key_path: Some(files.client_key.clone()),
        });
        assert!(builder.build_transport().is_err());
    }

    #[tokio::test]
    async fn test_build_tcp_client() {
        let result = ClientBuilder::new("c", "localhost", 1883, 10)
            .without_tls()
            .build();
        assert!(result.is_ok());
    }
}
