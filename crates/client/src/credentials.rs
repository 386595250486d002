//! Credentials presented to the hub.
//!
//! A [`CredentialProvider`] hands out [`AuthToken`]s. Transports ask for a
//! fresh token every time they build a session and on demand when the
//! session refreshes its credentials.
//!
//! Shared access signatures are computed as:
//!
//! ```text
//! string_to_sign = url_encode(resource) + "\n" + expiry
//! signature      = base64(hmac_sha256(base64_decode(key), string_to_sign))
//! token          = "SharedAccessSignature sr={url_encode(resource)}&sig={url_encode(signature)}&se={expiry}[&skn={key_name}]"
//! ```
//!
//! where `resource` is `{host}/devices/{device_id}` (or
//! `{host}/devices/{device_id}/modules/{module_id}`) and `expiry` is in
//! seconds since the Unix epoch.

use std::{
    fmt,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{ClientError, TransportError};

type HmacSha256 = Hmac<Sha256>;

/// A bearer token and its expiry.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken {
    value: String,
    expires_at: Option<SystemTime>,
}

impl AuthToken {
    pub fn new(value: impl Into<String>, expires_at: Option<SystemTime>) -> Self {
        Self {
            value: value.into(),
            expires_at,
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn expires_at(&self) -> Option<SystemTime> {
        self.expires_at
    }

    /// True if the token expires within `margin` of `now`.
    pub fn expires_within(&self, now: SystemTime, margin: Duration) -> bool {
        match self.expires_at {
            Some(at) => at <= now + margin,
            None => false,
        }
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthToken")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Source of tokens for a device identity.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn token(&self) -> Result<AuthToken, TransportError>;
}

/// Signs tokens locally from a device or module shared access key.
pub struct SharedAccessKeyProvider {
    resource: String,
    key: Vec<u8>,
    key_name: Option<String>,
    ttl: Duration,
}

impl SharedAccessKeyProvider {
    /// Creates a provider for a device (or module) identity.
    ///
    /// # Arguments
    /// - `host`: hub host name, e.g. `myhub.azure-devices.net`
    /// - `device_id`, `module_id`: identity the token is scoped to
    /// - `key`: base64-encoded shared access key
    /// - `ttl`: lifetime of each generated token
    ///
    /// # Errors
    /// `ClientError::ClientSetup` if the key is not valid base64.
    pub fn new(
        host: &str,
        device_id: &str,
        module_id: Option<&str>,
        key: &str,
        ttl: Duration,
    ) -> Result<Self, ClientError> {
        let key = STANDARD
            .decode(key.trim())
            .map_err(|e| ClientError::ClientSetup(format!("Invalid shared access key: {e}")))?;

        let mut resource = format!("{host}/devices/{device_id}");
        if let Some(module_id) = module_id {
            resource.push_str("/modules/");
            resource.push_str(module_id);
        }

        Ok(Self {
            resource,
            key,
            key_name: None,
            ttl,
        })
    }

    /// Names the shared access policy the key belongs to (`skn=`).
    pub fn with_key_name(mut self, key_name: impl Into<String>) -> Self {
        self.key_name = Some(key_name.into());
        self
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Builds a token that expires `ttl` after `now`.
    pub fn token_at(&self, now: SystemTime) -> Result<AuthToken, TransportError> {
        let expires_at = now + self.ttl;
        let expiry = expires_at
            .duration_since(UNIX_EPOCH)
            .map_err(|e| TransportError::Configuration(format!("Clock before epoch: {e}")))?
            .as_secs();

        let encoded_resource = urlencoding::encode(&self.resource);
        let string_to_sign = format!("{encoded_resource}\n{expiry}");

        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| TransportError::Configuration(format!("Unusable signing key: {e}")))?;
        mac.update(string_to_sign.as_bytes());
        let signature = STANDARD.encode(mac.finalize().into_bytes());

        let mut token = format!(
            "SharedAccessSignature sr={}&sig={}&se={}",
            encoded_resource,
            urlencoding::encode(&signature),
            expiry
        );
        if let Some(key_name) = &self.key_name {
            token.push_str("&skn=");
            token.push_str(&urlencoding::encode(key_name));
        }

        Ok(AuthToken::new(token, Some(expires_at)))
    }
}

#[async_trait]
impl CredentialProvider for SharedAccessKeyProvider {
    async fn token(&self) -> Result<AuthToken, TransportError> {
        self.token_at(SystemTime::now())
    }
}

/// Hands out a pre-generated token unchanged.
pub struct StaticTokenProvider {
    token: AuthToken,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: AuthToken::new(token, None),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticTokenProvider {
    async fn token(&self) -> Result<AuthToken, TransportError> {
        Ok(self.token.clone())
    }
}
