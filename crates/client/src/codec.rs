//! Payload encoding for telemetry and received messages.
//!
//! [`MessageCodec`] serializes a value with the configured format and
//! compresses it when it crosses the size threshold. The format and
//! compression are recorded on the message as `content_type` and
//! `content_encoding`, and decoding is driven by those two fields, so a
//! device can read messages encoded with a different configuration.
//!
//! ```ignore
//! let codec = MessageCodec::new(&config.serialization);
//! let message = codec.encode(&reading).await?;
//! client.send_event(&message, &cancel).await?;
//! ```

use async_compression::tokio::write::{GzipDecoder, GzipEncoder, ZstdDecoder, ZstdEncoder};
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{
    config::{CompressionType, SerializationConfig, SerializationFormat},
    error::{ClientError, Result},
    message::Message,
};

/// Serializes with one of the supported formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Serializer(SerializationFormat);

impl Serializer {
    pub fn new(format: SerializationFormat) -> Self {
        Self(format)
    }

    pub fn format(&self) -> SerializationFormat {
        self.0
    }

    pub fn to_bytes<T: Serialize>(&self, data: &T) -> Result<Vec<u8>> {
        let encoded = match self.0 {
            SerializationFormat::Json => serde_json::to_vec(data).map_err(|e| e.to_string()),
            SerializationFormat::MessagePack => rmp_serde::to_vec(data).map_err(|e| e.to_string()),
            SerializationFormat::Cbor => serde_cbor::to_vec(data).map_err(|e| e.to_string()),
        };
        encoded.map_err(ClientError::Serialization)
    }

    pub fn from_bytes<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        let decoded = match self.0 {
            SerializationFormat::Json => serde_json::from_slice(data).map_err(|e| e.to_string()),
            SerializationFormat::MessagePack => {
                rmp_serde::from_slice(data).map_err(|e| e.to_string())
            }
            SerializationFormat::Cbor => serde_cbor::from_slice(data).map_err(|e| e.to_string()),
        };
        decoded.map_err(ClientError::Deserialization)
    }
}

/// Streams `data` through an async writer adapter and returns its output.
async fn pipe<W>(mut writer: W, data: &[u8], into_inner: fn(W) -> Vec<u8>) -> Result<Vec<u8>>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(data).await?;
    writer.shutdown().await?;
    Ok(into_inner(writer))
}

pub async fn compress(compression: CompressionType, data: &[u8]) -> Result<Vec<u8>> {
    match compression {
        CompressionType::None => Ok(data.to_vec()),
        CompressionType::Gzip => pipe(GzipEncoder::new(Vec::new()), data, GzipEncoder::into_inner).await,
        CompressionType::Zstd => pipe(ZstdEncoder::new(Vec::new()), data, ZstdEncoder::into_inner).await,
    }
}

pub async fn decompress(compression: CompressionType, data: &[u8]) -> Result<Vec<u8>> {
    match compression {
        CompressionType::None => Ok(data.to_vec()),
        CompressionType::Gzip => pipe(GzipDecoder::new(Vec::new()), data, GzipDecoder::into_inner).await,
        CompressionType::Zstd => pipe(ZstdDecoder::new(Vec::new()), data, ZstdDecoder::into_inner).await,
    }
}

/// Format plus compression, applied to whole messages.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    serializer: Serializer,
    config: SerializationConfig,
}

impl MessageCodec {
    pub fn new(config: &SerializationConfig) -> Self {
        Self {
            serializer: Serializer::new(config.format),
            config: config.clone(),
        }
    }

    pub fn config(&self) -> &SerializationConfig {
        &self.config
    }

    /// Builds a message from `data`, compressed if it is large enough.
    pub async fn encode<T: Serialize>(&self, data: &T) -> Result<Message> {
        let body = self.serializer.to_bytes(data)?;
        let mut message = Message::new(Vec::new()).with_content_type(self.config.format.content_type());

        if self.config.should_compress(body.len()) {
            let compressed = compress(self.config.compression, &body).await?;
            if let Some(encoding) = self.config.compression.content_encoding() {
                message = message.with_content_encoding(encoding);
            }
            message.payload = compressed.into();
        } else {
            if self.config.format == SerializationFormat::Json {
                message = message.with_content_encoding("utf-8");
            }
            message.payload = body.into();
        }
        Ok(message)
    }

    /// Decodes a message using its own content type and encoding.
    ///
    /// Missing fields fall back to the configured format and to no compression.
    pub async fn decode<T: DeserializeOwned>(&self, message: &Message) -> Result<T> {
        let format = match message.content_type.as_deref() {
            Some(ct) => SerializationFormat::from_content_type(ct).ok_or_else(|| {
                ClientError::Deserialization(format!("unsupported content type {ct}"))
            })?,
            None => self.config.format,
        };
        let compression = message
            .content_encoding
            .as_deref()
            .and_then(CompressionType::from_content_encoding)
            .unwrap_or(CompressionType::None);

        let body = decompress(compression, &message.payload).await?;
        Serializer::new(format).from_bytes(&body)
    }
}
