// -------------------------------------------------------------------------------------------------
//  Copyright (C) 2015-2025 Nautech Systems Pty Ltd. All rights reserved.
//  https://nautechsystems.io
//
//  Licensed under the GNU Lesser General Public License Version 3.0 (the "License");
//  You may not use this file except in compliance with the License.
//  You may obtain a copy of the License at https://www.gnu.org/licenses/lgpl-3.0.en.html
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.
// -------------------------------------------------------------------------------------------------

//! Byte-exact payload delivery over a text-only transport.
//!
//! Outbound binary payloads are framed as
//!
//! ```text
//! \x01RSB1:<decimal byte length>:<standard base64 of the bytes>
//! ```
//!
//! and published through a dedicated publisher connection owned by the
//! [`BinaryTransportBridge`]. On the receiving side the router recognizes the marker and
//! redelivers the decoded bytes through the same dispatch path as text messages.

use std::{
    fmt::Debug,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use base64::prelude::*;
use bytes::Bytes;
use tokio::sync::Mutex;

use crate::{
    error::{PubSubError, PubSubResult},
    transport::{Publisher, SubscribableTransport},
};

/// Marker prefixing every framed binary payload.
pub const FRAME_MARKER: &str = "\u{1}RSB1:";

/// A payload as delivered to listeners.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    /// A plain text payload, delivered verbatim.
    Text(String),
    /// A byte-exact payload that travelled framed.
    Binary(Bytes),
}

impl Payload {
    /// Returns the payload as text, if it is a text payload.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Binary(_) => None,
        }
    }

    /// Returns the raw bytes of the payload.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(bytes) => bytes,
        }
    }

    #[must_use]
    pub const fn is_binary(&self) -> bool {
        matches!(self, Self::Binary(_))
    }
}

/// Encoder and decoder for the binary frame format.
#[derive(Clone, Copy, Debug, Default)]
pub struct BinaryFrameCodec;

impl BinaryFrameCodec {
    /// Frames `bytes` into a text-safe payload.
    #[must_use]
    pub fn encode(bytes: &[u8]) -> String {
        format!("{FRAME_MARKER}{}:{}", bytes.len(), BASE64_STANDARD.encode(bytes))
    }

    /// Returns whether `payload` carries the frame marker.
    #[must_use]
    pub fn is_framed(payload: &str) -> bool {
        payload.starts_with(FRAME_MARKER)
    }

    /// Decodes a framed payload.
    ///
    /// Returns `Ok(None)` when `payload` is not framed, i.e. plain text.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::ProtocolFraming`] if the payload carries the marker but the
    /// length is missing or invalid, the body is not valid base64, or the decoded length
    /// does not match.
    pub fn decode(payload: &str) -> PubSubResult<Option<Bytes>> {
        let Some(rest) = payload.strip_prefix(FRAME_MARKER) else {
            return Ok(None);
        };

        let (len, body) = rest
            .split_once(':')
            .ok_or_else(|| PubSubError::ProtocolFraming("missing length delimiter".to_string()))?;

        let expected: usize = len
            .parse()
            .map_err(|e| PubSubError::ProtocolFraming(format!("invalid length {len:?}: {e}")))?;

        let bytes = BASE64_STANDARD
            .decode(body)
            .map_err(|e| PubSubError::ProtocolFraming(format!("invalid base64 body: {e}")))?;

        if bytes.len() != expected {
            return Err(PubSubError::ProtocolFraming(format!(
                "length mismatch: header {expected}, decoded {}",
                bytes.len()
            )));
        }

        Ok(Some(Bytes::from(bytes)))
    }

    /// Decodes an inbound text payload into the [`Payload`] delivered to listeners.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::ProtocolFraming`] if the payload is malformed framing.
    pub fn decode_payload(payload: String) -> PubSubResult<Payload> {
        match Self::decode(&payload)? {
            Some(bytes) => Ok(Payload::Binary(bytes)),
            None => Ok(Payload::Text(payload)),
        }
    }
}

/// Secondary transport used for publishing text and byte-exact payloads.
///
/// The publisher connection is opened lazily on first use and is independent of the
/// subscription connection, so it never takes part in reconciliation.
pub struct BinaryTransportBridge {
    transport: Arc<dyn SubscribableTransport>,
    publisher: Mutex<Option<Box<dyn Publisher>>>,
    closed: AtomicBool,
}

impl Debug for BinaryTransportBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(stringify!(BinaryTransportBridge))
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl BinaryTransportBridge {
    /// Creates a new [`BinaryTransportBridge`] instance.
    #[must_use]
    pub fn new(transport: Arc<dyn SubscribableTransport>) -> Self {
        Self {
            transport,
            publisher: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Publishes a text payload verbatim.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::Closed`] after [`Self::close`], or [`PubSubError::Publish`] if
    /// the publisher could not be opened or the publish failed.
    pub async fn publish(&self, channel: &str, payload: &str) -> PubSubResult<usize> {
        self.send(channel, payload).await
    }

    /// Frames and publishes a byte-exact payload.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::Closed`] after [`Self::close`], or [`PubSubError::Publish`] if
    /// the publisher could not be opened or the publish failed.
    pub async fn publish_binary(&self, channel: &str, payload: &[u8]) -> PubSubResult<usize> {
        let framed = BinaryFrameCodec::encode(payload);
        self.send(channel, &framed).await
    }

    async fn send(&self, channel: &str, payload: &str) -> PubSubResult<usize> {
        if self.is_closed() {
            return Err(PubSubError::Closed);
        }

        let mut guard = self.publisher.lock().await;

        // Checked again under the lock, close may have won the race
        if self.is_closed() {
            return Err(PubSubError::Closed);
        }

        if guard.is_none() {
            tracing::debug!("Opening publisher connection");
            let publisher = self
                .transport
                .connect_publisher()
                .await
                .map_err(|e| PubSubError::Publish(format!("failed to open publisher: {e}")))?;
            *guard = Some(publisher);
        }

        let Some(publisher) = guard.as_ref() else {
            return Err(PubSubError::Closed);
        };

        match publisher.publish(channel, payload).await {
            Ok(receivers) => Ok(receivers),
            Err(e) => {
                tracing::warn!("Publish on {channel} failed, dropping publisher: {e}");
                if let Some(publisher) = guard.take()
                    && let Err(close_err) = publisher.close().await
                {
                    tracing::debug!("Error closing failed publisher: {close_err}");
                }
                Err(PubSubError::Publish(e.to_string()))
            }
        }
    }

    /// Closes the publisher connection, if one was opened.
    ///
    /// Idempotent, the underlying publisher is closed at most once.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);

        let publisher = self.publisher.lock().await.take();
        if let Some(publisher) = publisher {
            tracing::debug!("Closing publisher connection");
            if let Err(e) = publisher.close().await {
                tracing::warn!("Error closing publisher: {e}");
            }
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
