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

//! A [`SubscribableTransport`] over Redis pub/sub.
//!
//! Each constructed connection is a dedicated subscriber connection split into two halves:
//! the stream half feeds a reader task, the sink half serves liveness probes so a dead
//! subscriber socket is detected. Publishing uses a separate multiplexed connection.

use std::{fmt::Debug, pin::pin, sync::Mutex, time::Duration};

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use redis::{
    Msg,
    aio::{MultiplexedConnection, PubSubSink},
};
use resub_pubsub::{
    subscription::SubscriptionSnapshot,
    transport::{ConnectionSink, InboundMessage, PubSubConnection, Publisher, SubscribableTransport},
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use ustr::Ustr;

use crate::config::{RedisConfig, get_redis_url};

const REDIS_PING: &str = "PING";
const REDIS_PUBLISH: &str = "PUBLISH";

/// Constructs Redis connections subscribed to a complete snapshot.
pub struct RedisTransport {
    client: redis::Client,
    redacted_url: String,
    connection_timeout: Duration,
    response_timeout: Duration,
}

impl Debug for RedisTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(stringify!(RedisTransport))
            .field("url", &self.redacted_url)
            .field("connection_timeout", &self.connection_timeout)
            .field("response_timeout", &self.response_timeout)
            .finish()
    }
}

impl RedisTransport {
    /// Creates a new [`RedisTransport`] instance.
    ///
    /// No connection is opened until the first construction.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection URL cannot be built or parsed.
    pub fn new(config: &RedisConfig) -> anyhow::Result<Self> {
        let (url, redacted_url) = get_redis_url(config)?;
        let client = redis::Client::open(url)
            .map_err(|e| anyhow::anyhow!("Invalid Redis URL {redacted_url}: {e}"))?;

        Ok(Self {
            client,
            redacted_url,
            connection_timeout: config.connection_timeout(),
            response_timeout: config.response_timeout(),
        })
    }

    /// Returns the connection URL with the password redacted.
    #[must_use]
    pub fn redacted_url(&self) -> &str {
        &self.redacted_url
    }
}

#[async_trait]
impl SubscribableTransport for RedisTransport {
    async fn construct(
        &self,
        snapshot: &SubscriptionSnapshot,
        sink: ConnectionSink,
    ) -> anyhow::Result<Box<dyn PubSubConnection>> {
        tracing::debug!(
            connection_id = sink.connection_id(),
            revision = snapshot.revision(),
            "Connecting to {}",
            self.redacted_url
        );

        let subscribe = async {
            let mut pubsub = self.client.get_async_pubsub().await?;

            let channels: Vec<&str> = snapshot.exact_channels().iter().map(Ustr::as_str).collect();
            if !channels.is_empty() {
                pubsub.subscribe(channels).await?;
            }
            let patterns: Vec<&str> = snapshot.patterns().iter().map(Ustr::as_str).collect();
            if !patterns.is_empty() {
                pubsub.psubscribe(patterns).await?;
            }

            Ok::<_, redis::RedisError>(pubsub)
        };

        let pubsub = tokio::time::timeout(self.connection_timeout, subscribe)
            .await
            .map_err(|_| anyhow::anyhow!("Timed out subscribing on {}", self.redacted_url))?
            .map_err(|e| anyhow::anyhow!("Failed to subscribe on {}: {e}", self.redacted_url))?;

        let (subscriber, stream) = pubsub.split();
        let cancel = CancellationToken::new();
        let reader = tokio::spawn(read_messages(stream, sink, cancel.clone()));

        Ok(Box::new(RedisConnection {
            subscriber: Mutex::new(Some(subscriber)),
            response_timeout: self.response_timeout,
            cancel,
            reader: Mutex::new(Some(reader)),
        }))
    }

    async fn connect_publisher(&self) -> anyhow::Result<Box<dyn Publisher>> {
        let con = tokio::time::timeout(
            self.connection_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| anyhow::anyhow!("Timed out connecting to {}", self.redacted_url))?
        .map_err(|e| anyhow::anyhow!("Failed to connect to {}: {e}", self.redacted_url))?;

        tracing::debug!("Publisher connected to {}", self.redacted_url);
        Ok(Box::new(RedisPublisher {
            con: Mutex::new(Some(con)),
            response_timeout: self.response_timeout,
        }))
    }
}

/// Forwards subscriber messages to `sink` until the stream ends, `cancel` fires or the
/// engine stops listening.
async fn read_messages<S>(stream: S, sink: ConnectionSink, cancel: CancellationToken)
where
    S: Stream<Item = Msg>,
{
    let mut stream = pin!(stream);

    loop {
        let msg = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = sink.closed() => {
                tracing::debug!(connection_id = sink.connection_id(), "Sink closed");
                break;
            }
            msg = stream.next() => msg,
        };

        let Some(msg) = msg else {
            tracing::warn!(
                connection_id = sink.connection_id(),
                "Redis subscription stream ended"
            );
            sink.connection_lost("Redis subscription stream ended");
            break;
        };

        match to_inbound(&msg) {
            Ok(message) => sink.deliver(message),
            Err(e) => tracing::warn!("Dropping unreadable Redis message: {e}"),
        }
    }

    tracing::debug!(connection_id = sink.connection_id(), "Reader stopped");
}

fn to_inbound(msg: &Msg) -> redis::RedisResult<InboundMessage> {
    let channel: String = msg.get_channel()?;
    let payload = String::from_utf8_lossy(msg.get_payload_bytes()).into_owned();

    if msg.from_pattern() {
        let pattern: String = msg.get_pattern()?;
        Ok(InboundMessage::PMessage {
            pattern: Ustr::from(&pattern),
            channel: Ustr::from(&channel),
            payload,
        })
    } else {
        Ok(InboundMessage::Message {
            channel: Ustr::from(&channel),
            payload,
        })
    }
}

struct RedisConnection {
    subscriber: Mutex<Option<PubSubSink>>,
    response_timeout: Duration,
    cancel: CancellationToken,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl RedisConnection {
    fn take_reader(&self) -> Option<JoinHandle<()>> {
        self.reader.lock().ok().and_then(|mut reader| reader.take())
    }
}

#[async_trait]
impl PubSubConnection for RedisConnection {
    async fn ping(&self) -> anyhow::Result<()> {
        let mut subscriber = self
            .subscriber
            .lock()
            .ok()
            .and_then(|subscriber| subscriber.clone())
            .filter(|_| !self.cancel.is_cancelled())
            .ok_or_else(|| anyhow::anyhow!("Connection closed"))?;

        // In subscriber mode the reply is a `pong` push rather than a simple string
        tokio::time::timeout(self.response_timeout, subscriber.ping::<redis::Value>())
            .await
            .map_err(|_| anyhow::anyhow!("{REDIS_PING} timed out"))??;

        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.cancel.cancel();
        if let Ok(mut subscriber) = self.subscriber.lock() {
            subscriber.take();
        }

        if let Some(reader) = self.take_reader() {
            // The subscriber connection is released once the reader drops its stream
            reader
                .await
                .map_err(|e| anyhow::anyhow!("Reader task failed: {e}"))?;
        }
        Ok(())
    }
}

impl Drop for RedisConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(reader) = self.take_reader() {
            reader.abort();
        }
    }
}

struct RedisPublisher {
    con: Mutex<Option<MultiplexedConnection>>,
    response_timeout: Duration,
}

#[async_trait]
impl Publisher for RedisPublisher {
    async fn publish(&self, channel: &str, payload: &str) -> anyhow::Result<usize> {
        let mut con = self
            .con
            .lock()
            .ok()
            .and_then(|con| con.clone())
            .ok_or_else(|| anyhow::anyhow!("Publisher closed"))?;

        let receivers: usize = tokio::time::timeout(
            self.response_timeout,
            redis::cmd(REDIS_PUBLISH)
                .arg(channel)
                .arg(payload)
                .query_async::<usize>(&mut con),
        )
        .await
        .map_err(|_| anyhow::anyhow!("{REDIS_PUBLISH} on {channel} timed out"))??;

        Ok(receivers)
    }

    async fn close(&self) -> anyhow::Result<()> {
        if let Ok(mut con) = self.con.lock() {
            con.take();
        }
        Ok(())
    }
}
