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

//! Test related helpers, including an in-memory [`SubscribableTransport`].

use std::{
    future::Future,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use tokio::sync::mpsc;
use ustr::Ustr;

use crate::{
    lifecycle::LifecycleSignal,
    matching::is_matching,
    router::RouterCommand,
    subscription::SubscriptionSnapshot,
    transport::{
        ConnectionSink, InboundMessage, PubSubConnection, Publisher, SubscribableTransport,
    },
};

/// Repeatedly evaluates a condition with a delay until it becomes true or a timeout occurs.
///
/// # Panics
///
/// This function will panic if the timeout duration is exceeded without the condition being met.
pub async fn wait_until_async<F, Fut>(mut condition: F, timeout: Duration)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start_time = Instant::now();

    loop {
        if condition().await {
            break;
        }

        assert!(
            start_time.elapsed() <= timeout,
            "Timeout waiting for condition"
        );

        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// The engine side of a [`ConnectionSink`] not attached to any engine.
///
/// Lets transports exercise their reader tasks directly. Dropping it closes the sink.
#[derive(Debug)]
pub struct DetachedSink {
    router_rx: mpsc::UnboundedReceiver<RouterCommand>,
    signal_rx: mpsc::UnboundedReceiver<LifecycleSignal>,
}

impl DetachedSink {
    /// Creates a sink for `connection_id` and its detached receiving end.
    #[must_use]
    pub fn new(connection_id: u64) -> (ConnectionSink, Self) {
        let (router_tx, router_rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let sink = ConnectionSink::new(connection_id, 0, router_tx, signal_tx);
        (sink, Self { router_rx, signal_rx })
    }

    /// Returns the next delivered message, if one is pending.
    pub fn try_recv_message(&mut self) -> Option<InboundMessage> {
        while let Ok(cmd) = self.router_rx.try_recv() {
            if let RouterCommand::Inbound { message, .. } = cmd {
                return Some(message);
            }
        }
        None
    }

    /// Returns whether the connection reported itself lost.
    pub fn is_lost(&mut self) -> bool {
        while let Ok(signal) = self.signal_rx.try_recv() {
            if matches!(signal, LifecycleSignal::Lost { .. }) {
                return true;
            }
        }
        false
    }

    /// Completes once every clone of the sink has been dropped.
    pub async fn released(&mut self) {
        while self.router_rx.recv().await.is_some() {}
    }
}

#[derive(Debug)]
struct MockConnectionState {
    snapshot: SubscriptionSnapshot,
    sink: ConnectionSink,
    close_count: AtomicUsize,
}

impl MockConnectionState {
    fn is_open(&self) -> bool {
        self.close_count.load(Ordering::SeqCst) == 0 && !self.sink.is_closed()
    }
}

#[derive(Debug, Default)]
struct MockBroker {
    connections: Mutex<Vec<Arc<MockConnectionState>>>,
    construct_attempts: AtomicUsize,
    construct_failures: AtomicUsize,
    construct_delay_ms: AtomicU64,
    ping_failing: AtomicBool,
    ping_count: AtomicUsize,
    publishers_opened: AtomicUsize,
    publisher_closes: AtomicUsize,
    publish_failures: AtomicUsize,
    published: Mutex<Vec<(String, String)>>,
}

impl MockBroker {
    fn connections(&self) -> Vec<Arc<MockConnectionState>> {
        self.connections
            .lock()
            .map(|connections| connections.clone())
            .unwrap_or_default()
    }

    /// Delivers `payload` to every open connection subscribed to `channel`, the way a
    /// pub/sub server fans a message out to all matching subscriptions.
    fn route(&self, channel: &str, payload: &str) -> usize {
        let channel_ustr = Ustr::from(channel);
        let mut receivers = 0;

        for connection in self.connections().iter().filter(|c| c.is_open()) {
            if connection.snapshot.exact_channels().contains(&channel_ustr) {
                connection.sink.deliver(InboundMessage::Message {
                    channel: channel_ustr,
                    payload: payload.to_string(),
                });
                receivers += 1;
            }
            for pattern in connection.snapshot.patterns() {
                if is_matching(channel, pattern) {
                    connection.sink.deliver(InboundMessage::PMessage {
                        pattern: *pattern,
                        channel: channel_ustr,
                        payload: payload.to_string(),
                    });
                    receivers += 1;
                }
            }
        }

        receivers
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// An in-memory transport behaving like a pub/sub server with configuration-time-only
/// subscriptions.
///
/// Clones share the same broker, so a test keeps one clone for inspection and failure
/// injection while the client owns another.
#[derive(Clone, Debug, Default)]
pub struct MockTransport {
    broker: Arc<MockBroker>,
}

impl MockTransport {
    /// Creates a new [`MockTransport`] instance.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` constructions fail.
    pub fn fail_next_constructs(&self, count: usize) {
        self.broker
            .construct_failures
            .store(count, Ordering::SeqCst);
    }

    /// Delays every construction by `delay`.
    pub fn set_construct_delay(&self, delay: Duration) {
        self.broker
            .construct_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Makes every ping fail while `failing` is set.
    pub fn set_ping_failing(&self, failing: bool) {
        self.broker.ping_failing.store(failing, Ordering::SeqCst);
    }

    /// Makes the next `count` publishes fail.
    pub fn fail_next_publishes(&self, count: usize) {
        self.broker.publish_failures.store(count, Ordering::SeqCst);
    }

    /// Publishes a message as if another client had published it.
    pub fn publish(&self, channel: &str, payload: &str) -> usize {
        self.broker.route(channel, payload)
    }

    /// Reports the most recently constructed connection as lost.
    pub fn lose_latest_connection(&self, reason: &str) {
        if let Some(connection) = self.broker.connections().last() {
            connection.sink.connection_lost(reason);
        }
    }

    /// Returns the number of construction attempts, including failed ones.
    #[must_use]
    pub fn construct_attempts(&self) -> usize {
        self.broker.construct_attempts.load(Ordering::SeqCst)
    }

    /// Returns the number of successfully constructed connections.
    #[must_use]
    pub fn connections_built(&self) -> usize {
        self.broker.connections().len()
    }

    /// Returns the snapshots of every constructed connection, in construction order.
    #[must_use]
    pub fn snapshots(&self) -> Vec<SubscriptionSnapshot> {
        self.broker
            .connections()
            .iter()
            .map(|c| c.snapshot.clone())
            .collect()
    }

    /// Returns how many times each constructed connection was closed.
    #[must_use]
    pub fn close_counts(&self) -> Vec<usize> {
        self.broker
            .connections()
            .iter()
            .map(|c| c.close_count.load(Ordering::SeqCst))
            .collect()
    }

    /// Returns the number of connections not yet closed.
    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.broker
            .connections()
            .iter()
            .filter(|c| c.is_open())
            .count()
    }

    #[must_use]
    pub fn ping_count(&self) -> usize {
        self.broker.ping_count.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn publishers_opened(&self) -> usize {
        self.broker.publishers_opened.load(Ordering::SeqCst)
    }

    /// Returns the total number of publisher close calls.
    #[must_use]
    pub fn publisher_close_count(&self) -> usize {
        self.broker.publisher_closes.load(Ordering::SeqCst)
    }

    /// Returns every `(channel, payload)` published through a publisher.
    #[must_use]
    pub fn published(&self) -> Vec<(String, String)> {
        self.broker
            .published
            .lock()
            .map(|published| published.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SubscribableTransport for MockTransport {
    async fn construct(
        &self,
        snapshot: &SubscriptionSnapshot,
        sink: ConnectionSink,
    ) -> anyhow::Result<Box<dyn PubSubConnection>> {
        self.broker.construct_attempts.fetch_add(1, Ordering::SeqCst);

        let delay_ms = self.broker.construct_delay_ms.load(Ordering::SeqCst);
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }

        if MockBroker::take_failure(&self.broker.construct_failures) {
            anyhow::bail!("Connection refused");
        }

        let state = Arc::new(MockConnectionState {
            snapshot: snapshot.clone(),
            sink,
            close_count: AtomicUsize::new(0),
        });
        if let Ok(mut connections) = self.broker.connections.lock() {
            connections.push(state.clone());
        }

        Ok(Box::new(MockConnection {
            broker: self.broker.clone(),
            state,
        }))
    }

    async fn connect_publisher(&self) -> anyhow::Result<Box<dyn Publisher>> {
        self.broker.publishers_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockPublisher {
            broker: self.broker.clone(),
        }))
    }
}

struct MockConnection {
    broker: Arc<MockBroker>,
    state: Arc<MockConnectionState>,
}

#[async_trait]
impl PubSubConnection for MockConnection {
    async fn ping(&self) -> anyhow::Result<()> {
        self.broker.ping_count.fetch_add(1, Ordering::SeqCst);
        if self.broker.ping_failing.load(Ordering::SeqCst) {
            anyhow::bail!("PING timed out");
        }
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.state.close_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct MockPublisher {
    broker: Arc<MockBroker>,
}

#[async_trait]
impl Publisher for MockPublisher {
    async fn publish(&self, channel: &str, payload: &str) -> anyhow::Result<usize> {
        if MockBroker::take_failure(&self.broker.publish_failures) {
            anyhow::bail!("Broken pipe");
        }
        if let Ok(mut published) = self.broker.published.lock() {
            published.push((channel.to_string(), payload.to_string()));
        }
        Ok(self.broker.route(channel, payload))
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.broker.publisher_closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////////////
// Tests
////////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[tokio::test]
    async fn test_detached_sink_collects_deliveries_and_loss() {
        let (sink, mut detached) = DetachedSink::new(3);

        sink.deliver(InboundMessage::Message {
            channel: Ustr::from("a"),
            payload: "x".to_string(),
        });
        sink.connection_lost("reset");

        assert_eq!(
            detached.try_recv_message(),
            Some(InboundMessage::Message {
                channel: Ustr::from("a"),
                payload: "x".to_string(),
            })
        );
        assert!(detached.is_lost());

        drop(sink);
        tokio::time::timeout(Duration::from_secs(1), detached.released())
            .await
            .unwrap();
    }

    #[rstest]
    fn test_dropping_detached_sink_closes_sink() {
        let (sink, detached) = DetachedSink::new(3);
        assert!(!sink.is_closed());

        drop(detached);

        assert!(sink.is_closed());
    }
}
