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

//! Dynamic pub/sub client over a transport with construction-time-only subscriptions.
//!
//! **Key features**:
//! - Subscribe and unsubscribe at any time, with reference counting per key
//! - Bursts of changes coalesced into one reconnect
//! - Reconnect with exponential backoff and liveness probing
//! - Byte-exact binary payloads over a text transport
//!
//! **Design**:
//! - Batcher task is the single writer of subscription state
//! - Lifecycle controller task owns the underlying connection
//! - Router task dispatches every event in production order

use std::{sync::Arc, time::Duration};

use ustr::Ustr;

use crate::{
    batcher::{OperationBatcher, OperationKind},
    binary::BinaryTransportBridge,
    config::PubSubConfig,
    error::PubSubResult,
    health::HealthMonitor,
    lifecycle::ConnectionLifecycleManager,
    router::{ListenerId, MessageRouter, ShareableEventListener},
    shutdown::ShutdownCoordinator,
    state::ConnectionState,
    subscription::SubscriptionSnapshot,
    transport::SubscribableTransport,
};

/// A pub/sub client exposing dynamic subscriptions.
#[derive(Debug)]
pub struct PubSubClient {
    config: PubSubConfig,
    router: Arc<MessageRouter>,
    lifecycle: Arc<ConnectionLifecycleManager>,
    batcher: Arc<OperationBatcher>,
    bridge: Arc<BinaryTransportBridge>,
    coordinator: ShutdownCoordinator,
}

impl PubSubClient {
    /// Creates a new [`PubSubClient`] and spawns its component tasks.
    ///
    /// No connection is made until the first subscription. Must be called from within a
    /// Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::Config`](crate::error::PubSubError::Config) if `config` is
    /// invalid.
    pub fn new(
        transport: Arc<dyn SubscribableTransport>,
        config: PubSubConfig,
    ) -> PubSubResult<Self> {
        config.validate()?;

        let router = Arc::new(MessageRouter::spawn());
        let lifecycle = Arc::new(ConnectionLifecycleManager::spawn(
            transport.clone(),
            &config,
            router.clone(),
        )?);
        let batcher = Arc::new(OperationBatcher::spawn(
            config.debounce(),
            lifecycle.clone(),
            router.clone(),
        ));
        let bridge = Arc::new(BinaryTransportBridge::new(transport));
        let health = config.health_check_interval().map(|interval| {
            Arc::new(HealthMonitor::spawn(
                lifecycle.clone(),
                router.clone(),
                interval,
                config.health_check_timeout(),
                config.health_failure_threshold,
            ))
        });
        let coordinator = ShutdownCoordinator::new(
            batcher.clone(),
            lifecycle.clone(),
            bridge.clone(),
            health,
            router.clone(),
            config.shutdown_timeout(),
        );

        tracing::debug!("Created pub/sub client");

        Ok(Self {
            config,
            router,
            lifecycle,
            batcher,
            bridge,
            coordinator,
        })
    }

    /// Subscribes to exact channels, resolving to the total subscription count once applied.
    ///
    /// # Errors
    ///
    /// Returns an error if `channels` is empty, a channel name is invalid or the client is
    /// closed.
    pub async fn subscribe<I, S>(&self, channels: I) -> PubSubResult<usize>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.enqueue(OperationKind::Subscribe, channels).await
    }

    /// Unsubscribes from exact channels, or from all of them when `channels` is empty.
    ///
    /// # Errors
    ///
    /// Returns an error if a channel name is invalid or the client is closed.
    pub async fn unsubscribe<I, S>(&self, channels: I) -> PubSubResult<usize>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.enqueue(OperationKind::Unsubscribe, channels).await
    }

    /// Subscribes to patterns, resolving to the total subscription count once applied.
    ///
    /// # Errors
    ///
    /// Returns an error if `patterns` is empty, a pattern is invalid or the client is closed.
    pub async fn psubscribe<I, S>(&self, patterns: I) -> PubSubResult<usize>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.enqueue(OperationKind::PSubscribe, patterns).await
    }

    /// Unsubscribes from patterns, or from all of them when `patterns` is empty.
    ///
    /// # Errors
    ///
    /// Returns an error if a pattern is invalid or the client is closed.
    pub async fn punsubscribe<I, S>(&self, patterns: I) -> PubSubResult<usize>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.enqueue(OperationKind::PUnsubscribe, patterns).await
    }

    /// Unsubscribes from every exact channel desired when the operation is applied.
    ///
    /// # Errors
    ///
    /// Returns an error if the client is closed.
    pub async fn unsubscribe_all(&self) -> PubSubResult<usize> {
        self.batcher.enqueue(OperationKind::Unsubscribe, Vec::new()).await
    }

    /// Unsubscribes from every pattern desired when the operation is applied.
    ///
    /// # Errors
    ///
    /// Returns an error if the client is closed.
    pub async fn punsubscribe_all(&self) -> PubSubResult<usize> {
        self.batcher
            .enqueue(OperationKind::PUnsubscribe, Vec::new())
            .await
    }

    async fn enqueue<I, S>(&self, kind: OperationKind, keys: I) -> PubSubResult<usize>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keys: Vec<Ustr> = keys.into_iter().map(|k| Ustr::from(k.as_ref())).collect();
        self.batcher.enqueue(kind, keys).await
    }

    /// Publishes a text payload, returning the number of receivers.
    ///
    /// # Errors
    ///
    /// Returns an error if publishing failed or the client is closed.
    pub async fn publish(&self, channel: &str, payload: &str) -> PubSubResult<usize> {
        self.bridge.publish(channel, payload).await
    }

    /// Publishes a byte-exact payload, returning the number of receivers.
    ///
    /// # Errors
    ///
    /// Returns an error if publishing failed or the client is closed.
    pub async fn publish_binary(&self, channel: &str, payload: &[u8]) -> PubSubResult<usize> {
        self.bridge.publish_binary(channel, payload).await
    }

    /// Returns the number of exact channels and patterns in the applied snapshot.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.lifecycle.applied_snapshot().len()
    }

    #[must_use]
    pub fn applied_snapshot(&self) -> SubscriptionSnapshot {
        self.lifecycle.applied_snapshot()
    }

    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.lifecycle.connection_state()
    }

    #[must_use]
    pub const fn config(&self) -> &PubSubConfig {
        &self.config
    }

    /// Registers a listener for every event.
    pub fn add_listener(&self, listener: ShareableEventListener) -> ListenerId {
        self.router.add_listener(listener)
    }

    /// Registers a listener for messages on the exact `channel`.
    pub fn add_channel_listener(&self, channel: &str, listener: ShareableEventListener) -> ListenerId {
        self.router.add_channel_listener(channel, listener)
    }

    /// Registers a listener for messages received through `pattern`.
    pub fn add_pattern_listener(&self, pattern: &str, listener: ShareableEventListener) -> ListenerId {
        self.router.add_pattern_listener(pattern, listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.router.remove_listener(id)
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.router.listener_count()
    }

    /// Waits until a connection is current, returning `false` on timeout.
    pub async fn wait_until_ready(&self, timeout: Duration) -> bool {
        self.lifecycle.wait_until_ready(timeout).await
    }

    /// Shuts the client down, see [`ShutdownCoordinator`].
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::ShutdownTimeout`](crate::error::PubSubError::ShutdownTimeout)
    /// if resources had to be force-closed.
    pub async fn shutdown(&self) -> PubSubResult<()> {
        self.coordinator.shutdown().await
    }
}

impl Drop for PubSubClient {
    fn drop(&mut self) {
        self.coordinator.abort();
    }
}
