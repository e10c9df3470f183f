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

//! Capability interface between the engine and a concrete pub/sub transport.
//!
//! A transport can only fix its subscription set when a connection is constructed. The
//! lifecycle manager therefore asks for a brand-new [`PubSubConnection`] per snapshot and
//! never depends on how the transport subscribes.

use async_trait::async_trait;
use tokio::sync::mpsc;
use ustr::Ustr;

use crate::{lifecycle::LifecycleSignal, router::RouterCommand, subscription::SubscriptionSnapshot};

/// A raw inbound message produced by a connection.
///
/// Payloads are text: the primary transport assumes valid UTF-8. Binary payloads travel
/// framed and are decoded by the router.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InboundMessage {
    /// Delivered because of an exact-channel subscription.
    Message { channel: Ustr, payload: String },
    /// Delivered because of a pattern subscription.
    PMessage {
        pattern: Ustr,
        channel: Ustr,
        payload: String,
    },
}

/// A transport that can construct connections pre-subscribed to a snapshot.
#[async_trait]
pub trait SubscribableTransport: Send + Sync + 'static {
    /// Constructs a new connection subscribed to every exact channel and pattern in
    /// `snapshot`.
    ///
    /// Construction is all-or-nothing: the returned connection is ready and carries the
    /// full snapshot. Inbound messages and connection loss are reported through `sink`.
    async fn construct(
        &self,
        snapshot: &SubscriptionSnapshot,
        sink: ConnectionSink,
    ) -> anyhow::Result<Box<dyn PubSubConnection>>;

    /// Opens a connection used only for publishing.
    async fn connect_publisher(&self) -> anyhow::Result<Box<dyn Publisher>>;
}

/// A live subscription connection.
#[async_trait]
pub trait PubSubConnection: Send + Sync {
    /// Probes liveness.
    async fn ping(&self) -> anyhow::Result<()>;

    /// Closes the connection, after which no more messages are delivered through its sink.
    async fn close(&self) -> anyhow::Result<()>;
}

/// A connection used for publishing payloads.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes a text `payload` on `channel`, returning the number of receivers.
    async fn publish(&self, channel: &str, payload: &str) -> anyhow::Result<usize>;

    async fn close(&self) -> anyhow::Result<()>;
}

/// The receiving end handed to a transport for a single connection.
///
/// Each sink is tagged with the connection it was created for, so messages and loss
/// reports from a superseded connection are ignored downstream.
#[derive(Clone, Debug)]
pub struct ConnectionSink {
    connection_id: u64,
    revision: u64,
    router_tx: mpsc::UnboundedSender<RouterCommand>,
    signal_tx: mpsc::UnboundedSender<LifecycleSignal>,
}

impl ConnectionSink {
    pub(crate) const fn new(
        connection_id: u64,
        revision: u64,
        router_tx: mpsc::UnboundedSender<RouterCommand>,
        signal_tx: mpsc::UnboundedSender<LifecycleSignal>,
    ) -> Self {
        Self {
            connection_id,
            revision,
            router_tx,
            signal_tx,
        }
    }

    /// Returns the identifier of the connection this sink belongs to.
    #[must_use]
    pub const fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Returns the snapshot revision the connection was constructed for.
    #[must_use]
    pub const fn revision(&self) -> u64 {
        self.revision
    }

    /// Forwards an inbound message to the router.
    pub fn deliver(&self, message: InboundMessage) {
        let cmd = RouterCommand::Inbound {
            connection_id: self.connection_id,
            message,
        };
        if let Err(e) = self.router_tx.send(cmd) {
            tracing::trace!("Router closed, dropping inbound message: {e}");
        }
    }

    /// Reports that the connection was lost without being closed locally.
    pub fn connection_lost(&self, reason: impl Into<String>) {
        let signal = LifecycleSignal::Lost {
            connection_id: self.connection_id,
            reason: reason.into(),
        };
        if let Err(e) = self.signal_tx.send(signal) {
            tracing::trace!("Lifecycle closed, dropping loss report: {e}");
        }
    }

    /// Returns whether the engine has stopped listening to this sink.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.router_tx.is_closed()
    }

    /// Completes once the engine has stopped listening to this sink.
    pub async fn closed(&self) {
        self.router_tx.closed().await;
    }
}
