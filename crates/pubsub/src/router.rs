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

//! Typed event bus delivering inbound messages and lifecycle events to listeners.
//!
//! All events flow through a single dispatch task in the order they were produced, so a
//! listener observes connection events, acknowledgements and messages in one consistent
//! sequence. Inbound messages are only dispatched while the connection that produced them
//! is the active one.

use std::{
    fmt::Debug,
    sync::{Arc, Mutex},
    time::Duration,
};

use ahash::RandomState;
use dashmap::DashMap;
use indexmap::IndexMap;
use tokio::{
    sync::mpsc,
    task::{AbortHandle, JoinHandle},
};
use ustr::Ustr;
use uuid::Uuid;

use crate::{
    binary::{BinaryFrameCodec, Payload},
    error::PubSubError,
    transport::InboundMessage,
};

/// An event emitted by the client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PubSubEvent {
    /// A message received on an exact-channel subscription.
    Message { channel: Ustr, payload: Payload },
    /// A message received on a pattern subscription.
    PMessage {
        pattern: Ustr,
        channel: Ustr,
        payload: Payload,
    },
    /// An exact channel was subscribed, `count` is the total after it was applied.
    Subscribe { channel: Ustr, count: usize },
    /// An exact channel was unsubscribed, `count` is the total after it was applied.
    Unsubscribe { channel: Ustr, count: usize },
    /// A pattern was subscribed, `count` is the total after it was applied.
    PSubscribe { pattern: Ustr, count: usize },
    /// A pattern was unsubscribed, `count` is the total after it was applied.
    PUnsubscribe { pattern: Ustr, count: usize },
    /// A new connection was constructed for `revision`.
    Connect { revision: u64 },
    /// The connection for `revision` became the current one.
    Ready { revision: u64 },
    /// A non-fatal error occurred.
    Error(PubSubError),
    /// There is no current connection any more.
    Close,
    /// A reconnect is scheduled after `delay`.
    Reconnecting { attempt: u32, delay: Duration },
    /// The client shut down, no further events follow.
    End,
}

/// Identifier of a registered listener.
pub type ListenerId = Ustr;

/// Receives events dispatched by the [`MessageRouter`].
pub trait EventListener: Send + Sync {
    /// Returns the unique identifier for this listener.
    fn id(&self) -> ListenerId;
    /// Handles a single event.
    fn on_event(&self, event: &PubSubEvent);
}

/// An [`EventListener`] backed by a closure.
pub struct TypedEventListener<F: Fn(&PubSubEvent) + Send + Sync> {
    id: ListenerId,
    callback: F,
}

impl<F: Fn(&PubSubEvent) + Send + Sync> TypedEventListener<F> {
    /// Creates a new listener with an optional custom ID.
    pub fn new<S: AsRef<str>>(id: Option<S>, callback: F) -> Self {
        let id = id
            .map(|s| Ustr::from(s.as_ref()))
            .unwrap_or_else(generate_unique_listener_id);
        Self { id, callback }
    }

    /// Creates a new listener with an auto-generated ID.
    pub fn from(callback: F) -> Self {
        Self::new::<Ustr>(None, callback)
    }
}

impl<F: Fn(&PubSubEvent) + Send + Sync> Debug for TypedEventListener<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(stringify!(TypedEventListener))
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl<F: Fn(&PubSubEvent) + Send + Sync> EventListener for TypedEventListener<F> {
    fn id(&self) -> ListenerId {
        self.id
    }

    fn on_event(&self, event: &PubSubEvent) {
        (self.callback)(event);
    }
}

fn generate_unique_listener_id() -> ListenerId {
    Ustr::from(&Uuid::new_v4().to_string())
}

#[derive(Clone)]
#[repr(transparent)]
pub struct ShareableEventListener(pub Arc<dyn EventListener>);

impl From<Arc<dyn EventListener>> for ShareableEventListener {
    fn from(value: Arc<dyn EventListener>) -> Self {
        Self(value)
    }
}

impl Debug for ShareableEventListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple(stringify!(ShareableEventListener))
            .field(&self.0.id())
            .finish()
    }
}

/// Creates a channel-based event listener.
///
/// Returns a tuple containing the listener and a receiver for events.
#[must_use]
pub fn channel_event_listener() -> (
    ShareableEventListener,
    mpsc::UnboundedReceiver<PubSubEvent>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let listener = TypedEventListener::from(move |event: &PubSubEvent| {
        if let Err(e) = tx.send(event.clone()) {
            tracing::debug!("Failed to send event to channel: {e}");
        }
    });
    (ShareableEventListener(Arc::new(listener)), rx)
}

/// Which events a registration receives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ListenerScope {
    All,
    Channel(Ustr),
    Pattern(Ustr),
}

/// Listener registrations, keyed for direct lookup on dispatch.
#[derive(Debug, Default)]
struct ListenerRegistry {
    global: DashMap<ListenerId, ShareableEventListener, RandomState>,
    channels: DashMap<Ustr, IndexMap<ListenerId, ShareableEventListener>, RandomState>,
    patterns: DashMap<Ustr, IndexMap<ListenerId, ShareableEventListener>, RandomState>,
    scopes: DashMap<ListenerId, ListenerScope, RandomState>,
}

impl ListenerRegistry {
    fn insert(&self, scope: ListenerScope, listener: ShareableEventListener) -> ListenerId {
        let id = listener.0.id();
        self.remove(id);

        match scope {
            ListenerScope::All => {
                self.global.insert(id, listener);
            }
            ListenerScope::Channel(channel) => {
                self.channels.entry(channel).or_default().insert(id, listener);
            }
            ListenerScope::Pattern(pattern) => {
                self.patterns.entry(pattern).or_default().insert(id, listener);
            }
        }
        self.scopes.insert(id, scope);
        id
    }

    fn remove(&self, id: ListenerId) -> bool {
        let Some((_, scope)) = self.scopes.remove(&id) else {
            return false;
        };

        match scope {
            ListenerScope::All => {
                self.global.remove(&id);
            }
            ListenerScope::Channel(channel) => {
                remove_keyed(&self.channels, channel, id);
            }
            ListenerScope::Pattern(pattern) => {
                remove_keyed(&self.patterns, pattern, id);
            }
        }
        true
    }

    fn len(&self) -> usize {
        self.scopes.len()
    }

    /// Collects the listeners interested in `event`.
    ///
    /// Listeners are cloned out so no map guard is held while callbacks run.
    fn interested(&self, event: &PubSubEvent) -> Vec<ShareableEventListener> {
        let mut listeners: Vec<ShareableEventListener> =
            self.global.iter().map(|entry| entry.value().clone()).collect();

        let keyed = match event {
            PubSubEvent::Message { channel, .. } => self.channels.get(channel),
            PubSubEvent::PMessage { pattern, .. } => self.patterns.get(pattern),
            _ => None,
        };
        if let Some(keyed) = keyed {
            listeners.extend(keyed.values().cloned());
        }

        listeners
    }
}

fn remove_keyed(
    map: &DashMap<Ustr, IndexMap<ListenerId, ShareableEventListener>, RandomState>,
    key: Ustr,
    id: ListenerId,
) {
    map.remove_if_mut(&key, |_, listeners| {
        listeners.shift_remove(&id);
        listeners.is_empty()
    });
}

/// Represents a command for the dispatch task.
#[derive(Debug)]
pub(crate) enum RouterCommand {
    /// An inbound message from the connection identified by `connection_id`.
    Inbound {
        connection_id: u64,
        message: InboundMessage,
    },
    /// Switches the connection whose messages are dispatched, `None` drops everything.
    Activate(Option<u64>),
    /// An event produced by the engine itself.
    Event(PubSubEvent),
}

/// Dispatches inbound messages and engine events to registered listeners.
#[derive(Debug)]
pub struct MessageRouter {
    cmd_tx: mpsc::UnboundedSender<RouterCommand>,
    registry: Arc<ListenerRegistry>,
    task: Mutex<Option<JoinHandle<()>>>,
    abort_handle: AbortHandle,
}

impl MessageRouter {
    /// Creates a new [`MessageRouter`] and spawns its dispatch task.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn spawn() -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(ListenerRegistry::default());
        let task = tokio::spawn(Self::run_dispatch(cmd_rx, registry.clone()));
        let abort_handle = task.abort_handle();

        Self {
            cmd_tx,
            registry,
            task: Mutex::new(Some(task)),
            abort_handle,
        }
    }

    /// Registers a listener for every event.
    pub fn add_listener(&self, listener: ShareableEventListener) -> ListenerId {
        self.registry.insert(ListenerScope::All, listener)
    }

    /// Registers a listener for messages received on the exact `channel`.
    pub fn add_channel_listener(&self, channel: &str, listener: ShareableEventListener) -> ListenerId {
        self.registry
            .insert(ListenerScope::Channel(Ustr::from(channel)), listener)
    }

    /// Registers a listener for messages received through the subscribed `pattern`.
    pub fn add_pattern_listener(&self, pattern: &str, listener: ShareableEventListener) -> ListenerId {
        self.registry
            .insert(ListenerScope::Pattern(Ustr::from(pattern)), listener)
    }

    /// Removes a listener, returning whether it was registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.registry.remove(id)
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.registry.len()
    }

    /// Queues an event for dispatch after everything already queued.
    pub fn emit(&self, event: PubSubEvent) {
        if let Err(e) = self.cmd_tx.send(RouterCommand::Event(event)) {
            tracing::trace!("Router stopped, dropping event: {e}");
        }
    }

    /// Queues a switch of the active connection.
    pub(crate) fn activate(&self, connection_id: Option<u64>) {
        if let Err(e) = self.cmd_tx.send(RouterCommand::Activate(connection_id)) {
            tracing::trace!("Router stopped, dropping activation: {e}");
        }
    }

    pub(crate) fn command_sender(&self) -> mpsc::UnboundedSender<RouterCommand> {
        self.cmd_tx.clone()
    }

    /// Emits [`PubSubEvent::End`] and waits for the dispatch task to deliver everything
    /// queued before it.
    pub async fn shutdown(&self) {
        self.emit(PubSubEvent::End);
        if let Some(task) = self.take_task()
            && let Err(e) = task.await
            && !e.is_cancelled()
        {
            tracing::error!("Router dispatch task failed: {e}");
        }
    }

    /// Aborts the dispatch task without delivering queued events.
    pub fn abort(&self) {
        self.abort_handle.abort();
    }

    fn take_task(&self) -> Option<JoinHandle<()>> {
        self.task.lock().ok().and_then(|mut task| task.take())
    }

    async fn run_dispatch(
        mut cmd_rx: mpsc::UnboundedReceiver<RouterCommand>,
        registry: Arc<ListenerRegistry>,
    ) {
        let mut active: Option<u64> = None;

        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                RouterCommand::Activate(connection_id) => {
                    tracing::trace!("Activating connection {connection_id:?}");
                    active = connection_id;
                }
                RouterCommand::Inbound {
                    connection_id,
                    message,
                } => {
                    if active != Some(connection_id) {
                        tracing::trace!(
                            connection_id,
                            "Dropping message from inactive connection"
                        );
                        continue;
                    }
                    if let Some(event) = Self::decode(message) {
                        Self::dispatch(&registry, &event);
                    }
                }
                RouterCommand::Event(event) => {
                    let is_end = event == PubSubEvent::End;
                    Self::dispatch(&registry, &event);
                    if is_end {
                        break;
                    }
                }
            }
        }

        tracing::debug!("Router dispatch task stopped");
    }

    fn decode(message: InboundMessage) -> Option<PubSubEvent> {
        let (channel, pattern, payload) = match message {
            InboundMessage::Message { channel, payload } => (channel, None, payload),
            InboundMessage::PMessage {
                pattern,
                channel,
                payload,
            } => (channel, Some(pattern), payload),
        };

        let payload = match BinaryFrameCodec::decode_payload(payload) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("Dropping message on {channel}: {e}");
                return None;
            }
        };

        Some(match pattern {
            Some(pattern) => PubSubEvent::PMessage {
                pattern,
                channel,
                payload,
            },
            None => PubSubEvent::Message { channel, payload },
        })
    }

    fn dispatch(registry: &ListenerRegistry, event: &PubSubEvent) {
        for listener in registry.interested(event) {
            listener.0.on_event(event);
        }
    }
}

impl Drop for MessageRouter {
    fn drop(&mut self) {
        self.abort();
    }
}
