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

//! Ownership of the single underlying subscription connection.
//!
//! **Reconcile**:
//! - The desired snapshot arrives on a watch channel, only the latest one matters.
//! - An empty snapshot closes the current connection.
//! - Otherwise a new connection is constructed carrying the full snapshot. Only once it is
//!   ready is it swapped in as current, and the previous connection is closed in the
//!   background. Messages published while the old connection is closing and before the
//!   new one is ready can be missed (at-most-once delivery).
//! - Construction failures keep the previous connection serving and retry with backoff,
//!   always targeting the latest desired snapshot.
//!
//! **Design**:
//! - Controller task is the sole writer of the current handle
//! - Readers load the handle through an atomic pointer swap
//! - Lost connections and health failures arrive as signals tagged with the connection id

use std::{
    fmt::Debug,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU8, Ordering},
    },
    time::Duration,
};

use arc_swap::ArcSwapOption;
use tokio::{
    sync::{mpsc, watch},
    task::{AbortHandle, JoinHandle, JoinSet},
};
use tokio_util::sync::CancellationToken;

use crate::{
    backoff::ExponentialBackoff,
    config::PubSubConfig,
    error::{PubSubError, PubSubResult},
    router::{MessageRouter, PubSubEvent},
    state::ConnectionState,
    subscription::SubscriptionSnapshot,
    transport::{ConnectionSink, PubSubConnection, SubscribableTransport},
};

/// Signals sent to the controller from outside the reconcile loop.
#[derive(Debug)]
pub(crate) enum LifecycleSignal {
    /// The transport reported the connection as lost.
    Lost { connection_id: u64, reason: String },
    /// The health monitor reached its failure threshold.
    HealthFailure { connection_id: u64, failures: u32 },
}

/// The snapshot the current connection was built from.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct AppliedState {
    /// The latest applied snapshot.
    pub snapshot: SubscriptionSnapshot,
    /// Set once the lifecycle manager stopped, no further snapshot will be applied.
    pub closed: bool,
}

/// The current underlying connection, tagged with the snapshot it was built from.
pub struct ConnectionHandle {
    connection_id: u64,
    snapshot: SubscriptionSnapshot,
    connection: Box<dyn PubSubConnection>,
    closed: AtomicBool,
}

impl Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(stringify!(ConnectionHandle))
            .field("connection_id", &self.connection_id)
            .field("revision", &self.snapshot.revision())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ConnectionHandle {
    fn new(
        connection_id: u64,
        snapshot: SubscriptionSnapshot,
        connection: Box<dyn PubSubConnection>,
    ) -> Self {
        Self {
            connection_id,
            snapshot,
            connection,
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub const fn connection_id(&self) -> u64 {
        self.connection_id
    }

    #[must_use]
    pub const fn revision(&self) -> u64 {
        self.snapshot.revision()
    }

    #[must_use]
    pub const fn snapshot(&self) -> &SubscriptionSnapshot {
        &self.snapshot
    }

    /// Probes the connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed or the probe failed.
    pub async fn ping(&self) -> anyhow::Result<()> {
        if self.is_closed() {
            anyhow::bail!("Connection {} is closed", self.connection_id);
        }
        self.connection.ping().await
    }

    /// Closes the connection. Only the first call reaches the transport.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport failed to close the connection.
    pub async fn close(&self) -> anyhow::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        tracing::debug!(
            connection_id = self.connection_id,
            revision = self.revision(),
            "Closing connection"
        );
        self.connection.close().await
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// State shared between the controller task and its readers.
#[derive(Debug)]
struct LifecycleShared {
    current: ArcSwapOption<ConnectionHandle>,
    state: AtomicU8,
    applied_tx: watch::Sender<AppliedState>,
}

impl LifecycleShared {
    fn new() -> Self {
        let (applied_tx, _) = watch::channel(AppliedState::default());
        Self {
            current: ArcSwapOption::empty(),
            state: AtomicU8::new(ConnectionState::Disconnected.as_u8()),
            applied_tx,
        }
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::from_atomic(&self.state)
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = ConnectionState::from_u8(self.state.swap(state.as_u8(), Ordering::SeqCst));
        if previous != state {
            tracing::debug!("Connection state {previous} -> {state}");
        }
    }

    fn applied_revision(&self) -> u64 {
        self.applied_tx.borrow().snapshot.revision()
    }

    fn publish_applied(&self, snapshot: SubscriptionSnapshot) {
        self.applied_tx.send_modify(|applied| applied.snapshot = snapshot);
    }

    fn mark_closed(&self) {
        self.applied_tx.send_modify(|applied| applied.closed = true);
    }
}

/// Reconciles the underlying connection with the desired subscription snapshot.
#[derive(Debug)]
pub struct ConnectionLifecycleManager {
    shared: Arc<LifecycleShared>,
    desired_tx: watch::Sender<SubscriptionSnapshot>,
    signal_tx: mpsc::UnboundedSender<LifecycleSignal>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    abort_handle: AbortHandle,
}

impl ConnectionLifecycleManager {
    /// Creates a new [`ConnectionLifecycleManager`] and spawns its controller task.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::Config`] if the reconnect parameters are invalid.
    pub fn spawn(
        transport: Arc<dyn SubscribableTransport>,
        config: &PubSubConfig,
        router: Arc<MessageRouter>,
    ) -> PubSubResult<Self> {
        let backoff =
            ExponentialBackoff::from_config(config).map_err(|e| PubSubError::Config(e.to_string()))?;

        let shared = Arc::new(LifecycleShared::new());
        let (desired_tx, desired_rx) = watch::channel(SubscriptionSnapshot::empty());
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let controller = LifecycleController {
            transport,
            router,
            shared: shared.clone(),
            backoff,
            construct_timeout: config.construct_timeout(),
            next_connection_id: 0,
            retiring: JoinSet::new(),
            signal_tx: signal_tx.clone(),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(controller.run(desired_rx, signal_rx));
        let abort_handle = task.abort_handle();

        Ok(Self {
            shared,
            desired_tx,
            signal_tx,
            cancel,
            task: Mutex::new(Some(task)),
            abort_handle,
        })
    }

    /// Requests the connection to be reconciled with `snapshot`.
    ///
    /// Only the latest requested snapshot is acted upon.
    pub fn request_reconcile(&self, snapshot: SubscriptionSnapshot) {
        tracing::trace!(revision = snapshot.revision(), "Reconcile requested");
        self.desired_tx.send_replace(snapshot);
    }

    /// Waits until a snapshot with at least `revision` is applied.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::Closed`] if the manager stopped before applying it.
    pub async fn wait_applied(&self, revision: u64) -> PubSubResult<SubscriptionSnapshot> {
        let mut applied_rx = self.shared.applied_tx.subscribe();
        let applied = applied_rx
            .wait_for(|applied| applied.snapshot.revision() >= revision || applied.closed)
            .await
            .map_err(|_| PubSubError::Closed)?;

        if applied.snapshot.revision() >= revision {
            Ok(applied.snapshot.clone())
        } else {
            Err(PubSubError::Closed)
        }
    }

    /// Waits until a connection is current, returning `false` on timeout or after shutdown.
    pub async fn wait_until_ready(&self, timeout: Duration) -> bool {
        let mut applied_rx = self.shared.applied_tx.subscribe();
        let shared = self.shared.clone();
        let ready = tokio::time::timeout(
            timeout,
            applied_rx.wait_for(|applied| applied.closed || shared.current.load().is_some()),
        )
        .await;

        matches!(ready, Ok(Ok(applied)) if !applied.closed)
    }

    /// Returns the latest applied snapshot.
    #[must_use]
    pub fn applied_snapshot(&self) -> SubscriptionSnapshot {
        self.shared.applied_tx.borrow().snapshot.clone()
    }

    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Returns the current connection, if any.
    #[must_use]
    pub fn current(&self) -> Option<Arc<ConnectionHandle>> {
        self.shared.current.load_full()
    }

    pub(crate) fn signal_sender(&self) -> mpsc::UnboundedSender<LifecycleSignal> {
        self.signal_tx.clone()
    }

    /// Stops the controller, closes the current connection and waits for every retiring
    /// connection to finish closing.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(task) = self.take_task()
            && let Err(e) = task.await
            && !e.is_cancelled()
        {
            tracing::error!("Lifecycle controller task failed: {e}");
        }
    }

    /// Aborts the controller and closes the current connection without waiting for
    /// connections still retiring.
    pub async fn force_close(&self) {
        self.cancel.cancel();
        self.abort_handle.abort();

        if let Some(current) = self.shared.current.swap(None)
            && let Err(e) = current.close().await
        {
            tracing::warn!("Error force-closing connection: {e}");
        }
        self.shared.set_state(ConnectionState::Disconnected);
        self.shared.mark_closed();
    }

    /// Aborts the controller task without closing any connection.
    pub fn abort(&self) {
        self.cancel.cancel();
        self.abort_handle.abort();
    }

    fn take_task(&self) -> Option<JoinHandle<()>> {
        self.task.lock().ok().and_then(|mut task| task.take())
    }
}

impl Drop for ConnectionLifecycleManager {
    fn drop(&mut self) {
        self.abort();
    }
}

struct LifecycleController {
    transport: Arc<dyn SubscribableTransport>,
    router: Arc<MessageRouter>,
    shared: Arc<LifecycleShared>,
    backoff: ExponentialBackoff,
    construct_timeout: Duration,
    next_connection_id: u64,
    retiring: JoinSet<()>,
    signal_tx: mpsc::UnboundedSender<LifecycleSignal>,
    cancel: CancellationToken,
}

impl LifecycleController {
    async fn run(
        mut self,
        mut desired_rx: watch::Receiver<SubscriptionSnapshot>,
        mut signal_rx: mpsc::UnboundedReceiver<LifecycleSignal>,
    ) {
        let mut force_rebuild = false;

        loop {
            while self.retiring.try_join_next().is_some() {}

            let target = desired_rx.borrow_and_update().clone();

            if force_rebuild || target.revision() != self.shared.applied_revision() {
                match self.reconcile(&target).await {
                    Ok(()) => {
                        self.backoff.reset();
                        force_rebuild = false;
                        continue;
                    }
                    Err(_) if self.cancel.is_cancelled() => break,
                    Err(e) => {
                        if e.is_transient() {
                            tracing::warn!("{e}");
                        } else {
                            tracing::error!("{e}");
                        }
                        self.shared.set_state(ConnectionState::Errored);
                        self.router.emit(PubSubEvent::Error(e));
                        if !self.wait_backoff().await {
                            break;
                        }
                        continue;
                    }
                }
            }

            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                changed = desired_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                Some(signal) = signal_rx.recv() => {
                    if self.handle_signal(signal).await {
                        force_rebuild = true;
                        if !self.wait_backoff().await {
                            break;
                        }
                    }
                }
            }
        }

        self.close_all().await;
        tracing::debug!("Lifecycle controller stopped");
    }

    async fn reconcile(&mut self, target: &SubscriptionSnapshot) -> PubSubResult<()> {
        let revision = target.revision();

        if target.is_empty() {
            tracing::debug!(revision, "Desired snapshot is empty");
            if let Some(previous) = self.shared.current.swap(None) {
                self.router.activate(None);
                self.retire(previous);
                self.router.emit(PubSubEvent::Close);
            }
            self.shared.set_state(ConnectionState::Disconnected);
            self.shared.publish_applied(target.clone());
            return Ok(());
        }

        self.shared.set_state(ConnectionState::Connecting);
        self.next_connection_id += 1;
        let connection_id = self.next_connection_id;

        tracing::debug!(
            revision,
            connection_id,
            channels = target.exact_channels().len(),
            patterns = target.patterns().len(),
            "Constructing connection"
        );

        let sink = ConnectionSink::new(
            connection_id,
            revision,
            self.router.command_sender(),
            self.signal_tx.clone(),
        );

        let connection = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(PubSubError::Closed),
            result = tokio::time::timeout(
                self.construct_timeout,
                self.transport.construct(target, sink),
            ) => match result {
                Ok(Ok(connection)) => connection,
                Ok(Err(e)) => {
                    return Err(PubSubError::ConnectionConstruction {
                        revision,
                        message: e.to_string(),
                    });
                }
                Err(_) => {
                    return Err(PubSubError::ConnectionConstruction {
                        revision,
                        message: format!("timed out after {:?}", self.construct_timeout),
                    });
                }
            },
        };

        self.router.emit(PubSubEvent::Connect { revision });

        let handle = Arc::new(ConnectionHandle::new(connection_id, target.clone(), connection));
        let previous = self.shared.current.swap(Some(handle));
        self.router.activate(Some(connection_id));
        self.shared.set_state(ConnectionState::Connected);
        self.router.emit(PubSubEvent::Ready { revision });
        self.shared.publish_applied(target.clone());

        tracing::info!(revision, connection_id, "Connection ready");

        if let Some(previous) = previous {
            self.retire(previous);
        }

        Ok(())
    }

    /// Returns whether the signal concerned the current connection, which is then retired.
    async fn handle_signal(&mut self, signal: LifecycleSignal) -> bool {
        let connection_id = match &signal {
            LifecycleSignal::Lost { connection_id, .. }
            | LifecycleSignal::HealthFailure { connection_id, .. } => *connection_id,
        };

        let Some(current) = self.shared.current.load_full() else {
            return false;
        };
        if current.connection_id() != connection_id {
            tracing::debug!(connection_id, "Ignoring signal for superseded connection");
            return false;
        }

        match signal {
            LifecycleSignal::Lost { reason, .. } => {
                tracing::warn!(connection_id, "Connection lost: {reason}");
                self.router.emit(PubSubEvent::Error(PubSubError::ConnectionLost {
                    revision: current.revision(),
                    message: reason,
                }));
            }
            LifecycleSignal::HealthFailure { failures, .. } => {
                tracing::warn!(connection_id, failures, "Forcing reconnect after failed health checks");
            }
        }

        self.shared.set_state(ConnectionState::Errored);
        self.shared.current.store(None);
        self.router.activate(None);
        self.retire(current);
        self.router.emit(PubSubEvent::Close);

        true
    }

    /// Waits for the next backoff delay, returns `false` if cancelled meanwhile.
    async fn wait_backoff(&mut self) -> bool {
        let delay = self.backoff.next_duration();
        let attempt = self.backoff.attempts();

        tracing::debug!(attempt, ?delay, "Scheduling reconnect");
        self.router.emit(PubSubEvent::Reconnecting { attempt, delay });

        tokio::select! {
            () = self.cancel.cancelled() => false,
            () = tokio::time::sleep(delay) => true,
        }
    }

    fn retire(&mut self, handle: Arc<ConnectionHandle>) {
        self.retiring.spawn(async move {
            if let Err(e) = handle.close().await {
                tracing::warn!("Error closing retired connection: {e}");
            }
        });
    }

    async fn close_all(&mut self) {
        if let Some(current) = self.shared.current.swap(None) {
            self.router.activate(None);
            if let Err(e) = current.close().await {
                tracing::warn!("Error closing connection: {e}");
            }
            self.router.emit(PubSubEvent::Close);
        }

        while let Some(result) = self.retiring.join_next().await {
            if let Err(e) = result {
                tracing::error!("Retiring connection task failed: {e}");
            }
        }

        self.shared.set_state(ConnectionState::Disconnected);
        self.shared.mark_closed();
    }
}
