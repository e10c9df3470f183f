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

//! Debounced batching of subscription operations.
//!
//! Operations are collected for a fixed window starting at the first enqueue after an idle
//! period. The window is not extended by later enqueues, which bounds latency under
//! sustained load. Each batch is applied to the [`SubscriptionStateManager`] in FIFO order,
//! reconciled once if the key set changed, and only then are its operations resolved and
//! their acknowledgement events emitted.
//!
//! The batcher task is the only writer of the subscription state.

use std::{
    fmt::Debug,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use strum::{AsRefStr, Display, EnumString};
use tokio::{
    sync::{mpsc, oneshot},
    task::{AbortHandle, JoinHandle},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use ustr::Ustr;

use crate::{
    error::{PubSubError, PubSubResult},
    lifecycle::ConnectionLifecycleManager,
    router::{MessageRouter, PubSubEvent},
    subscription::{SubscriptionKind, SubscriptionStateManager, validate_key},
};

/// The kind of a subscription operation.
#[derive(Clone, Copy, Debug, Display, Hash, PartialEq, Eq, AsRefStr, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum OperationKind {
    Subscribe,
    Unsubscribe,
    PSubscribe,
    PUnsubscribe,
}

impl OperationKind {
    /// Returns the subscription kind the operation acts on.
    #[must_use]
    pub const fn subscription_kind(self) -> SubscriptionKind {
        match self {
            Self::Subscribe | Self::Unsubscribe => SubscriptionKind::Exact,
            Self::PSubscribe | Self::PUnsubscribe => SubscriptionKind::Pattern,
        }
    }

    #[must_use]
    pub const fn is_removal(self) -> bool {
        matches!(self, Self::Unsubscribe | Self::PUnsubscribe)
    }

    fn ack(self, key: Ustr, count: usize) -> PubSubEvent {
        match self {
            Self::Subscribe => PubSubEvent::Subscribe {
                channel: key,
                count,
            },
            Self::Unsubscribe => PubSubEvent::Unsubscribe {
                channel: key,
                count,
            },
            Self::PSubscribe => PubSubEvent::PSubscribe {
                pattern: key,
                count,
            },
            Self::PUnsubscribe => PubSubEvent::PUnsubscribe {
                pattern: key,
                count,
            },
        }
    }
}

/// A queued subscription operation.
///
/// An unsubscribe with no keys removes every key of its kind desired when the batch is
/// applied.
#[derive(Debug)]
pub struct PendingOperation {
    pub kind: OperationKind,
    pub keys: Vec<Ustr>,
    pub enqueued_at: Instant,
    completion: oneshot::Sender<PubSubResult<usize>>,
}

/// Accepts subscription operations and applies them in debounced batches.
#[derive(Debug)]
pub struct OperationBatcher {
    op_tx: mpsc::UnboundedSender<PendingOperation>,
    accepting: Arc<AtomicBool>,
    drain: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    abort_handle: AbortHandle,
}

impl OperationBatcher {
    /// Creates a new [`OperationBatcher`] and spawns its batch task.
    #[must_use]
    pub fn spawn(
        debounce: Duration,
        lifecycle: Arc<ConnectionLifecycleManager>,
        router: Arc<MessageRouter>,
    ) -> Self {
        let (op_tx, op_rx) = mpsc::unbounded_channel();
        let drain = CancellationToken::new();

        let worker = BatchWorker {
            state: SubscriptionStateManager::new(),
            debounce,
            lifecycle,
            router,
        };
        let task = tokio::spawn(worker.run(op_rx, drain.clone()));
        let abort_handle = task.abort_handle();

        Self {
            op_tx,
            accepting: Arc::new(AtomicBool::new(true)),
            drain,
            task: Mutex::new(Some(task)),
            abort_handle,
        }
    }

    /// Enqueues an operation and waits until its batch is applied.
    ///
    /// Resolves to the total subscription count right after the operation's net effect.
    ///
    /// # Errors
    ///
    /// Returns:
    /// - [`PubSubError::InvalidKey`] if any key is malformed, or no key is given for a
    ///   subscribe (nothing is enqueued).
    /// - [`PubSubError::Closed`] if the batcher no longer accepts work, or shut down before
    ///   the batch could be applied.
    pub async fn enqueue(&self, kind: OperationKind, keys: Vec<Ustr>) -> PubSubResult<usize> {
        if !self.is_accepting() {
            return Err(PubSubError::Closed);
        }
        if keys.is_empty() && !kind.is_removal() {
            return Err(PubSubError::InvalidKey(format!("{kind} requires at least one key")));
        }
        for key in &keys {
            validate_key(key)?;
        }

        let (completion, rx) = oneshot::channel();
        let op = PendingOperation {
            kind,
            keys,
            enqueued_at: Instant::now(),
            completion,
        };
        self.op_tx.send(op).map_err(|_| PubSubError::Closed)?;

        rx.await.unwrap_or(Err(PubSubError::Closed))
    }

    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Stops accepting new operations. Already queued operations are still applied.
    pub fn stop_accepting(&self) {
        if self.accepting.swap(false, Ordering::AcqRel) {
            tracing::debug!("Operation batcher stopped accepting");
        }
    }

    /// Stops accepting, applies every queued operation and waits for the task to finish.
    pub async fn drain(&self) {
        self.stop_accepting();
        self.drain.cancel();
        if let Some(task) = self.take_task()
            && let Err(e) = task.await
            && !e.is_cancelled()
        {
            tracing::error!("Operation batcher task failed: {e}");
        }
    }

    /// Aborts the batch task, pending operations resolve with [`PubSubError::Closed`].
    pub fn abort(&self) {
        self.stop_accepting();
        self.drain.cancel();
        self.abort_handle.abort();
    }

    fn take_task(&self) -> Option<JoinHandle<()>> {
        self.task.lock().ok().and_then(|mut task| task.take())
    }
}

impl Drop for OperationBatcher {
    fn drop(&mut self) {
        self.abort();
    }
}

struct BatchWorker {
    state: SubscriptionStateManager,
    debounce: Duration,
    lifecycle: Arc<ConnectionLifecycleManager>,
    router: Arc<MessageRouter>,
}

impl BatchWorker {
    async fn run(
        mut self,
        mut op_rx: mpsc::UnboundedReceiver<PendingOperation>,
        drain: CancellationToken,
    ) {
        loop {
            let first = tokio::select! {
                op = op_rx.recv() => op,
                () = drain.cancelled(), if !op_rx.is_closed() => {
                    // Queued operations are still returned by `recv` after closing
                    op_rx.close();
                    continue;
                }
            };
            let Some(first) = first else {
                break;
            };

            let mut batch = vec![first];

            if drain.is_cancelled() {
                while let Ok(op) = op_rx.try_recv() {
                    batch.push(op);
                }
            } else {
                let deadline = Instant::now() + self.debounce;
                loop {
                    tokio::select! {
                        biased;
                        op = op_rx.recv() => match op {
                            Some(op) => batch.push(op),
                            None => break,
                        },
                        () = tokio::time::sleep_until(deadline) => break,
                        () = drain.cancelled() => break,
                    }
                }
            }

            self.apply_batch(batch).await;
        }

        tracing::debug!("Operation batcher stopped");
    }

    async fn apply_batch(&mut self, batch: Vec<PendingOperation>) {
        let before = self.state.revision();
        let mut acks: Vec<PubSubEvent> = Vec::new();
        let mut completions: Vec<(oneshot::Sender<PubSubResult<usize>>, PubSubResult<usize>)> =
            Vec::with_capacity(batch.len());

        tracing::trace!(operations = batch.len(), "Applying batch");

        for op in batch {
            let waited = op.enqueued_at.elapsed();
            let result = self.apply_operation(op.kind, &op.keys, &mut acks);
            tracing::trace!(kind = %op.kind, ?waited, "Applied operation");
            completions.push((op.completion, result));
        }

        let snapshot = self.state.current_snapshot();
        let mut reconciled = Ok(());

        if snapshot.revision() != before {
            let revision = snapshot.revision();
            tracing::debug!(
                revision,
                channels = snapshot.exact_channels().len(),
                patterns = snapshot.patterns().len(),
                "Subscription set changed, reconciling"
            );
            self.lifecycle.request_reconcile(snapshot);
            reconciled = self.lifecycle.wait_applied(revision).await.map(|_| ());
        } else {
            tracing::trace!("Batch left the subscription set unchanged");
        }

        match reconciled {
            Ok(()) => {
                for event in acks {
                    self.router.emit(event);
                }
                for (completion, result) in completions {
                    let _ = completion.send(result);
                }
            }
            Err(e) => {
                tracing::debug!("Batch not applied: {e}");
                for (completion, _) in completions {
                    let _ = completion.send(Err(e.clone()));
                }
            }
        }
    }

    fn apply_operation(
        &mut self,
        kind: OperationKind,
        keys: &[Ustr],
        acks: &mut Vec<PubSubEvent>,
    ) -> PubSubResult<usize> {
        let sub_kind = kind.subscription_kind();

        // Only removals reach here without keys
        if keys.is_empty() {
            for (key, count) in self.state.remove_all(sub_kind) {
                acks.push(kind.ack(key, count));
            }
            return Ok(self.state.count());
        }

        for key in keys {
            let count = match kind {
                OperationKind::Subscribe => self.state.add_exact(key)?,
                OperationKind::Unsubscribe => self.state.remove_exact(key)?,
                OperationKind::PSubscribe => self.state.add_pattern(key)?,
                OperationKind::PUnsubscribe => self.state.remove_pattern(key)?,
            };
            acks.push(kind.ack(*key, count));
        }

        Ok(self.state.count())
    }
}
