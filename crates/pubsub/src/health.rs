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

//! Periodic liveness probing of the current connection.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{
    sync::mpsc,
    task::{AbortHandle, JoinHandle},
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;

use crate::{
    error::PubSubError,
    lifecycle::{ConnectionLifecycleManager, LifecycleSignal},
    router::{MessageRouter, PubSubEvent},
};

/// Probes the current connection on a fixed interval.
///
/// After `threshold` consecutive failed probes an error event is emitted and the lifecycle
/// manager is asked to rebuild the connection. Any successful probe resets the count, as
/// does a change of the current connection.
#[derive(Debug)]
pub struct HealthMonitor {
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    abort_handle: AbortHandle,
}

impl HealthMonitor {
    /// Creates a new [`HealthMonitor`] and spawns its probe task.
    #[must_use]
    pub fn spawn(
        lifecycle: Arc<ConnectionLifecycleManager>,
        router: Arc<MessageRouter>,
        interval: Duration,
        probe_timeout: Duration,
        threshold: u32,
    ) -> Self {
        let cancel = CancellationToken::new();
        let probe = HealthProbe {
            lifecycle: lifecycle.clone(),
            signal_tx: lifecycle.signal_sender(),
            router,
            probe_timeout,
            threshold,
            failures: 0,
            connection_id: None,
        };
        let task = tokio::spawn(probe.run(interval, cancel.clone()));
        let abort_handle = task.abort_handle();

        Self {
            cancel,
            task: Mutex::new(Some(task)),
            abort_handle,
        }
    }

    /// Stops probing and waits for the probe task to finish.
    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(task) = self.take_task()
            && let Err(e) = task.await
            && !e.is_cancelled()
        {
            tracing::error!("Health monitor task failed: {e}");
        }
    }

    /// Aborts the probe task.
    pub fn abort(&self) {
        self.cancel.cancel();
        self.abort_handle.abort();
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .ok()
            .is_some_and(|task| task.as_ref().is_some_and(|task| !task.is_finished()))
    }

    fn take_task(&self) -> Option<JoinHandle<()>> {
        self.task.lock().ok().and_then(|mut task| task.take())
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.abort();
    }
}

struct HealthProbe {
    lifecycle: Arc<ConnectionLifecycleManager>,
    signal_tx: mpsc::UnboundedSender<LifecycleSignal>,
    router: Arc<MessageRouter>,
    probe_timeout: Duration,
    threshold: u32,
    failures: u32,
    connection_id: Option<u64>,
}

impl HealthProbe {
    async fn run(mut self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => break,
                        () = self.probe() => {}
                    }
                }
            }
        }

        tracing::debug!("Health monitor stopped");
    }

    async fn probe(&mut self) {
        let Some(handle) = self.lifecycle.current() else {
            self.failures = 0;
            self.connection_id = None;
            return;
        };

        if self.connection_id != Some(handle.connection_id()) {
            self.connection_id = Some(handle.connection_id());
            self.failures = 0;
        }

        let message = match tokio::time::timeout(self.probe_timeout, handle.ping()).await {
            Ok(Ok(())) => {
                if self.failures > 0 {
                    tracing::debug!("Health check recovered after {} failures", self.failures);
                }
                self.failures = 0;
                return;
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("probe timed out after {:?}", self.probe_timeout),
        };

        self.failures += 1;
        tracing::warn!(
            connection_id = handle.connection_id(),
            failures = self.failures,
            "Health check failed: {message}"
        );

        if self.failures < self.threshold {
            return;
        }

        tracing::error!(
            connection_id = handle.connection_id(),
            "Health check failure threshold {} reached",
            self.threshold
        );
        self.router.emit(PubSubEvent::Error(PubSubError::HealthCheckFailure {
            failures: self.failures,
            message,
        }));

        let signal = LifecycleSignal::HealthFailure {
            connection_id: handle.connection_id(),
            failures: self.failures,
        };
        if let Err(e) = self.signal_tx.send(signal) {
            tracing::debug!("Lifecycle stopped, dropping health failure: {e}");
        }
        self.failures = 0;
    }
}

////////////////////////////////////////////////////////////////////////////////
// Tests
////////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use indexmap::IndexSet;
    use rstest::rstest;
    use ustr::Ustr;

    use super::*;
    use crate::{
        config::PubSubConfig,
        router::channel_event_listener,
        subscription::SubscriptionSnapshot,
        testing::{MockTransport, wait_until_async},
    };

    async fn connected(
        transport: &MockTransport,
    ) -> (Arc<ConnectionLifecycleManager>, Arc<MessageRouter>) {
        let config = PubSubConfig {
            reconnect_delay_initial_ms: 10,
            reconnect_jitter_ms: 0,
            ..Default::default()
        };
        let router = Arc::new(MessageRouter::spawn());
        let lifecycle = Arc::new(
            ConnectionLifecycleManager::spawn(Arc::new(transport.clone()), &config, router.clone())
                .unwrap(),
        );
        let exact: IndexSet<Ustr> = [Ustr::from("a")].into_iter().collect();
        lifecycle.request_reconcile(SubscriptionSnapshot::new(exact, IndexSet::new(), 1));
        lifecycle.wait_applied(1).await.unwrap();
        (lifecycle, router)
    }

    #[rstest]
    #[tokio::test]
    async fn test_threshold_forces_reconnect() {
        let transport = MockTransport::new();
        let (lifecycle, router) = connected(&transport).await;
        let (listener, mut rx) = channel_event_listener();
        router.add_listener(listener);

        transport.set_ping_failing(true);
        let monitor = HealthMonitor::spawn(
            lifecycle.clone(),
            router.clone(),
            Duration::from_millis(10),
            Duration::from_millis(50),
            3,
        );

        let probe = transport.clone();
        wait_until_async(
            || {
                let probe = probe.clone();
                async move { probe.connections_built() >= 2 }
            },
            Duration::from_secs(2),
        )
        .await;

        transport.set_ping_failing(false);
        monitor.stop().await;
        assert!(!monitor.is_running());

        let failure = loop {
            if let Some(PubSubEvent::Error(err)) = rx.recv().await {
                break err;
            }
        };
        assert!(matches!(
            failure,
            PubSubError::HealthCheckFailure { failures: 3, .. }
        ));
        assert!(transport.ping_count() >= 3);
        assert_eq!(transport.close_counts()[0], 1);

        lifecycle.shutdown().await;
    }

    #[rstest]
    #[tokio::test]
    async fn test_successful_probes_do_not_reconnect() {
        let transport = MockTransport::new();
        let (lifecycle, router) = connected(&transport).await;

        let monitor = HealthMonitor::spawn(
            lifecycle.clone(),
            router,
            Duration::from_millis(5),
            Duration::from_millis(50),
            1,
        );

        let probe = transport.clone();
        wait_until_async(
            || {
                let probe = probe.clone();
                async move { probe.ping_count() >= 3 }
            },
            Duration::from_secs(2),
        )
        .await;
        monitor.stop().await;

        assert_eq!(transport.connections_built(), 1);
        lifecycle.shutdown().await;
    }
}
