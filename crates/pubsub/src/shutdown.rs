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

//! Bounded graceful termination of every client component.

use std::{sync::Arc, time::Duration};

use tokio::sync::Mutex;

use crate::{
    batcher::OperationBatcher,
    binary::BinaryTransportBridge,
    error::{PubSubError, PubSubResult},
    health::HealthMonitor,
    lifecycle::ConnectionLifecycleManager,
    router::MessageRouter,
};

/// Upper bound on each close issued after the graceful path timed out.
const FORCE_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Coordinates shutdown of the batcher, connections and supervisors.
///
/// Graceful order:
/// 1. Stop the batcher accepting work.
/// 2. Drain queued operations, waiting for an in-flight reconcile.
/// 3. Close the current connection and the binary bridge.
/// 4. Stop the health monitor.
///
/// The whole sequence is bounded by a timeout, after which every resource is force-closed
/// and [`PubSubError::ShutdownTimeout`] is reported. Listeners receive
/// [`PubSubEvent::End`](crate::router::PubSubEvent::End) last in both cases.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    batcher: Arc<OperationBatcher>,
    lifecycle: Arc<ConnectionLifecycleManager>,
    bridge: Arc<BinaryTransportBridge>,
    health: Option<Arc<HealthMonitor>>,
    router: Arc<MessageRouter>,
    timeout: Duration,
    outcome: Mutex<Option<PubSubResult<()>>>,
}

impl ShutdownCoordinator {
    /// Creates a new [`ShutdownCoordinator`] instance.
    #[must_use]
    pub fn new(
        batcher: Arc<OperationBatcher>,
        lifecycle: Arc<ConnectionLifecycleManager>,
        bridge: Arc<BinaryTransportBridge>,
        health: Option<Arc<HealthMonitor>>,
        router: Arc<MessageRouter>,
        timeout: Duration,
    ) -> Self {
        Self {
            batcher,
            lifecycle,
            bridge,
            health,
            router,
            timeout,
            outcome: Mutex::new(None),
        }
    }

    /// Shuts every component down.
    ///
    /// Idempotent: later calls wait for the first one and return its outcome.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::ShutdownTimeout`] if the graceful sequence did not complete
    /// within the timeout.
    pub async fn shutdown(&self) -> PubSubResult<()> {
        let mut outcome = self.outcome.lock().await;
        if let Some(outcome) = outcome.as_ref() {
            return outcome.clone();
        }

        tracing::info!("Shutting down");
        self.batcher.stop_accepting();

        let graceful = tokio::time::timeout(self.timeout, async {
            self.batcher.drain().await;
            self.lifecycle.shutdown().await;
            self.bridge.close().await;
            if let Some(health) = &self.health {
                health.stop().await;
            }
        })
        .await;

        let result = match graceful {
            Ok(()) => {
                tracing::info!("Shutdown complete");
                Ok(())
            }
            Err(_) => {
                let timeout_ms = self.timeout.as_millis() as u64;
                tracing::error!("Graceful shutdown exceeded {timeout_ms}ms, force-closing");
                self.force_close().await;
                Err(PubSubError::ShutdownTimeout { timeout_ms })
            }
        };

        self.router.shutdown().await;
        *outcome = Some(result.clone());
        result
    }

    async fn force_close(&self) {
        self.batcher.abort();
        if let Some(health) = &self.health {
            health.abort();
        }

        if tokio::time::timeout(FORCE_CLOSE_TIMEOUT, self.lifecycle.force_close())
            .await
            .is_err()
        {
            tracing::error!("Timed out force-closing connection");
        }
        if tokio::time::timeout(FORCE_CLOSE_TIMEOUT, self.bridge.close())
            .await
            .is_err()
        {
            tracing::error!("Timed out force-closing binary bridge");
        }
    }

    /// Aborts every component task without closing connections.
    pub fn abort(&self) {
        self.batcher.abort();
        if let Some(health) = &self.health {
            health.abort();
        }
        self.lifecycle.abort();
        self.router.abort();
    }
}
