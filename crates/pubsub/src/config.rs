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

//! Configuration for the dynamic pub/sub client.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PubSubError, PubSubResult};

/// Configuration for a [`PubSubClient`](crate::client::PubSubClient).
///
/// All durations are expressed in milliseconds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PubSubConfig {
    /// The fixed window (milliseconds) during which subscription changes are coalesced.
    pub debounce_ms: u64,
    /// The initial reconnection delay (milliseconds) after a failed reconcile.
    pub reconnect_delay_initial_ms: u64,
    /// The maximum reconnection delay (milliseconds) for exponential backoff.
    pub reconnect_delay_max_ms: u64,
    /// The exponential backoff factor for reconnection delays.
    pub reconnect_backoff_factor: f64,
    /// The maximum jitter (milliseconds) added to reconnection delays.
    pub reconnect_jitter_ms: u64,
    /// If the first retry after a failure should happen without delay.
    pub reconnect_immediate_first: bool,
    /// The timeout (milliseconds) for constructing a single connection.
    pub construct_timeout_ms: u64,
    /// The liveness probe interval (milliseconds), `None` disables health monitoring.
    pub health_check_interval_ms: Option<u64>,
    /// The timeout (milliseconds) for a single liveness probe.
    pub health_check_timeout_ms: u64,
    /// The number of consecutive failed probes before a reconnect is forced.
    pub health_failure_threshold: u32,
    /// The bound (milliseconds) on a graceful shutdown before resources are force-closed.
    pub shutdown_timeout_ms: u64,
}

impl Default for PubSubConfig {
    /// Creates a new default [`PubSubConfig`] instance.
    fn default() -> Self {
        Self {
            debounce_ms: 10,
            reconnect_delay_initial_ms: 500,
            reconnect_delay_max_ms: 30_000,
            reconnect_backoff_factor: 2.0,
            reconnect_jitter_ms: 100,
            reconnect_immediate_first: true,
            construct_timeout_ms: 10_000,
            health_check_interval_ms: Some(5_000),
            health_check_timeout_ms: 2_000,
            health_failure_threshold: 3,
            shutdown_timeout_ms: 5_000,
        }
    }
}

impl PubSubConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::Config`] describing the first invalid field.
    pub fn validate(&self) -> PubSubResult<()> {
        let invalid = |msg: String| Err(PubSubError::Config(msg));

        if self.debounce_ms == 0 {
            return invalid("`debounce_ms` must be positive".to_string());
        }
        if self.reconnect_delay_initial_ms == 0 {
            return invalid("`reconnect_delay_initial_ms` must be positive".to_string());
        }
        if self.reconnect_delay_initial_ms > self.reconnect_delay_max_ms {
            return invalid(format!(
                "`reconnect_delay_initial_ms` ({}) exceeds `reconnect_delay_max_ms` ({})",
                self.reconnect_delay_initial_ms, self.reconnect_delay_max_ms
            ));
        }
        if !(1.0..=100.0).contains(&self.reconnect_backoff_factor) {
            return invalid(format!(
                "`reconnect_backoff_factor` must be within [1.0, 100.0], was {}",
                self.reconnect_backoff_factor
            ));
        }
        if self.construct_timeout_ms == 0 {
            return invalid("`construct_timeout_ms` must be positive".to_string());
        }
        if self.health_check_interval_ms == Some(0) {
            return invalid("`health_check_interval_ms` must be positive when set".to_string());
        }
        if self.health_check_timeout_ms == 0 {
            return invalid("`health_check_timeout_ms` must be positive".to_string());
        }
        if self.health_failure_threshold == 0 {
            return invalid("`health_failure_threshold` must be positive".to_string());
        }
        if self.shutdown_timeout_ms == 0 {
            return invalid("`shutdown_timeout_ms` must be positive".to_string());
        }

        Ok(())
    }

    #[must_use]
    pub const fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    #[must_use]
    pub const fn construct_timeout(&self) -> Duration {
        Duration::from_millis(self.construct_timeout_ms)
    }

    #[must_use]
    pub fn health_check_interval(&self) -> Option<Duration> {
        self.health_check_interval_ms.map(Duration::from_millis)
    }

    #[must_use]
    pub const fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}
