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

//! Exponential backoff with jitter for connection reconstruction.
//!
//! After a failed reconcile the lifecycle manager asks the backoff for the delay before the
//! next attempt. Delays start at a base value, grow by a constant factor on every failure and
//! are capped at a maximum. Random jitter (up to a configured bound) is added on top to avoid
//! synchronized reconnect storms across many clients. When `immediate_first` is set the very
//! first retry after a reset happens without any delay.

use std::time::Duration;

use rand::Rng;

use crate::config::PubSubConfig;

/// The largest accepted growth factor.
const MAX_FACTOR: f64 = 100.0;

/// An exponential backoff mechanism with optional jitter and immediate-first behavior.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    /// The initial backoff delay.
    delay_initial: Duration,
    /// The maximum delay to cap the backoff.
    delay_max: Duration,
    /// The current backoff delay.
    delay_current: Duration,
    /// The factor to multiply the delay on each iteration.
    factor: f64,
    /// The maximum random jitter to add (in milliseconds).
    jitter_ms: u64,
    /// If true, the first call to `next_duration()` after a reset returns zero delay.
    immediate_first: bool,
    /// Whether the immediate attempt is still available.
    immediate_pending: bool,
    /// The number of delays handed out since the last reset.
    attempts: u32,
}

impl ExponentialBackoff {
    /// Creates a new [`ExponentialBackoff`] instance.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `factor` is not within `[1.0, 100.0]`.
    /// - `delay_initial` is zero.
    /// - `delay_initial` is greater than `delay_max`.
    pub fn new(
        delay_initial: Duration,
        delay_max: Duration,
        factor: f64,
        jitter_ms: u64,
        immediate_first: bool,
    ) -> anyhow::Result<Self> {
        if !(1.0..=MAX_FACTOR).contains(&factor) {
            anyhow::bail!("Backoff factor must be within [1.0, {MAX_FACTOR}], was {factor}");
        }
        if delay_initial.is_zero() {
            anyhow::bail!("Initial backoff delay must be positive");
        }
        if delay_initial > delay_max {
            anyhow::bail!(
                "Initial backoff delay {delay_initial:?} exceeds maximum delay {delay_max:?}"
            );
        }

        Ok(Self {
            delay_initial,
            delay_max,
            delay_current: delay_initial,
            factor,
            jitter_ms,
            immediate_first,
            immediate_pending: immediate_first,
            attempts: 0,
        })
    }

    /// Creates a new [`ExponentialBackoff`] from the reconnect fields of `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured reconnect parameters are invalid.
    pub fn from_config(config: &PubSubConfig) -> anyhow::Result<Self> {
        Self::new(
            Duration::from_millis(config.reconnect_delay_initial_ms),
            Duration::from_millis(config.reconnect_delay_max_ms),
            config.reconnect_backoff_factor,
            config.reconnect_jitter_ms,
            config.reconnect_immediate_first,
        )
    }

    /// Return the next backoff delay with jitter and update the internal state.
    ///
    /// If `immediate_first` is set and no delay has been handed out since the last reset,
    /// returns `Duration::ZERO` and leaves the base delay untouched.
    pub fn next_duration(&mut self) -> Duration {
        self.attempts = self.attempts.saturating_add(1);

        if self.immediate_pending {
            self.immediate_pending = false;
            return Duration::ZERO;
        }

        let jitter = if self.jitter_ms > 0 {
            rand::rng().random_range(0..=self.jitter_ms)
        } else {
            0
        };
        let delay_with_jitter = self.delay_current + Duration::from_millis(jitter);

        // Prepare the next delay
        let current_nanos = self.delay_current.as_nanos() as f64;
        let max_nanos = self.delay_max.as_nanos() as u64;
        let next_nanos = (current_nanos * self.factor) as u64;
        self.delay_current = Duration::from_nanos(next_nanos.min(max_nanos));

        delay_with_jitter
    }

    /// Reset the backoff to its initial state.
    pub fn reset(&mut self) {
        self.delay_current = self.delay_initial;
        self.immediate_pending = self.immediate_first;
        self.attempts = 0;
    }

    /// Returns the current base delay without jitter.
    #[must_use]
    pub const fn current_delay(&self) -> Duration {
        self.delay_current
    }

    /// Returns the configured maximum delay.
    #[must_use]
    pub const fn max_delay(&self) -> Duration {
        self.delay_max
    }

    /// Returns the number of delays handed out since the last reset.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }
}

////////////////////////////////////////////////////////////////////////////////
// Tests
////////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rstest::rstest;

    use super::*;

    fn backoff(initial_ms: u64, max_ms: u64, factor: f64, immediate: bool) -> ExponentialBackoff {
        ExponentialBackoff::new(
            Duration::from_millis(initial_ms),
            Duration::from_millis(max_ms),
            factor,
            0,
            immediate,
        )
        .unwrap()
    }

    #[rstest]
    fn test_no_jitter_exponential_growth() {
        let mut backoff = backoff(100, 1600, 2.0, false);

        let delays: Vec<u64> = (0..6)
            .map(|_| backoff.next_duration().as_millis() as u64)
            .collect();

        assert_eq!(delays, vec![100, 200, 400, 800, 1600, 1600]);
    }

    #[rstest]
    fn test_reset_restores_initial_delay_and_immediate_attempt() {
        let mut backoff = backoff(100, 1600, 2.0, true);

        assert_eq!(backoff.next_duration(), Duration::ZERO);
        assert_eq!(backoff.next_duration(), Duration::from_millis(100));
        assert_eq!(backoff.attempts(), 2);

        backoff.reset();

        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.current_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_duration(), Duration::ZERO);
    }

    #[rstest]
    fn test_jitter_within_bounds() {
        for _ in 0..10 {
            let mut backoff = ExponentialBackoff::new(
                Duration::from_millis(100),
                Duration::from_millis(1000),
                2.0,
                50,
                false,
            )
            .unwrap();
            let base = backoff.current_delay();
            let delay = backoff.next_duration();

            assert!(delay >= base, "Delay {delay:?} is less than base {base:?}");
            assert!(
                delay <= base + Duration::from_millis(50),
                "Delay {delay:?} exceeds base plus jitter"
            );
        }
    }

    #[rstest]
    fn test_factor_less_than_two() {
        let mut backoff = backoff(100, 200, 1.5, false);

        assert_eq!(backoff.next_duration(), Duration::from_millis(100));
        assert_eq!(backoff.next_duration(), Duration::from_millis(150));
        assert_eq!(backoff.next_duration(), Duration::from_millis(200));
        assert_eq!(backoff.next_duration(), Duration::from_millis(200));
    }

    #[rstest]
    fn test_immediate_first_then_strictly_growing_until_cap() {
        let mut backoff = backoff(10, 80, 2.0, true);

        let delays: Vec<Duration> = (0..6).map(|_| backoff.next_duration()).collect();

        for pair in delays.windows(2).take(4) {
            assert!(pair[1] > pair[0], "Expected growth in {delays:?}");
        }
        assert_eq!(delays[4], backoff.max_delay());
        assert_eq!(delays[5], backoff.max_delay());
    }

    #[rstest]
    #[case(0.5)]
    #[case(101.0)]
    #[case(f64::NAN)]
    fn test_invalid_factor_rejected(#[case] factor: f64) {
        let result = ExponentialBackoff::new(
            Duration::from_millis(10),
            Duration::from_millis(100),
            factor,
            0,
            false,
        );
        assert!(result.is_err());
    }

    #[rstest]
    fn test_initial_above_max_rejected() {
        let result = ExponentialBackoff::new(
            Duration::from_millis(500),
            Duration::from_millis(100),
            2.0,
            0,
            false,
        );
        assert!(result.is_err());
    }

    #[rstest]
    fn test_from_config_uses_reconnect_fields() {
        let config = PubSubConfig {
            reconnect_delay_initial_ms: 20,
            reconnect_delay_max_ms: 40,
            reconnect_backoff_factor: 2.0,
            reconnect_jitter_ms: 0,
            reconnect_immediate_first: false,
            ..Default::default()
        };
        let mut backoff = ExponentialBackoff::from_config(&config).unwrap();

        assert_eq!(backoff.next_duration(), Duration::from_millis(20));
        assert_eq!(backoff.next_duration(), Duration::from_millis(40));
        assert_eq!(backoff.next_duration(), Duration::from_millis(40));
    }
}
