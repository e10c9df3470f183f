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

//! Property-based tests for the reconnect backoff.
//!
//! - Base delays never shrink and never exceed the maximum
//! - Jitter stays within its bound
//! - Reset restores the initial behavior

use std::time::Duration;

use proptest::prelude::*;
use resub_pubsub::backoff::ExponentialBackoff;
use rstest::rstest;

fn backoff_params_strategy() -> impl Strategy<Value = (Duration, Duration, f64, u64, bool)> {
    (
        1u64..=5000u64,   // initial_ms
        10u64..=60000u64, // max_ms
        1.0f64..=10.0f64, // factor
        0u64..=1000u64,   // jitter_ms
        any::<bool>(),    // immediate_first
    )
        .prop_filter("max >= initial", |(initial_ms, max_ms, _, _, _)| {
            max_ms >= initial_ms
        })
        .prop_map(|(initial_ms, max_ms, factor, jitter_ms, immediate_first)| {
            (
                Duration::from_millis(initial_ms),
                Duration::from_millis(max_ms),
                factor,
                jitter_ms,
                immediate_first,
            )
        })
}

proptest! {
    /// Base delays are non-decreasing and capped, and each delay is base plus bounded jitter.
    #[rstest]
    fn backoff_grows_monotonically_to_max(
        (initial, max, factor, jitter_ms, immediate_first) in backoff_params_strategy(),
        iterations in 1usize..=30
    ) {
        let mut backoff = ExponentialBackoff::new(initial, max, factor, jitter_ms, immediate_first)
            .expect("Valid backoff parameters");

        let mut last_base = Duration::ZERO;

        for i in 0..iterations {
            let base = backoff.current_delay();
            let delay = backoff.next_duration();

            if immediate_first && i == 0 {
                prop_assert_eq!(delay, Duration::ZERO);
                prop_assert_eq!(backoff.current_delay(), initial);
                continue;
            }

            prop_assert!(base >= last_base, "Base delay shrank: {:?} < {:?}", base, last_base);
            prop_assert!(base <= max, "Base delay {:?} exceeded max {:?}", base, max);
            prop_assert!(delay >= base);
            prop_assert!(delay <= base + Duration::from_millis(jitter_ms));
            prop_assert!(backoff.current_delay() <= max);

            last_base = base;
        }

        prop_assert_eq!(backoff.attempts() as usize, iterations);
    }

    /// After a reset the sequence starts over from the initial delay.
    #[rstest]
    fn backoff_reset_restores_initial_state(
        (initial, max, factor, jitter_ms, immediate_first) in backoff_params_strategy(),
        advances in 1usize..=10
    ) {
        let mut backoff = ExponentialBackoff::new(initial, max, factor, jitter_ms, immediate_first)
            .expect("Valid backoff parameters");

        for _ in 0..advances {
            let _ = backoff.next_duration();
        }
        backoff.reset();

        prop_assert_eq!(backoff.current_delay(), initial);
        prop_assert_eq!(backoff.attempts(), 0);

        let delay = backoff.next_duration();
        if immediate_first {
            prop_assert_eq!(delay, Duration::ZERO);
        } else {
            prop_assert!(delay >= initial);
            prop_assert!(delay <= initial + Duration::from_millis(jitter_ms));
        }
    }

    /// Without jitter and with a factor above one, delays strictly grow until capped.
    #[rstest]
    fn backoff_without_jitter_strictly_grows_until_capped(
        initial_ms in 1u64..=100u64,
        factor in 1.5f64..=4.0f64,
    ) {
        let initial = Duration::from_millis(initial_ms);
        let max = Duration::from_millis(initial_ms * 50);
        let mut backoff = ExponentialBackoff::new(initial, max, factor, 0, false)
            .expect("Valid backoff parameters");

        let mut previous = backoff.next_duration();
        prop_assert_eq!(previous, initial);

        for _ in 0..20 {
            let delay = backoff.next_duration();
            if previous < max {
                prop_assert!(delay > previous, "Delay did not grow: {:?} -> {:?}", previous, delay);
            } else {
                prop_assert_eq!(delay, max);
            }
            prop_assert!(delay <= max);
            previous = delay;
        }
    }
}

#[rstest]
#[case(0.5)]
#[case(100.5)]
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
