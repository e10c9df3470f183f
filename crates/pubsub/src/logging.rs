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

//! Tracing subscriber setup for binaries and tests embedding the client.

use std::env;

use tracing_subscriber::EnvFilter;

/// Environment variable holding the tracing filter directives.
pub const RUST_LOG: &str = "RUST_LOG";

/// Initializes a global `fmt` tracing subscriber filtered by `RUST_LOG`.
///
/// Does nothing when `RUST_LOG` is not set, so embedding applications keep control of
/// their own subscriber.
///
/// # Errors
///
/// Returns an error if the filter directives are invalid or a global subscriber is
/// already installed.
pub fn init_tracing() -> anyhow::Result<()> {
    // Skip tracing initialization if `RUST_LOG` is not set
    if let Ok(directives) = env::var(RUST_LOG) {
        let env_filter = EnvFilter::try_new(&directives)
            .map_err(|e| anyhow::anyhow!("Invalid {RUST_LOG} directives {directives:?}: {e}"))?;
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {e}"))?;
        tracing::info!("Initialized tracing logs with {RUST_LOG}={directives}");
    }
    Ok(())
}

////////////////////////////////////////////////////////////////////////////////
// Tests
////////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn test_init_tracing_is_a_noop_or_fails_cleanly() {
        // Either RUST_LOG is unset (no-op) or a subscriber gets installed once
        let first = init_tracing();
        if env::var(RUST_LOG).is_err() {
            assert!(first.is_ok());
            assert!(init_tracing().is_ok());
        } else if first.is_ok() {
            assert!(init_tracing().is_err());
        }
    }
}
