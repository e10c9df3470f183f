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

//! Error types for the dynamic pub/sub client.

use thiserror::Error;

/// Result alias for pub/sub operations.
pub type PubSubResult<T> = Result<T, PubSubError>;

/// Error type for pub/sub client failures.
///
/// Variants carry rendered messages rather than source errors so the type stays `Clone`
/// and can travel inside [`PubSubEvent::Error`](crate::router::PubSubEvent::Error).
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum PubSubError {
    /// Building a new underlying connection for a snapshot failed (retried with backoff).
    #[error("Connection construction failed for revision {revision}: {message}")]
    ConnectionConstruction { revision: u64, message: String },

    /// The transport reported that the current connection was lost.
    #[error("Connection lost for revision {revision}: {message}")]
    ConnectionLost { revision: u64, message: String },

    /// Consecutive liveness probes failed and a reconnect was forced.
    #[error("Health check failed {failures} consecutive times: {message}")]
    HealthCheckFailure { failures: u32, message: String },

    /// Graceful shutdown exceeded its bound and resources were force-closed.
    #[error("Shutdown timed out after {timeout_ms}ms, resources were force-closed")]
    ShutdownTimeout { timeout_ms: u64 },

    /// A binary frame received on the primary transport was malformed.
    #[error("Protocol framing error: {0}")]
    ProtocolFraming(String),

    /// A channel name or pattern was rejected.
    #[error("Invalid subscription key: {0}")]
    InvalidKey(String),

    /// The configuration was rejected.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The client is shutting down or shut down and no longer accepts work.
    #[error("Client closed")]
    Closed,

    /// Publishing a payload failed.
    #[error("Publish error: {0}")]
    Publish(String),
}

impl PubSubError {
    /// Returns `true` if the error is transient and handled by internal retries.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectionConstruction { .. }
                | Self::ConnectionLost { .. }
                | Self::HealthCheckFailure { .. }
        )
    }
}

////////////////////////////////////////////////////////////////////////////////
// Tests
////////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn test_display_includes_context() {
        let err = PubSubError::ConnectionConstruction {
            revision: 3,
            message: "refused".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Connection construction failed for revision 3: refused"
        );
        assert_eq!(
            PubSubError::ShutdownTimeout { timeout_ms: 50 }.to_string(),
            "Shutdown timed out after 50ms, resources were force-closed"
        );
    }

    #[rstest]
    #[case(PubSubError::HealthCheckFailure { failures: 3, message: String::new() }, true)]
    #[case(PubSubError::ConnectionLost { revision: 1, message: String::new() }, true)]
    #[case(PubSubError::ShutdownTimeout { timeout_ms: 1 }, false)]
    #[case(PubSubError::ProtocolFraming(String::new()), false)]
    #[case(PubSubError::Closed, false)]
    fn test_is_transient(#[case] err: PubSubError, #[case] expected: bool) {
        assert_eq!(err.is_transient(), expected);
    }
}
