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

//! Dynamic publish/subscribe over clients whose subscriptions are fixed at connection time.
//!
//! The `resub-pubsub` crate turns a transport that can only subscribe when a connection is
//! constructed into one supporting `subscribe`/`unsubscribe` at any time. Each change of the
//! desired subscription set is applied by building a fresh connection for the new set and
//! retiring the old one once the replacement is ready.
//!
//! The main components are:
//!
//! - [`subscription::SubscriptionStateManager`]: reference-counted desired channels and patterns.
//! - [`batcher::OperationBatcher`]: coalesces bursts of operations into a single reconcile.
//! - [`lifecycle::ConnectionLifecycleManager`]: builds, swaps, retires and reconnects connections.
//! - [`health::HealthMonitor`]: periodic liveness probing of the current connection.
//! - [`router::MessageRouter`]: ordered, at-most-once delivery of events to listeners.
//! - [`binary::BinaryTransportBridge`]: byte-exact payloads over a text-only transport.
//! - [`shutdown::ShutdownCoordinator`]: bounded graceful termination.
//!
//! [`client::PubSubClient`] wires these together over any [`transport::SubscribableTransport`].

#![warn(rustc::all)]
#![deny(unsafe_code)]
#![deny(nonstandard_style)]
#![deny(missing_debug_implementations)]
#![deny(clippy::missing_errors_doc)]
#![deny(clippy::missing_panics_doc)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod backoff;
pub mod batcher;
pub mod binary;
pub mod client;
pub mod config;
pub mod error;
pub mod health;
pub mod lifecycle;
pub mod logging;
pub mod matching;
pub mod router;
pub mod shutdown;
pub mod state;
pub mod subscription;
pub mod testing;
pub mod transport;

pub use crate::{
    client::PubSubClient,
    config::PubSubConfig,
    error::{PubSubError, PubSubResult},
    router::PubSubEvent,
};
