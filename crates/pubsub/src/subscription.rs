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

//! Desired subscription state with reference counting.
//!
//! The [`SubscriptionStateManager`] is the authoritative record of which exact channels and
//! patterns the application wants to receive. It performs no I/O: the batcher mutates it one
//! batch at a time and hands the resulting [`SubscriptionSnapshot`] to the lifecycle manager.
//!
//! # Reference Counting
//!
//! Subscribing to the same key twice increments its reference count instead of adding a
//! second entry. Only the last unsubscribe removes the key. The set of keys (not the counts)
//! determines the snapshot, so reference-count-only changes never require a reconnect.
//!
//! # Revisions
//!
//! Every snapshot carries a `revision`. The revision increases only when the set of exact
//! channels or patterns differs from the previously produced snapshot, which lets callers
//! detect "nothing to reconcile" by comparing revisions.

use std::{fmt, num::NonZeroUsize, sync::Arc};

use indexmap::{IndexMap, IndexSet};
use strum::{AsRefStr, Display, EnumString};
use ustr::Ustr;

use crate::error::{PubSubError, PubSubResult};

/// The matching kind of a subscription key.
#[derive(Clone, Copy, Debug, Display, Hash, PartialEq, Eq, AsRefStr, EnumString)]
#[strum(serialize_all = "UPPERCASE")]
pub enum SubscriptionKind {
    /// Matched by exact string equality against the published channel name.
    Exact,
    /// Matched by glob against the published channel name.
    Pattern,
}

/// A single desired subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subscription {
    /// The channel name or pattern.
    pub key: Ustr,
    /// The matching kind.
    pub kind: SubscriptionKind,
    /// The number of outstanding subscribe calls for this key.
    pub ref_count: NonZeroUsize,
    /// The monotonic order in which the key was first added.
    pub subscribed_at_order: u64,
}

/// An immutable, versioned view of the desired subscription set.
///
/// Cloning is cheap, the key sets are shared.
#[derive(Clone, PartialEq, Eq)]
pub struct SubscriptionSnapshot {
    exact_channels: Arc<IndexSet<Ustr>>,
    patterns: Arc<IndexSet<Ustr>>,
    revision: u64,
}

impl SubscriptionSnapshot {
    /// Creates a new [`SubscriptionSnapshot`] instance.
    #[must_use]
    pub fn new(exact_channels: IndexSet<Ustr>, patterns: IndexSet<Ustr>, revision: u64) -> Self {
        Self {
            exact_channels: Arc::new(exact_channels),
            patterns: Arc::new(patterns),
            revision,
        }
    }

    /// Creates an empty snapshot at revision zero.
    #[must_use]
    pub fn empty() -> Self {
        Self::new(IndexSet::new(), IndexSet::new(), 0)
    }

    /// Returns the exact channels, in the order they were first subscribed.
    #[must_use]
    pub fn exact_channels(&self) -> &IndexSet<Ustr> {
        &self.exact_channels
    }

    /// Returns the patterns, in the order they were first subscribed.
    #[must_use]
    pub fn patterns(&self) -> &IndexSet<Ustr> {
        &self.patterns
    }

    #[must_use]
    pub const fn revision(&self) -> u64 {
        self.revision
    }

    /// Returns the total number of exact channels and patterns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.exact_channels.len() + self.patterns.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.exact_channels.is_empty() && self.patterns.is_empty()
    }

    /// Returns whether both snapshots hold the same keys, regardless of revision and order.
    #[must_use]
    pub fn same_keys(&self, other: &Self) -> bool {
        same_set(&self.exact_channels, &other.exact_channels)
            && same_set(&self.patterns, &other.patterns)
    }
}

impl fmt::Debug for SubscriptionSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(stringify!(SubscriptionSnapshot))
            .field("revision", &self.revision)
            .field("exact_channels", &self.exact_channels)
            .field("patterns", &self.patterns)
            .finish()
    }
}

impl Default for SubscriptionSnapshot {
    fn default() -> Self {
        Self::empty()
    }
}

fn same_set(a: &IndexSet<Ustr>, b: &IndexSet<Ustr>) -> bool {
    a.len() == b.len() && a.iter().all(|key| b.contains(key))
}

/// Validates a channel name or pattern.
///
/// # Errors
///
/// Returns [`PubSubError::InvalidKey`] if `key` is empty or contains a NUL byte.
pub fn validate_key(key: &str) -> PubSubResult<()> {
    if key.is_empty() {
        return Err(PubSubError::InvalidKey("key must not be empty".to_string()));
    }
    if key.contains('\0') {
        return Err(PubSubError::InvalidKey(format!(
            "key {key:?} must not contain NUL"
        )));
    }
    Ok(())
}

/// Authoritative record of desired exact-channel and pattern subscriptions.
///
/// All mutation is synchronous and expected to happen from a single task.
#[derive(Debug)]
pub struct SubscriptionStateManager {
    exact: IndexMap<Ustr, Subscription>,
    patterns: IndexMap<Ustr, Subscription>,
    next_order: u64,
    last_snapshot: SubscriptionSnapshot,
}

impl Default for SubscriptionStateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionStateManager {
    /// Creates a new empty [`SubscriptionStateManager`] instance.
    #[must_use]
    pub fn new() -> Self {
        Self {
            exact: IndexMap::new(),
            patterns: IndexMap::new(),
            next_order: 0,
            last_snapshot: SubscriptionSnapshot::empty(),
        }
    }

    /// Adds a reference to an exact channel, returning the new total count.
    ///
    /// # Errors
    ///
    /// Returns an error if `key` is malformed.
    pub fn add_exact(&mut self, key: &str) -> PubSubResult<usize> {
        self.add(key, SubscriptionKind::Exact)
    }

    /// Removes a reference to an exact channel, returning the new total count.
    ///
    /// Removing a key that is not subscribed is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if `key` is malformed.
    pub fn remove_exact(&mut self, key: &str) -> PubSubResult<usize> {
        self.remove(key, SubscriptionKind::Exact)
    }

    /// Adds a reference to a pattern, returning the new total count.
    ///
    /// # Errors
    ///
    /// Returns an error if `key` is malformed.
    pub fn add_pattern(&mut self, key: &str) -> PubSubResult<usize> {
        self.add(key, SubscriptionKind::Pattern)
    }

    /// Removes a reference to a pattern, returning the new total count.
    ///
    /// Removing a pattern that is not subscribed is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if `key` is malformed.
    pub fn remove_pattern(&mut self, key: &str) -> PubSubResult<usize> {
        self.remove(key, SubscriptionKind::Pattern)
    }

    /// Removes every key of `kind` regardless of reference count.
    ///
    /// Returns the removed keys in subscription order, each paired with the total count
    /// remaining after its removal.
    pub fn remove_all(&mut self, kind: SubscriptionKind) -> Vec<(Ustr, usize)> {
        let keys: Vec<Ustr> = self.map(kind).keys().copied().collect();
        keys.into_iter()
            .map(|key| {
                self.map_mut(kind).shift_remove(&key);
                (key, self.count())
            })
            .collect()
    }

    /// Returns the keys of `kind` currently desired, in subscription order.
    #[must_use]
    pub fn keys(&self, kind: SubscriptionKind) -> Vec<Ustr> {
        self.map(kind).keys().copied().collect()
    }

    /// Returns the subscription entry for `key`, if any.
    #[must_use]
    pub fn get(&self, key: &str, kind: SubscriptionKind) -> Option<&Subscription> {
        self.map(kind).get(&Ustr::from(key))
    }

    /// Returns the current reference count for `key`, zero if it is not subscribed.
    #[must_use]
    pub fn ref_count(&self, key: &str, kind: SubscriptionKind) -> usize {
        self.get(key, kind).map_or(0, |sub| sub.ref_count.get())
    }

    /// Returns the total number of desired exact channels and patterns.
    #[must_use]
    pub fn count(&self) -> usize {
        self.exact.len() + self.patterns.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.patterns.is_empty()
    }

    /// Returns a snapshot of the desired state.
    ///
    /// The revision is bumped only when the key sets differ from the last snapshot produced.
    pub fn current_snapshot(&mut self) -> SubscriptionSnapshot {
        let exact: IndexSet<Ustr> = self.exact.keys().copied().collect();
        let patterns: IndexSet<Ustr> = self.patterns.keys().copied().collect();

        if same_set(&exact, self.last_snapshot.exact_channels())
            && same_set(&patterns, self.last_snapshot.patterns())
        {
            return self.last_snapshot.clone();
        }

        let revision = self.last_snapshot.revision() + 1;
        self.last_snapshot = SubscriptionSnapshot::new(exact, patterns, revision);
        tracing::trace!(revision, "Produced new subscription snapshot");
        self.last_snapshot.clone()
    }

    /// Returns the revision of the last snapshot produced.
    #[must_use]
    pub const fn revision(&self) -> u64 {
        self.last_snapshot.revision()
    }

    fn add(&mut self, key: &str, kind: SubscriptionKind) -> PubSubResult<usize> {
        validate_key(key)?;
        let key = Ustr::from(key);
        let order = self.next_order;

        self.map_mut(kind)
            .entry(key)
            .and_modify(|sub| {
                sub.ref_count = sub.ref_count.saturating_add(1);
            })
            .or_insert_with(|| Subscription {
                key,
                kind,
                ref_count: NonZeroUsize::MIN,
                subscribed_at_order: order,
            });

        if self.map(kind)[&key].subscribed_at_order == order {
            self.next_order += 1;
        }

        Ok(self.count())
    }

    fn remove(&mut self, key: &str, kind: SubscriptionKind) -> PubSubResult<usize> {
        validate_key(key)?;
        let key = Ustr::from(key);
        let map = self.map_mut(kind);

        if let Some(sub) = map.get_mut(&key) {
            match NonZeroUsize::new(sub.ref_count.get() - 1) {
                Some(remaining) => sub.ref_count = remaining,
                None => {
                    map.shift_remove(&key);
                }
            }
        }

        Ok(self.count())
    }

    fn map(&self, kind: SubscriptionKind) -> &IndexMap<Ustr, Subscription> {
        match kind {
            SubscriptionKind::Exact => &self.exact,
            SubscriptionKind::Pattern => &self.patterns,
        }
    }

    fn map_mut(&mut self, kind: SubscriptionKind) -> &mut IndexMap<Ustr, Subscription> {
        match kind {
            SubscriptionKind::Exact => &mut self.exact,
            SubscriptionKind::Pattern => &mut self.patterns,
        }
    }
}
