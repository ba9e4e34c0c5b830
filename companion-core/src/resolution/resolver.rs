// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::fmt::Debug;

/// Receives the outcome of one resolve call. Consumed on use, so it fires once.
pub trait ResolveListener<K, V, E>: Send + 'static {
    fn on_outcome(self: Box<Self>, key: K, outcome: Result<V, E>);
}

impl<K, V, E, F> ResolveListener<K, V, E> for F
where
    F: FnOnce(K, Result<V, E>) + Send + 'static,
{
    fn on_outcome(self: Box<Self>, key: K, outcome: Result<V, E>) {
        (*self)(key, outcome)
    }
}

pub type BoxedListener<K, V, E> = Box<dyn ResolveListener<K, V, E>>;

/// An external resolve operation that must not be called again before the
/// previous call reported back, e.g. a platform service-discovery resolver.
pub trait Resolver: Send + Sync + 'static {
    /// Identifies what is resolved, e.g. a service name.
    type Key: Clone + Eq + Debug + Send + 'static;
    type Value: Send + 'static;
    type Error: Send + 'static;

    /// Start resolving `key`. The listener is invoked later, from any thread,
    /// or before this call returns. The key passed to the listener is informational,
    /// e.g. the resolved canonical name.
    fn resolve(&self, key: Self::Key, listener: BoxedListener<Self::Key, Self::Value, Self::Error>);
}
