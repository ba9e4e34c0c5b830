// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use log::{debug, error, warn};
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::panic_message;
use crate::resolution::resolver::{BoxedListener, Resolver};

/// What happened to a request handed to [`ResolutionQueue::resolve_or_enqueue`].
#[derive(Clone, Debug, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// The queue was idle, the request is the active one.
    Started,
    /// The request waits behind others.
    Queued,
    /// A request for the same key is already queued. This one was dropped and
    /// its listener will never be called.
    Duplicate,
}

struct Entry<K, V, E> {
    key: K,
    listener: Option<BoxedListener<K, V, E>>,
    started: bool,
}

struct QueueState<K, V, E> {
    entries: VecDeque<Entry<K, V, E>>,
    // a thread is inside Resolver::resolve right now
    launching: bool,
}

struct QueueInner<R: Resolver> {
    resolver: R,
    state: Mutex<QueueState<R::Key, R::Value, R::Error>>,
}

/// Serializes requests against a [`Resolver`] that tolerates one call at a time.
///
/// Requests start in the order they arrived, one after another. A request for a
/// key that is already queued is dropped. The lock is never held while the
/// resolver or a listener runs, so both may call back into the queue.
///
/// There is no timeout: a resolver that never reports back stalls the queue.
pub struct ResolutionQueue<R: Resolver> {
    inner: Arc<QueueInner<R>>,
}

impl<R: Resolver> Clone for ResolutionQueue<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: Resolver> fmt::Debug for ResolutionQueue<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state();
        f.debug_struct("ResolutionQueue")
            .field(
                "keys",
                &state.entries.iter().map(|e| &e.key).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl<R: Resolver> ResolutionQueue<R> {
    pub fn new(resolver: R) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                resolver,
                state: Mutex::new(QueueState {
                    entries: VecDeque::new(),
                    launching: false,
                }),
            }),
        }
    }

    /// Resolve `key`, or queue it behind the running request.
    pub fn resolve_or_enqueue<F>(&self, key: R::Key, listener: F) -> Enqueued
    where
        F: FnOnce(R::Key, Result<R::Value, R::Error>) + Send + 'static,
    {
        self.resolve_or_enqueue_boxed(key, Box::new(listener))
    }

    pub fn resolve_or_enqueue_boxed(
        &self,
        key: R::Key,
        listener: BoxedListener<R::Key, R::Value, R::Error>,
    ) -> Enqueued {
        let status = {
            let mut state = self.inner.state();
            if state.entries.iter().any(|entry| entry.key == key) {
                debug!("Dropping duplicate resolve request for {:?}", key);
                return Enqueued::Duplicate;
            }
            let was_empty = state.entries.is_empty();
            state.entries.push_back(Entry {
                key,
                listener: Some(listener),
                started: false,
            });
            if was_empty {
                Enqueued::Started
            } else {
                Enqueued::Queued
            }
        };

        if status == Enqueued::Started {
            self.inner.launch_head();
        }
        status
    }

    /// Number of requests, the active one included.
    pub fn len(&self) -> usize {
        self.inner.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.state().entries.is_empty()
    }

    pub fn contains(&self, key: &R::Key) -> bool {
        self.inner.state().entries.iter().any(|e| &e.key == key)
    }

    /// Key of the request the resolver is working on.
    pub fn active_key(&self) -> Option<R::Key> {
        self.inner
            .state()
            .entries
            .front()
            .filter(|head| head.started)
            .map(|head| head.key.clone())
    }

    pub fn resolver(&self) -> &R {
        &self.inner.resolver
    }
}

impl<R: Resolver> QueueInner<R> {
    fn state(&self) -> MutexGuard<'_, QueueState<R::Key, R::Value, R::Error>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start the resolver for the head of the queue unless it already runs.
    ///
    /// A resolver may report back before `resolve` returns. The nested
    /// completion then finds `launching` set and leaves the next start to
    /// this loop instead of recursing.
    fn launch_head(self: &Arc<Self>) {
        let mut state = self.state();
        if state.launching {
            return;
        }
        loop {
            let key = match state.entries.front_mut() {
                Some(head) if !head.started => {
                    head.started = true;
                    head.key.clone()
                }
                _ => return,
            };
            state.launching = true;
            drop(state);

            debug!("Resolving {:?}", key);
            let inner = Arc::clone(self);
            let launched = key.clone();
            // the listener belongs to this launch, whatever key the resolver reports back
            let listener: BoxedListener<R::Key, R::Value, R::Error> =
                Box::new(move |reported: R::Key, outcome: Result<R::Value, R::Error>| {
                    if reported != launched {
                        debug!("Resolver reported {:?} for request {:?}", reported, launched);
                    }
                    inner.on_complete(launched, outcome)
                });
            self.resolver.resolve(key, listener);

            state = self.state();
            state.launching = false;
        }
    }

    fn on_complete(self: &Arc<Self>, key: R::Key, outcome: Result<R::Value, R::Error>) {
        let listener = {
            let mut state = self.state();
            match state.entries.front_mut() {
                Some(head) if head.started && head.key == key => head.listener.take(),
                _ => None,
            }
        };
        let Some(listener) = listener else {
            warn!("Resolver outcome for {:?} arrived after the request was done", key);
            return;
        };

        // forward first; the entry stays queued meanwhile, so the key is still deduplicated
        let forwarded_key = key.clone();
        if let Err(payload) =
            panic::catch_unwind(AssertUnwindSafe(move || listener.on_outcome(forwarded_key, outcome)))
        {
            error!(
                "Resolve listener for {:?} panicked: {}",
                key,
                panic_message(payload.as_ref())
            );
        }

        let waiting = {
            let mut state = self.state();
            state.entries.pop_front();
            state.entries.len()
        };
        debug!("Resolve for {:?} done, {} request(s) waiting", key, waiting);
        self.launch_head();
    }
}
