// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use companion_core::{BoxedListener, Resolver};
use log::debug;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Stand-in for a platform service resolver. Answers from a background thread
/// after `delay`, resolving `name` to `name.local` unless told to fail it.
pub struct ScriptedResolver {
    delay: Duration,
    failures: HashMap<String, i32>,
    calls: Arc<Mutex<Vec<String>>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl ScriptedResolver {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            failures: HashMap::new(),
            calls: Arc::new(Mutex::new(Vec::new())),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing(mut self, key: &str, error_code: i32) -> Self {
        self.failures.insert(key.to_string(), error_code);
        self
    }

    /// Keys in the order the resolver was asked for them.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Highest number of resolves that were running at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl Resolver for ScriptedResolver {
    type Key = String;
    type Value = String;
    type Error = i32;

    fn resolve(&self, key: String, listener: BoxedListener<String, String, i32>) {
        self.calls.lock().unwrap().push(key.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let outcome = match self.failures.get(&key) {
            Some(code) => Err(*code),
            None => Ok(format!("{key}.local")),
        };
        let delay = self.delay;
        let in_flight = self.in_flight.clone();
        thread::spawn(move || {
            thread::sleep(delay);
            debug!("Scripted resolver answers {key}");
            in_flight.fetch_sub(1, Ordering::SeqCst);
            listener.on_outcome(key, outcome);
        });
    }
}
