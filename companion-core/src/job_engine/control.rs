// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use async_channel::{Receiver, Sender};
use futures::executor::LocalPool;
use log::{debug, error, info};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::panic_message;

/// A callback that has to run on the control context.
pub type ControlTask = Box<dyn FnOnce() + Send + 'static>;

/// Returned when a task is posted to a control context that no longer accepts work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlClosed;

impl fmt::Display for ControlClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "control context has been closed")
    }
}

impl std::error::Error for ControlClosed {}

/// The single execution context that all job completions are marshaled to.
///
/// Implementations must run posted tasks one after another, in the order they
/// were posted, and must never run them synchronously inside `post`.
pub trait ControlContext: Send + Sync + 'static {
    fn post(&self, task: ControlTask) -> Result<(), ControlClosed>;
}

impl<C: ControlContext + ?Sized> ControlContext for Arc<C> {
    fn post(&self, task: ControlTask) -> Result<(), ControlClosed> {
        (**self).post(task)
    }
}

/// Create a control context that is driven by the host, e.g. from its own event loop.
pub fn control_channel() -> (ControlSender, ControlReceiver) {
    let (tx, rx) = async_channel::unbounded();
    (ControlSender { tx }, ControlReceiver { rx })
}

/// Posting side of a control context.
#[derive(Debug, Clone)]
pub struct ControlSender {
    tx: Sender<ControlTask>,
}

impl ControlSender {
    /// Stop accepting tasks. Tasks that are already queued are still handed out.
    pub fn close(&self) -> bool {
        self.tx.close()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl ControlContext for ControlSender {
    fn post(&self, task: ControlTask) -> Result<(), ControlClosed> {
        // unbounded, so this only fails once closed
        self.tx.try_send(task).map_err(|_| ControlClosed)
    }
}

/// Executing side of a control context. Whoever owns it is the control context.
#[derive(Debug)]
pub struct ControlReceiver {
    rx: Receiver<ControlTask>,
}

impl ControlReceiver {
    /// Run all tasks that are queued right now without waiting for more.
    /// Returns how many tasks were executed.
    pub fn run_pending(&self) -> usize {
        let mut executed = 0;
        while let Ok(task) = self.rx.try_recv() {
            run_task(task);
            executed += 1;
        }
        executed
    }

    /// Wait for the next task and run it. Returns false once the context is
    /// closed and drained.
    pub fn run_next(&self) -> bool {
        match self.rx.recv_blocking() {
            Ok(task) => {
                run_task(task);
                true
            }
            Err(_) => false,
        }
    }

    /// Run tasks until every sender is gone or the context has been closed.
    pub async fn run(self) {
        while let Ok(task) = self.rx.recv().await {
            run_task(task);
        }
        debug!("Control context drained, channel closed");
    }

    /// Blocking variant of [`ControlReceiver::run`].
    pub fn run_until_closed(self) {
        futures::executor::block_on(self.run());
    }
}

fn run_task(task: ControlTask) {
    // a misbehaving callback must not take the control loop down with it
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
        error!(
            "Task on the control context panicked: {}",
            panic_message(payload.as_ref())
        );
    }
}

/// A control context backed by a dedicated thread.
#[derive(Debug)]
pub struct ControlThread {
    thread_handle: Option<JoinHandle<()>>,
    sender: ControlSender,
}

impl ControlThread {
    /// Spawn the control thread.
    pub fn new() -> std::io::Result<Self> {
        Self::with_name("control")
    }

    pub fn with_name(name: &str) -> std::io::Result<Self> {
        let (sender, receiver) = control_channel();

        // run the control loop in a dedicated thread
        let thread_handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut pool = LocalPool::new();
                pool.run_until(receiver.run()); // blocks until the channel closes
            })?;
        info!("Started control thread {name}");

        Ok(Self {
            thread_handle: Some(thread_handle),
            sender,
        })
    }

    pub fn sender(&self) -> ControlSender {
        self.sender.clone()
    }

    pub fn close(&self) {
        self.sender.close();
    }

    /// Close the context and wait until every queued task has run.
    pub fn wait_until_finished(&mut self) {
        self.close();
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                error!("Control thread terminated abnormally");
            }
        }
    }
}

impl ControlContext for ControlThread {
    fn post(&self, task: ControlTask) -> Result<(), ControlClosed> {
        self.sender.post(task)
    }
}

impl Drop for ControlThread {
    fn drop(&mut self) {
        self.close();
    }
}
