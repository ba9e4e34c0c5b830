// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use anyhow::{Context, Result};
use async_channel::{Receiver, Sender, TrySendError};
use futures::future::{AbortHandle, AbortRegistration, Abortable, BoxFuture};
use futures::FutureExt;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crate::config::{QueueKind, SchedulerConfig};
use crate::job_engine::control::ControlContext;
use crate::job_engine::job::{
    Job, JobControl, JobError, JobId, JobState, JobWork, RejectReason, ScheduledJob,
};
use crate::panic_message;

type WorkItem = BoxFuture<'static, ()>;

struct RegistryEntry {
    job: Arc<dyn ScheduledJob>,
    control: Arc<JobControl>,
    abort: AbortHandle,
}

/// State shared between the scheduler handle, its workers and the jobs it owns.
pub(crate) struct SchedulerShared {
    registry: Mutex<HashMap<JobId, RegistryEntry>>,
    tx: Sender<WorkItem>,
    control: Box<dyn ControlContext>,
}

impl SchedulerShared {
    fn registry(&self) -> MutexGuard<'_, HashMap<JobId, RegistryEntry>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn cancel(&self, id: JobId) -> bool {
        let mut registry = self.registry();
        match registry.remove(&id) {
            Some(entry) => {
                entry.control.cancel();
                entry.abort.abort();
                debug!("Cancelled job {} ({})", id, entry.job.desc());
                true
            }
            None => false,
        }
    }

    /// Called by the worker once the job's future is done. Whoever removes the
    /// registry entry first owns the outcome: a job cancelled in the meantime
    /// is not reported.
    fn complete<I, R>(&self, job: Job<I, R>, outcome: Result<R, JobError>)
    where
        I: Send + Sync + 'static,
        R: Send + 'static,
    {
        if self.registry().remove(&job.id()).is_none() {
            debug!(
                "Job {} finished after it was cancelled, dropping its outcome",
                job.id()
            );
            return;
        }

        let terminal = match &outcome {
            Ok(_) => JobState::Completed,
            Err(err) => {
                debug!("Job {} ({}) failed: {}", job.id(), job.desc(), err);
                JobState::Failed
            }
        };
        let delivery = job.clone();
        let posted = self.control.post(Box::new(move || {
            // the state must turn terminal even if the callback panics
            let delivered = panic::catch_unwind(AssertUnwindSafe(|| delivery.deliver(outcome)));
            delivery.control().set_state(terminal);
            if let Err(payload) = delivered {
                panic::resume_unwind(payload);
            }
        }));
        if posted.is_err() {
            warn!(
                "Control context is closed, outcome of job {} ({}) is lost",
                job.id(),
                job.desc()
            );
            job.control().set_state(terminal);
        }
    }
}

/// Runs jobs on a fixed-size pool of worker threads and reports their outcome
/// on a control context.
pub struct JobScheduler {
    shared: Arc<SchedulerShared>,
    workers: Vec<JoinHandle<()>>,
}

impl fmt::Debug for JobScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobScheduler")
            .field("workers", &self.workers.len())
            .field("running_jobs", &self.running_jobs())
            .field("closed", &self.shared.tx.is_closed())
            .finish()
    }
}

impl JobScheduler {
    /// Spawn the worker pool. Completions are posted to `control`.
    pub fn new(config: &SchedulerConfig, control: impl ControlContext) -> Result<Self> {
        config.validate()?;

        let (tx, rx) = match config.queue {
            QueueKind::Unbounded => async_channel::unbounded(),
            QueueKind::Bounded => async_channel::bounded(config.queue_capacity),
        };

        let shared = Arc::new(SchedulerShared {
            registry: Mutex::new(HashMap::new()),
            tx,
            control: Box::new(control),
        });

        let mut workers = Vec::with_capacity(config.pool_size);
        for index in 0..config.pool_size {
            let rx_in_thread = rx.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", config.thread_name, index))
                .spawn(move || worker_loop(index, rx_in_thread));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    shared.tx.close();
                    return Err(e).with_context(|| format!("failed to spawn worker {index}"));
                }
            }
        }
        info!(
            "Started job scheduler with {} workers ({:?} queue)",
            config.pool_size, config.queue
        );

        Ok(Self { shared, workers })
    }

    /// Register `job` and hand it to the pool.
    ///
    /// Returns false if the pool refused the job. In that case the job's
    /// `on_error` has already been called with [`JobError::Rejected`], on the
    /// calling thread rather than the control context.
    pub fn submit<I, R>(&self, job: &Job<I, R>) -> bool
    where
        I: Send + Sync + 'static,
        R: Send + 'static,
    {
        let work = if job.attach_owner(Arc::downgrade(&self.shared)) {
            job.take_work()
        } else {
            None
        };
        let Some(work) = work else {
            return reject(job, RejectReason::AlreadySubmitted);
        };

        let (abort, registration) = AbortHandle::new_pair();
        let task = run_job(self.shared.clone(), job.clone(), work, registration).boxed();

        let rejected = {
            // register before the pool sees the job, so a fast worker always finds the entry
            let mut registry = self.shared.registry();
            registry.insert(
                job.id(),
                RegistryEntry {
                    job: job.as_scheduled(),
                    control: job.control().clone(),
                    abort,
                },
            );
            job.control().set_state(JobState::Submitted);
            match self.shared.tx.try_send(task) {
                Ok(()) => None,
                Err(e) => {
                    registry.remove(&job.id());
                    Some(match e {
                        TrySendError::Full(_) => RejectReason::QueueFull,
                        TrySendError::Closed(_) => RejectReason::Closed,
                    })
                }
            }
        };

        match rejected {
            None => {
                debug!("Submitted job {} ({})", job.id(), job.desc());
                true
            }
            Some(reason) => reject(job, reason),
        }
    }

    /// Cancel a submitted job. Pending jobs never start, running ones are
    /// interrupted at their next await point and observe
    /// [`Job::is_cancelled`]. No callback is delivered for a cancelled job.
    ///
    /// Returns false if the job is not registered (never submitted, already
    /// finished or already cancelled).
    pub fn cancel<I, R>(&self, job: &Job<I, R>) -> bool
    where
        I: Send + Sync + 'static,
        R: Send + 'static,
    {
        self.shared.cancel(job.id())
    }

    pub fn cancel_by_id(&self, id: JobId) -> bool {
        self.shared.cancel(id)
    }

    /// Cancel every registered job. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<RegistryEntry> = self
            .shared
            .registry()
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for entry in &drained {
            entry.control.cancel();
            entry.abort.abort();
        }
        if !drained.is_empty() {
            debug!("Cancelled {} pending jobs", drained.len());
        }
        drained.len()
    }

    /// True while the job is submitted and has neither finished nor been cancelled.
    pub fn is_running(&self, id: JobId) -> bool {
        self.shared.registry().contains_key(&id)
    }

    /// The registered job with this id, if it has the given input and result types.
    pub fn get_job<I, R>(&self, id: JobId) -> Option<Job<I, R>>
    where
        I: Send + Sync + 'static,
        R: Send + 'static,
    {
        let job = self.job_info(id)?;
        Job::from_scheduled(job)
    }

    /// Type-erased view of the registered job with this id.
    pub fn job_info(&self, id: JobId) -> Option<Arc<dyn ScheduledJob>> {
        self.shared
            .registry()
            .get(&id)
            .map(|entry| entry.job.clone())
    }

    pub fn running_jobs(&self) -> usize {
        self.shared.registry().len()
    }

    pub fn pool_size(&self) -> usize {
        self.workers.len()
    }

    /// Stop accepting jobs. Jobs that are already queued still run.
    pub fn close(&self) {
        if self.shared.tx.close() {
            debug!("Job scheduler closed, {} jobs left", self.running_jobs());
        }
    }

    /// Close the scheduler and wait until the workers ran every queued job.
    pub fn wait_until_finished(&mut self) {
        self.close();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("Worker thread terminated abnormally");
            }
        }
        info!("Job scheduler stopped");
    }
}

impl Drop for JobScheduler {
    fn drop(&mut self) {
        self.close();
    }
}

fn reject<I, R>(job: &Job<I, R>, reason: RejectReason) -> bool
where
    I: Send + Sync + 'static,
    R: Send + 'static,
{
    warn!("Rejected job {} ({}): {}", job.id(), job.desc(), reason);
    job.control().set_state(JobState::Rejected);
    job.deliver(Err(JobError::Rejected(reason)));
    false
}

/// Executes one job on the worker thread that picked it up.
async fn run_job<I, R>(
    shared: Arc<SchedulerShared>,
    job: Job<I, R>,
    work: Box<dyn JobWork<I, R>>,
    registration: AbortRegistration,
) where
    I: Send + Sync + 'static,
    R: Send + 'static,
{
    let task_job = job.clone();
    let task = AssertUnwindSafe(async move {
        // not reached if the job was aborted while still queued
        task_job.control().set_state(JobState::Running);
        work.create_task(task_job).await
    })
    .catch_unwind();

    let outcome = match Abortable::new(task, registration).await {
        Err(_aborted) => {
            debug!("Job {} ({}) stopped by cancellation", job.id(), job.desc());
            return;
        }
        Ok(Err(payload)) => Err(JobError::Panicked(panic_message(payload.as_ref()))),
        Ok(Ok(Err(err))) => Err(JobError::Failed(err)),
        Ok(Ok(Ok(result))) => Ok(result),
    };
    shared.complete(job, outcome);
}

/// The loop of a single pool thread.
fn worker_loop(index: usize, rx: Receiver<WorkItem>) {
    debug!("Starting worker {index}");
    while let Ok(task) = rx.recv_blocking() {
        futures::executor::block_on(task);
    }
    debug!("Worker {index} ended, channel closed");
}
