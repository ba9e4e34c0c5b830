// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use futures::future::BoxFuture;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, PoisonError, Weak};
use std::time::Duration;

use crate::job_engine::closure_job::{AsyncClosure, BlockingClosure};
use crate::job_engine::scheduler::SchedulerShared;

/// Process-unique job identity. Ids are handed out in increasing order and never reused.
pub type JobId = u64;

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Debug, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Created,
    Submitted,
    Running,
    Completed,
    Failed,
    Cancelled,
    Rejected,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled | JobState::Rejected
        )
    }
}

/// Why the pool refused a job.
#[derive(Clone, Debug, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The bounded queue of the pool is full.
    QueueFull,
    /// The scheduler has been closed.
    Closed,
    /// Jobs run once. This one was handed to a scheduler before.
    AlreadySubmitted,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::QueueFull => write!(f, "job queue is full"),
            RejectReason::Closed => write!(f, "scheduler is closed"),
            RejectReason::AlreadySubmitted => write!(f, "job was already submitted"),
        }
    }
}

#[derive(Debug)]
pub enum JobError {
    /// The pool did not accept the job. Reported on the submitting thread.
    Rejected(RejectReason),
    /// The work routine returned an error.
    Failed(anyhow::Error),
    /// The work routine panicked.
    Panicked(String),
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobError::Rejected(reason) => write!(f, "job rejected: {reason}"),
            JobError::Failed(err) => write!(f, "job failed: {err:#}"),
            JobError::Panicked(msg) => write!(f, "job panicked: {msg}"),
        }
    }
}

impl std::error::Error for JobError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            JobError::Failed(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

/// Receives the outcome of a job. Apart from a rejection at submit time, both
/// methods run on the control context, and at most one of them runs per job.
pub trait JobCallback<I, R>: Send + Sync + 'static {
    fn on_result(&self, job: &Job<I, R>, result: R);
    fn on_error(&self, job: &Job<I, R>, error: JobError);
}

impl<I, R, C> JobCallback<I, R> for Arc<C>
where
    C: JobCallback<I, R> + ?Sized,
{
    fn on_result(&self, job: &Job<I, R>, result: R) {
        (**self).on_result(job, result)
    }

    fn on_error(&self, job: &Job<I, R>, error: JobError) {
        (**self).on_error(job, error)
    }
}

/// Callback built from a single closure receiving the outcome as a `Result`.
pub struct FnCallback<F> {
    f: F,
}

/// Wrap a closure as a [`JobCallback`].
pub fn callback_fn<I, R, F>(f: F) -> FnCallback<F>
where
    F: Fn(&Job<I, R>, Result<R, JobError>) + Send + Sync + 'static,
{
    FnCallback { f }
}

impl<I, R, F> JobCallback<I, R> for FnCallback<F>
where
    F: Fn(&Job<I, R>, Result<R, JobError>) + Send + Sync + 'static,
{
    fn on_result(&self, job: &Job<I, R>, result: R) {
        (self.f)(job, Ok(result))
    }

    fn on_error(&self, job: &Job<I, R>, error: JobError) {
        (self.f)(job, Err(error))
    }
}

/// The body of a job. It produces the result from the job's request info and
/// should return early once [`Job::is_cancelled`] turns true.
pub trait JobWork<I, R>: Send + 'static {
    fn create_task(self: Box<Self>, job: Job<I, R>) -> BoxFuture<'static, anyhow::Result<R>>;
}

/// Type-erased view on a job, as held by the scheduler's registry.
pub trait ScheduledJob: Send + Sync + 'static {
    fn id(&self) -> JobId;
    fn desc(&self) -> &str;
    fn is_cancelled(&self) -> bool;
    fn state(&self) -> JobState;
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl fmt::Debug for dyn ScheduledJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledJob")
            .field("id", &self.id())
            .field("desc", &self.desc())
            .field("state", &self.state())
            .finish()
    }
}

/// Cancellation flag and lifecycle state, shared between a job and the scheduler.
#[derive(Debug)]
pub(crate) struct JobControl {
    cancelled: AtomicBool,
    sync_state: (Mutex<JobState>, Condvar),
}

impl JobControl {
    fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            sync_state: (Mutex::new(JobState::Created), Condvar::new()),
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn state(&self) -> JobState {
        *self
            .sync_state
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `new_state` unless the job already reached a terminal state.
    pub(crate) fn set_state(&self, new_state: JobState) -> bool {
        let (lock, cvar) = &self.sync_state;
        let mut current_state = lock.lock().unwrap_or_else(PoisonError::into_inner);
        if current_state.is_terminal() {
            return false;
        }
        *current_state = new_state;
        cvar.notify_all();
        true
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.set_state(JobState::Cancelled);
    }

    fn wait_until(&self, reached: impl Fn(JobState) -> bool, timeout: Option<Duration>) -> JobState {
        // pattern is described on https://doc.rust-lang.org/stable/std/sync/struct.Condvar.html
        let (lock, cvar) = &self.sync_state;
        let guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let guard = match timeout {
            None => cvar
                .wait_while(guard, |state| !reached(*state))
                .unwrap_or_else(PoisonError::into_inner),
            Some(timeout) => {
                cvar.wait_timeout_while(guard, timeout, |state| !reached(*state))
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
        };
        *guard
    }
}

pub(crate) struct JobCore<I, R> {
    id: JobId,
    desc: String,
    request_info: I,
    control: Arc<JobControl>,
    callback: Box<dyn JobCallback<I, R>>,
    work: Mutex<Option<Box<dyn JobWork<I, R>>>>,
    owner: OnceLock<Weak<SchedulerShared>>,
}

impl<I, R> ScheduledJob for JobCore<I, R>
where
    I: Send + Sync + 'static,
    R: Send + 'static,
{
    fn id(&self) -> JobId {
        self.id
    }

    fn desc(&self) -> &str {
        &self.desc
    }

    fn is_cancelled(&self) -> bool {
        self.control.is_cancelled()
    }

    fn state(&self) -> JobState {
        self.control.state()
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// A unit of deferred work with a typed input and a typed result.
///
/// `Job` is a cheap handle; clones refer to the same job. A job is submitted
/// to a [`JobScheduler`](crate::JobScheduler) once and never reused.
pub struct Job<I, R> {
    core: Arc<JobCore<I, R>>,
}

impl<I, R> Clone for Job<I, R> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<I, R> fmt::Debug for Job<I, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.core.id)
            .field("desc", &self.core.desc)
            .field("state", &self.core.control.state())
            .field("cancelled", &self.core.control.is_cancelled())
            .finish()
    }
}

impl<I, R> Job<I, R>
where
    I: Send + Sync + 'static,
    R: Send + 'static,
{
    /// Create a job from any [`JobWork`] implementation.
    pub fn with_work(
        desc: impl Into<String>,
        request_info: I,
        callback: impl JobCallback<I, R>,
        work: impl JobWork<I, R>,
    ) -> Self {
        Self {
            core: Arc::new(JobCore {
                id: NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed),
                desc: desc.into(),
                request_info,
                control: Arc::new(JobControl::new()),
                callback: Box::new(callback),
                work: Mutex::new(Some(Box::new(work))),
                owner: OnceLock::new(),
            }),
        }
    }

    /// Create a job whose body is an async closure. Cancellation interrupts it
    /// at its next await point.
    pub fn new<F, Fut>(
        desc: impl Into<String>,
        request_info: I,
        callback: impl JobCallback<I, R>,
        f: F,
    ) -> Self
    where
        F: FnOnce(Job<I, R>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        Self::with_work(desc, request_info, callback, AsyncClosure::new(f))
    }

    /// Create a job whose body blocks its worker thread until it is done.
    pub fn blocking<F>(
        desc: impl Into<String>,
        request_info: I,
        callback: impl JobCallback<I, R>,
        f: F,
    ) -> Self
    where
        F: FnOnce(&Job<I, R>) -> anyhow::Result<R> + Send + 'static,
    {
        Self::with_work(desc, request_info, callback, BlockingClosure::new(f))
    }
}

impl<I, R> Job<I, R> {
    pub fn id(&self) -> JobId {
        self.core.id
    }

    pub fn desc(&self) -> &str {
        &self.core.desc
    }

    pub fn request_info(&self) -> &I {
        &self.core.request_info
    }

    pub fn is_cancelled(&self) -> bool {
        self.core.control.is_cancelled()
    }

    pub fn state(&self) -> JobState {
        self.core.control.state()
    }

    /// Cancel the job through its scheduler. A job that was never submitted is
    /// only flagged. Returns whether a registered job was cancelled.
    pub fn cancel(&self) -> bool {
        match self.core.owner.get().and_then(Weak::upgrade) {
            Some(owner) => owner.cancel(self.core.id),
            None => {
                if self.core.owner.get().is_none() {
                    self.core.control.cancelled.store(true, Ordering::SeqCst);
                }
                false
            }
        }
    }

    /// Block until the job reached a terminal state. Completed and failed jobs
    /// get there after their callback returned, so this must not be called from
    /// the control context itself.
    pub fn wait(&self) -> JobState {
        self.core.control.wait_until(JobState::is_terminal, None)
    }

    /// Like [`Job::wait`], giving up after `timeout`. Returns the state at that time.
    pub fn wait_timeout(&self, timeout: Duration) -> JobState {
        self.core.control.wait_until(JobState::is_terminal, Some(timeout))
    }

    /// Block until the job is in `state` or any terminal state.
    pub fn wait_for_state(&self, state: JobState) -> JobState {
        self.core
            .control
            .wait_until(|current| current == state || current.is_terminal(), None)
    }

    pub(crate) fn control(&self) -> &Arc<JobControl> {
        &self.core.control
    }
}

impl<I, R> Job<I, R>
where
    I: Send + Sync + 'static,
    R: Send + 'static,
{
    pub(crate) fn as_scheduled(&self) -> Arc<dyn ScheduledJob> {
        self.core.clone()
    }

    /// Bind the job to its scheduler. Fails if it was bound before.
    pub(crate) fn attach_owner(&self, owner: Weak<SchedulerShared>) -> bool {
        self.core.owner.set(owner).is_ok()
    }

    pub(crate) fn take_work(&self) -> Option<Box<dyn JobWork<I, R>>> {
        self.core
            .work
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub(crate) fn deliver(&self, outcome: Result<R, JobError>) {
        match outcome {
            Ok(result) => self.core.callback.on_result(self, result),
            Err(error) => self.core.callback.on_error(self, error),
        }
    }

    pub(crate) fn from_scheduled(job: Arc<dyn ScheduledJob>) -> Option<Self> {
        job.as_any()
            .downcast::<JobCore<I, R>>()
            .ok()
            .map(|core| Self { core })
    }
}
