// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use companion_core::{Job, JobCallback, JobError, JobId};
use serde::Serialize;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum RecordedOutcome<R> {
    Result { value: R },
    Rejected { reason: String },
    Failed { message: String },
    Panicked { message: String },
}

impl<R> From<Result<R, JobError>> for RecordedOutcome<R> {
    fn from(outcome: Result<R, JobError>) -> Self {
        match outcome {
            Ok(value) => RecordedOutcome::Result { value },
            Err(JobError::Rejected(reason)) => RecordedOutcome::Rejected {
                reason: reason.to_string(),
            },
            Err(JobError::Failed(err)) => RecordedOutcome::Failed {
                message: format!("{err:#}"),
            },
            Err(JobError::Panicked(message)) => RecordedOutcome::Panicked { message },
        }
    }
}

/// One callback invocation as seen by the job's owner.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Recorded<R> {
    pub job_id: JobId,
    pub outcome: RecordedOutcome<R>,
    pub thread: Option<String>,
}

/// Job callback that records every invocation.
pub struct RecordingCallback<R> {
    tx: Mutex<Sender<Recorded<R>>>,
}

impl<I, R> JobCallback<I, R> for RecordingCallback<R>
where
    R: Send + 'static,
{
    fn on_result(&self, job: &Job<I, R>, result: R) {
        self.record(job.id(), Ok(result));
    }

    fn on_error(&self, job: &Job<I, R>, error: JobError) {
        self.record(job.id(), Err(error));
    }
}

impl<R> RecordingCallback<R> {
    fn record(&self, job_id: JobId, outcome: Result<R, JobError>) {
        let recorded = Recorded {
            job_id,
            outcome: outcome.into(),
            thread: thread::current().name().map(str::to_string),
        };
        let _ = self.tx.lock().unwrap().send(recorded);
    }
}

/// Receiving side of a [`RecordingCallback`].
pub struct Recorder<R> {
    rx: Receiver<Recorded<R>>,
}

impl<R: Serialize> Recorder<R> {
    pub fn next(&self, timeout: Duration) -> Option<Recorded<R>> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Collect `count` invocations, giving up at `timeout` in total.
    pub fn collect(&self, count: usize, timeout: Duration) -> Vec<Recorded<R>> {
        let deadline = Instant::now() + timeout;
        let mut recorded = Vec::with_capacity(count);
        while recorded.len() < count {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(left) {
                Ok(r) => recorded.push(r),
                Err(_) => break,
            }
        }
        recorded
    }

    /// Everything recorded so far, without waiting.
    pub fn drain(&self) -> Vec<Recorded<R>> {
        self.rx.try_iter().collect()
    }

    /// JSON rendering, handy in assertion messages.
    pub fn to_json(recorded: &[Recorded<R>]) -> String {
        serde_json::to_string_pretty(recorded).unwrap_or_else(|e| format!("<{e}>"))
    }
}

pub fn recording<R>() -> (Arc<RecordingCallback<R>>, Recorder<R>) {
    let (tx, rx) = mpsc::channel();
    (
        Arc::new(RecordingCallback { tx: Mutex::new(tx) }),
        Recorder { rx },
    )
}
