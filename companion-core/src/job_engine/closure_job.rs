// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use futures::future::BoxFuture;
use std::future::Future;

use crate::job_engine::job::{Job, JobWork};

/// Job body given as a closure that returns a future.
pub struct AsyncClosure<F> {
    task_creator: F,
}

impl<F> AsyncClosure<F> {
    pub fn new(task_creator: F) -> Self {
        Self { task_creator }
    }
}

impl<I, R, F, Fut> JobWork<I, R> for AsyncClosure<F>
where
    F: FnOnce(Job<I, R>) -> Fut + Send + 'static, // the closure itself can be sent across threads
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
{
    fn create_task(self: Box<Self>, job: Job<I, R>) -> BoxFuture<'static, anyhow::Result<R>> {
        let creator = self.task_creator;
        Box::pin(creator(job))
    }
}

/// Job body that runs to completion on its worker thread without yielding.
pub struct BlockingClosure<F> {
    body: F,
}

impl<F> BlockingClosure<F> {
    pub fn new(body: F) -> Self {
        Self { body }
    }
}

impl<I, R, F> JobWork<I, R> for BlockingClosure<F>
where
    I: Send + Sync + 'static,
    R: Send + 'static,
    F: FnOnce(&Job<I, R>) -> anyhow::Result<R> + Send + 'static,
{
    fn create_task(self: Box<Self>, job: Job<I, R>) -> BoxFuture<'static, anyhow::Result<R>> {
        let body = self.body;
        Box::pin(async move { body(&job) })
    }
}
