// SPDX-License-Identifier: MIT
// companion-core: concurrency core of the device-companion background work
//
// - Runs cancellable jobs on a fixed worker pool and hands their outcome to a
//   single control context.
// - Serializes requests against a resolver that only tolerates one call at a time.
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::any::Any;

pub mod config;
pub mod job_engine;
pub mod resolution;

pub use config::{QueueKind, SchedulerArgs, SchedulerConfig};
pub use job_engine::control::{
    control_channel, ControlClosed, ControlContext, ControlReceiver, ControlSender, ControlTask,
    ControlThread,
};
pub use job_engine::job::{
    callback_fn, Job, JobCallback, JobError, JobId, JobState, JobWork, RejectReason,
    ScheduledJob,
};
pub use job_engine::scheduler::JobScheduler;
pub use resolution::queue::{Enqueued, ResolutionQueue};
pub use resolution::resolver::{BoxedListener, ResolveListener, Resolver};

/// Best effort extraction of the message of a caught panic.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
