// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>
//! # Design: Cancellable Job Scheduler
//!
//! ## Overview
//! Background work of the companion (discovery, plugin I/O) runs as jobs on a
//! fixed pool of worker threads. Their outcome is handed back to one control
//! context, usually the thread that also runs the host's event loop.
//!
//! - The pool size is fixed at construction. Excess jobs wait in an unbounded
//!   queue unless a bounded queue is configured, in which case a full queue
//!   rejects the job.
//! - Every submitted job sits in a registry until it finishes or is cancelled.
//!   Registry mutation happens under one lock, so a cancellation racing with
//!   the natural end of a job decides exactly one winner.
//! - The result, the returned error or a caught panic is posted to the control
//!   context as a task. Workers never call job callbacks themselves.
//! - A rejected job is told so on the submitting thread.
//! - Cancelled jobs report nothing.
//!
//! ## Jobs
//! - A job's body produces a future (`JobWork::create_task`). Blocking bodies
//!   just block their worker, async bodies can be interrupted at await points.
//!
//! ```text
//!         +----------+   submit    +------------------------+
//!         |  caller  | ----------> |  registry + work queue |
//!         +----------+             +-----------+------------+
//!              ^                               |
//!              |                     +---------+---------+
//!              |                     v         v         v
//!              |                +--------+ +--------+ +--------+
//!              |                |worker 0| |worker 1| |worker n|
//!              |                +---+----+ +---+----+ +---+----+
//!              |                    |          |          |
//!              |                    v          v          v
//!         +----+--------------------------------------------+
//!         |        control context (ordered task queue)      |
//!         +--------------------------------------------------+
//! ```

pub mod closure_job;
pub mod control;
pub mod job;
pub mod scheduler;

#[cfg(test)]
mod tests;
