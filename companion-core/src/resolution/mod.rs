// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>
//! Serialized access to a single-concurrency resolver.
//!
//! Platform discovery services typically resolve one service at a time and
//! misbehave when asked for a second one before the first reported back. The
//! [`ResolutionQueue`](queue::ResolutionQueue) sits in front of such a
//! [`Resolver`](resolver::Resolver): it starts requests in FIFO order, keeps
//! exactly one in flight, and drops requests for a key that is already queued.

pub mod queue;
pub mod resolver;
