// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use anyhow::{bail, Context, Result};
use clap::{Args, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How the work queue in front of the pool behaves once all workers are busy.
#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum, Default, Serialize, Deserialize)]
#[clap(rename_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum QueueKind {
    #[default]
    /// Queue every job, without limit
    Unbounded,
    /// Queue at most `queue_capacity` jobs and reject the rest
    Bounded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SchedulerConfig {
    /// Number of worker threads. The pool never grows or shrinks.
    pub pool_size: usize,
    pub queue: QueueKind,
    /// Only used for [`QueueKind::Bounded`].
    pub queue_capacity: usize,
    /// Worker threads are named `<thread_name>-<index>`.
    pub thread_name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            queue: QueueKind::Unbounded,
            queue_capacity: 64,
            thread_name: "job-worker".to_string(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_pool_size(pool_size: usize) -> Self {
        Self {
            pool_size,
            ..Self::default()
        }
    }

    pub fn bounded(pool_size: usize, queue_capacity: usize) -> Self {
        Self {
            pool_size,
            queue: QueueKind::Bounded,
            queue_capacity,
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: SchedulerConfig =
            serde_json::from_str(json).context("invalid scheduler configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            bail!("pool-size must be at least 1");
        }
        if self.queue == QueueKind::Bounded && self.queue_capacity == 0 {
            bail!("queue-capacity must be at least 1 for a bounded queue");
        }
        if self.thread_name.is_empty() {
            bail!("thread-name must not be empty");
        }
        Ok(())
    }
}

/// Command line options of binaries that run a scheduler.
#[derive(Debug, Clone, Default, Args)]
pub struct SchedulerArgs {
    /// JSON file with the scheduler configuration. Other options override it.
    #[arg(long = "scheduler-config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Number of worker threads
    #[arg(long)]
    pub pool_size: Option<usize>,

    /// Queue in front of the worker pool
    #[arg(long, value_enum)]
    pub queue: Option<QueueKind>,

    /// Capacity of a bounded queue
    #[arg(long)]
    pub queue_capacity: Option<usize>,
}

impl SchedulerArgs {
    pub fn resolve(&self) -> Result<SchedulerConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let json = std::fs::read_to_string(path)
                    .with_context(|| format!("could not read {}", path.display()))?;
                SchedulerConfig::from_json(&json)?
            }
            None => SchedulerConfig::default(),
        };
        if let Some(pool_size) = self.pool_size {
            config.pool_size = pool_size;
        }
        if let Some(queue) = self.queue {
            config.queue = queue;
        }
        if let Some(queue_capacity) = self.queue_capacity {
            config.queue_capacity = queue_capacity;
        }
        config.validate()?;
        Ok(config)
    }
}
