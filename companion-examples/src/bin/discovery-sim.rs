// SPDX-License-Identifier: MIT
// discovery-sim: replays a device-discovery session against a simulated
// service resolver.
//
// - Every announced device gets a background job on the scheduler.
// - The job resolves the device's service name through the shared queue.
// - Outcomes are printed as JSON lines from the control thread.
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use anyhow::{anyhow, bail, Context};
use clap::Parser;
use companion_core::{
    callback_fn, BoxedListener, ControlThread, Enqueued, Job, JobError, JobScheduler,
    ResolutionQueue, Resolver, SchedulerArgs,
};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Announced device names, in announcement order. A name may repeat.
    #[arg(long = "device", value_name = "NAME", default_values_t = default_devices())]
    devices: Vec<String>,

    /// Time the simulated resolver needs for one name
    #[arg(long, value_name = "MS", default_value_t = 20)]
    resolve_delay_ms: u64,

    /// Device names the simulated resolver fails to resolve
    #[arg(long = "fail", value_name = "NAME")]
    failing: Vec<String>,

    /// Device names whose discovery job is cancelled right after submission
    #[arg(long = "cancel", value_name = "NAME")]
    cancelled: Vec<String>,

    /// Seconds a job waits for its resolve before giving up
    #[arg(long, default_value_t = 10)]
    resolve_timeout: u64,

    #[command(flatten)]
    scheduler: SchedulerArgs,
}

fn default_devices() -> Vec<String> {
    ["phone", "tablet", "phone", "laptop", "watch"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

/// Resolver answering from its own thread, the way platform discovery
/// services report back.
struct SimulatedResolver {
    delay: Duration,
    failing: HashSet<String>,
}

impl Resolver for SimulatedResolver {
    type Key = String;
    type Value = String;
    type Error = i32;

    fn resolve(&self, key: String, listener: BoxedListener<String, String, i32>) {
        let outcome = if self.failing.contains(&key) {
            Err(-65538) // unknown host
        } else {
            Ok(format!("{key}.local:8009"))
        };
        let delay = self.delay;
        debug!("Resolving {key}");
        thread::spawn(move || {
            thread::sleep(delay);
            listener.on_outcome(key, outcome);
        });
    }
}

#[derive(Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
enum Report<'a> {
    Resolved { job: u64, device: &'a str, address: String },
    Failed { job: u64, device: &'a str, error: String },
    Rejected { job: u64, device: &'a str, reason: String },
    Panicked { job: u64, device: &'a str, message: String },
}

fn print_report(job: &Job<String, String>, outcome: Result<String, JobError>) {
    let (id, device) = (job.id(), job.request_info().as_str());
    let report = match outcome {
        Ok(address) => Report::Resolved { job: id, device, address },
        Err(JobError::Failed(err)) => Report::Failed { job: id, device, error: format!("{err:#}") },
        Err(JobError::Rejected(reason)) => Report::Rejected { job: id, device, reason: reason.to_string() },
        Err(JobError::Panicked(message)) => Report::Panicked { job: id, device, message },
    };
    match serde_json::to_string(&report) {
        Ok(line) => println!("{line}"),
        Err(e) => warn!("Could not encode report of job {id}: {e}"),
    }
}

fn discovery_job(
    device: &str,
    queue: ResolutionQueue<SimulatedResolver>,
    timeout: Duration,
) -> Job<String, String> {
    Job::blocking(
        format!("discover {device}"),
        device.to_string(),
        callback_fn(print_report),
        move |job| {
            let (tx, rx) = mpsc::channel();
            let status = queue.resolve_or_enqueue(job.request_info().clone(), move |_key, outcome| {
                let _ = tx.send(outcome);
            });
            if status == Enqueued::Duplicate {
                bail!("{} is already being resolved", job.request_info());
            }
            let outcome = rx
                .recv_timeout(timeout)
                .with_context(|| format!("no answer for {}", job.request_info()))?;
            if job.is_cancelled() {
                bail!("cancelled");
            }
            outcome.map_err(|code| anyhow!("resolver error {code}"))
        },
    )
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = args.scheduler.resolve()?;

    let mut control = ControlThread::new()?;
    let mut scheduler = JobScheduler::new(&config, control.sender())?;
    let queue = ResolutionQueue::new(SimulatedResolver {
        delay: Duration::from_millis(args.resolve_delay_ms),
        failing: args.failing.iter().cloned().collect(),
    });
    let timeout = Duration::from_secs(args.resolve_timeout);

    info!(
        "Discovering {} devices on {} workers",
        args.devices.len(),
        scheduler.pool_size()
    );
    for device in &args.devices {
        let job = discovery_job(device, queue.clone(), timeout);
        if !scheduler.submit(&job) {
            continue;
        }
        if args.cancelled.contains(device) && scheduler.cancel(&job) {
            info!("Cancelled discovery of {device}");
        }
    }

    scheduler.wait_until_finished();
    control.wait_until_finished();
    info!("Discovery finished");
    Ok(())
}
