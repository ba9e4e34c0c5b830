use crate::config::SchedulerConfig;
use crate::job_engine::control::ControlThread;
use crate::job_engine::job::{
    callback_fn, Job, JobCallback, JobError, JobId, JobState, RejectReason,
};
use crate::job_engine::scheduler::JobScheduler;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(200);

#[derive(Debug)]
struct Delivery {
    id: JobId,
    outcome: Result<u32, JobError>,
    thread: Option<String>,
    thread_id: ThreadId,
}

/// Callback that forwards every delivery to a channel
fn recorder() -> (impl JobCallback<u32, u32>, Receiver<Delivery>) {
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let callback = callback_fn(move |job: &Job<u32, u32>, outcome: Result<u32, JobError>| {
        let current = thread::current();
        let _ = tx.lock().unwrap().send(Delivery {
            id: job.id(),
            outcome,
            thread: current.name().map(str::to_string),
            thread_id: current.id(),
        });
    });
    (callback, rx)
}

fn setup(config: SchedulerConfig) -> (JobScheduler, ControlThread) {
    let _ = env_logger::builder().is_test(true).try_init();
    let control = ControlThread::with_name("control-test").unwrap();
    let scheduler = JobScheduler::new(&config, control.sender()).unwrap();
    (scheduler, control)
}

/// Job that blocks its worker until the returned sender fires (or is dropped)
fn gated_job(desc: &str, value: u32) -> (Job<u32, u32>, Receiver<Delivery>, mpsc::Sender<()>) {
    let (callback, rx) = recorder();
    let (gate_tx, gate_rx) = mpsc::channel::<()>();
    let job = Job::blocking(desc, value, callback, move |job| {
        let _ = gate_rx.recv_timeout(TIMEOUT);
        Ok(*job.request_info())
    });
    (job, rx, gate_tx)
}

//
// 1. Results reach the control context
//
#[test]
fn test_result_is_delivered_on_control_thread() {
    let (mut scheduler, mut control) = setup(SchedulerConfig::with_pool_size(2));
    let (callback, rx) = recorder();

    let job = Job::blocking("double", 21u32, callback, |job| Ok(job.request_info() * 2));
    assert!(scheduler.submit(&job));

    let delivery = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(delivery.id, job.id());
    assert_eq!(delivery.outcome.unwrap(), 42);
    assert_eq!(delivery.thread.as_deref(), Some("control-test"));

    assert_eq!(job.wait_timeout(TIMEOUT), JobState::Completed);
    assert!(!scheduler.is_running(job.id()));
    assert!(rx.recv_timeout(QUIET).is_err());

    scheduler.wait_until_finished();
    control.wait_until_finished();
}

//
// 2. Pool of one: the second job starts after the first one finished
//
#[test]
fn test_single_worker_runs_jobs_back_to_back() {
    let (mut scheduler, mut control) = setup(SchedulerConfig::with_pool_size(1));
    let events = Arc::new(Mutex::new(Vec::<String>::new()));

    let (tx, rx) = mpsc::channel::<(JobId, u32)>();
    let tx = Mutex::new(tx);
    let callback_events = events.clone();
    let callback = callback_fn(move |job: &Job<u32, u32>, outcome: Result<u32, JobError>| {
        let value = outcome.unwrap();
        callback_events
            .lock()
            .unwrap()
            .push(format!("callback {value}"));
        let _ = tx.lock().unwrap().send((job.id(), value));
    });
    let callback = Arc::new(callback);

    let events1 = events.clone();
    let job1 = Job::blocking("sleep then 1", 1u32, callback.clone(), move |_job| {
        thread::sleep(Duration::from_millis(50));
        events1.lock().unwrap().push("job1 done".into());
        Ok(1)
    });
    let events2 = events.clone();
    let job2 = Job::blocking("2 right away", 2u32, callback, move |_job| {
        events2.lock().unwrap().push("job2 start".into());
        Ok(2)
    });

    assert!(scheduler.submit(&job1));
    assert!(scheduler.submit(&job2));

    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), (job1.id(), 1));
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), (job2.id(), 2));

    let events = events.lock().unwrap();
    let position = |name: &str| events.iter().position(|e| e == name).unwrap();
    assert!(position("job1 done") < position("job2 start"));
    assert!(position("callback 1") < position("callback 2"));

    scheduler.wait_until_finished();
    control.wait_until_finished();
}

//
// 3. At most pool_size jobs run at the same time
//
#[test]
fn test_concurrency_is_bounded_by_pool_size() {
    let (mut scheduler, mut control) = setup(SchedulerConfig::with_pool_size(2));
    let active = Arc::new(AtomicUsize::new(0));
    let max_active = Arc::new(AtomicUsize::new(0));
    let (callback, rx) = recorder();
    let callback = Arc::new(callback);

    let jobs: Vec<Job<u32, u32>> = (0..6)
        .map(|i| {
            let active = active.clone();
            let max_active = max_active.clone();
            Job::blocking(format!("job {i}"), i, callback.clone(), move |job| {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_active.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(30));
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(*job.request_info())
            })
        })
        .collect();
    for job in &jobs {
        assert!(scheduler.submit(job));
    }

    let mut results: Vec<u32> = (0..6)
        .map(|_| rx.recv_timeout(TIMEOUT).unwrap().outcome.unwrap())
        .collect();
    results.sort();
    assert_eq!(results, vec![0, 1, 2, 3, 4, 5]);
    assert!(max_active.load(Ordering::SeqCst) <= 2);

    scheduler.wait_until_finished();
    control.wait_until_finished();
}

//
// 4. Errors and panics of the work routine
//
#[test]
fn test_returned_error_is_reported() {
    let (mut scheduler, mut control) = setup(SchedulerConfig::with_pool_size(1));
    let (callback, rx) = recorder();

    let job = Job::blocking("fails", 0u32, callback, |_job| {
        Err(anyhow::anyhow!("device unreachable"))
    });
    assert!(scheduler.submit(&job));

    let delivery = rx.recv_timeout(TIMEOUT).unwrap();
    match delivery.outcome {
        Err(JobError::Failed(err)) => assert_eq!(err.to_string(), "device unreachable"),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(job.wait_timeout(TIMEOUT), JobState::Failed);
    assert!(rx.recv_timeout(QUIET).is_err());

    scheduler.wait_until_finished();
    control.wait_until_finished();
}

#[test]
fn test_panic_is_captured_and_pool_survives() {
    let (mut scheduler, mut control) = setup(SchedulerConfig::with_pool_size(1));
    let (callback, rx) = recorder();
    let callback = Arc::new(callback);

    let exploding = Job::blocking("explodes", 0u32, callback.clone(), |_job| -> anyhow::Result<u32> {
        panic!("worker exploded")
    });
    let healthy = Job::blocking("healthy", 7u32, callback, |job| Ok(*job.request_info()));
    assert!(scheduler.submit(&exploding));
    assert!(scheduler.submit(&healthy));

    let first = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(first.id, exploding.id());
    match first.outcome {
        Err(JobError::Panicked(msg)) => assert!(msg.contains("worker exploded")),
        other => panic!("unexpected outcome {other:?}"),
    }

    let second = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(second.id, healthy.id());
    assert_eq!(second.outcome.unwrap(), 7);

    scheduler.wait_until_finished();
    control.wait_until_finished();
}

#[test]
fn test_panicking_callback_still_finishes_the_job() {
    let (mut scheduler, mut control) = setup(SchedulerConfig::with_pool_size(1));
    let faulty = callback_fn(|_job: &Job<u32, u32>, _outcome: Result<u32, JobError>| {
        panic!("ui bug")
    });
    let (callback, rx) = recorder();

    let job = Job::blocking("faulty ui", 1u32, faulty, |_job| Ok(1));
    assert!(scheduler.submit(&job));

    assert_eq!(job.wait_timeout(TIMEOUT), JobState::Completed);
    assert!(!scheduler.is_running(job.id()));

    // the control thread keeps delivering
    let next = Job::blocking("after", 2u32, callback, |job| Ok(*job.request_info()));
    assert!(scheduler.submit(&next));
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap().outcome.unwrap(), 2);

    scheduler.wait_until_finished();
    control.wait_until_finished();
}

//
// 5. Cancellation
//
#[test]
fn test_cancel_pending_job() {
    let (mut scheduler, mut control) = setup(SchedulerConfig::with_pool_size(1));
    let (blocker, blocker_rx, release) = gated_job("blocker", 1);

    let (callback, pending_rx) = recorder();
    let body_ran = Arc::new(AtomicBool::new(false));
    let body_ran_in_job = body_ran.clone();
    let pending = Job::blocking("pending", 2u32, callback, move |_job| {
        body_ran_in_job.store(true, Ordering::SeqCst);
        Ok(2)
    });

    assert!(scheduler.submit(&blocker));
    assert_eq!(blocker.wait_for_state(JobState::Running), JobState::Running);
    assert!(scheduler.submit(&pending));
    assert!(scheduler.is_running(pending.id()));

    assert!(scheduler.cancel(&pending));
    assert!(!scheduler.is_running(pending.id()));
    assert!(pending.is_cancelled());
    assert_eq!(pending.state(), JobState::Cancelled);

    release.send(()).unwrap();
    assert_eq!(blocker_rx.recv_timeout(TIMEOUT).unwrap().outcome.unwrap(), 1);

    scheduler.wait_until_finished();
    control.wait_until_finished();
    assert!(pending_rx.try_recv().is_err());
    assert!(!body_ran.load(Ordering::SeqCst));
}

#[test]
fn test_cancel_after_completion_is_noop() {
    let (mut scheduler, mut control) = setup(SchedulerConfig::with_pool_size(1));
    let (callback, rx) = recorder();

    let job = Job::blocking("quick", 3u32, callback, |job| Ok(*job.request_info()));
    assert!(scheduler.submit(&job));
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap().outcome.unwrap(), 3);
    assert_eq!(job.wait_timeout(TIMEOUT), JobState::Completed);

    assert!(!scheduler.cancel(&job));
    assert!(!job.cancel());
    assert!(!job.is_cancelled());
    assert_eq!(job.state(), JobState::Completed);
    assert!(rx.recv_timeout(QUIET).is_err());

    scheduler.wait_until_finished();
    control.wait_until_finished();
}

#[test]
fn test_cancel_interrupts_running_async_job() {
    let (mut scheduler, mut control) = setup(SchedulerConfig::with_pool_size(1));
    let (callback, rx) = recorder();
    let (started_tx, started_rx) = mpsc::channel::<()>();

    let job = Job::new("waits forever", 0u32, callback, move |_job| async move {
        let _ = started_tx.send(());
        futures::future::pending::<()>().await;
        Ok(0)
    });
    assert!(scheduler.submit(&job));
    started_rx.recv_timeout(TIMEOUT).unwrap();

    // cancel through the job handle, which goes through its owner
    assert!(job.cancel());
    assert!(!scheduler.is_running(job.id()));
    assert_eq!(job.wait_timeout(TIMEOUT), JobState::Cancelled);

    // the worker is free again
    let (follow_up_callback, follow_up_rx) = recorder();
    let follow_up = Job::blocking("follow up", 5u32, follow_up_callback, |job| {
        Ok(*job.request_info())
    });
    assert!(scheduler.submit(&follow_up));
    assert_eq!(follow_up_rx.recv_timeout(TIMEOUT).unwrap().outcome.unwrap(), 5);
    assert!(rx.try_recv().is_err());

    scheduler.wait_until_finished();
    control.wait_until_finished();
}

#[test]
fn test_cooperative_cancellation_suppresses_late_result() {
    let (mut scheduler, mut control) = setup(SchedulerConfig::with_pool_size(1));
    let (callback, rx) = recorder();
    let (started_tx, started_rx) = mpsc::channel::<()>();
    let (observed_tx, observed_rx) = mpsc::channel::<bool>();

    let job = Job::blocking("polls its flag", 0u32, callback, move |job| {
        let _ = started_tx.send(());
        while !job.is_cancelled() {
            thread::sleep(Duration::from_millis(5));
        }
        let _ = observed_tx.send(true);
        Ok(99)
    });
    assert!(scheduler.submit(&job));
    started_rx.recv_timeout(TIMEOUT).unwrap();

    assert!(scheduler.cancel_by_id(job.id()));
    assert!(observed_rx.recv_timeout(TIMEOUT).unwrap());

    scheduler.wait_until_finished();
    control.wait_until_finished();
    assert!(rx.try_recv().is_err());
    assert_eq!(job.state(), JobState::Cancelled);
}

#[test]
fn test_cancel_all() {
    let (mut scheduler, mut control) = setup(SchedulerConfig::with_pool_size(1));
    let (blocker, blocker_rx, release_blocker) = gated_job("blocker", 1);
    let (queued, queued_rx, release_queued) = gated_job("queued", 2);

    assert!(scheduler.submit(&blocker));
    assert!(scheduler.submit(&queued));
    assert_eq!(scheduler.running_jobs(), 2);

    assert_eq!(scheduler.cancel_all(), 2);
    assert_eq!(scheduler.running_jobs(), 0);
    assert!(blocker.is_cancelled());
    assert!(queued.is_cancelled());

    // dropping the gates lets the blocked body return, its result is discarded
    drop(release_blocker);
    drop(release_queued);
    scheduler.wait_until_finished();
    control.wait_until_finished();
    assert!(blocker_rx.try_recv().is_err());
    assert!(queued_rx.try_recv().is_err());
}

//
// 6. Rejection
//
#[test]
fn test_full_bounded_queue_rejects_on_submitting_thread() {
    let (mut scheduler, mut control) = setup(SchedulerConfig::bounded(1, 1));
    let (blocker, _blocker_rx, release) = gated_job("blocker", 1);
    let (queued, queued_rx, _) = gated_job("queued", 2);
    let (overflow, overflow_rx, _) = gated_job("overflow", 3);

    assert!(scheduler.submit(&blocker));
    assert_eq!(blocker.wait_for_state(JobState::Running), JobState::Running);
    assert!(scheduler.submit(&queued));
    assert!(!scheduler.submit(&overflow));

    // delivered before submit returned, on this very thread
    let delivery = overflow_rx.try_recv().unwrap();
    assert_eq!(delivery.thread_id, thread::current().id());
    assert!(matches!(
        delivery.outcome,
        Err(JobError::Rejected(RejectReason::QueueFull))
    ));
    assert!(!scheduler.is_running(overflow.id()));
    assert_eq!(overflow.state(), JobState::Rejected);

    release.send(()).unwrap();
    assert_eq!(queued_rx.recv_timeout(TIMEOUT).unwrap().outcome.unwrap(), 2);

    scheduler.wait_until_finished();
    control.wait_until_finished();
}

#[test]
fn test_resubmission_is_rejected() {
    let (mut scheduler, mut control) = setup(SchedulerConfig::with_pool_size(1));
    let (callback, rx) = recorder();

    let job = Job::blocking("once", 4u32, callback, |job| Ok(*job.request_info()));
    assert!(scheduler.submit(&job));
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap().outcome.unwrap(), 4);

    assert!(!scheduler.submit(&job));
    assert!(matches!(
        rx.try_recv().unwrap().outcome,
        Err(JobError::Rejected(RejectReason::AlreadySubmitted))
    ));

    scheduler.wait_until_finished();
    control.wait_until_finished();
}

#[test]
fn test_closed_scheduler_rejects() {
    let (mut scheduler, mut control) = setup(SchedulerConfig::with_pool_size(1));
    scheduler.close();

    let (callback, rx) = recorder();
    let job = Job::blocking("too late", 0u32, callback, |_job| Ok(0));
    assert!(!scheduler.submit(&job));
    assert!(matches!(
        rx.try_recv().unwrap().outcome,
        Err(JobError::Rejected(RejectReason::Closed))
    ));

    scheduler.wait_until_finished();
    control.wait_until_finished();
}

//
// 7. Registry lookups
//
#[test]
fn test_get_job_while_running() {
    let (mut scheduler, mut control) = setup(SchedulerConfig::with_pool_size(1));
    let (job, rx, release) = gated_job("lookup", 11);

    assert!(scheduler.submit(&job));
    let found = scheduler.get_job::<u32, u32>(job.id()).unwrap();
    assert_eq!(found.id(), job.id());
    assert_eq!(*found.request_info(), 11);
    assert!(scheduler.get_job::<String, u32>(job.id()).is_none());

    let info = scheduler.job_info(job.id()).unwrap();
    assert_eq!(info.desc(), "lookup");
    assert!(!info.is_cancelled());

    release.send(()).unwrap();
    rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(job.wait_timeout(TIMEOUT), JobState::Completed);
    assert!(scheduler.get_job::<u32, u32>(job.id()).is_none());
    assert!(scheduler.job_info(job.id()).is_none());

    scheduler.wait_until_finished();
    control.wait_until_finished();
}

#[test]
fn test_ids_are_unique_and_increasing() {
    let (callback, _rx) = recorder();
    let callback = Arc::new(callback);
    let first = Job::blocking("a", 0u32, callback.clone(), |_job| Ok(0));
    let second = Job::blocking("b", 0u32, callback, |_job| Ok(0));
    assert!(second.id() > first.id());
    assert_eq!(first.state(), JobState::Created);
}

//
// 8. Shutdown drains the queue
//
#[test]
fn test_wait_until_finished_runs_queued_jobs() {
    let (mut scheduler, mut control) = setup(SchedulerConfig::with_pool_size(1));
    let order = Arc::new(Mutex::new(Vec::new()));
    let (callback, rx) = recorder();
    let callback = Arc::new(callback);

    for i in 0..5u32 {
        let order = order.clone();
        let job = Job::blocking(format!("push {i}"), i, callback.clone(), move |job| {
            order.lock().unwrap().push(*job.request_info());
            Ok(*job.request_info())
        });
        assert!(scheduler.submit(&job));
    }

    scheduler.close();
    scheduler.wait_until_finished();
    control.wait_until_finished();

    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    assert_eq!(rx.try_iter().count(), 5);
}
