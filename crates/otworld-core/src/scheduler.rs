//! Delayed and periodic work, released to the dispatcher when due.
//!
//! The [`Scheduler`] runs its own thread, which never executes task bodies.
//! It sleeps until the earliest deadline in its [`TimerHeap`] and hands
//! each due event to the [`Dispatcher`] as a [`Task`]. Periodic events
//! are re-inserted at `now + interval` under the same [`EventId`].
//!
//! # Wake protocol
//!
//! Every insertion and cancellation calls [`Notify::notify_one`] after
//! releasing the heap lock. `Notify` keeps a permit when nobody is
//! waiting, so a deadline added while the loop is busy submitting work is
//! seen on the next iteration instead of being slept through.
//!
//! # Cancellation
//!
//! [`Scheduler::cancel`] removes the event under the heap lock. If that
//! happens before the loop pops it, the event never fires. An event that
//! was already popped has been (or is about to be) submitted and will run
//! once on the dispatcher.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::dispatcher::Dispatcher;
use crate::latch::ReadinessLatch;
use crate::task::{RepeatingJob, Task};
use crate::timer_heap::{EventId, TimerHeap};

/// Name given to the scheduler's thread.
pub const SCHEDULER_THREAD_NAME: &str = "scheduler";

/// Lateness past which a fire is logged as a warning.
const LATE_FIRE_WARNING: Duration = Duration::from_millis(500);

/// Errors returned by [`Scheduler`] operations.
#[derive(Debug, thiserror::Error)]
pub enum SchedulingError {
    /// A periodic event was given a zero repeat interval.
    #[error("repeat interval must be greater than zero")]
    InvalidInterval,

    /// `now + delay` is not representable on the monotonic clock.
    #[error("delay of {delay:?} overflows the monotonic clock")]
    DelayOverflow {
        /// The rejected delay.
        delay: Duration,
    },

    /// The scheduler has been stopped and accepts no new events.
    #[error("scheduler is stopped")]
    Stopped,

    /// The scheduler thread or its timer runtime could not be created.
    #[error("failed to start scheduler: {source}")]
    Spawn {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },
}

/// What happens when an event fires.
#[derive(Debug)]
enum ScheduledWork {
    /// Submit the task once.
    Once(Task),
    /// Submit a fresh task and re-insert at `now + interval`.
    Repeating {
        job: RepeatingJob,
        interval: Duration,
    },
}

/// State shared between the scheduler handle and its thread.
#[derive(Debug)]
struct Shared {
    heap: Mutex<TimerHeap<ScheduledWork>>,
    wake: Notify,
    stopping: AtomicBool,
    next_id: AtomicU64,
    /// Set under the worker lock once a thread has been launched.
    launched: AtomicBool,
    /// Opened when the scheduler thread has stopped submitting work.
    exited: ReadinessLatch,
}

/// Timed event scheduler feeding a [`Dispatcher`].
#[derive(Debug)]
pub struct Scheduler {
    dispatcher: Arc<Dispatcher>,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Create a stopped scheduler that will submit fired work to `dispatcher`.
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            shared: Arc::new(Shared {
                heap: Mutex::new(TimerHeap::new()),
                wake: Notify::new(),
                stopping: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                launched: AtomicBool::new(false),
                exited: ReadinessLatch::new(),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Spawn the scheduler thread. A second call is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulingError::Stopped`] if the scheduler was already
    /// joined, or [`SchedulingError::Spawn`] if the timer runtime or the
    /// thread cannot be created.
    pub fn start(&self) -> Result<(), SchedulingError> {
        if self.shared.stopping.load(Ordering::Acquire) {
            return Err(SchedulingError::Stopped);
        }
        let mut worker = self.worker.lock();
        if worker.is_some() {
            debug!("scheduler already started");
            return Ok(());
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        let shared = Arc::clone(&self.shared);
        let dispatcher = Arc::clone(&self.dispatcher);
        let handle = thread::Builder::new()
            .name(SCHEDULER_THREAD_NAME.to_owned())
            .spawn(move || {
                runtime.block_on(run_loop(&shared, &dispatcher));
                shared.exited.fire();
            })?;

        self.shared.launched.store(true, Ordering::Release);
        *worker = Some(handle);
        info!("scheduler started");
        Ok(())
    }

    /// Schedule `task` to be submitted to the dispatcher after `delay`.
    ///
    /// A zero delay fires on the next wake cycle.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulingError::DelayOverflow`] for an unrepresentable
    /// delay and [`SchedulingError::Stopped`] after shutdown.
    pub fn add_event(&self, delay: Duration, task: Task) -> Result<EventId, SchedulingError> {
        self.insert(delay, ScheduledWork::Once(task))
    }

    /// Schedule `job` to fire after `delay` and then every `interval`.
    ///
    /// Each fire is a separate submission to the dispatcher. The returned
    /// handle cancels the whole series.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulingError::InvalidInterval`] for a zero interval,
    /// plus the errors of [`add_event`](Self::add_event).
    pub fn add_periodic(
        &self,
        delay: Duration,
        interval: Duration,
        job: RepeatingJob,
    ) -> Result<EventId, SchedulingError> {
        if interval.is_zero() {
            return Err(SchedulingError::InvalidInterval);
        }
        self.insert(delay, ScheduledWork::Repeating { job, interval })
    }

    /// Cancel a pending event.
    ///
    /// Returns `false` for handles that already fired (one-shot), were
    /// already cancelled, or were never issued.
    pub fn cancel(&self, id: EventId) -> bool {
        let removed = self.shared.heap.lock().remove(id).is_some();
        if removed {
            debug!(event = %id, "scheduled event cancelled");
            self.shared.wake.notify_one();
        }
        removed
    }

    /// Number of events waiting to fire.
    pub fn pending(&self) -> usize {
        self.shared.heap.lock().len()
    }

    /// Whether `id` is still waiting to fire.
    pub fn is_pending(&self, id: EventId) -> bool {
        self.shared.heap.lock().contains(id)
    }

    /// Stop firing events and refuse new ones. Does not wait.
    pub fn stop(&self) {
        if !self.shared.stopping.swap(true, Ordering::AcqRel) {
            info!("scheduler stop requested");
        }
        self.shared.wake.notify_one();
    }

    /// Stop the scheduler and block until its thread has exited.
    ///
    /// Events that have not fired yet are dropped; the count is logged.
    /// Concurrent joiners all wait for the thread to exit.
    pub fn join(&self) {
        self.stop();
        let handle = {
            let mut worker = self.worker.lock();
            let handle = worker.take();
            let launched = self.shared.launched.load(Ordering::Acquire);
            drop(worker);
            (handle, launched)
        };
        match handle {
            (Some(handle), _) => {
                if handle.join().is_err() {
                    error!("scheduler thread terminated abnormally");
                }
                self.shared.exited.fire();
            }
            (None, true) => {
                debug!("scheduler join: waiting for another joiner");
                self.shared.exited.wait();
            }
            (None, false) => {
                let dropped = self.shared.heap.lock().clear();
                debug!(dropped, "scheduler join: no running thread");
            }
        }
    }

    fn insert(&self, delay: Duration, work: ScheduledWork) -> Result<EventId, SchedulingError> {
        if self.shared.stopping.load(Ordering::Acquire) {
            return Err(SchedulingError::Stopped);
        }
        let due = Instant::now()
            .checked_add(delay)
            .ok_or(SchedulingError::DelayOverflow { delay })?;
        let id = EventId::new(self.shared.next_id.fetch_add(1, Ordering::AcqRel));

        {
            let mut heap = self.shared.heap.lock();
            heap.insert(id, due, work);
        }
        self.shared.wake.notify_one();

        debug!(event = %id, delay_ms = delay.as_millis(), "event scheduled");
        Ok(id)
    }
}

/// Scheduler thread body.
async fn run_loop(shared: &Shared, dispatcher: &Dispatcher) {
    debug!("scheduler loop entered");
    while !shared.stopping.load(Ordering::Acquire) {
        let (ready, next_deadline) = collect_due(shared);

        for task in ready {
            if let Err(e) = dispatcher.submit(task) {
                warn!(error = %e, "dropping fired event");
            }
        }

        match next_deadline {
            Some(deadline) => {
                tokio::select! {
                    () = tokio::time::sleep_until(deadline.into()) => {}
                    () = shared.wake.notified() => {}
                }
            }
            None => shared.wake.notified().await,
        }
    }

    let dropped = shared.heap.lock().clear();
    info!(dropped, "scheduler stopped, pending events dropped");
}

/// Pop everything due, re-arm periodic events, and report the next deadline.
///
/// Runs entirely under the heap lock so a concurrent cancel either removes
/// an event before it is popped or finds the re-armed instance.
fn collect_due(shared: &Shared) -> (Vec<Task>, Option<Instant>) {
    let mut heap = shared.heap.lock();
    let now = Instant::now();
    let due = heap.pop_due(now);
    let mut ready = Vec::with_capacity(due.len());

    for event in due {
        let late = now.saturating_duration_since(event.due);
        if late > LATE_FIRE_WARNING {
            warn!(event = %event.id, late_ms = late.as_millis(), "event fired late");
        }
        match event.payload {
            ScheduledWork::Once(task) => ready.push(task),
            ScheduledWork::Repeating { job, interval } => {
                ready.push(job.to_task());
                match now.checked_add(interval) {
                    Some(next) => {
                        heap.insert(event.id, next, ScheduledWork::Repeating { job, interval });
                    }
                    None => warn!(event = %event.id, "periodic event cannot be re-armed"),
                }
            }
        }
    }

    (ready, heap.next_deadline())
}
