//! Single-consumer serial executor.
//!
//! The [`Dispatcher`] owns one OS thread that pops [`Task`]s off an
//! unbounded FIFO queue and runs them one at a time, in submission order.
//! All world-state mutation happens inside tasks run here, which is what
//! lets the rest of the server touch shared game state without further
//! locking.
//!
//! # Architecture
//!
//! ```text
//! network threads --+
//! scheduler thread -+--> unbounded queue --> dispatcher thread (runs 1 task at a time)
//! launcher thread --+
//! ```
//!
//! A task that returns an error or panics is logged and counted in
//! [`DispatchStats`]; the loop moves on to the next task.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};

use crate::latch::ReadinessLatch;
use crate::task::Task;

/// Name given to the dispatcher's consumer thread.
pub const DISPATCHER_THREAD_NAME: &str = "dispatcher";

/// Errors returned by [`Dispatcher`] operations.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The OS refused to spawn the consumer thread.
    #[error("failed to spawn dispatcher thread: {source}")]
    Spawn {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// The dispatcher has been stopped and admits no more work.
    #[error("dispatcher is shutting down, task `{label}` rejected")]
    ShuttingDown {
        /// Label of the rejected task.
        label: String,
    },
}

/// Execution counters for the dispatcher loop.
///
/// `depth` is the number of tasks currently mid-execution. The serial
/// loop keeps it at 0 or 1; `peak_depth` records the highest value ever
/// observed.
#[derive(Debug, Default)]
pub struct DispatchStats {
    executed: AtomicU64,
    failed: AtomicU64,
    panicked: AtomicU64,
    depth: AtomicUsize,
    peak_depth: AtomicUsize,
}

impl DispatchStats {
    /// Tasks run to completion (including failed and panicked ones).
    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::Acquire)
    }

    /// Tasks that returned an error.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Acquire)
    }

    /// Tasks that panicked.
    pub fn panicked(&self) -> u64 {
        self.panicked.load(Ordering::Acquire)
    }

    /// Tasks currently executing.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    /// Highest concurrent execution depth ever observed.
    pub fn peak_depth(&self) -> usize {
        self.peak_depth.load(Ordering::Acquire)
    }

    fn enter(&self) {
        let depth = self.depth.fetch_add(1, Ordering::AcqRel).saturating_add(1);
        self.peak_depth.fetch_max(depth, Ordering::AcqRel);
    }

    fn exit(&self) {
        self.depth.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Serial task executor backed by a dedicated thread.
///
/// Share it behind an [`Arc`]; every method takes `&self` and is safe to
/// call from any thread.
#[derive(Debug)]
pub struct Dispatcher {
    /// Producer side of the queue. `None` once stopped.
    sender: Mutex<Option<UnboundedSender<Task>>>,

    /// Consumer side, held until [`start`](Self::start) moves it to the thread.
    receiver: Mutex<Option<UnboundedReceiver<Task>>>,

    /// Consumer thread handle, present between start and the first join.
    worker: Mutex<Option<JoinHandle<()>>>,

    /// Consumer thread id, kept after the handle is taken.
    consumer: Mutex<Option<ThreadId>>,

    /// Opened when the consumer loop has drained the queue and exited.
    exited: Arc<ReadinessLatch>,

    stats: Arc<DispatchStats>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    /// Create a stopped dispatcher with an empty queue.
    ///
    /// Tasks submitted before [`start`](Self::start) are queued and run
    /// once the consumer thread is up.
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender: Mutex::new(Some(sender)),
            receiver: Mutex::new(Some(receiver)),
            worker: Mutex::new(None),
            consumer: Mutex::new(None),
            exited: Arc::new(ReadinessLatch::new()),
            stats: Arc::new(DispatchStats::default()),
        }
    }

    /// Spawn the consumer thread. A second call is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Spawn`] if the thread cannot be created.
    pub fn start(&self) -> Result<(), DispatchError> {
        let mut worker = self.worker.lock();
        let Some(receiver) = self.receiver.lock().take() else {
            debug!("dispatcher already started");
            return Ok(());
        };

        let stats = Arc::clone(&self.stats);
        let exited = Arc::clone(&self.exited);
        let spawned = thread::Builder::new()
            .name(DISPATCHER_THREAD_NAME.to_owned())
            .spawn(move || {
                run_loop(receiver, &stats);
                exited.fire();
            });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                // The queue went down with the closure; nothing will ever drain it.
                self.exited.fire();
                return Err(e.into());
            }
        };

        *self.consumer.lock() = Some(handle.thread().id());
        *worker = Some(handle);
        info!("dispatcher started");
        Ok(())
    }

    /// Append a task to the tail of the queue.
    ///
    /// Never blocks on the consumer.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::ShuttingDown`] once [`stop`](Self::stop)
    /// or [`join`](Self::join) has been called.
    pub fn submit(&self, task: Task) -> Result<(), DispatchError> {
        let guard = self.sender.lock();
        let Some(sender) = guard.as_ref() else {
            return Err(DispatchError::ShuttingDown {
                label: task.label().to_owned(),
            });
        };
        sender
            .send(task)
            .map_err(|rejected| DispatchError::ShuttingDown {
                label: rejected.0.label().to_owned(),
            })
    }

    /// Stop admitting new tasks. Already-queued tasks still run.
    pub fn stop(&self) {
        if self.sender.lock().take().is_some() {
            info!("dispatcher stop requested, draining queue");
        }
    }

    /// Stop admitting tasks, then block until the queue is drained and the
    /// consumer thread has exited.
    ///
    /// A task that is mid-execution is allowed to finish. Any number of
    /// threads may join concurrently; each returns only after the consumer
    /// has exited. Calling this from inside a task (on the dispatcher
    /// thread) only stops admission, since the thread cannot wait for
    /// itself.
    pub fn join(&self) {
        self.stop();

        if *self.consumer.lock() == Some(thread::current().id()) {
            warn!("dispatcher join called from the dispatcher thread, not waiting");
            return;
        }

        let mut worker = self.worker.lock();
        let handle = worker.take();
        let never_started = handle.is_none() && self.receiver.lock().is_some();
        drop(worker);

        match handle {
            Some(handle) => {
                if handle.join().is_err() {
                    error!("dispatcher thread terminated abnormally");
                }
                self.exited.fire();
                info!(
                    executed = self.stats.executed(),
                    failed = self.stats.failed(),
                    panicked = self.stats.panicked(),
                    "dispatcher joined"
                );
            }
            None if never_started => debug!("dispatcher join: consumer was never started"),
            None => {
                debug!("dispatcher join: waiting for another joiner's drain");
                self.exited.wait();
            }
        }
    }

    /// Whether the consumer thread is running and accepting tasks.
    pub fn is_running(&self) -> bool {
        self.consumer.lock().is_some() && !self.exited.is_ready() && self.sender.lock().is_some()
    }

    /// Execution counters.
    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }
}

/// Whether the calling thread is a dispatcher consumer thread.
///
/// Collaborators can use this in debug assertions to check the
/// single-writer convention for world state.
pub fn on_dispatcher_thread() -> bool {
    thread::current().name() == Some(DISPATCHER_THREAD_NAME)
}

/// Consumer loop: runs until every sender is gone and the queue is empty.
fn run_loop(mut receiver: UnboundedReceiver<Task>, stats: &DispatchStats) {
    debug!("dispatcher loop entered");
    while let Some(task) = receiver.blocking_recv() {
        execute(task, stats);
    }
    debug!(executed = stats.executed(), "dispatcher queue drained");
}

fn execute(task: Task, stats: &DispatchStats) {
    let (label, job) = task.into_parts();

    stats.enter();
    let outcome = panic::catch_unwind(AssertUnwindSafe(job));
    stats.exit();

    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            stats.failed.fetch_add(1, Ordering::AcqRel);
            warn!(task = %label, error = %e, "task failed");
        }
        Err(payload) => {
            stats.panicked.fetch_add(1, Ordering::AcqRel);
            error!(task = %label, panic = panic_message(payload.as_ref()), "task panicked");
        }
    }
    stats.executed.fetch_add(1, Ordering::AcqRel);
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Task) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = Arc::clone(&log);
        let make = move |name: &str| {
            let l = Arc::clone(&l);
            let owned = name.to_owned();
            Task::new(owned.clone(), move || {
                l.lock().push(owned);
                Ok(())
            })
        };
        (log, make)
    }

    #[test]
    fn runs_tasks_in_submission_order() {
        let dispatcher = Dispatcher::new();
        dispatcher.start().unwrap();
        let (log, make) = recorder();

        dispatcher.submit(make("A")).unwrap();
        dispatcher.submit(make("B")).unwrap();
        dispatcher.submit(make("C")).unwrap();
        dispatcher.join();

        assert_eq!(*log.lock(), vec!["A", "B", "C"]);
        assert_eq!(dispatcher.stats().executed(), 3);
    }

    #[test]
    fn tasks_submitted_before_start_are_kept() {
        let dispatcher = Dispatcher::new();
        let (log, make) = recorder();
        dispatcher.submit(make("early")).unwrap();

        dispatcher.start().unwrap();
        dispatcher.join();

        assert_eq!(*log.lock(), vec!["early"]);
    }

    #[test]
    fn start_twice_is_a_no_op() {
        let dispatcher = Dispatcher::new();
        dispatcher.start().unwrap();
        dispatcher.start().unwrap();
        assert!(dispatcher.is_running());
        dispatcher.join();
        assert!(!dispatcher.is_running());
    }

    #[test]
    fn failing_task_does_not_stop_the_loop() {
        let dispatcher = Dispatcher::new();
        dispatcher.start().unwrap();
        let (log, make) = recorder();

        dispatcher.submit(make("before")).unwrap();
        dispatcher
            .submit(Task::new("broken", || Err(anyhow::anyhow!("no such player"))))
            .unwrap();
        dispatcher.submit(make("after")).unwrap();
        dispatcher.join();

        assert_eq!(*log.lock(), vec!["before", "after"]);
        assert_eq!(dispatcher.stats().failed(), 1);
        assert_eq!(dispatcher.stats().executed(), 3);
    }

    #[test]
    fn panicking_task_is_contained() {
        let dispatcher = Dispatcher::new();
        dispatcher.start().unwrap();
        let (log, make) = recorder();

        dispatcher
            .submit(Task::new("explodes", || panic!("corrupted tile")))
            .unwrap();
        dispatcher.submit(make("survivor")).unwrap();
        dispatcher.join();

        assert_eq!(*log.lock(), vec!["survivor"]);
        assert_eq!(dispatcher.stats().panicked(), 1);
    }

    #[test]
    fn submit_after_join_is_rejected() {
        let dispatcher = Dispatcher::new();
        dispatcher.start().unwrap();
        dispatcher.join();

        let err = dispatcher.submit(Task::new("late", || Ok(()))).unwrap_err();
        assert!(matches!(err, DispatchError::ShuttingDown { ref label } if label == "late"));
    }

    #[test]
    fn join_waits_for_queued_work() {
        let dispatcher = Dispatcher::new();
        dispatcher.start().unwrap();
        let (log, make) = recorder();

        dispatcher
            .submit(Task::new("slow", || {
                thread::sleep(Duration::from_millis(50));
                Ok(())
            }))
            .unwrap();
        for i in 0..20 {
            dispatcher.submit(make(&format!("t{i}"))).unwrap();
        }
        dispatcher.join();

        assert_eq!(log.lock().len(), 20);
        assert_eq!(dispatcher.stats().depth(), 0);
    }

    #[test]
    fn many_producers_never_overlap_execution() {
        let dispatcher = Arc::new(Dispatcher::new());
        dispatcher.start().unwrap();

        let producers: Vec<_> = (0..8)
            .map(|p| {
                let d = Arc::clone(&dispatcher);
                thread::spawn(move || {
                    for i in 0..50 {
                        d.submit(Task::new(format!("p{p}-{i}"), || {
                            assert!(on_dispatcher_thread());
                            thread::yield_now();
                            Ok(())
                        }))
                        .unwrap();
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }
        dispatcher.join();

        assert_eq!(dispatcher.stats().executed(), 400);
        assert_eq!(dispatcher.stats().peak_depth(), 1);
        assert_eq!(dispatcher.stats().failed(), 0);
        assert_eq!(dispatcher.stats().panicked(), 0);
    }

    #[test]
    fn join_from_inside_a_task_does_not_deadlock() {
        let dispatcher = Arc::new(Dispatcher::new());
        dispatcher.start().unwrap();
        let d = Arc::clone(&dispatcher);
        dispatcher
            .submit(Task::new("self-join", move || {
                d.join();
                Ok(())
            }))
            .unwrap();

        // The in-task join only stops admission; this join actually waits.
        dispatcher.join();
        assert_eq!(dispatcher.stats().executed(), 1);
    }

    #[test]
    fn concurrent_joiners_all_wait_for_the_drain() {
        let dispatcher = Arc::new(Dispatcher::new());
        dispatcher.start().unwrap();
        let finished = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let f = Arc::clone(&finished);
        dispatcher
            .submit(Task::new("slow save", move || {
                thread::sleep(Duration::from_millis(300));
                f.store(true, Ordering::SeqCst);
                Ok(())
            }))
            .unwrap();

        let first = {
            let d = Arc::clone(&dispatcher);
            thread::spawn(move || d.join())
        };
        thread::sleep(Duration::from_millis(50));
        dispatcher.join();

        assert!(
            finished.load(Ordering::SeqCst),
            "second join returned before the queue drained"
        );
        first.join().unwrap();
        assert!(!dispatcher.is_running());
    }

    #[test]
    fn join_without_start_returns() {
        let dispatcher = Dispatcher::new();
        dispatcher.submit(Task::new("never run", || Ok(()))).unwrap();
        dispatcher.join();
        assert_eq!(dispatcher.stats().executed(), 0);
    }

    #[test]
    fn panic_message_extracts_strings() {
        let boxed: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(boxed.as_ref()), "static");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(boxed.as_ref()), "non-string panic payload");
    }
}
