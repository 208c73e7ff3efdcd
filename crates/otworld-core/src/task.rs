//! Units of deferred work.
//!
//! A [`Task`] is the only thing the [`Dispatcher`] knows how to run: a
//! labelled, self-contained closure that captures its own inputs and is
//! consumed by running it exactly once. A [`RepeatingJob`] is the shared
//! body behind a periodic scheduler event; every fire clones a fresh
//! [`Task`] out of it so the queue stays uniform.
//!
//! [`Dispatcher`]: crate::dispatcher::Dispatcher

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

/// Boxed one-shot job body.
type Job = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>;

/// Shared job body that can be invoked many times.
type SharedJob = Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync + 'static>;

/// A single unit of work executed on the dispatcher thread.
///
/// The label is used only for logging and diagnostics; tasks have no
/// identity beyond it.
pub struct Task {
    label: Cow<'static, str>,
    job: Job,
}

impl Task {
    /// Create a task from a label and a closure.
    pub fn new<F>(label: impl Into<Cow<'static, str>>, job: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        Self {
            label: label.into(),
            job: Box::new(job),
        }
    }

    /// Label given at construction.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Run the task, consuming it.
    #[cfg(test)]
    pub(crate) fn run(self) -> anyhow::Result<()> {
        (self.job)()
    }

    pub(crate) fn into_parts(self) -> (Cow<'static, str>, Job) {
        (self.label, self.job)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

/// Job body for a periodic event.
///
/// Cloning is cheap; all clones share the same closure.
#[derive(Clone)]
pub struct RepeatingJob {
    label: Cow<'static, str>,
    job: SharedJob,
}

impl RepeatingJob {
    /// Create a repeating job from a label and a reusable closure.
    pub fn new<F>(label: impl Into<Cow<'static, str>>, job: F) -> Self
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            label: label.into(),
            job: Arc::new(job),
        }
    }

    /// Label given at construction.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Produce one independent [`Task`] for a single fire of this job.
    pub fn to_task(&self) -> Task {
        let job = Arc::clone(&self.job);
        Task::new(self.label.clone(), move || job())
    }
}

impl fmt::Debug for RepeatingJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepeatingJob")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn task_runs_its_closure_once() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&counter);
        let task = Task::new("count", move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert_eq!(task.label(), "count");
        task.run().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn task_error_is_returned() {
        let task = Task::new(String::from("broken"), || Err(anyhow::anyhow!("boom")));
        let err = task.run().unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn repeating_job_yields_independent_tasks() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&counter);
        let job = RepeatingJob::new("tick", move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let first = job.to_task();
        let second = job.clone().to_task();
        assert_eq!(first.label(), "tick");
        first.run().unwrap();
        second.run().unwrap();
        job.to_task().run().unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn debug_shows_label() {
        let task = Task::new("save", || Ok(()));
        assert!(format!("{task:?}").contains("save"));
    }
}
