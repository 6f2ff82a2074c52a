//! Bounded fan-out of per-server jobs.
//!
//! Jobs run on a rayon pool sized to the concurrency cap, so extra jobs queue until a
//! worker frees up. [`ActiveJobCount`] tracks in-flight jobs under one mutex and wakes
//! the caller through a condition variable on every completion.

use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

/// One unit of work, consumed once by a worker.
pub struct Job {
    name: String,
    body: Box<dyn FnOnce() -> Result<()> + Send + 'static>,
}

impl Job {
    pub fn new<S: Into<String>, F: FnOnce() -> Result<()> + Send + 'static>(name: S, body: F) -> Self {
        Self {
            name: name.into(),
            body: Box::new(body),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Number of dispatched jobs that have not finished yet.
#[derive(Debug, Default)]
pub struct ActiveJobCount {
    count: Mutex<usize>,
    drained: Condvar,
}

impl ActiveJobCount {
    // The count stays consistent even if a holder panicked, so poisoning is ignored.
    fn lock(&self) -> MutexGuard<'_, usize> {
        self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn current(&self) -> usize {
        *self.lock()
    }

    fn dispatched(&self, jobs: usize) {
        *self.lock() += jobs;
    }

    fn finished(&self) {
        let mut count = self.lock();
        match count.checked_sub(1) {
            Some(remaining) => *count = remaining,
            None => tracing::error!("Job finished with no job in flight"),
        }
        self.drained.notify_all();
    }

    fn wait_for_drain(&self) {
        let _drained = self
            .drained
            .wait_while(self.lock(), |count| *count > 0)
            .unwrap_or_else(PoisonError::into_inner);
    }
}

/// Decrements the count when the job ends, whether it returned or unwound.
struct FinishGuard(Arc<ActiveJobCount>);

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.0.finished();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".into())
}

pub struct JobScheduler {
    pool: ThreadPool,
    active: Arc<ActiveJobCount>,
}

impl JobScheduler {
    pub fn new(max_concurrency: usize) -> Result<Self> {
        if max_concurrency == 0 {
            return Err(Error::Configuration(
                "max_concurrency must be a positive integer".into(),
            ));
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(max_concurrency)
            .thread_name(|i| format!("backup-worker-{i}"))
            .build()?;
        Ok(Self {
            pool,
            active: Arc::new(ActiveJobCount::default()),
        })
    }

    pub fn max_concurrency(&self) -> usize {
        self.pool.current_num_threads()
    }

    pub fn active(&self) -> &ActiveJobCount {
        &self.active
    }

    /// Runs every job and blocks until all of them have finished.
    ///
    /// A job that fails or panics is logged and counted as finished; it never stops
    /// its siblings.
    pub fn run_all<I: IntoIterator<Item = Job>>(&self, jobs: I) {
        let jobs: Vec<Job> = jobs.into_iter().collect();
        tracing::info!(
            "Dispatching {} jobs on {} workers",
            jobs.len(),
            self.max_concurrency()
        );
        // Counted up front so the count cannot touch zero before the last dispatch.
        self.active.dispatched(jobs.len());

        for job in jobs {
            let guard = FinishGuard(self.active.clone());
            self.pool.spawn(move || {
                let _guard = guard;
                let Job { name, body } = job;
                tracing::debug!("Job {name} started");
                match catch_unwind(AssertUnwindSafe(body)) {
                    Ok(Ok(())) => tracing::info!("Job {name} finished"),
                    Ok(Err(e)) => tracing::error!("Job {name} failed:\n{e}"),
                    Err(payload) => {
                        let e = Error::JobPanicked {
                            job: name,
                            payload: panic_message(payload.as_ref()),
                        };
                        tracing::error!("{e}");
                    }
                }
            });
        }

        self.active.wait_for_drain();
        tracing::info!("All jobs drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Probe {
        running: AtomicUsize,
        peak: AtomicUsize,
        completed: AtomicUsize,
    }

    impl Probe {
        fn job(self: &Arc<Self>, i: usize) -> Job {
            let probe = self.clone();
            Job::new(format!("job-{i}"), move || {
                let now = probe.running.fetch_add(1, Ordering::SeqCst) + 1;
                probe.peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(15));
                probe.running.fetch_sub(1, Ordering::SeqCst);
                probe.completed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }
    }

    #[test]
    fn test_concurrency_never_exceeds_cap() {
        let scheduler = JobScheduler::new(3).unwrap();
        let probe = Arc::new(Probe::default());

        scheduler.run_all((0..12).map(|i| probe.job(i)));

        assert_eq!(probe.completed.load(Ordering::SeqCst), 12);
        assert!(probe.peak.load(Ordering::SeqCst) <= 3);
        assert!(probe.peak.load(Ordering::SeqCst) >= 1);
        assert_eq!(probe.running.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_count_stays_zero_after_drain() {
        let scheduler = JobScheduler::new(2).unwrap();
        let probe = Arc::new(Probe::default());

        scheduler.run_all((0..5).map(|i| probe.job(i)));
        assert_eq!(scheduler.active().current(), 0);

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(scheduler.active().current(), 0);
    }

    #[test]
    fn test_failing_and_panicking_jobs_still_drain() {
        let scheduler = JobScheduler::new(2).unwrap();
        let probe = Arc::new(Probe::default());

        let jobs = vec![
            probe.job(0),
            Job::new("fails", || Err(Error::Configuration("boom".into()))),
            Job::new("panics", || panic!("worker exploded")),
            probe.job(1),
        ];
        scheduler.run_all(jobs);

        assert_eq!(probe.completed.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.active().current(), 0);
    }

    #[test]
    fn test_scheduler_is_reusable() {
        let scheduler = JobScheduler::new(1).unwrap();
        let probe = Arc::new(Probe::default());

        scheduler.run_all((0..2).map(|i| probe.job(i)));
        scheduler.run_all((2..4).map(|i| probe.job(i)));

        assert_eq!(probe.completed.load(Ordering::SeqCst), 4);
        assert_eq!(probe.peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_no_jobs_returns_immediately() {
        let scheduler = JobScheduler::new(2).unwrap();
        scheduler.run_all(Vec::new());
        assert_eq!(scheduler.active().current(), 0);
    }

    #[test]
    fn test_zero_concurrency_is_rejected() {
        assert!(matches!(JobScheduler::new(0), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_panic_message_extraction() {
        let payload: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(panic_message(payload.as_ref()), "static message");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned message"));
        assert_eq!(panic_message(payload.as_ref()), "owned message");
        let payload: Box<dyn Any + Send> = Box::new(42);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic payload");
    }
}
