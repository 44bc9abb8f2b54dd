use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};

type TaskBody = Box<dyn FnMut() -> anyhow::Result<()> + Send>;

/// A unit of work to run at or after `next_run`, optionally repeating.
pub struct DeferredTask {
    next_run: Instant,
    interval: Option<Duration>,
    body: TaskBody,
}

impl DeferredTask {
    /// Runs once, `delay` from now.
    pub fn once<F>(delay: Duration, body: F) -> Self
    where
        F: FnMut() -> anyhow::Result<()> + Send + 'static,
    {
        Self::at(Instant::now() + delay, body)
    }

    /// Runs once at `when`.
    pub fn at<F>(when: Instant, body: F) -> Self
    where
        F: FnMut() -> anyhow::Result<()> + Send + 'static,
    {
        Self {
            next_run: when,
            interval: None,
            body: Box::new(body),
        }
    }

    /// Runs every `interval`, the first time `interval` from now. The next
    /// run is measured from the end of the previous one, so it drifts under
    /// load.
    pub fn repeating<F>(interval: Duration, body: F) -> Self
    where
        F: FnMut() -> anyhow::Result<()> + Send + 'static,
    {
        Self {
            next_run: Instant::now() + interval,
            interval: Some(interval),
            body: Box::new(body),
        }
    }

    pub fn next_run(&self) -> Instant {
        self.next_run
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Time left until the task is due, zero once it is.
    pub fn delay(&self, now: Instant) -> Duration {
        self.next_run.saturating_duration_since(now)
    }

    fn run(&mut self) {
        match catch_unwind(AssertUnwindSafe(|| (self.body)())) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::error!("deferred task failed: {:#}", err),
            Err(_) => tracing::error!("deferred task panicked"),
        }
    }
}

impl std::fmt::Debug for DeferredTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredTask")
            .field("next_run", &self.next_run)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

struct Entry {
    task: DeferredTask,
    seq: u64,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// BinaryHeap is a max-heap; the earliest deadline, then the oldest entry,
// has to compare greatest.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.task.next_run, other.seq).cmp(&(self.task.next_run, self.seq))
    }
}

/// Deferred tasks ordered by deadline, ties broken by insertion order.
#[derive(Default)]
pub struct Scheduler {
    queue: BinaryHeap<Entry>,
    seq: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a task. Returns whether it is now the soonest one, in which
    /// case a blocked wait has to be cut short.
    pub fn schedule(&mut self, task: DeferredTask) -> bool {
        let sooner = self
            .soonest()
            .map_or(true, |soonest| task.next_run < soonest);

        self.seq += 1;
        self.queue.push(Entry {
            task,
            seq: self.seq,
        });
        sooner
    }

    /// Runs every task due at `now`, in deadline order. Failures are logged
    /// and never stop the pass. Repeating tasks are put back afterwards, so
    /// they cannot run twice in one pass.
    ///
    /// Returns the delay until the next task is due.
    pub fn run_due(&mut self, now: Instant) -> Option<Duration> {
        let mut due = Vec::new();
        while self
            .queue
            .peek()
            .map_or(false, |entry| entry.task.next_run <= now)
        {
            if let Some(entry) = self.queue.pop() {
                due.push(entry.task);
            }
        }

        if !due.is_empty() {
            tracing::trace!("running {} deferred tasks", due.len());
        }

        let mut repeating = Vec::new();
        for mut task in due {
            task.run();
            if let Some(interval) = task.interval {
                task.next_run = Instant::now() + interval;
                repeating.push(task);
            }
        }
        for task in repeating {
            self.schedule(task);
        }

        self.next_delay(Instant::now())
    }

    /// Delay until the soonest task is due: zero if one is already due, `None`
    /// if nothing is scheduled.
    pub fn next_delay(&self, now: Instant) -> Option<Duration> {
        self.queue.peek().map(|entry| entry.task.delay(now))
    }

    pub fn soonest(&self) -> Option<Instant> {
        self.queue.peek().map(|entry| entry.task.next_run)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("len", &self.queue.len())
            .field("soonest", &self.soonest())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder() -> (Arc<Mutex<Vec<u32>>>, impl Fn(u32) -> DeferredTaskBody) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let for_tasks = Arc::clone(&log);
        let make = move |id: u32| {
            let log = Arc::clone(&for_tasks);
            Box::new(move || {
                log.lock().unwrap().push(id);
                Ok(())
            }) as DeferredTaskBody
        };
        (log, make)
    }

    type DeferredTaskBody = Box<dyn FnMut() -> anyhow::Result<()> + Send>;

    #[test]
    fn test_tasks_run_in_deadline_order() {
        let (log, task) = recorder();
        let start = Instant::now();
        let mut scheduler = Scheduler::new();

        assert!(scheduler.schedule(DeferredTask::at(start + Duration::from_millis(10), task(10))));
        assert!(scheduler.schedule(DeferredTask::at(start + Duration::from_millis(5), task(5))));
        assert!(!scheduler.schedule(DeferredTask::at(start + Duration::from_millis(20), task(20))));

        assert_eq!(
            scheduler.next_delay(start),
            Some(Duration::from_millis(5))
        );

        scheduler.run_due(start + Duration::from_millis(25));
        assert_eq!(*log.lock().unwrap(), vec![5, 10, 20]);
        assert!(scheduler.is_empty());
        assert_eq!(scheduler.next_delay(start), None);
    }

    #[test]
    fn test_ties_run_in_insertion_order() {
        let (log, task) = recorder();
        let when = Instant::now();
        let mut scheduler = Scheduler::new();
        for id in 1..=4 {
            scheduler.schedule(DeferredTask::at(when, task(id)));
        }

        scheduler.run_due(when);
        assert_eq!(*log.lock().unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_only_due_tasks_run() {
        let (log, task) = recorder();
        let start = Instant::now();
        let mut scheduler = Scheduler::new();
        scheduler.schedule(DeferredTask::at(start, task(1)));
        scheduler.schedule(DeferredTask::at(start + Duration::from_secs(60), task(2)));

        let delay = scheduler.run_due(start).unwrap();
        assert_eq!(*log.lock().unwrap(), vec![1]);
        assert_eq!(scheduler.len(), 1);
        assert!(delay > Duration::from_secs(50));
    }

    #[test]
    fn test_failing_tasks_do_not_stop_others() {
        let (log, task) = recorder();
        let when = Instant::now();
        let mut scheduler = Scheduler::new();

        scheduler.schedule(DeferredTask::at(when, || anyhow::bail!("boom")));
        scheduler.schedule(DeferredTask::at(when, || panic!("boom")));
        scheduler.schedule(DeferredTask::at(when, task(3)));

        scheduler.run_due(when);
        assert_eq!(*log.lock().unwrap(), vec![3]);
    }

    #[test]
    fn test_repeating_task_is_rescheduled() {
        let (log, task) = recorder();
        let mut scheduler = Scheduler::new();
        let interval = Duration::from_secs(30);

        scheduler.schedule(DeferredTask::repeating(interval, task(7)));
        let late = Instant::now() + interval * 2;
        scheduler.run_due(late);

        // runs once per pass even though it is overdue, then waits a full
        // interval from the end of the run
        assert_eq!(*log.lock().unwrap(), vec![7]);
        assert_eq!(scheduler.len(), 1);
        let next = scheduler.soonest().unwrap();
        assert!(next < late);
        assert!(next >= Instant::now() + interval - Duration::from_secs(1));
    }

    #[test]
    fn test_failing_repeating_task_keeps_running() {
        let mut scheduler = Scheduler::new();
        scheduler.schedule(DeferredTask::repeating(Duration::ZERO, || {
            anyhow::bail!("always")
        }));

        scheduler.run_due(Instant::now());
        assert_eq!(scheduler.len(), 1);
        assert_eq!(scheduler.next_delay(Instant::now()), Some(Duration::ZERO));
    }
}
