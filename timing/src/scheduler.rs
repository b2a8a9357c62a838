use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::{Clock, Time, TimeQueue, TimingError};

/// How long the clock thread sleeps between checks while the clock is paused
const PAUSED_POLL: Duration = Duration::from_millis(10);

/// A callback the scheduler fires at (or after) a requested time.
///
/// Actions are handed the time they actually run at and must correct any periodic behaviour from
/// it, rather than assuming they ran exactly when asked. They must be short: anything long should
/// be handed to another thread.
pub trait ScheduledAction: Send + Sync {
    /// Returns when to run next, or `Time::ZERO` to not be rescheduled
    fn run(&self, current_time: Time) -> Time;
}

pub type Action = Arc<dyn ScheduledAction>;

struct Entry {
    action: Action,
    jitter: u64,
}

struct Inner {
    queue: TimeQueue<Entry>,
    /// Pending plus in-flight instances per action
    outstanding: HashMap<usize, u32>,
    shutdown: bool,
}

/// Time-ordered queue of best-effort one-shot callbacks.
///
/// Callbacks run either on whichever thread calls `run_due`/`run_until`, or on the dedicated clock
/// thread started by `spawn`. Nothing about the calling thread should be assumed by an action.
pub struct Scheduler {
    clock: Arc<Clock>,
    inner: Mutex<Inner>,
    wakeup: Condvar,
}

fn action_key(action: &Action) -> usize {
    Arc::as_ptr(action) as *const () as usize
}

impl Scheduler {
    pub fn new(clock: Arc<Clock>) -> Arc<Self> {
        Arc::new(Self {
            clock,
            inner: Mutex::new(Inner {
                queue: TimeQueue::new(),
                outstanding: HashMap::new(),
                shutdown: false,
            }),
            wakeup: Condvar::new(),
        })
    }

    pub fn clock(&self) -> &Arc<Clock> {
        &self.clock
    }

    pub fn schedule(&self, time: Time, action: Action) {
        self.schedule_with_jitter(time, 0, action)
    }

    /// `jitter` is how many nanoseconds early the action may be run to batch it with other work
    pub fn schedule_with_jitter(&self, time: Time, jitter: u64, action: Action) {
        let mut inner = self.lock();
        *inner.outstanding.entry(action_key(&action)).or_insert(0) += 1;
        inner.queue.push(time, Entry { action, jitter });
        drop(inner);
        self.wakeup.notify_all();
    }

    /// True while the action has an instance queued or currently running
    pub fn is_scheduled(&self, action: &Action) -> bool {
        self.lock().outstanding.get(&action_key(action)).copied().unwrap_or(0) != 0
    }

    pub fn next_due(&self) -> Option<Time> {
        self.lock().queue.peek().map(|(time, _)| time)
    }

    pub fn pending(&self) -> usize {
        self.lock().queue.len()
    }

    /// Runs every action due at the clock's current time. Returns how many ran.
    pub fn run_due(&self) -> usize {
        let now = self.clock.now();
        self.fire(now, |_| now)
    }

    /// Runs every action due up to `time`, in order, handing each its own due time.
    ///
    /// This steps virtual time deterministically instead of reading the clock.
    pub fn run_until(&self, time: Time) -> usize {
        self.fire(time, |due| due)
    }

    fn fire(&self, limit: Time, current_time: impl Fn(Time) -> Time) -> usize {
        let mut count = 0;
        loop {
            let (due, entry) = {
                let mut inner = self.lock();
                match inner.queue.peek() {
                    Some((due, entry)) if due.nanos().saturating_sub(entry.jitter) <= limit.nanos() => {}
                    _ => return count,
                }
                match inner.queue.pop() {
                    Some(popped) => popped,
                    None => return count,
                }
            };

            let now = current_time(due);
            let next = entry.action.run(now);
            count += 1;

            let mut inner = self.lock();
            let key = action_key(&entry.action);
            if !next.is_zero() {
                // Never requeue at or before the time the action was just handed
                let next = next.max(now.add(self.clock.granularity()));
                *inner.outstanding.entry(key).or_insert(0) += 1;
                inner.queue.push(next, Entry { action: entry.action, jitter: 0 });
            }
            if let Some(outstanding) = inner.outstanding.get_mut(&key) {
                *outstanding -= 1;
                if *outstanding == 0 {
                    inner.outstanding.remove(&key);
                }
            }
        }
    }

    /// Pokes the clock thread, e.g. after the clock resumes
    pub fn wake(&self) {
        self.wakeup.notify_all();
    }

    /// Starts the clock thread that fires actions as virtual time reaches them
    pub fn spawn(self: &Arc<Self>) -> Result<SchedulerThread, TimingError> {
        self.lock().shutdown = false;
        let scheduler = self.clone();
        let join = std::thread::Builder::new()
            .name("clock".to_owned())
            .spawn(move || scheduler.thread_main())?;
        Ok(SchedulerThread {
            scheduler: self.clone(),
            join: Some(join),
        })
    }

    fn thread_main(&self) {
        tracing::debug!("clock thread started");
        let mut inner = self.lock();
        loop {
            if inner.shutdown {
                break;
            }
            let wait = match inner.queue.peek() {
                None => None,
                Some((due, entry)) => {
                    let due = Time::from_nanos(due.nanos().saturating_sub(entry.jitter));
                    match self.clock.wall_until(due) {
                        Some(wait) if wait.is_zero() => {
                            drop(inner);
                            self.run_due();
                            inner = self.lock();
                            continue;
                        }
                        Some(wait) => Some(wait),
                        None => Some(PAUSED_POLL),
                    }
                }
            };
            inner = match wait {
                None => self.wakeup.wait(inner).expect("scheduler state poisoned"),
                Some(wait) => self.wakeup.wait_timeout(inner, wait).expect("scheduler state poisoned").0,
            };
        }
        tracing::debug!("clock thread stopped");
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("scheduler state poisoned")
    }
}

/// Handle to the clock thread, stops it when dropped
pub struct SchedulerThread {
    scheduler: Arc<Scheduler>,
    join: Option<std::thread::JoinHandle<()>>,
}

impl SchedulerThread {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.scheduler.lock().shutdown = true;
        self.scheduler.wake();
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                tracing::error!("clock thread panicked");
            }
        }
    }
}

impl Drop for SchedulerThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ManualTimeSource;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Recorder {
        id: u32,
        log: Arc<Mutex<Vec<(u32, Time)>>>,
        period: u64,
        remaining: AtomicU32,
    }

    impl ScheduledAction for Recorder {
        fn run(&self, current_time: Time) -> Time {
            self.log.lock().unwrap().push((self.id, current_time));
            if self.period != 0 && self.remaining.fetch_sub(1, Ordering::SeqCst) > 1 {
                current_time.add(self.period)
            } else {
                Time::ZERO
            }
        }
    }

    fn recorder(id: u32, log: &Arc<Mutex<Vec<(u32, Time)>>>, period: u64, repeats: u32) -> Arc<Recorder> {
        Arc::new(Recorder { id, log: log.clone(), period, remaining: AtomicU32::new(repeats) })
    }

    fn manual_scheduler() -> (Arc<ManualTimeSource>, Arc<Scheduler>) {
        let source = Arc::new(ManualTimeSource::new());
        let clock = Arc::new(Clock::new(source.clone(), 1).unwrap());
        (source, Scheduler::new(clock))
    }

    #[test]
    fn earlier_actions_fire_first() {
        let (_, scheduler) = manual_scheduler();
        let log = Arc::new(Mutex::new(Vec::new()));
        scheduler.schedule(Time::from_nanos(200), recorder(2, &log, 0, 1));
        scheduler.schedule(Time::from_nanos(100), recorder(1, &log, 0, 1));

        assert_eq!(scheduler.run_until(Time::from_nanos(150)), 1);
        assert_eq!(scheduler.run_until(Time::from_nanos(1_000)), 1);
        let ids: Vec<u32> = log.lock().unwrap().iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn rescheduled_action_never_runs_early() {
        let (source, scheduler) = manual_scheduler();
        let log = Arc::new(Mutex::new(Vec::new()));
        let action: Action = recorder(1, &log, 1_000, 3);
        scheduler.schedule(Time::from_nanos(500), action.clone());

        for step in 0..40 {
            source.set(step * 100);
            scheduler.run_due();
        }
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 3);
        for pair in log.windows(2) {
            assert!(pair[1].1.since(pair[0].1) >= 1_000);
        }
        assert!(!scheduler.is_scheduled(&action));
    }

    struct Again(AtomicU32);

    impl ScheduledAction for Again {
        fn run(&self, current_time: Time) -> Time {
            self.0.fetch_add(1, Ordering::SeqCst);
            current_time
        }
    }

    #[test]
    fn action_asking_for_its_own_time_runs_once_per_pass() {
        let (source, scheduler) = manual_scheduler();
        let again = Arc::new(Again(AtomicU32::new(0)));
        let action: Action = again.clone();
        scheduler.schedule(Time::from_nanos(100), action.clone());

        source.set(100);
        assert_eq!(scheduler.run_due(), 1);
        assert_eq!(again.0.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.next_due(), Some(Time::from_nanos(101)));

        source.set(101);
        assert_eq!(scheduler.run_due(), 1);
        assert!(scheduler.is_scheduled(&action));

        // Stepping virtual time moves it one granule per run
        assert_eq!(scheduler.run_until(Time::from_nanos(105)), 4);
        assert_eq!(again.0.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn is_scheduled_tracks_pending_instances() {
        let (_, scheduler) = manual_scheduler();
        let log = Arc::new(Mutex::new(Vec::new()));
        let action: Action = recorder(1, &log, 0, 1);
        assert!(!scheduler.is_scheduled(&action));

        scheduler.schedule(Time::from_nanos(10), action.clone());
        scheduler.schedule(Time::from_nanos(20), action.clone());
        assert!(scheduler.is_scheduled(&action));

        scheduler.run_until(Time::from_nanos(10));
        assert!(scheduler.is_scheduled(&action));
        scheduler.run_until(Time::from_nanos(20));
        assert!(!scheduler.is_scheduled(&action));
    }

    #[test]
    fn jitter_allows_early_batching() {
        let (_, scheduler) = manual_scheduler();
        let log = Arc::new(Mutex::new(Vec::new()));
        scheduler.schedule_with_jitter(Time::from_nanos(120), 30, recorder(1, &log, 0, 1));
        assert_eq!(scheduler.run_until(Time::from_nanos(80)), 0);
        assert_eq!(scheduler.run_until(Time::from_nanos(95)), 1);
    }

    #[test]
    fn clock_thread_fires_actions() {
        let scheduler = Scheduler::new(Arc::new(Clock::system()));
        let log = Arc::new(Mutex::new(Vec::new()));
        let now = scheduler.clock().now();
        scheduler.schedule(now.add(1_000_000), recorder(1, &log, 0, 1));

        let thread = scheduler.spawn().unwrap();
        for _ in 0..500 {
            if !log.lock().unwrap().is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        thread.stop();
        assert_eq!(log.lock().unwrap().len(), 1);
    }
}
