//! Interval-paced priority task queue
//!
//! One queue per rate-limited endpoint. The queue dequeues at most one task
//! per fixed interval, preferring high-priority tasks, and can be paused
//! until a deadline or purged wholesale. Dequeued tasks run on their own
//! spawned tasks, so a slow request never blocks admission of new items or
//! the pacing of the next dequeue.
//!
//! Ordering: each dequeue picks the first high-priority item scanning from
//! the head, or the head item if none is high-priority. That gives FIFO
//! within each priority class, with high priority preferred at every
//! dequeue decision. A requeued retry is pushed to the front of its class.
//!
//! Timing uses `tokio::time::Instant`, so `start_paused` test runtimes can
//! drive pacing deterministically.

use crate::error::Rejection;
use crate::sleeper::Sleeper;
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tracing::debug;

/// What the queue decided to do with an item.
pub(crate) enum Verdict {
    /// Run the task now.
    Execute,
    /// Settle the task with a failure without running it.
    Reject(Rejection),
}

/// A type-erased queued call. Returns the future to run for `Execute`;
/// settles synchronously and returns `None` for `Reject`.
pub(crate) type Job = Box<dyn FnOnce(Verdict) -> Option<BoxFuture<'static, ()>> + Send>;

/// Build a job plus the handle its submitter awaits. The job owns the
/// settlement channel, so exactly one of "ran to completion" or "rejected"
/// reaches the submitter.
pub(crate) fn settled_job<T, F, Fut>(f: F) -> (Job, oneshot::Receiver<Result<T, Rejection>>)
where
    T: Send + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = T> + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let job: Job = Box::new(move |verdict| match verdict {
        Verdict::Execute => Some(Box::pin(async move {
            // The submitter may have given up; a dropped receiver is fine.
            let _ = tx.send(Ok(f().await));
        }) as BoxFuture<'static, ()>),
        Verdict::Reject(rejection) => {
            let _ = tx.send(Err(rejection));
            None
        }
    });
    (job, rx)
}

struct QueueItem {
    job: Job,
    high_priority: bool,
}

struct QueueState {
    items: VecDeque<QueueItem>,
    /// When set, no dequeues happen until this instant.
    paused_until: Option<Instant>,
    /// Time of the most recent dequeue. `None` until the first one, so an
    /// idle or fresh queue dequeues immediately.
    last_dequeue: Option<Instant>,
}

struct Shared {
    state: Mutex<QueueState>,
    notify: Notify,
    interval: Duration,
    sleeper: Arc<dyn Sleeper>,
}

/// Interval-paced priority queue of pending calls.
///
/// Dropping the queue stops its dequeue loop and drops any items still
/// queued; their settlement channels close without a value, which
/// submitters observe as [`Rejection::QueueClosed`].
pub struct TaskQueue {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("interval", &self.shared.interval)
            .field("len", &self.len())
            .field("paused", &self.is_paused())
            .finish()
    }
}

impl TaskQueue {
    /// Create a queue dequeuing at most one task per `interval`.
    ///
    /// Must be called inside a Tokio runtime; the dequeue loop is spawned
    /// here and exits when the queue is dropped.
    pub(crate) fn new(interval: Duration, sleeper: Arc<dyn Sleeper>) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                paused_until: None,
                last_dequeue: None,
            }),
            notify: Notify::new(),
            interval,
            sleeper,
        });
        tokio::spawn(dequeue_loop(Arc::downgrade(&shared)));
        Self { shared }
    }

    /// Enqueue a job. `front` prepends within the list (used for retry
    /// resubmission); otherwise the job is appended.
    pub(crate) fn push(&self, job: Job, high_priority: bool, front: bool) {
        let len = {
            let mut state = self.shared.state.lock().expect("task queue poisoned");
            let item = QueueItem { job, high_priority };
            if front {
                state.items.push_front(item);
            } else {
                state.items.push_back(item);
            }
            state.items.len()
        };
        debug!(target: "quotagate::queue", len, high_priority, front, "task queued");
        // Wakes the loop so an idle queue dequeues immediately instead of
        // waiting out a full interval.
        self.shared.notify.notify_one();
    }

    /// Stop dequeuing until `deadline`, then resume automatically.
    ///
    /// Idempotent: calling while already paused is a no-op, so the earliest
    /// requested deadline wins.
    pub fn pause_until(&self, deadline: Instant) {
        {
            let mut state = self.shared.state.lock().expect("task queue poisoned");
            if state.paused_until.is_some() {
                return;
            }
            state.paused_until = Some(deadline);
        }
        debug!(target: "quotagate::queue", "queue paused");
        self.shared.notify.notify_one();
    }

    /// Synchronously fail every currently-queued item with `rejection` and
    /// empty the list. The item currently executing (if any) is unaffected,
    /// as are items pushed after this call.
    pub fn reject_all(&self, rejection: Rejection) {
        let drained: Vec<QueueItem> = {
            let mut state = self.shared.state.lock().expect("task queue poisoned");
            state.items.drain(..).collect()
        };
        debug!(target: "quotagate::queue", count = drained.len(), "rejecting queued tasks");
        for item in drained {
            // Reject settles synchronously and returns no future.
            let _ = (item.job)(Verdict::Reject(rejection.clone()));
        }
    }

    /// Number of items currently queued.
    pub fn len(&self) -> usize {
        self.shared.state.lock().expect("task queue poisoned").items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the queue is currently paused.
    pub fn is_paused(&self) -> bool {
        self.shared.state.lock().expect("task queue poisoned").paused_until.is_some()
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        // Wake the loop so it notices the handle is gone and exits.
        self.shared.notify.notify_one();
    }
}

enum Step {
    Run(QueueItem),
    Wait(Duration),
    Idle,
}

async fn dequeue_loop(weak: Weak<Shared>) {
    loop {
        let Some(shared) = weak.upgrade() else { return };
        let now = Instant::now();
        let step = {
            let mut state = shared.state.lock().expect("task queue poisoned");
            match state.paused_until {
                Some(until) if now < until => Step::Wait(until - now),
                Some(_) => {
                    // Pause elapsed; clear it and re-check immediately so a
                    // waiting item is dequeued without extra slack.
                    state.paused_until = None;
                    Step::Wait(Duration::ZERO)
                }
                None if state.items.is_empty() => Step::Idle,
                None => {
                    let due = state
                        .last_dequeue
                        .map(|last| last + shared.interval)
                        .unwrap_or(now);
                    if now >= due {
                        let item = pop_next(&mut state.items);
                        state.last_dequeue = Some(now);
                        Step::Run(item)
                    } else {
                        Step::Wait(due - now)
                    }
                }
            }
        };
        match step {
            Step::Run(item) => {
                debug!(target: "quotagate::queue", high_priority = item.high_priority, "task dequeued");
                // Run outside the lock and off this loop, so pacing of the
                // next dequeue is independent of task duration.
                if let Some(fut) = (item.job)(Verdict::Execute) {
                    tokio::spawn(fut);
                }
            }
            Step::Wait(duration) => {
                let sleep = shared.sleeper.sleep(duration);
                let wake = shared.notify.notified();
                tokio::select! {
                    _ = sleep => {}
                    _ = wake => {}
                }
            }
            Step::Idle => {
                shared.notify.notified().await;
            }
        }
    }
}

/// First high-priority item scanning from the head, else the head item.
fn pop_next(items: &mut VecDeque<QueueItem>) -> QueueItem {
    let idx = items.iter().position(|item| item.high_priority).unwrap_or(0);
    items.remove(idx).expect("pop_next called on empty queue")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sleeper::TokioSleeper;
    use std::sync::Mutex as StdMutex;
    use tokio::time::{advance, Instant};

    fn queue(interval_ms: u64) -> TaskQueue {
        TaskQueue::new(Duration::from_millis(interval_ms), Arc::new(TokioSleeper))
    }

    /// Submit a task that records `label` into `log` when it runs.
    fn labelled(
        queue: &TaskQueue,
        log: &Arc<StdMutex<Vec<&'static str>>>,
        label: &'static str,
        high_priority: bool,
        front: bool,
    ) -> oneshot::Receiver<Result<&'static str, Rejection>> {
        let log = log.clone();
        let (job, rx) = settled_job(move || async move {
            log.lock().unwrap().push(label);
            label
        });
        queue.push(job, high_priority, front);
        rx
    }

    #[tokio::test(start_paused = true)]
    async fn dequeues_high_priority_first_then_fifo() {
        let q = queue(10);
        let log = Arc::new(StdMutex::new(Vec::new()));

        // Pause so all three are queued before the first dequeue decision.
        q.pause_until(Instant::now() + Duration::from_millis(50));
        let low1 = labelled(&q, &log, "low1", false, false);
        let low2 = labelled(&q, &log, "low2", false, false);
        let high1 = labelled(&q, &log, "high1", true, false);

        for rx in [low1, low2, high1] {
            rx.await.unwrap().unwrap();
        }
        assert_eq!(*log.lock().unwrap(), vec!["high1", "low1", "low2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn front_insertion_jumps_its_class() {
        let q = queue(10);
        let log = Arc::new(StdMutex::new(Vec::new()));

        q.pause_until(Instant::now() + Duration::from_millis(50));
        let a = labelled(&q, &log, "a", false, false);
        let b = labelled(&q, &log, "b", false, true);

        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["b", "a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_queue_dequeues_immediately() {
        let q = queue(1_000);
        let log = Arc::new(StdMutex::new(Vec::new()));

        let start = Instant::now();
        let rx = labelled(&q, &log, "only", false, false);
        rx.await.unwrap().unwrap();
        // No full-interval slack for the first item on an idle queue.
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn paces_one_dequeue_per_interval() {
        let q = queue(10);
        let log = Arc::new(StdMutex::new(Vec::new()));

        let start = Instant::now();
        let handles: Vec<_> = (0..10).map(|_| labelled(&q, &log, "x", false, false)).collect();
        for rx in handles {
            rx.await.unwrap().unwrap();
        }
        let elapsed = start.elapsed();
        // 10 items, one immediate + 9 gaps of 10ms.
        assert!(elapsed >= Duration::from_millis(90), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(150), "elapsed {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_defers_execution_until_deadline() {
        let q = queue(1);
        let log = Arc::new(StdMutex::new(Vec::new()));

        let start = Instant::now();
        q.pause_until(Instant::now() + Duration::from_millis(200));
        assert!(q.is_paused());

        let rx = labelled(&q, &log, "after-pause", false, false);
        rx.await.unwrap().unwrap();
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert!(!q.is_paused());
    }

    #[tokio::test(start_paused = true)]
    async fn second_pause_while_paused_is_a_no_op() {
        let q = queue(1);
        let log = Arc::new(StdMutex::new(Vec::new()));

        let start = Instant::now();
        q.pause_until(Instant::now() + Duration::from_millis(100));
        // Longer deadline must not extend the existing pause.
        q.pause_until(Instant::now() + Duration::from_secs(60));

        let rx = labelled(&q, &log, "x", false, false);
        rx.await.unwrap().unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_secs(10), "elapsed {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn reject_all_settles_queued_items_and_empties() {
        let q = queue(10);
        let log = Arc::new(StdMutex::new(Vec::new()));

        q.pause_until(Instant::now() + Duration::from_secs(60));
        let a = labelled(&q, &log, "a", false, false);
        let b = labelled(&q, &log, "b", true, false);
        assert_eq!(q.len(), 2);

        q.reject_all(Rejection::DailyLimit { resets_at: 123 });
        assert!(q.is_empty());
        assert_eq!(a.await.unwrap(), Err(Rejection::DailyLimit { resets_at: 123 }));
        assert_eq!(b.await.unwrap(), Err(Rejection::DailyLimit { resets_at: 123 }));
        assert!(log.lock().unwrap().is_empty(), "rejected tasks must not run");
    }

    #[tokio::test(start_paused = true)]
    async fn items_pushed_after_reject_all_still_run() {
        let q = queue(1);
        let log = Arc::new(StdMutex::new(Vec::new()));

        q.reject_all(Rejection::DailyLimit { resets_at: 0 });
        let rx = labelled(&q, &log, "late", false, false);
        assert_eq!(rx.await.unwrap().unwrap(), "late");
    }

    #[tokio::test(start_paused = true)]
    async fn a_failing_task_does_not_stop_the_queue() {
        let q = queue(1);

        let (job, rx1) = settled_job(|| async { Err::<(), &str>("task blew up") });
        q.push(job, false, false);
        assert_eq!(rx1.await.unwrap().unwrap(), Err("task blew up"));

        let log = Arc::new(StdMutex::new(Vec::new()));
        let rx2 = labelled(&q, &log, "survivor", false, false);
        assert_eq!(rx2.await.unwrap().unwrap(), "survivor");
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_queue_settles_pending_items_as_closed() {
        let q = queue(10);
        q.pause_until(Instant::now() + Duration::from_secs(60));
        let (job, rx) = settled_job(|| async { 1u32 });
        q.push(job, false, false);

        drop(q);
        // The loop exits and drops the item; the sender side of the oneshot
        // goes away without a value.
        advance(Duration::from_millis(10)).await;
        assert!(rx.await.is_err());
    }
}
