//! Serialized task execution with support for delayed tasks.
use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};

pub type Task = Box<dyn FnOnce() + Send>;

/// Capability to run closures on a serialized event loop, now or later.
///
/// Everything posted to one runner executes on the same thread, in post
/// order for immediate tasks. Delayed tasks run no earlier than their
/// deadline and never concurrently with other tasks of the same runner.
pub trait TaskRunner: Send + Sync {
    fn post_task(&self, task: Task);
    fn post_delayed_task(&self, task: Task, delay: Duration);
    fn runs_tasks_on_current_thread(&self) -> bool;
}

/// Closure-friendly sugar over [`TaskRunner`], usable through trait objects.
pub trait TaskRunnerExt {
    fn post<F: FnOnce() + Send + 'static>(&self, f: F);
    fn post_delayed<F: FnOnce() + Send + 'static>(&self, delay: Duration, f: F);
}

impl<T: TaskRunner + ?Sized> TaskRunnerExt for T {
    fn post<F: FnOnce() + Send + 'static>(&self, f: F) {
        self.post_task(Box::new(f));
    }

    fn post_delayed<F: FnOnce() + Send + 'static>(&self, delay: Duration, f: F) {
        self.post_delayed_task(Box::new(f), delay);
    }
}

struct DelayedEntry {
    deadline: Instant,
    seq: u64,
    task: Task,
}

// Ordered by (deadline, seq) so that equal deadlines preserve post order.
impl PartialEq for DelayedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for DelayedEntry {}
impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

#[derive(Default)]
struct Queues {
    immediate: VecDeque<Task>,
    delayed: BinaryHeap<Reverse<DelayedEntry>>,
    next_seq: u64,
    quit: bool,
}

struct Shared {
    queues: Mutex<Queues>,
    cond: Condvar,
}

/// A [`TaskRunner`] backed by one dedicated worker thread.
///
/// Dropping the runner drains nothing: pending tasks that have not started
/// are discarded, the worker is asked to quit and joined.
pub struct ThreadTaskRunner {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
    thread_id: ThreadId,
}

impl ThreadTaskRunner {
    pub fn new(name: &str) -> Self {
        let shared = Arc::new(Shared {
            queues: Mutex::new(Queues::default()),
            cond: Condvar::new(),
        });
        let worker_shared = shared.clone();
        let thread = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || run_loop(&worker_shared))
            .expect("spawning task runner thread");
        let thread_id = thread.thread().id();
        Self {
            shared,
            thread: Some(thread),
            thread_id,
        }
    }
}

fn run_loop(shared: &Shared) {
    let mut queues = shared.queues.lock().unwrap();
    loop {
        let now = Instant::now();
        while let Some(Reverse(entry)) = queues.delayed.peek() {
            if entry.deadline > now {
                break;
            }
            let Reverse(entry) = queues.delayed.pop().unwrap();
            queues.immediate.push_back(entry.task);
        }

        if let Some(task) = queues.immediate.pop_front() {
            drop(queues);
            task();
            queues = shared.queues.lock().unwrap();
            continue;
        }

        if queues.quit {
            return;
        }

        let next_deadline = queues
            .delayed
            .peek()
            .map(|Reverse(entry)| entry.deadline.saturating_duration_since(now));
        queues = match next_deadline {
            Some(timeout) => shared.cond.wait_timeout(queues, timeout).unwrap().0,
            None => shared.cond.wait(queues).unwrap(),
        };
    }
}

impl TaskRunner for ThreadTaskRunner {
    fn post_task(&self, task: Task) {
        let mut queues = self.shared.queues.lock().unwrap();
        queues.immediate.push_back(task);
        drop(queues);
        self.shared.cond.notify_one();
    }

    fn post_delayed_task(&self, task: Task, delay: Duration) {
        let mut queues = self.shared.queues.lock().unwrap();
        let seq = queues.next_seq;
        queues.next_seq += 1;
        queues.delayed.push(Reverse(DelayedEntry {
            deadline: Instant::now() + delay,
            seq,
            task,
        }));
        drop(queues);
        self.shared.cond.notify_one();
    }

    fn runs_tasks_on_current_thread(&self) -> bool {
        std::thread::current().id() == self.thread_id
    }
}

impl Drop for ThreadTaskRunner {
    fn drop(&mut self) {
        {
            let mut queues = self.shared.queues.lock().unwrap();
            queues.quit = true;
        }
        self.shared.cond.notify_one();
        if let Some(handle) = self.thread.take()
            && let Err(e) = handle.join()
        {
            log::error!("task runner thread join failed: {e:?}");
        }
    }
}
