//! Fixed-size background thread pool.
//!
//! The scene uses one of these for asynchronous BVH builds: tasks are
//! fire-and-forget, and [`ThreadPool::wait`] blocks until the queue is empty
//! and nothing is executing, which the renderer uses as its "scene is ready"
//! barrier. Panicking tasks are contained and their output discarded.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

type Task = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    queue: VecDeque<Task>,
    in_flight: usize,
    shutdown: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    task_ready: Condvar,
    all_idle: Condvar,
}

pub struct ThreadPool {
    shared: Arc<PoolShared>,
    threads: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Spawn a pool with `size` worker threads (at least one).
    pub fn new(size: usize) -> Self {
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                in_flight: 0,
                shutdown: false,
            }),
            task_ready: Condvar::new(),
            all_idle: Condvar::new(),
        });
        let count = size.max(1);
        let mut threads = Vec::with_capacity(count);
        for i in 0..count {
            let shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(format!("fray-pool-{i}"))
                .spawn(move || worker_loop(shared));
            match handle {
                Ok(h) => threads.push(h),
                Err(e) => log::error!("failed to spawn pool thread: {e}"),
            }
        }
        ThreadPool { shared, threads }
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// Queue a task for execution. Tasks queued after shutdown began are
    /// dropped.
    pub fn enqueue<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            log::debug!("pool is shutting down, task dropped");
            return;
        }
        state.queue.push_back(Box::new(task));
        self.shared.task_ready.notify_one();
    }

    /// Block until every queued task has finished executing.
    pub fn wait(&self) {
        let mut state = self.shared.state.lock();
        while !state.queue.is_empty() || state.in_flight > 0 {
            self.shared.all_idle.wait(&mut state);
        }
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    loop {
        let task = {
            let mut state = shared.state.lock();
            loop {
                if let Some(task) = state.queue.pop_front() {
                    state.in_flight += 1;
                    break task;
                }
                if state.shutdown {
                    return;
                }
                shared.task_ready.wait(&mut state);
            }
        };
        if catch_unwind(AssertUnwindSafe(task)).is_err() {
            log::warn!("background task panicked, result discarded");
        }
        let mut state = shared.state.lock();
        state.in_flight -= 1;
        if state.queue.is_empty() && state.in_flight == 0 {
            shared.all_idle.notify_all();
        }
    }
}

impl Drop for ThreadPool {
    /// Drains the remaining queue, then joins the workers.
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.task_ready.notify_all();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}
