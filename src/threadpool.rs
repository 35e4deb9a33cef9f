use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

type Task = Box<dyn FnOnce() + Send + 'static>;

struct State {
    tasks: VecDeque<Task>,
    closed: bool,
}

struct Inner {
    state: Mutex<State>,
    cond: Condvar,
}

/// Fixed-size pool of worker threads consuming a shared FIFO task queue.
///
/// Dropping the pool closes the queue, wakes every worker, lets them
/// drain the remaining tasks, and joins the threads. No task outlives
/// the pool.
pub struct ThreadPool {
    inner: Arc<Inner>,
    handles: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    pub fn new(threads: usize) -> Self {
        assert!(threads > 0);
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                tasks: VecDeque::new(),
                closed: false,
            }),
            cond: Condvar::new(),
        });

        let mut handles = Vec::with_capacity(threads);
        for i in 0..threads {
            let inner = inner.clone();
            let handle = thread::Builder::new()
                .name(format!("breakwater-worker-{i}"))
                .spawn(move || {
                    let mut state = inner.state.lock().unwrap();
                    loop {
                        if let Some(task) = state.tasks.pop_front() {
                            drop(state);
                            task();
                            state = inner.state.lock().unwrap();
                        } else if state.closed {
                            break;
                        } else {
                            state = inner.cond.wait(state).unwrap();
                        }
                    }
                })
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }

        Self { inner, handles }
    }

    /// Enqueue a task and wake one worker. Tasks run exactly once, FIFO
    /// among tasks that become runnable under a single consumer.
    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.tasks.push_back(Box::new(task));
        }
        self.inner.cond.notify_one();
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.closed = true;
        }
        self.inner.cond.notify_all();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn every_task_runs_exactly_once() {
        let ran: Arc<Vec<AtomicUsize>> =
            Arc::new((0..10_000).map(|_| AtomicUsize::new(0)).collect());
        {
            let pool = ThreadPool::new(8);
            for i in 0..10_000 {
                let ran = ran.clone();
                pool.submit(move || {
                    ran[i].fetch_add(1, Ordering::SeqCst);
                });
            }
            // Drop drains the queue before joining.
        }
        for (i, slot) in ran.iter().enumerate() {
            assert_eq!(slot.load(Ordering::SeqCst), 1, "task {i} ran a wrong number of times");
        }
    }

    #[test]
    fn single_worker_preserves_fifo_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        {
            let pool = ThreadPool::new(1);
            for i in 0..256 {
                let order = order.clone();
                pool.submit(move || order.lock().unwrap().push(i));
            }
        }
        let order = order.lock().unwrap();
        assert_eq!(*order, (0..256).collect::<Vec<_>>());
    }

    #[test]
    fn drop_joins_workers_mid_task() {
        let started = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        {
            let pool = ThreadPool::new(2);
            for _ in 0..4 {
                let started = started.clone();
                let finished = finished.clone();
                pool.submit(move || {
                    started.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(std::time::Duration::from_millis(10));
                    finished.fetch_add(1, Ordering::SeqCst);
                });
            }
        }
        assert_eq!(started.load(Ordering::SeqCst), 4);
        assert_eq!(finished.load(Ordering::SeqCst), 4);
    }
}
