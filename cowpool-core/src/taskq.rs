// vim: tw=80
//! A small bounded worker pool.
//!
//! Used for commit-callback dispatch and for leaf I/O completion, where the
//! submitting thread must not run the work inline.

use std::{
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex},
    thread::JoinHandle,
};

use crate::types::{Error, Result};

type Task = Box<dyn FnOnce() + Send + 'static>;

struct TaskqCore {
    queue: VecDeque<Task>,
    active: usize,
    shutdown: bool,
}

struct TaskqInner {
    name: String,
    core: Mutex<TaskqCore>,
    /// Signals workers that work (or shutdown) is available
    work_cv: Condvar,
    /// Signals waiters that the pool has gone idle
    idle_cv: Condvar,
}

pub struct Taskq {
    inner: Arc<TaskqInner>,
    workers: Vec<JoinHandle<()>>,
}

impl Taskq {
    pub fn new(name: &str, nthreads: usize) -> Self {
        assert!(nthreads > 0);
        let inner = Arc::new(TaskqInner {
            name: name.to_owned(),
            core: Mutex::new(TaskqCore {
                queue: VecDeque::new(),
                active: 0,
                shutdown: false,
            }),
            work_cv: Condvar::new(),
            idle_cv: Condvar::new(),
        });
        let workers = (0..nthreads)
            .map(|i| {
                let inner2 = inner.clone();
                std::thread::Builder::new()
                    .name(format!("{name}_{i}"))
                    .spawn(move || Taskq::worker(inner2))
                    .unwrap()
            }).collect();
        Taskq { inner, workers }
    }

    fn worker(inner: Arc<TaskqInner>) {
        let mut core = inner.core.lock().unwrap();
        loop {
            if let Some(task) = core.queue.pop_front() {
                core.active += 1;
                drop(core);
                task();
                core = inner.core.lock().unwrap();
                core.active -= 1;
                if core.active == 0 && core.queue.is_empty() {
                    inner.idle_cv.notify_all();
                }
            } else if core.shutdown {
                break;
            } else {
                core = inner.work_cv.wait(core).unwrap();
            }
        }
    }

    pub fn dispatch<F: FnOnce() + Send + 'static>(&self, f: F) -> Result<()> {
        let mut core = self.inner.core.lock().unwrap();
        if core.shutdown {
            return Err(Error::EAGAIN);
        }
        core.queue.push_back(Box::new(f));
        self.inner.work_cv.notify_one();
        Ok(())
    }

    /// Block until every queued task has finished
    pub fn wait(&self) {
        let mut core = self.inner.core.lock().unwrap();
        while core.active != 0 || !core.queue.is_empty() {
            core = self.inner.idle_cv.wait(core).unwrap();
        }
    }

    /// Finish all queued tasks, then stop and join the workers
    pub fn destroy(mut self) {
        tracing::debug!(name = %self.inner.name, "taskq destroy");
        {
            let mut core = self.inner.core.lock().unwrap();
            core.shutdown = true;
            self.inner.work_cv.notify_all();
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }

    /// Stop accepting work and detach without waiting; the last worker to
    /// finish cleans up.
    pub fn abandon(mut self) {
        tracing::debug!(name = %self.inner.name, "taskq abandon");
        let mut core = self.inner.core.lock().unwrap();
        core.shutdown = true;
        self.inner.work_cv.notify_all();
        drop(core);
        self.workers.clear();
    }
}

impl Drop for Taskq {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            let mut core = self.inner.core.lock().unwrap();
            core.shutdown = true;
            self.inner.work_cv.notify_all();
            drop(core);
            for worker in self.workers.drain(..) {
                let _ = worker.join();
            }
        }
    }
}

// LCOV_EXCL_STOP
