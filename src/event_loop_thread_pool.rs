//! `EventLoopThreadPool`: the "thread pool" half of "one loop per thread
//! + thread pool". Owns zero or more `EventLoopThread`s and hands out their
//! handles round-robin.
//!
//! With `num_threads == 0`, `next_loop()` returns the base loop's own
//! handle, matching the original's single-threaded fallback (all work runs
//! on the one loop that also accepts connections).

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::callbacks::ThreadInitCallback;
use crate::event_loop::EventLoopHandle;
use crate::event_loop_thread::EventLoopThread;

pub struct EventLoopThreadPool {
    base_loop: EventLoopHandle,
    name: String,
    threads: Vec<EventLoopThread>,
    next: AtomicUsize,
}

impl EventLoopThreadPool {
    pub fn new(base_loop: EventLoopHandle, name: String) -> EventLoopThreadPool {
        EventLoopThreadPool {
            base_loop,
            name,
            threads: Vec::new(),
            next: AtomicUsize::new(0),
        }
    }

    /// Spawns `num_threads` worker loops, running `thread_init_cb` (if
    /// any) on each right after its `EventLoop` is constructed.
    pub fn start(&mut self, num_threads: usize, thread_init_cb: Option<ThreadInitCallback>) {
        assert!(self.threads.is_empty(), "EventLoopThreadPool::start called twice");
        for i in 0..num_threads {
            let thread_name = format!("{}-{}", self.name, i);
            self.threads.push(EventLoopThread::new(thread_init_cb.clone(), thread_name));
        }
    }

    /// Returns the next worker loop's handle in round-robin order, or the
    /// base loop's handle if the pool has no worker threads.
    pub fn next_loop(&self) -> EventLoopHandle {
        if self.threads.is_empty() {
            return self.base_loop.clone();
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.threads.len();
        self.threads[i].handle()
    }

    pub fn all_loops(&self) -> Vec<EventLoopHandle> {
        if self.threads.is_empty() {
            vec![self.base_loop.clone()]
        } else {
            self.threads.iter().map(|t| t.handle()).collect()
        }
    }

    pub fn num_threads(&self) -> usize {
        self.threads.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;

    #[test]
    fn round_robins_across_threads() {
        let event_loop = EventLoop::new().unwrap();
        let mut pool = EventLoopThreadPool::new(event_loop.handle(), "test-pool".to_string());
        pool.start(3, None);

        let a = pool.next_loop();
        let b = pool.next_loop();
        let c = pool.next_loop();
        let d = pool.next_loop();
        assert!(!a.is_in_loop_thread() || !b.is_in_loop_thread());
        let _ = (c, d);
    }

    #[test]
    fn falls_back_to_base_loop_with_no_threads() {
        let event_loop = EventLoop::new().unwrap();
        let pool = EventLoopThreadPool::new(event_loop.handle(), "test-pool".to_string());
        assert!(pool.next_loop().is_in_loop_thread());
    }
}
