//! Round-robin pool of loop threads fronted by a base loop.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use log::info;

use crate::event_loop::LoopHandle;
use crate::loop_thread::{LoopThread, ThreadInitCallback};

/// Owns `N` worker loop threads and hands out their handles round-robin.
/// With `N == 0` every request falls back to the base loop, so callers never
/// see an absent loop.
pub struct LoopThreadPool {
    base: Arc<LoopHandle>,
    name: String,
    num_threads: usize,
    threads: Vec<LoopThread>,
    loops: Vec<Arc<LoopHandle>>,
    next: AtomicUsize,
    started: AtomicBool,
}

impl LoopThreadPool {
    pub fn new(base: Arc<LoopHandle>, name: impl Into<String>) -> Self {
        LoopThreadPool {
            base,
            name: name.into(),
            num_threads: 0,
            threads: Vec::new(),
            loops: Vec::new(),
            next: AtomicUsize::new(0),
            started: AtomicBool::new(false),
        }
    }

    /// Must be called before [`start`](Self::start).
    pub fn set_thread_count(&mut self, num_threads: usize) {
        debug_assert!(!self.started.load(Ordering::SeqCst));
        self.num_threads = num_threads;
    }

    /// Spawns the worker threads, running `init` on each loop's thread
    /// before it is handed out. With zero workers, `init` runs inline on the
    /// base loop's behalf instead.
    pub fn start(&mut self, init: Option<ThreadInitCallback>) {
        debug_assert!(!self.started.load(Ordering::SeqCst));
        self.started.store(true, Ordering::SeqCst);

        for i in 0..self.num_threads {
            let thread_name = format!("{}-io-{}", self.name, i);
            let mut thread = LoopThread::new(thread_name, init.clone());
            self.loops.push(thread.start());
            self.threads.push(thread);
        }
        info!("pool {} started {} io loops", self.name, self.num_threads);

        if self.num_threads == 0 {
            if let Some(init) = init {
                init(&self.base);
            }
        }
    }

    /// Next loop in rotation, or the base loop when the pool is empty.
    pub fn next_loop(&self) -> Arc<LoopHandle> {
        if self.loops.is_empty() {
            return Arc::clone(&self.base);
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.loops.len();
        Arc::clone(&self.loops[i])
    }

    pub fn all_loops(&self) -> Vec<Arc<LoopHandle>> {
        if self.loops.is_empty() {
            vec![Arc::clone(&self.base)]
        } else {
            self.loops.clone()
        }
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;

    #[test]
    fn empty_pool_hands_out_the_base_loop() {
        let base_loop = EventLoop::new().unwrap();
        let mut pool = LoopThreadPool::new(base_loop.handle(), "empty");
        pool.start(None);
        for _ in 0..3 {
            assert!(Arc::ptr_eq(&pool.next_loop(), &base_loop.handle()));
        }
    }

    #[test]
    fn two_workers_alternate() {
        let base_loop = EventLoop::new().unwrap();
        let mut pool = LoopThreadPool::new(base_loop.handle(), "pair");
        pool.set_thread_count(2);
        pool.start(None);

        let a = pool.next_loop();
        let b = pool.next_loop();
        let a2 = pool.next_loop();
        let b2 = pool.next_loop();
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &a2));
        assert!(Arc::ptr_eq(&b, &b2));
        assert!(!Arc::ptr_eq(&a, &base_loop.handle()));
    }

    #[test]
    fn init_runs_once_per_worker() {
        use std::sync::atomic::AtomicUsize;
        let base_loop = EventLoop::new().unwrap();
        let mut pool = LoopThreadPool::new(base_loop.handle(), "hooked");
        pool.set_thread_count(3);

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        pool.start(Some(Arc::new(move |_handle| {
            counter.fetch_add(1, Ordering::SeqCst);
        })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(pool.all_loops().len(), 3);
    }
}
