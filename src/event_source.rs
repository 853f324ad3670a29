//! Per-descriptor binding of interest flags to callbacks.
//!
//! An `EventSource` is owned by a higher-level object (a connection or an
//! acceptor) and registered with its loop's multiplexer. Interest mutations
//! are pushed to the multiplexer before the mutating call returns, and only
//! ever happen on the owning loop's thread; dispatch likewise runs there.

use std::any::Any;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use mio::Token;

use crate::event_loop::LoopHandle;
use crate::poller::Ready;

const INTEREST_NONE: u8 = 0;
const INTEREST_READ: u8 = 0b01;
const INTEREST_WRITE: u8 = 0b10;

/// Read callbacks receive the multiplexer's completion timestamp.
pub type ReadCallback = Arc<dyn Fn(Instant) + Send + Sync>;
pub type EventCallback = Arc<dyn Fn() + Send + Sync>;

pub struct EventSource {
    fd: RawFd,
    token: Token,
    owner_loop: Arc<LoopHandle>,
    interest: AtomicU8,
    /// Non-owning liveness guard to the external owner; when set, dispatch
    /// first materializes a strong reference and silently skips everything
    /// if the owner is already gone.
    tie: Mutex<Option<Weak<dyn Any + Send + Sync>>>,
    last_ready: Mutex<Ready>,
    read_cb: Mutex<Option<ReadCallback>>,
    write_cb: Mutex<Option<EventCallback>>,
    close_cb: Mutex<Option<EventCallback>>,
    error_cb: Mutex<Option<EventCallback>>,
    weak_self: Weak<EventSource>,
}

impl EventSource {
    pub fn new(owner_loop: Arc<LoopHandle>, fd: RawFd) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| EventSource {
            fd,
            token: Token(fd as usize),
            owner_loop,
            interest: AtomicU8::new(INTEREST_NONE),
            tie: Mutex::new(None),
            last_ready: Mutex::new(Ready::default()),
            read_cb: Mutex::new(None),
            write_cb: Mutex::new(None),
            close_cb: Mutex::new(None),
            error_cb: Mutex::new(None),
            weak_self: weak_self.clone(),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn owner_loop(&self) -> &Arc<LoopHandle> {
        &self.owner_loop
    }

    pub fn set_read_callback(&self, cb: ReadCallback) {
        *self.read_cb.lock().unwrap() = Some(cb);
    }

    pub fn set_write_callback(&self, cb: EventCallback) {
        *self.write_cb.lock().unwrap() = Some(cb);
    }

    pub fn set_close_callback(&self, cb: EventCallback) {
        *self.close_cb.lock().unwrap() = Some(cb);
    }

    pub fn set_error_callback(&self, cb: EventCallback) {
        *self.error_cb.lock().unwrap() = Some(cb);
    }

    /// Ties this source's dispatch to `owner`'s lifetime without keeping the
    /// owner alive.
    pub fn tie<T: Any + Send + Sync>(&self, owner: &Arc<T>) {
        let weak = Arc::downgrade(owner);
        let weak: Weak<dyn Any + Send + Sync> = weak;
        *self.tie.lock().unwrap() = Some(weak);
    }

    /// Readiness reported by the most recent dispatch, for diagnostics.
    pub fn last_ready(&self) -> Ready {
        *self.last_ready.lock().unwrap()
    }

    pub fn is_reading(&self) -> bool {
        self.interest.load(Ordering::SeqCst) & INTEREST_READ != 0
    }

    pub fn is_writing(&self) -> bool {
        self.interest.load(Ordering::SeqCst) & INTEREST_WRITE != 0
    }

    pub fn is_none_interest(&self) -> bool {
        self.interest.load(Ordering::SeqCst) == INTEREST_NONE
    }

    pub fn enable_reading(&self) {
        self.add_interest(INTEREST_READ);
    }

    pub fn disable_reading(&self) {
        self.clear_interest(INTEREST_READ);
    }

    pub fn enable_writing(&self) {
        self.add_interest(INTEREST_WRITE);
    }

    pub fn disable_writing(&self) {
        self.clear_interest(INTEREST_WRITE);
    }

    pub fn disable_all(&self) {
        let current = self.interest.load(Ordering::SeqCst);
        if current == INTEREST_NONE {
            return;
        }
        self.interest.store(INTEREST_NONE, Ordering::SeqCst);
        self.update();
    }

    /// Erases this source from the multiplexer. Interest must already be
    /// empty; removing twice is a no-op.
    pub fn remove(&self) {
        debug_assert!(self.is_none_interest());
        self.owner_loop.multiplexer().remove_source(self);
    }

    fn add_interest(&self, bit: u8) {
        let current = self.interest.load(Ordering::SeqCst);
        if current & bit != 0 {
            return;
        }
        self.interest.store(current | bit, Ordering::SeqCst);
        self.update();
    }

    fn clear_interest(&self, bit: u8) {
        let current = self.interest.load(Ordering::SeqCst);
        if current & bit == 0 {
            return;
        }
        self.interest.store(current & !bit, Ordering::SeqCst);
        self.update();
    }

    fn update(&self) {
        if let Some(this) = self.weak_self.upgrade() {
            self.owner_loop.multiplexer().update_source(&this);
        }
    }

    /// Invoked by the loop for sources the multiplexer reported ready.
    /// Fixed evaluation order: close (hangup without pending data), error,
    /// read (data or priority data), write. Close before read is what lets
    /// a half-closed peer be detected before a read is attempted.
    pub fn dispatch(&self, ready: Ready, at: Instant) {
        *self.last_ready.lock().unwrap() = ready;
        let guard = self.tie.lock().unwrap().clone();
        match guard {
            Some(tie) => {
                // Owner teardown may have raced a pending notification.
                if let Some(_owner) = tie.upgrade() {
                    self.dispatch_guarded(ready, at);
                }
            }
            None => self.dispatch_guarded(ready, at),
        }
    }

    fn dispatch_guarded(&self, ready: Ready, at: Instant) {
        if ready.closed && !ready.readable {
            if let Some(cb) = self.close_cb.lock().unwrap().clone() {
                cb();
            }
        }
        if ready.error {
            if let Some(cb) = self.error_cb.lock().unwrap().clone() {
                cb();
            }
        }
        if ready.readable || ready.priority {
            if let Some(cb) = self.read_cb.lock().unwrap().clone() {
                cb(at);
            }
        }
        if ready.writable {
            if let Some(cb) = self.write_cb.lock().unwrap().clone() {
                cb();
            }
        }
    }
}
