//! Readiness multiplexer: the abstraction over the OS polling facility and
//! its one concrete backend built on [`mio::Poll`].
//!
//! The multiplexer owns a non-owning token→source map with a per-source
//! registration tag, so rapid enable/disable cycles on one descriptor do not
//! churn the OS interest table: a source whose interest drops to empty is
//! removed from the OS but kept as an inactive bookkeeping entry.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use log::{debug, error, trace, warn};
use mio::event::Event;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};

use crate::error::Result;
use crate::event_source::EventSource;

/// Reserved token for the self-wakeup primitive; never maps to a source.
pub(crate) const WAKE_TOKEN: Token = Token(usize::MAX);

const INITIAL_EVENTS_CAPACITY: usize = 64;

/// Readiness flags reported for one source, decoupled from the backend's
/// event representation.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ready {
    pub readable: bool,
    pub writable: bool,
    pub closed: bool,
    pub error: bool,
    pub priority: bool,
}

impl From<&Event> for Ready {
    fn from(event: &Event) -> Self {
        Ready {
            readable: event.is_readable(),
            writable: event.is_writable(),
            closed: event.is_read_closed() && event.is_write_closed(),
            error: event.is_error(),
            priority: event.is_priority(),
        }
    }
}

/// Sources reported ready by one wait, in backend return order.
pub type ReadyList = Vec<(Arc<EventSource>, Ready)>;

/// Interface to a readiness backend. One concrete implementation is chosen
/// at loop construction via [`new_default_multiplexer`]; calls are never
/// dispatched per-operation on anything else.
pub trait Multiplexer: Send + Sync {
    /// Blocks until readiness, timeout or interruption (interruption counts
    /// as zero events). Fills `ready` and returns the completion timestamp.
    /// Only the owning loop's thread may call this.
    fn wait(&self, timeout: Duration, ready: &mut ReadyList) -> Instant;

    /// Pushes the source's current interest to the OS, inserting or
    /// deactivating its bookkeeping entry as needed. Add/modify failure is
    /// fatal; only the owning loop's thread may call this.
    fn update_source(&self, source: &Arc<EventSource>);

    /// Erases the source's bookkeeping entry, removing it from the OS if
    /// still registered. The source's interest must already be empty.
    /// Removing an unknown source is a no-op.
    fn remove_source(&self, source: &EventSource);

    /// Whether the source currently has a bookkeeping entry.
    fn has_source(&self, source: &EventSource) -> bool;

    /// Cuts a concurrent `wait` short from any thread.
    fn wake(&self);
}

/// Builds the default backend for this platform.
pub fn new_default_multiplexer() -> Result<Arc<dyn Multiplexer>> {
    Ok(Arc::new(PollMultiplexer::new()?))
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum RegState {
    /// Registered with the OS.
    Active,
    /// Known to the map but removed from the OS (empty interest).
    Inactive,
}

struct SourceEntry {
    source: Weak<EventSource>,
    state: RegState,
}

/// Backend over `mio::Poll` (epoll on Linux). The poll handle and event
/// buffer are locked, but only the owning loop's thread ever takes those
/// locks; registration goes through a cloned registry handle and the
/// token→source map.
pub struct PollMultiplexer {
    poll: Mutex<Poll>,
    events: Mutex<Events>,
    registry: Registry,
    waker: Waker,
    sources: Mutex<HashMap<Token, SourceEntry>>,
}

impl PollMultiplexer {
    pub fn new() -> Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        Ok(PollMultiplexer {
            poll: Mutex::new(poll),
            events: Mutex::new(Events::with_capacity(INITIAL_EVENTS_CAPACITY)),
            registry,
            waker,
            sources: Mutex::new(HashMap::new()),
        })
    }

    fn register_os(&self, source: &EventSource, interest: Interest) {
        let fd = source.fd();
        if let Err(e) = self
            .registry
            .register(&mut SourceFd(&fd), source.token(), interest)
        {
            error!("multiplexer add failed for fd {}: {}", fd, e);
            panic!("multiplexer add failed: {}", e);
        }
    }

    fn reregister_os(&self, source: &EventSource, interest: Interest) {
        let fd = source.fd();
        if let Err(e) = self
            .registry
            .reregister(&mut SourceFd(&fd), source.token(), interest)
        {
            error!("multiplexer modify failed for fd {}: {}", fd, e);
            panic!("multiplexer modify failed: {}", e);
        }
    }

    fn deregister_os(&self, source: &EventSource) {
        let fd = source.fd();
        if let Err(e) = self.registry.deregister(&mut SourceFd(&fd)) {
            warn!("multiplexer delete failed for fd {}: {}", fd, e);
        }
    }
}

fn to_interest(reading: bool, writing: bool) -> Option<Interest> {
    match (reading, writing) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

impl Multiplexer for PollMultiplexer {
    fn wait(&self, timeout: Duration, ready: &mut ReadyList) -> Instant {
        let mut events = self.events.lock().unwrap();
        {
            let mut poll = self.poll.lock().unwrap();
            if let Err(e) = poll.poll(&mut events, Some(timeout)) {
                if e.kind() != io::ErrorKind::Interrupted {
                    error!("multiplexer wait failed: {}", e);
                }
                return Instant::now();
            }
        }
        let now = Instant::now();

        let count = events.iter().count();
        {
            let sources = self.sources.lock().unwrap();
            for event in events.iter() {
                if event.token() == WAKE_TOKEN {
                    // The waker needs no drain; consume the notification.
                    continue;
                }
                if let Some(entry) = sources.get(&event.token()) {
                    if let Some(source) = entry.source.upgrade() {
                        ready.push((source, Ready::from(event)));
                    }
                }
            }
        }

        // A completely filled buffer signals under-provisioning.
        if count == events.capacity() {
            let doubled = events.capacity() * 2;
            debug!("event buffer filled, growing to {}", doubled);
            *events = Events::with_capacity(doubled);
        }
        now
    }

    fn update_source(&self, source: &Arc<EventSource>) {
        let interest = to_interest(source.is_reading(), source.is_writing());
        let mut sources = self.sources.lock().unwrap();
        match sources.entry(source.token()) {
            Entry::Vacant(vacant) => {
                let state = match interest {
                    Some(interest) => {
                        self.register_os(source, interest);
                        RegState::Active
                    }
                    None => RegState::Inactive,
                };
                vacant.insert(SourceEntry {
                    source: Arc::downgrade(source),
                    state,
                });
            }
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.source = Arc::downgrade(source);
                match (entry.state, interest) {
                    (RegState::Active, None) => {
                        self.deregister_os(source);
                        entry.state = RegState::Inactive;
                    }
                    (RegState::Active, Some(interest)) => {
                        self.reregister_os(source, interest);
                    }
                    (RegState::Inactive, Some(interest)) => {
                        self.register_os(source, interest);
                        entry.state = RegState::Active;
                    }
                    (RegState::Inactive, None) => {}
                }
            }
        }
    }

    fn remove_source(&self, source: &EventSource) {
        debug_assert!(source.is_none_interest());
        let mut sources = self.sources.lock().unwrap();
        match sources.remove(&source.token()) {
            Some(entry) => {
                if entry.state == RegState::Active {
                    self.deregister_os(source);
                }
            }
            None => trace!("remove of unknown source fd {}", source.fd()),
        }
    }

    fn has_source(&self, source: &EventSource) -> bool {
        self.sources.lock().unwrap().contains_key(&source.token())
    }

    fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            warn!("wakeup write failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn wait_times_out_with_nothing_registered() {
        let poller = PollMultiplexer::new().unwrap();
        let mut ready = ReadyList::new();
        let start = Instant::now();
        poller.wait(Duration::from_millis(50), &mut ready);
        assert!(ready.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn wake_cuts_wait_short() {
        let poller = Arc::new(PollMultiplexer::new().unwrap());
        let waker_side = Arc::clone(&poller);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            waker_side.wake();
        });

        let mut ready = ReadyList::new();
        let start = Instant::now();
        poller.wait(Duration::from_secs(10), &mut ready);
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(ready.is_empty());
        handle.join().unwrap();
    }
}
