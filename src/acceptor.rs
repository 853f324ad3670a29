//! Listening socket wrapper that hands accepted streams to its owner.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{error, info, warn};
use mio::net::{TcpListener, TcpStream};

use crate::error::Result;
use crate::event_loop::LoopHandle;
use crate::event_source::EventSource;

/// Receives each accepted stream with its peer address. The acceptor has
/// already put the stream in non-blocking mode.
pub type NewConnectionCallback = Arc<dyn Fn(TcpStream, SocketAddr) + Send + Sync>;

pub struct Acceptor {
    owner_loop: Arc<LoopHandle>,
    listener: Mutex<TcpListener>,
    source: Arc<EventSource>,
    new_connection_cb: Mutex<Option<NewConnectionCallback>>,
    listening: AtomicBool,
    local_addr: SocketAddr,
}

impl Acceptor {
    /// Binds `addr` immediately; accepting starts with [`listen`](Self::listen).
    pub fn new(owner_loop: Arc<LoopHandle>, addr: SocketAddr) -> Result<Arc<Self>> {
        use std::os::fd::AsRawFd;
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        let source = EventSource::new(Arc::clone(&owner_loop), listener.as_raw_fd());

        let acceptor = Arc::new(Acceptor {
            owner_loop,
            listener: Mutex::new(listener),
            source: Arc::clone(&source),
            new_connection_cb: Mutex::new(None),
            listening: AtomicBool::new(false),
            local_addr,
        });

        let weak = Arc::downgrade(&acceptor);
        source.set_read_callback(Arc::new(move |_at| {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.handle_read();
            }
        }));
        Ok(acceptor)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    pub fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        *self.new_connection_cb.lock().unwrap() = Some(cb);
    }

    /// Starts accepting. Must run on the owning loop's thread.
    pub fn listen(self: &Arc<Self>) {
        debug_assert!(self.owner_loop.is_in_loop_thread());
        self.listening.store(true, Ordering::SeqCst);
        self.source.tie(self);
        self.source.enable_reading();
        info!("listening on {}", self.local_addr);
    }

    fn handle_read(&self) {
        debug_assert!(self.owner_loop.is_in_loop_thread());
        loop {
            let accepted = self.listener.lock().unwrap().accept();
            match accepted {
                Ok((stream, peer_addr)) => {
                    let cb = self.new_connection_cb.lock().unwrap().clone();
                    match cb {
                        Some(cb) => cb(stream, peer_addr),
                        // No owner yet: closing the stream here beats
                        // leaking a descriptor.
                        None => warn!("accepted {} with no callback, dropping", peer_addr),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // EMFILE/ENFILE land here; the listener stays registered
                    // and retries on the next readiness report.
                    error!("accept on {} failed: {}", self.local_addr, e);
                    return;
                }
            }
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.source.disable_all();
        self.source.remove();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn accepts_a_connection_and_reports_the_peer() {
        let mut event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        let acceptor = Acceptor::new(handle.clone(), "127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = acceptor.local_addr();

        let (tx, rx) = mpsc::channel();
        let quitter = handle.clone();
        acceptor.set_new_connection_callback(Arc::new(move |stream, peer| {
            tx.send((stream.peer_addr().unwrap(), peer)).unwrap();
            quitter.quit();
        }));
        acceptor.listen();
        assert!(acceptor.listening());

        let client = thread::spawn(move || {
            let stream = std::net::TcpStream::connect(addr).unwrap();
            // Hold the socket open until the loop has seen it.
            thread::sleep(Duration::from_millis(200));
            drop(stream);
        });

        event_loop.run();
        let (reported, peer) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(reported, peer);
        client.join().unwrap();
    }

    #[test]
    fn bind_failure_surfaces_as_an_error() {
        let event_loop = EventLoop::new().unwrap();
        let first = Acceptor::new(event_loop.handle(), "127.0.0.1:0".parse().unwrap()).unwrap();
        let taken = first.local_addr();
        assert!(Acceptor::new(event_loop.handle(), taken).is_err());
    }
}
