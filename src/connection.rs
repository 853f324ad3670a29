//! Buffered TCP connection driven by its owning loop.
//!
//! All I/O and state transitions run on the owning loop's thread; the only
//! cross-thread entry points are [`TcpConnection::send`] and
//! [`TcpConnection::shutdown`], which marshal themselves over. Lock order
//! within a connection is buffer before stream, and neither is ever held
//! across a user callback.

use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use log::{debug, error, trace, warn};
use mio::net::TcpStream;

use crate::buffer::Buffer;
use crate::event_loop::LoopHandle;
use crate::event_source::EventSource;

pub type ConnectionCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
pub type MessageCallback = Arc<dyn Fn(&Arc<TcpConnection>, &mut Buffer, Instant) + Send + Sync>;
pub type WriteCompleteCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
pub type HighWaterMarkCallback = Arc<dyn Fn(&Arc<TcpConnection>, usize) + Send + Sync>;
pub type CloseCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

pub const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

pub struct TcpConnection {
    owner_loop: Arc<LoopHandle>,
    name: String,
    state: AtomicU8,
    stream: Mutex<TcpStream>,
    source: Arc<EventSource>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    input: Mutex<Buffer>,
    output: Mutex<Buffer>,
    high_water_mark: AtomicUsize,
    connection_cb: Mutex<Option<ConnectionCallback>>,
    message_cb: Mutex<Option<MessageCallback>>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback>>,
    high_water_cb: Mutex<Option<HighWaterMarkCallback>>,
    close_cb: Mutex<Option<CloseCallback>>,
    weak_self: Weak<TcpConnection>,
}

impl TcpConnection {
    /// Wraps an already-connected non-blocking stream. The connection starts
    /// in `Connecting`; nothing is registered with the loop until
    /// [`established`](Self::established) runs there.
    pub fn new(
        owner_loop: Arc<LoopHandle>,
        name: impl Into<String>,
        stream: TcpStream,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> Arc<Self> {
        use std::os::fd::AsRawFd;
        let fd = stream.as_raw_fd();
        let source = EventSource::new(Arc::clone(&owner_loop), fd);

        let conn = Arc::new_cyclic(|weak_self: &Weak<TcpConnection>| TcpConnection {
            owner_loop,
            name: name.into(),
            state: AtomicU8::new(ConnState::Connecting as u8),
            stream: Mutex::new(stream),
            source: Arc::clone(&source),
            local_addr,
            peer_addr,
            input: Mutex::new(Buffer::new()),
            output: Mutex::new(Buffer::new()),
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
            connection_cb: Mutex::new(None),
            message_cb: Mutex::new(None),
            write_complete_cb: Mutex::new(None),
            high_water_cb: Mutex::new(None),
            close_cb: Mutex::new(None),
            weak_self: weak_self.clone(),
        });

        let weak = Arc::downgrade(&conn);
        source.set_read_callback(Arc::new({
            let weak = weak.clone();
            move |at| {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_read(at);
                }
            }
        }));
        source.set_write_callback(Arc::new({
            let weak = weak.clone();
            move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_write();
                }
            }
        }));
        source.set_close_callback(Arc::new({
            let weak = weak.clone();
            move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_close();
                }
            }
        }));
        source.set_error_callback(Arc::new(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_error();
            }
        }));
        conn
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner_loop(&self) -> &Arc<LoopHandle> {
        &self.owner_loop
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn state(&self) -> ConnState {
        match self.state.load(Ordering::SeqCst) {
            0 => ConnState::Connecting,
            1 => ConnState::Connected,
            2 => ConnState::Disconnecting,
            _ => ConnState::Disconnected,
        }
    }

    pub fn connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    pub fn disconnected(&self) -> bool {
        self.state() == ConnState::Disconnected
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.connection_cb.lock().unwrap() = Some(cb);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        *self.message_cb.lock().unwrap() = Some(cb);
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        *self.write_complete_cb.lock().unwrap() = Some(cb);
    }

    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback, mark: usize) {
        *self.high_water_cb.lock().unwrap() = Some(cb);
        self.high_water_mark.store(mark, Ordering::SeqCst);
    }

    pub fn set_close_callback(&self, cb: CloseCallback) {
        *self.close_cb.lock().unwrap() = Some(cb);
    }

    pub fn set_nodelay(&self, on: bool) {
        if let Err(e) = self.stream.lock().unwrap().set_nodelay(on) {
            warn!("{}: set_nodelay failed: {}", self.name, e);
        }
    }

    /// Queues `data` for delivery. Callable from any thread; off the loop
    /// thread the bytes are copied and the write marshaled over.
    pub fn send(&self, data: &[u8]) {
        if self.state() == ConnState::Disconnected {
            return;
        }
        if self.owner_loop.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let owned = data.to_vec();
            let weak = self.weak_self.clone();
            self.owner_loop.run_in_loop(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.send_in_loop(&owned);
                }
            });
        }
    }

    fn send_in_loop(&self, data: &[u8]) {
        debug_assert!(self.owner_loop.is_in_loop_thread());
        if self.state() == ConnState::Disconnected {
            warn!("{}: disconnected, dropping {} bytes", self.name, data.len());
            return;
        }

        let mut written = 0usize;
        let mut fault = false;

        // Try the socket directly only when nothing is queued ahead of this
        // write, so bytes never reorder.
        let output_empty = self.output.lock().unwrap().readable_bytes() == 0;
        if !self.source.is_writing() && output_empty && !data.is_empty() {
            let stream = self.stream.lock().unwrap();
            match io::Write::write(&mut &*stream, data) {
                Ok(n) => written = n,
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    error!("{}: write failed: {}", self.name, e);
                    if e.kind() == io::ErrorKind::BrokenPipe
                        || e.kind() == io::ErrorKind::ConnectionReset
                    {
                        fault = true;
                    }
                }
            }
        }

        if fault {
            let weak = self.weak_self.clone();
            self.owner_loop.queue_in_loop(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_close();
                }
            });
            return;
        }

        if written == data.len() {
            self.queue_write_complete();
            return;
        }

        let remaining = data.len() - written;
        {
            let mut output = self.output.lock().unwrap();
            let old_len = output.readable_bytes();
            let mark = self.high_water_mark.load(Ordering::SeqCst);
            // Fires on the rising edge only; re-arms once the queue drains
            // back below the mark.
            if old_len < mark && old_len + remaining >= mark {
                self.queue_high_water(old_len + remaining);
            }
            output.append(&data[written..]);
        }
        if !self.source.is_writing() {
            self.source.enable_writing();
        }
    }

    /// Half-closes the write side once the output queue drains. Callable
    /// from any thread.
    pub fn shutdown(&self) {
        if self.state() == ConnState::Connected {
            self.state
                .store(ConnState::Disconnecting as u8, Ordering::SeqCst);
            let weak = self.weak_self.clone();
            self.owner_loop.run_in_loop(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.shutdown_in_loop();
                }
            });
        }
    }

    fn shutdown_in_loop(&self) {
        debug_assert!(self.owner_loop.is_in_loop_thread());
        // Still flushing: handle_write re-runs this after the queue empties.
        if !self.source.is_writing() {
            let stream = self.stream.lock().unwrap();
            if let Err(e) = stream.shutdown(Shutdown::Write) {
                warn!("{}: shutdown failed: {}", self.name, e);
            }
        }
    }

    /// Completes setup on the loop thread: ties the source's dispatch to
    /// this connection, starts reading and fires the connection callback.
    /// Only a `Connecting` connection transitions; anything later (a close
    /// that raced ahead) makes this a no-op.
    pub fn established(self: &Arc<Self>) {
        debug_assert!(self.owner_loop.is_in_loop_thread());
        if self
            .state
            .compare_exchange(
                ConnState::Connecting as u8,
                ConnState::Connected as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return;
        }
        self.source.tie(self);
        self.source.enable_reading();
        if let Some(cb) = self.connection_cb.lock().unwrap().clone() {
            cb(self);
        }
    }

    /// Final teardown on the loop thread. Normally runs after `handle_close`
    /// already transitioned the state; the `Connected` branch covers a
    /// server dropping connections that never saw a close event.
    pub fn destroyed(self: &Arc<Self>) {
        debug_assert!(self.owner_loop.is_in_loop_thread());
        if self
            .state
            .compare_exchange(
                ConnState::Connected as u8,
                ConnState::Disconnected as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            self.source.disable_all();
            if let Some(cb) = self.connection_cb.lock().unwrap().clone() {
                cb(self);
            }
        }
        self.source.remove();
    }

    fn handle_read(&self, at: Instant) {
        debug_assert!(self.owner_loop.is_in_loop_thread());
        // Edge-style drain: keep reading until the socket is dry, surfacing
        // each chunk to the message callback as it lands.
        loop {
            let result = {
                let mut input = self.input.lock().unwrap();
                let stream = self.stream.lock().unwrap();
                input.read_from(&mut &*stream)
            };
            match result {
                Ok(0) => {
                    self.handle_close();
                    return;
                }
                Ok(_) => {
                    let cb = self.message_cb.lock().unwrap().clone();
                    if let Some(conn) = self.weak_self.upgrade() {
                        let mut input = self.input.lock().unwrap();
                        match &cb {
                            Some(cb) => cb(&conn, &mut input, at),
                            None => input.consume_all(),
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("{}: read failed: {}", self.name, e);
                    self.handle_error();
                    return;
                }
            }
        }
    }

    fn handle_write(&self) {
        debug_assert!(self.owner_loop.is_in_loop_thread());
        if !self.source.is_writing() {
            trace!("{}: writable but writing disabled", self.name);
            return;
        }
        loop {
            let result = {
                let output = self.output.lock().unwrap();
                if output.readable_bytes() == 0 {
                    break;
                }
                let stream = self.stream.lock().unwrap();
                io::Write::write(&mut &*stream, output.peek())
            };
            match result {
                Ok(n) => {
                    let drained = {
                        let mut output = self.output.lock().unwrap();
                        output.consume(n);
                        output.readable_bytes() == 0
                    };
                    if drained {
                        self.source.disable_writing();
                        self.queue_write_complete();
                        if self.state() == ConnState::Disconnecting {
                            self.shutdown_in_loop();
                        }
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("{}: write failed: {}", self.name, e);
                    return;
                }
            }
        }
    }

    fn handle_close(&self) {
        debug_assert!(self.owner_loop.is_in_loop_thread());
        if self.state() == ConnState::Disconnected {
            return;
        }
        debug!("{}: closing in state {:?}", self.name, self.state());
        self.state
            .store(ConnState::Disconnected as u8, Ordering::SeqCst);
        self.source.disable_all();

        if let Some(conn) = self.weak_self.upgrade() {
            if let Some(cb) = self.connection_cb.lock().unwrap().clone() {
                cb(&conn);
            }
            // Owner's hook last; typically unregisters and schedules
            // `destroyed`.
            if let Some(cb) = self.close_cb.lock().unwrap().clone() {
                cb(&conn);
            }
        }
    }

    fn handle_error(&self) {
        let err = self.stream.lock().unwrap().take_error();
        match err {
            Ok(Some(e)) => error!("{}: socket error: {}", self.name, e),
            Ok(None) => error!("{}: socket error event with no pending error", self.name),
            Err(e) => error!("{}: could not fetch socket error: {}", self.name, e),
        }
    }

    fn queue_write_complete(&self) {
        if let Some(cb) = self.write_complete_cb.lock().unwrap().clone() {
            let weak = self.weak_self.clone();
            self.owner_loop.queue_in_loop(move || {
                if let Some(conn) = weak.upgrade() {
                    cb(&conn);
                }
            });
        }
    }

    fn queue_high_water(&self, queued: usize) {
        if let Some(cb) = self.high_water_cb.lock().unwrap().clone() {
            let weak = self.weak_self.clone();
            self.owner_loop.queue_in_loop(move || {
                if let Some(conn) = weak.upgrade() {
                    cb(&conn, queued);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;
    use crate::loop_thread::LoopThread;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    /// Connected pair: a mio stream for the connection under test plus the
    /// blocking peer end.
    fn socket_pair() -> (TcpStream, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let peer = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();
        (TcpStream::from_std(accepted), peer)
    }

    fn test_connection(owner: Arc<LoopHandle>) -> (Arc<TcpConnection>, std::net::TcpStream) {
        let (stream, peer) = socket_pair();
        let local = stream.local_addr().unwrap();
        let remote = stream.peer_addr().unwrap();
        (
            TcpConnection::new(owner, "test-conn", stream, local, remote),
            peer,
        )
    }

    #[test]
    fn established_after_close_stays_disconnected() {
        let event_loop = EventLoop::new().unwrap();
        let (conn, _peer) = test_connection(event_loop.handle());

        let state_changes = Arc::new(AtomicUsize::new(0));
        let counter = state_changes.clone();
        conn.set_connection_callback(Arc::new(move |_conn| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        conn.handle_close();
        assert!(conn.disconnected());
        assert_eq!(state_changes.load(Ordering::SeqCst), 1);

        conn.established();
        assert!(conn.disconnected());
        assert_eq!(state_changes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn close_is_idempotent() {
        let event_loop = EventLoop::new().unwrap();
        let (conn, _peer) = test_connection(event_loop.handle());

        let closes = Arc::new(AtomicUsize::new(0));
        let counter = closes.clone();
        conn.set_close_callback(Arc::new(move |_conn| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        conn.handle_close();
        conn.handle_close();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn high_water_fires_once_on_the_rising_edge() {
        let mut lt = LoopThread::new("hwm-test", None);
        let handle = lt.start();
        let (conn, _peer) = test_connection(handle.clone());

        let hits = Arc::new(AtomicUsize::new(0));
        let lengths = Arc::new(Mutex::new(Vec::new()));
        let (counter, lens) = (hits.clone(), lengths.clone());
        conn.set_high_water_mark_callback(
            Arc::new(move |_conn, queued| {
                counter.fetch_add(1, Ordering::SeqCst);
                lens.lock().unwrap().push(queued);
            }),
            10,
        );

        let (ack_tx, ack_rx) = mpsc::channel();
        let subject = conn.clone();
        handle.run_in_loop(move || {
            // Pretend a flush is already pending so every chunk buffers.
            subject.source.enable_writing();
            subject.send_in_loop(&[0u8; 8]);
            subject.send_in_loop(&[0u8; 8]); // crosses the mark at 16
            subject.send_in_loop(&[0u8; 8]); // above the mark, must not re-fire
            let done = ack_tx;
            subject
                .owner_loop()
                .queue_in_loop(move || done.send(()).unwrap());
        });

        ack_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(*lengths.lock().unwrap(), vec![16]);
    }

    #[test]
    fn send_while_disconnected_is_dropped() {
        let event_loop = EventLoop::new().unwrap();
        let (conn, mut peer) = test_connection(event_loop.handle());
        conn.handle_close();
        conn.send(b"into the void");

        use std::io::Read;
        peer.set_read_timeout(Some(Duration::from_millis(100))).unwrap();
        let mut sink = [0u8; 16];
        // Nothing was written; the peer read times out (or sees EOF-less
        // silence), never payload.
        assert!(matches!(peer.read(&mut sink), Err(_) | Ok(0)));
    }
}
