//! TCP server: acceptor on the base loop, connections spread over a pool.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{info, warn};
use mio::net::TcpStream;

use crate::acceptor::Acceptor;
use crate::connection::{
    ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnection,
    WriteCompleteCallback, DEFAULT_HIGH_WATER_MARK,
};
use crate::error::{Error, Result};
use crate::event_loop::LoopHandle;
use crate::loop_pool::LoopThreadPool;
use crate::loop_thread::ThreadInitCallback;

/// Server settings, built fluently:
///
/// ```no_run
/// # use millrace::server::ServerConfig;
/// let config = ServerConfig::new("0.0.0.0:7000".parse().unwrap(), "echo")
///     .with_worker_loops(4)
///     .with_no_delay(true);
/// ```
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub name: String,
    pub worker_loops: usize,
    pub no_delay: bool,
    pub high_water_mark: usize,
}

impl ServerConfig {
    pub fn new(addr: SocketAddr, name: impl Into<String>) -> Self {
        ServerConfig {
            addr,
            name: name.into(),
            worker_loops: 0,
            no_delay: false,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
        }
    }

    /// Number of dedicated I/O loops; zero keeps all I/O on the base loop.
    pub fn with_worker_loops(mut self, n: usize) -> Self {
        self.worker_loops = n;
        self
    }

    pub fn with_no_delay(mut self, on: bool) -> Self {
        self.no_delay = on;
        self
    }

    pub fn with_high_water_mark(mut self, mark: usize) -> Self {
        self.high_water_mark = mark;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Configuration("server name must not be empty".into()));
        }
        if self.high_water_mark == 0 {
            return Err(Error::Configuration(
                "high water mark must be positive".into(),
            ));
        }
        Ok(())
    }
}

pub struct TcpServer {
    base: Arc<LoopHandle>,
    name: String,
    ip_port: String,
    no_delay: bool,
    high_water_mark: usize,
    acceptor: Arc<Acceptor>,
    pool: Mutex<LoopThreadPool>,
    connections: Mutex<HashMap<String, Arc<TcpConnection>>>,
    connection_cb: Mutex<Option<ConnectionCallback>>,
    message_cb: Mutex<Option<MessageCallback>>,
    write_complete_cb: Mutex<Option<WriteCompleteCallback>>,
    high_water_cb: Mutex<Option<HighWaterMarkCallback>>,
    thread_init: Mutex<Option<ThreadInitCallback>>,
    next_conn_id: AtomicU64,
    started: AtomicBool,
    weak_self: Weak<TcpServer>,
}

impl TcpServer {
    /// Binds the listening socket immediately; worker threads spawn and
    /// accepting begins on [`start`](Self::start).
    pub fn new(base: Arc<LoopHandle>, config: ServerConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let acceptor = Acceptor::new(Arc::clone(&base), config.addr)?;
        let ip_port = acceptor.local_addr().to_string();

        let mut pool = LoopThreadPool::new(Arc::clone(&base), config.name.clone());
        pool.set_thread_count(config.worker_loops);

        let server = Arc::new_cyclic(|weak_self: &Weak<TcpServer>| TcpServer {
            base,
            name: config.name,
            ip_port,
            no_delay: config.no_delay,
            high_water_mark: config.high_water_mark,
            acceptor: Arc::clone(&acceptor),
            pool: Mutex::new(pool),
            connections: Mutex::new(HashMap::new()),
            connection_cb: Mutex::new(None),
            message_cb: Mutex::new(None),
            write_complete_cb: Mutex::new(None),
            high_water_cb: Mutex::new(None),
            thread_init: Mutex::new(None),
            next_conn_id: AtomicU64::new(1),
            started: AtomicBool::new(false),
            weak_self: weak_self.clone(),
        });

        let weak = Arc::downgrade(&server);
        acceptor.set_new_connection_callback(Arc::new(move |stream, peer_addr| {
            if let Some(server) = weak.upgrade() {
                server.new_connection(stream, peer_addr);
            }
        }));
        Ok(server)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.acceptor.local_addr()
    }

    pub fn base_loop(&self) -> &Arc<LoopHandle> {
        &self.base
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
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

    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback) {
        *self.high_water_cb.lock().unwrap() = Some(cb);
    }

    /// Runs on each worker loop's thread before it serves connections.
    pub fn set_thread_init_callback(&self, cb: ThreadInitCallback) {
        *self.thread_init.lock().unwrap() = Some(cb);
    }

    /// Spawns the pool and starts accepting. Safe to call more than once;
    /// later calls are no-ops.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let init = self.thread_init.lock().unwrap().clone();
        self.pool.lock().unwrap().start(init);

        let acceptor = Arc::clone(&self.acceptor);
        self.base.run_in_loop(move || acceptor.listen());
        info!("server {} accepting on {}", self.name, self.ip_port);
    }

    /// Runs on the base loop when the acceptor hands over a stream.
    fn new_connection(&self, stream: TcpStream, peer_addr: SocketAddr) {
        debug_assert!(self.base.is_in_loop_thread());
        let io_loop = self.pool.lock().unwrap().next_loop();
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}-{}#{}", self.name, self.ip_port, id);
        let local_addr = stream.local_addr().unwrap_or_else(|e| {
            warn!("{}: no local addr ({}), using listener's", conn_name, e);
            self.acceptor.local_addr()
        });
        info!("{}: new connection from {}", conn_name, peer_addr);

        let conn = TcpConnection::new(io_loop.clone(), conn_name.clone(), stream, local_addr, peer_addr);
        conn.set_nodelay(self.no_delay);
        if let Some(cb) = self.connection_cb.lock().unwrap().clone() {
            conn.set_connection_callback(cb);
        }
        if let Some(cb) = self.message_cb.lock().unwrap().clone() {
            conn.set_message_callback(cb);
        }
        if let Some(cb) = self.write_complete_cb.lock().unwrap().clone() {
            conn.set_write_complete_callback(cb);
        }
        if let Some(cb) = self.high_water_cb.lock().unwrap().clone() {
            conn.set_high_water_mark_callback(cb, self.high_water_mark);
        }
        let weak = self.weak_self.clone();
        conn.set_close_callback(Arc::new(move |conn| {
            if let Some(server) = weak.upgrade() {
                server.remove_connection(conn);
            }
        }));

        self.connections
            .lock()
            .unwrap()
            .insert(conn_name, Arc::clone(&conn));
        io_loop.run_in_loop(move || conn.established());
    }

    /// Callable from any connection's loop; hops to the base loop where the
    /// connection map lives.
    fn remove_connection(&self, conn: &Arc<TcpConnection>) {
        let weak = self.weak_self.clone();
        let conn = Arc::clone(conn);
        self.base.run_in_loop(move || {
            if let Some(server) = weak.upgrade() {
                server.remove_connection_in_loop(conn);
            }
        });
    }

    fn remove_connection_in_loop(&self, conn: Arc<TcpConnection>) {
        debug_assert!(self.base.is_in_loop_thread());
        info!("{}: removing connection {}", self.name, conn.name());
        self.connections.lock().unwrap().remove(conn.name());
        let io_loop = Arc::clone(conn.owner_loop());
        // Teardown must outlive this drain; the connection keeps itself
        // alive through the queued closure.
        io_loop.queue_in_loop(move || conn.destroyed());
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        let connections = std::mem::take(&mut *self.connections.lock().unwrap());
        for (_, conn) in connections {
            let io_loop = Arc::clone(conn.owner_loop());
            io_loop.run_in_loop(move || conn.destroyed());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;

    #[test]
    fn config_rejects_an_empty_name() {
        let event_loop = EventLoop::new().unwrap();
        let config = ServerConfig::new("127.0.0.1:0".parse().unwrap(), "");
        assert!(TcpServer::new(event_loop.handle(), config).is_err());
    }

    #[test]
    fn bind_happens_at_construction() {
        let event_loop = EventLoop::new().unwrap();
        let config = ServerConfig::new("127.0.0.1:0".parse().unwrap(), "bound");
        let server = TcpServer::new(event_loop.handle(), config).unwrap();
        assert_ne!(server.local_addr().port(), 0);
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn start_twice_is_harmless() {
        let event_loop = EventLoop::new().unwrap();
        let config = ServerConfig::new("127.0.0.1:0".parse().unwrap(), "twice");
        let server = TcpServer::new(event_loop.handle(), config).unwrap();
        server.start();
        server.start();
    }
}
