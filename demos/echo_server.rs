//! Minimal echo server. Try it with `nc 127.0.0.1 7000`.

use std::sync::Arc;

use millrace::prelude::*;

fn main() -> Result<()> {
    env_logger::init();

    let mut base_loop = EventLoop::new()?;
    let config = ServerConfig::new("127.0.0.1:7000".parse().map_err(|e| {
        Error::Configuration(format!("bad listen address: {}", e))
    })?, "echo")
        .with_worker_loops(2)
        .with_no_delay(true);

    let server = TcpServer::new(base_loop.handle(), config)?;
    server.set_connection_callback(Arc::new(|conn| {
        if conn.connected() {
            println!("{} up from {}", conn.name(), conn.peer_addr());
        } else {
            println!("{} down", conn.name());
        }
    }));
    server.set_message_callback(Arc::new(|conn, input, _at| {
        let n = input.readable_bytes();
        let payload = input.consume_as_string(n);
        conn.send(payload.as_bytes());
    }));

    println!("echo server on {}", server.local_addr());
    server.start();
    base_loop.run();
    Ok(())
}
