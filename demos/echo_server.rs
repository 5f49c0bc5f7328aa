use std::sync::Arc;

use sluice::{LogLevel, Logger, Reactor, TcpServer, TcpServerConfig};

struct ConsoleLogger;

impl Logger for ConsoleLogger {
    fn log(&self, level: LogLevel, message: &str) {
        eprintln!("[{level:?}] {message}");
    }
}

fn main() -> sluice::Result<()> {
    let reactor = Reactor::new()?;

    let config = TcpServerConfig::builder()
        .name("echo")
        .address("127.0.0.1:8080".parse()?)
        .worker_count(4)
        .logger(Arc::new(ConsoleLogger))
        .build();
    let server = TcpServer::new(&reactor, config)?;

    server.set_connection_callback(|conn| {
        println!(
            "{} is {}",
            conn.name(),
            if conn.is_connected() { "up" } else { "down" }
        );
    });
    server.set_message_callback(|conn, buf, _at| {
        let bytes = buf.retrieve_all_as_bytes();
        conn.send(&bytes);
    });

    server.start();
    println!("Echo server listening on {}", server.listen_addr());
    reactor.run();
    Ok(())
}
