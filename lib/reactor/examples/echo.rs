//! Echo server over the POSIX host.
//!
//! Run with `cargo run --example echo`, then `nc 127.0.0.1 8080`.
//! The server exits on its own after 30 idle seconds.

use std::time::Duration;

use fiber_reactor::sys::PosixHost;
use fiber_reactor::{Config, Conn, NetError, Scheduler};

fn echo(conn: &mut Conn<'_, PosixHost>) -> Result<(), NetError> {
    let mut buf = [0u8; 1024];
    loop {
        let n = match conn.recv(&mut buf) {
            Ok(n) => n,
            Err(NetError::Closed) => break,
            Err(err) => return Err(err),
        };
        conn.send(&buf[..n])?;
    }
    conn.close()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let cfg = Config {
        max_connections: 64,
        poll_timeout: Some(Duration::from_secs(30)),
        shutdown_on_idle: true,
    };
    let mut sched = Scheduler::new(PosixHost::new(), cfg);
    let listener = sched.listen(8080, 64)?;
    tracing::info!(%listener, "echo server on 127.0.0.1:8080");

    sched.run(
        listener,
        Box::new(|conn| loop {
            let vfd = conn.accept()?;
            conn.spawn(vfd, Box::new(echo))?;
        }),
    )?;
    sched.finalize();
    tracing::info!("idle, shutting down");
    Ok(())
}
