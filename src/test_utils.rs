//! Helpers for integration tests.
//!
//! Only useful from the `tests/` directory; not part of the public API.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use crate::net::{ServerSocket, TcpServer, TcpServerSocket};
use crate::EventLoop;

/// Pump the loop until `done` holds, bounding every wait with a short
/// timer so an unexpected stall fails the test instead of hanging it.
#[doc(hidden)]
pub fn pump_until(event_loop: &Rc<EventLoop>, mut done: impl FnMut() -> bool) {
  let give_up = Instant::now() + Duration::from_secs(5);

  while !done() {
    assert!(Instant::now() < give_up, "test condition not reached within 5s");
    event_loop
      .execute_at(|| {}, Instant::now() + Duration::from_millis(10));
    event_loop.run_once().expect("run_once failed");
  }
}

/// A TCP server socket listening on an ephemeral loopback port, plus the
/// address it ended up on.
#[doc(hidden)]
pub fn loopback_listener(
  event_loop: &Rc<EventLoop>,
) -> (TcpServerSocket, SocketAddr) {
  let server = ServerSocket::open(event_loop.clone(), TcpServer)
    .expect("failed to open server socket");
  server
    .bind(&"127.0.0.1:0".parse().unwrap())
    .expect("failed to bind");
  server.listen(128).expect("failed to listen");

  let addr = server
    .local_address()
    .expect("failed to read bound address")
    .as_socket()
    .expect("bound address is not an inet address");

  (server, addr)
}

/// A fresh path for a Unix socket, unique per process and call.
#[doc(hidden)]
pub fn unix_socket_path(tag: &str) -> PathBuf {
  static COUNTER: AtomicU32 = AtomicU32::new(0);

  let n = COUNTER.fetch_add(1, Ordering::Relaxed);
  std::env::temp_dir().join(format!(
    "elio-{}-{}-{}.sock",
    tag,
    std::process::id(),
    n
  ))
}
