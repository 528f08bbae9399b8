#![deny(
  clippy::unnecessary_safety_comment,
  clippy::unnecessary_safety_doc,
  clippy::undocumented_unsafe_blocks
)]

//! # elio — a single-threaded readiness event loop
//!
//! elio multiplexes readiness notifications for descriptor-backed kernel
//! objects through one [`EventLoop`] and layers callback-based non-blocking
//! stream sockets on top. Asynchronous operations never block: they either
//! complete synchronously or park the request and arm a one-shot readiness
//! wait, completing from a later [`EventLoop::run_once`] iteration.
//!
//! ### Example
//!
//! ```rust,no_run
//! use std::cell::RefCell;
//! use std::rc::Rc;
//! use elio::net::{Tcp, TcpServer, ServerSocket, StreamSocket, TcpSocket};
//! use elio::EventLoop;
//!
//! fn main() -> std::io::Result<()> {
//!   let event_loop = Rc::new(EventLoop::new()?);
//!
//!   let server = ServerSocket::open(event_loop.clone(), TcpServer)?;
//!   server.bind(&"127.0.0.1:0".parse().unwrap())?;
//!   server.listen(128)?;
//!
//!   // The accepted socket must outlive its pending recv.
//!   let peers: Rc<RefCell<Vec<TcpSocket>>> = Rc::new(RefCell::new(Vec::new()));
//!   server.async_accept({
//!     let peers = peers.clone();
//!     move |peer| {
//!       let peer = peer.expect("accept failed");
//!       peer.async_recv(vec![0u8; 1024], 0, |(result, buf)| {
//!         let n = result.expect("recv failed");
//!         println!("got {:?}", &buf[..n]);
//!       });
//!       peers.borrow_mut().push(peer);
//!     }
//!   });
//!
//!   let client = StreamSocket::open(event_loop.clone(), Tcp)?;
//!   let addr = server.local_address()?.as_socket().unwrap();
//!   client.async_connect(&addr, |result| result.expect("connect failed"));
//!
//!   loop {
//!     event_loop.run_once()?;
//!   }
//! }
//! ```
//!
//! The loop, its sockets and every callback live on one thread; there is no
//! internal synchronisation. One iteration runs deferred work
//! ([`EventLoop::execute_later`]), fires expired timers
//! ([`EventLoop::execute_at`]), then waits on the event queue and
//! dispatches.

#[macro_use]
mod macros;

mod event_loop;
pub mod net;
pub mod queue;

#[doc(hidden)]
pub mod test_utils;

pub use event_loop::{EventCallback, EventLoop};
pub use queue::{EventInfo, EventQueue, Events, ObjectKind};
