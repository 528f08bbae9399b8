//! Asynchronous stream sockets over the event loop.

pub mod addr;
pub mod proto;

mod base;
mod server;
mod stream;

pub use addr::ToSockAddr;
pub use base::BaseSocket;
pub use proto::{Protocol, ServerProtocol, Tcp, TcpServer, Unix, UnixServer};
pub use server::ServerSocket;
pub use stream::{BufResult, StreamSocket};

pub type TcpSocket = StreamSocket<Tcp>;
pub type UnixSocket = StreamSocket<Unix>;
pub type TcpServerSocket = ServerSocket<TcpServer>;
pub type UnixServerSocket = ServerSocket<UnixServer>;
