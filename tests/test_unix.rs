use std::cell::{Cell, RefCell};
use std::rc::Rc;

use elio::net::{
  BufResult, ServerSocket, StreamSocket, Unix, UnixServer, UnixSocket,
};
use elio::test_utils::{pump_until, unix_socket_path};
use elio::EventLoop;

#[test]
fn unix_stream_roundtrip() {
  let event_loop = Rc::new(EventLoop::new().unwrap());
  let path = unix_socket_path("roundtrip");

  let server = ServerSocket::open(event_loop.clone(), UnixServer).unwrap();
  server.bind(&path).unwrap();
  server.listen(16).unwrap();

  let accepted: Rc<RefCell<Option<UnixSocket>>> = Rc::new(RefCell::new(None));
  {
    let accepted = accepted.clone();
    server.async_accept(move |peer| {
      *accepted.borrow_mut() = Some(peer.expect("accept failed"));
    });
  }

  let client = StreamSocket::open(event_loop.clone(), Unix).unwrap();
  let connected = Rc::new(Cell::new(false));
  {
    let connected = connected.clone();
    client.async_connect(&path, move |result| {
      result.expect("connect failed");
      connected.set(true);
    });
  }

  pump_until(&event_loop, || connected.get() && accepted.borrow().is_some());
  let peer = accepted.borrow_mut().take().unwrap();

  let sent: Rc<RefCell<Option<BufResult>>> = Rc::new(RefCell::new(None));
  {
    let sent = sent.clone();
    client.async_send(b"over the wire".to_vec(), 0, move |result| {
      *sent.borrow_mut() = Some(result);
    });
  }
  pump_until(&event_loop, || sent.borrow().is_some());
  let (result, _buf) = sent.borrow_mut().take().unwrap();
  assert_eq!(result.unwrap(), 13);

  let got: Rc<RefCell<Option<BufResult>>> = Rc::new(RefCell::new(None));
  {
    let got = got.clone();
    peer.async_recv(vec![0u8; 64], 0, move |result| {
      *got.borrow_mut() = Some(result);
    });
  }
  pump_until(&event_loop, || got.borrow().is_some());

  let (result, buf) = got.borrow_mut().take().unwrap();
  let n = result.unwrap();
  assert_eq!(&buf[..n], b"over the wire");

  drop(server);
  let _ = std::fs::remove_file(&path);
}

#[test]
fn connect_to_missing_path_reports_the_error() {
  let event_loop = Rc::new(EventLoop::new().unwrap());
  let path = unix_socket_path("missing");

  let client = StreamSocket::open(event_loop.clone(), Unix).unwrap();
  let outcome: Rc<RefCell<Option<std::io::Result<()>>>> =
    Rc::new(RefCell::new(None));
  {
    let outcome = outcome.clone();
    client.async_connect(&path, move |result| {
      *outcome.borrow_mut() = Some(result);
    });
  }

  pump_until(&event_loop, || outcome.borrow().is_some());

  let err = outcome.borrow_mut().take().unwrap().unwrap_err();
  assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
}
