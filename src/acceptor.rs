//! Non-blocking HTTP acceptor driving an event loop.
//!
//! Owns the listening socket and spawns a per-connection handler for every
//! accepted socket. Each connection accumulates bytes until the end of the
//! request headers and is answered with a fixed response, after which the
//! connection is torn down. No request parsing happens beyond detecting
//! the header terminator.

#![allow(unused_variables)] // because we need them for feature-gated logger

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr;

use socket2::{Domain, Protocol, Socket, Type};

use crate::fd::FileDesc;
use crate::handler::EventHandler;
use crate::poller::EventKind;
use crate::reactor::{Error, Handle, LoopKind};

/// Fixed response sent to every connection once its request headers
/// complete.
pub const RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\n\
    Content-Type: text/html\r\n\
    Content-Length: 13\r\n\
    Connection: close\r\n\
    \r\n\
    Hello, World!";

/// End-of-headers marker awaited on every connection.
const HEADER_END: &[u8] = b"\r\n\r\n";

const BACKLOG: i32 = 5;

/// Stack chunk size for connection reads.
const RECV_CHUNK: usize = 4096;

// Edge-triggered registration where the backend supports it, per the
// backend contract; select silently ignores the bit anyway.
fn edge_mode(handle: &Handle) -> EventKind {
    match handle.kind() {
        LoopKind::Epoll => EventKind::EDGE_TRIGGERED,
        LoopKind::Select => EventKind::none(),
    }
}

/// Non-blocking HTTP listener answering every complete request with a
/// fixed `Hello, World!` response and closing the connection.
pub struct Acceptor {
    socket: Socket,
}

impl Acceptor {
    /// Creates the listening socket: IPv4 TCP with address reuse, bound to
    /// all interfaces on `port`, listening with a short backlog,
    /// non-blocking and close-on-exec. Port 0 asks the OS for an ephemeral
    /// port, reported by [`Acceptor::local_addr`].
    pub fn bind(port: u16) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        let addr = SocketAddr::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
        socket.bind(&addr.into())?;
        socket.listen(BACKLOG)?;
        socket.set_nonblocking(true)?;
        socket.set_cloexec(true)?;
        Ok(Acceptor { socket })
    }

    /// The actually bound local address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()?.as_socket().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "listener has a non-IP address")
        })
    }

    /// Registers the accept handler with the event loop behind `handle`,
    /// for read readiness on the listening socket.
    pub fn attach(&self, handle: &Handle) -> Result<(), Error> {
        let kind = EventKind::READ | edge_mode(handle);
        handle.register_handler(
            self.socket.as_raw_fd(),
            kind,
            Box::new(AcceptHandler {
                handle: handle.clone(),
            }),
        )
    }
}

/// Handler of the listening socket: drains the accept queue and registers
/// a fresh [`Connection`] for every accepted socket.
struct AcceptHandler {
    handle: Handle,
}

impl EventHandler for AcceptHandler {
    fn on_read(&mut self, fd: RawFd) {
        // Drain the accept queue: with edge-triggered registration the loop
        // will not re-report until a new connection arrives.
        loop {
            let client = unsafe { libc::accept(fd, ptr::null_mut(), ptr::null_mut()) };
            if client < 0 {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::WouldBlock {
                    #[cfg(feature = "log")]
                    log::error!(target: "acceptor", "Error accepting connection: {err}");
                }
                break;
            }
            let client = FileDesc::new(client);
            if let Err(err) = client.set_nonblocking().and_then(|_| client.set_cloexec()) {
                #[cfg(feature = "log")]
                log::error!(target: "acceptor", "Unable to prepare accepted socket: {err}");
                continue;
            }

            let kind = EventKind::READ | edge_mode(&self.handle);
            let connection = Connection::new(self.handle.clone());
            match self
                .handle
                .register_handler(client.as_raw_fd(), kind, Box::new(connection))
            {
                Ok(()) => {
                    #[cfg(feature = "log")]
                    log::debug!(target: "acceptor", "Accepted connection on fd={}", client.as_raw_fd());
                    // The loop owns the descriptor from now on.
                    client.into_raw();
                }
                Err(err) => {
                    #[cfg(feature = "log")]
                    log::error!(target: "acceptor", "Unable to register connection: {err}");
                }
            }
        }
    }

    fn on_exception(&mut self, fd: RawFd) {
        #[cfg(feature = "log")]
        log::warn!(target: "acceptor", "Exception condition on listening socket fd={fd}");
    }
}

/// Per-connection state: the receive buffer accumulated until the header
/// terminator shows up.
struct Connection {
    handle: Handle,
    buf: Vec<u8>,
}

impl Connection {
    fn new(handle: Handle) -> Self {
        Connection {
            handle,
            buf: empty!(),
        }
    }

    fn respond(&self, fd: RawFd) {
        let written =
            unsafe { libc::write(fd, RESPONSE.as_ptr() as *const libc::c_void, RESPONSE.len()) };
        if written < 0 {
            #[cfg(feature = "log")]
            log::error!(
                target: "acceptor",
                "Error writing response to fd={fd}: {}",
                io::Error::last_os_error()
            );
        }
        // Short writes are not retried: the response is far below the
        // kernel send buffer size.
    }

    fn teardown(&mut self, fd: RawFd) {
        if let Err(err) = self.handle.unregister_handler(fd, EventKind::READ) {
            #[cfg(feature = "log")]
            log::error!(target: "acceptor", "Unable to unregister fd={fd}: {err}");
        }
        // Epoll unregistration already schedules the close.
        if self.handle.kind() == LoopKind::Select {
            if let Err(err) = self.handle.close_fd_safely(fd) {
                #[cfg(feature = "log")]
                log::error!(target: "acceptor", "Unable to schedule close of fd={fd}: {err}");
            }
        }
        self.buf = empty!();
    }
}

impl EventHandler for Connection {
    fn on_read(&mut self, fd: RawFd) {
        let mut chunk = [0u8; RECV_CHUNK];
        loop {
            let read =
                unsafe { libc::read(fd, chunk.as_mut_ptr() as *mut libc::c_void, chunk.len()) };
            if read > 0 {
                self.buf.extend_from_slice(&chunk[..read as usize]);
                if self
                    .buf
                    .windows(HEADER_END.len())
                    .any(|window| window == HEADER_END)
                {
                    self.respond(fd);
                    self.teardown(fd);
                    break;
                }
            } else if read == 0 {
                // Orderly remote shutdown before the headers completed.
                self.teardown(fd);
                break;
            } else {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    // Drained; await the next readiness.
                    break;
                }
                #[cfg(feature = "log")]
                log::error!(target: "acceptor", "Error reading from fd={fd}: {err}");
                self.teardown(fd);
                break;
            }
        }
    }

    fn on_exception(&mut self, fd: RawFd) { self.teardown(fd) }
}

#[cfg(test)]
mod test {
    use std::io::{Read, Write};
    use std::net::{Shutdown, TcpStream};
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::reactor::{EpollLoop, EventLoop, SelectLoop};

    const REQUEST: &[u8] = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";

    fn serve(mut evloop: impl EventLoop + Send + 'static) -> (SocketAddr, Handle) {
        let handle = evloop.handle();
        let acceptor = Acceptor::bind(0).unwrap();
        let addr = acceptor.local_addr().unwrap();
        acceptor.attach(&handle).unwrap();
        thread::spawn(move || {
            // The listener must outlive the loop serving it.
            let _acceptor = acceptor;
            evloop.run();
        });
        (addr, handle)
    }

    fn connect(addr: SocketAddr) -> TcpStream {
        let target = SocketAddr::from(([127, 0, 0, 1], addr.port()));
        let stream = TcpStream::connect(target).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        stream
    }

    #[test]
    fn minimal_request_epoll() {
        let (addr, handle) = serve(EpollLoop::new().unwrap());
        let mut client = connect(addr);

        client.write_all(REQUEST).unwrap();
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).unwrap();
        assert_eq!(reply, RESPONSE);

        handle.stop();
    }

    #[test]
    fn minimal_request_select() {
        let (addr, handle) = serve(SelectLoop::new());
        let mut client = connect(addr);

        client.write_all(REQUEST).unwrap();
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).unwrap();
        assert_eq!(reply, RESPONSE);

        // Select needs fresh readiness to notice the stop flag.
        handle.stop();
        let _ = TcpStream::connect(SocketAddr::from(([127, 0, 0, 1], addr.port())));
    }

    #[test]
    fn concurrent_clients_get_whole_responses() {
        let (addr, handle) = serve(EpollLoop::new().unwrap());
        let mut first = connect(addr);
        let mut second = connect(addr);

        first.write_all(REQUEST).unwrap();
        second.write_all(REQUEST).unwrap();

        let mut reply = Vec::new();
        first.read_to_end(&mut reply).unwrap();
        assert_eq!(reply, RESPONSE);

        reply.clear();
        second.read_to_end(&mut reply).unwrap();
        assert_eq!(reply, RESPONSE);

        handle.stop();
    }

    #[test]
    fn headers_split_across_reads() {
        let (addr, handle) = serve(EpollLoop::new().unwrap());
        let mut client = connect(addr);

        client.write_all(b"GET / HTTP/1.1\r\n").unwrap();
        thread::sleep(Duration::from_millis(100));
        client.write_all(b"Host: x\r\n\r\n").unwrap();

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).unwrap();
        assert_eq!(reply, RESPONSE);

        handle.stop();
    }

    #[test]
    fn early_disconnect_gets_no_response() {
        let (addr, handle) = serve(EpollLoop::new().unwrap());
        let mut client = connect(addr);

        client.write_all(b"GET /").unwrap();
        client.shutdown(Shutdown::Write).unwrap();

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).unwrap();
        assert!(reply.is_empty(), "no response before headers complete");

        handle.stop();
    }
}
