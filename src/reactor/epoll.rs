// Library for concurrent I/O resource management using reactor pattern.
//
// SPDX-License-Identifier: Apache-2.0
//
// Written in 2021-2023 by
//     Dr. Maxim Orlovsky <orlovsky@ubideco.org>
//     Alexis Sellier <alexis@cloudhead.io>
//
// Copyright 2022-2023 UBIDECO Institute, Switzerland
// Copyright 2021 Alexis Sellier <alexis@cloudhead.io>
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![allow(unused_variables)] // because we need them for feature-gated logger

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel as chan;

use crate::handler::EventHandler;
use crate::poller::epoll::Epoll;
use crate::poller::{EventKind, Poll, Token};
use crate::reactor::{Error, EventLoop, Handle, LoopKind, PendingOp};

/// Upper bound on readiness records collected per tick.
const MAX_EVENTS: usize = 1024;

/// Edge-capable event loop over the [`Epoll`] backend.
///
/// A descriptor carries a single handler covering all event kinds it was
/// registered for. Registration and unregistration are thread-safe: the
/// pending operation is enqueued and the wakeup descriptor poked, and the
/// loop applies the queue at the point of the tick where the kernel
/// reports the wakeup readiness.
///
/// Unregistering a descriptor also schedules it for close at the end of
/// the tick applying the operation: a descriptor leaving the loop leaves
/// for good.
pub struct EpollLoop {
    poller: Epoll,
    handlers: HashMap<RawFd, Box<dyn EventHandler + Send>>,
    ops: chan::Receiver<PendingOp>,
    handle: Handle,
    pending_closes: Vec<RawFd>,
    running: Arc<AtomicBool>,
}

impl EpollLoop {
    pub fn new() -> Result<Self, Error> {
        let poller = Epoll::with_capacity(MAX_EVENTS)?;
        let (ops_send, ops_recv) = chan::unbounded();
        let running = Arc::new(AtomicBool::new(true));
        let handle = Handle::new(
            LoopKind::Epoll,
            ops_send,
            Some(poller.waker()),
            running.clone(),
        );
        Ok(EpollLoop {
            poller,
            handlers: empty!(),
            ops: ops_recv,
            handle,
            pending_closes: empty!(),
            running,
        })
    }

    fn apply_pending_ops(&mut self) {
        while let Ok(op) = self.ops.try_recv() {
            match op {
                PendingOp::Register { fd, kind, handler } => self.apply_register(fd, kind, handler),
                PendingOp::Unregister { fd, kind } => self.apply_unregister(fd, kind),
                PendingOp::Close(fd) => self.pending_closes.push(fd),
            }
        }
    }

    fn apply_register(&mut self, fd: RawFd, kind: EventKind, handler: Box<dyn EventHandler + Send>) {
        let result = if self.handlers.contains_key(&fd) {
            self.poller.modify(fd, kind)
        } else {
            match self.poller.add(fd, kind) {
                // Lost track of the descriptor (e.g. registered before this
                // loop got hold of it): refresh the existing registration.
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    self.poller.modify(fd, kind)
                }
                other => other,
            }
        };
        match result {
            Ok(()) => {
                self.handlers.insert(fd, handler);
            }
            Err(err) => {
                #[cfg(feature = "log")]
                log::error!(target: "reactor", "Unable to register fd={fd}: {err}");
            }
        }
    }

    fn apply_unregister(&mut self, fd: RawFd, kind: EventKind) {
        // A single handler covers all event kinds here, so `kind` does not
        // narrow anything.
        let _ = kind;
        if self.handlers.remove(&fd).is_none() {
            #[cfg(feature = "log")]
            log::warn!(target: "reactor", "No handler registered for fd={fd}");
            return;
        }
        if let Err(err) = self.poller.remove(fd) {
            #[cfg(feature = "log")]
            log::error!(target: "reactor", "Unable to detach fd={fd}: {err}");
        }
        // Unregistering implies close: the descriptor leaves the loop for
        // good at the end of this tick.
        self.pending_closes.push(fd);
    }

    fn dispatch(&mut self, fd: RawFd, kind: EventKind) {
        let Some(handler) = self.handlers.get_mut(&fd) else {
            #[cfg(feature = "log")]
            log::warn!(target: "reactor", "No handler registered for fd={fd}");
            return;
        };
        if kind.contains(EventKind::READ) {
            handler.on_read(fd);
        }
        if kind.contains(EventKind::WRITE) {
            handler.on_write(fd);
        }
        if kind.contains(EventKind::EXCEPTION) {
            handler.on_exception(fd);
        }
    }

    fn process_pending_closes(&mut self) {
        for fd in self.pending_closes.drain(..) {
            #[cfg(feature = "log")]
            log::trace!(target: "reactor", "Closing fd={fd}");
            if unsafe { libc::close(fd) } < 0 {
                #[cfg(feature = "log")]
                log::warn!(
                    target: "reactor",
                    "Unable to close fd={fd}: {}",
                    io::Error::last_os_error()
                );
            }
        }
    }
}

impl EventLoop for EpollLoop {
    fn handle(&self) -> Handle { self.handle.clone() }

    fn run(&mut self) {
        while self.running.load(Ordering::Acquire) {
            // Blocking call
            match self.poller.wait(None) {
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    #[cfg(feature = "log")]
                    log::error!(target: "reactor", "Error during epoll wait: {err}");
                    continue;
                }
            }

            while let Some((token, kind)) = self.poller.next() {
                match token {
                    // Pending operations are applied at the batch position
                    // the kernel reported the wakeup, the way the interest
                    // set saw them.
                    Token::Wakeup => self.apply_pending_ops(),
                    Token::Fd(fd) => self.dispatch(fd, kind),
                }
            }

            self.process_pending_closes();
        }
    }
}

#[cfg(test)]
mod test {
    use std::os::unix::io::AsRawFd;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::fd;
    use crate::handler::FnHandler;

    fn write_byte(fd: RawFd) {
        let byte = [1u8];
        let n = unsafe { libc::write(fd, byte.as_ptr() as *const libc::c_void, 1) };
        assert_eq!(n, 1);
    }

    fn drain(fd: RawFd) {
        let mut buf = [0u8; 64];
        while unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) } > 0 {}
    }

    #[test]
    fn stop_wakes_blocked_loop() {
        let mut evloop = EpollLoop::new().unwrap();
        let handle = evloop.handle();

        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            evloop.run();
            tx.send(()).unwrap();
        });

        thread::sleep(Duration::from_millis(50));
        handle.stop();
        rx.recv_timeout(Duration::from_secs(1))
            .expect("loop must exit promptly after stop");
    }

    #[test]
    fn cross_thread_registration_wakes_loop() {
        let mut evloop = EpollLoop::new().unwrap();
        let handle = evloop.handle();

        let worker = thread::spawn(move || evloop.run());
        // Give the loop time to block inside the wait.
        thread::sleep(Duration::from_millis(50));

        let (reader, writer) = fd::pipe();
        let raw = reader.as_raw_fd();
        let (tx, rx) = mpsc::channel();
        handle
            .register_handler(
                raw,
                EventKind::READ | EventKind::EDGE_TRIGGERED,
                Box::new(FnHandler::new(move |fd| {
                    drain(fd);
                    tx.send(fd).unwrap();
                })),
            )
            .unwrap();

        write_byte(writer.as_raw_fd());
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), raw);

        handle.stop();
        worker.join().unwrap();
    }

    #[test]
    fn register_replaces_handler() {
        let mut evloop = EpollLoop::new().unwrap();
        let handle = evloop.handle();
        let worker = thread::spawn(move || evloop.run());

        let (reader, writer) = fd::pipe();
        let raw = reader.as_raw_fd();

        let (tx_old, rx_old) = mpsc::channel();
        let (tx_new, rx_new) = mpsc::channel();
        handle
            .register_handler(
                raw,
                EventKind::READ,
                Box::new(FnHandler::new(move |fd| {
                    drain(fd);
                    tx_old.send(fd).unwrap();
                })),
            )
            .unwrap();
        handle
            .register_handler(
                raw,
                EventKind::READ,
                Box::new(FnHandler::new(move |fd| {
                    drain(fd);
                    tx_new.send(fd).unwrap();
                })),
            )
            .unwrap();

        // Let both operations get applied before producing readiness.
        thread::sleep(Duration::from_millis(100));
        write_byte(writer.as_raw_fd());

        assert_eq!(rx_new.recv_timeout(Duration::from_secs(1)).unwrap(), raw);
        assert!(rx_old.try_recv().is_err(), "replaced handler must not fire");

        handle.stop();
        worker.join().unwrap();
    }

    #[test]
    fn unregister_detaches_and_closes() {
        let mut evloop = EpollLoop::new().unwrap();
        let handle = evloop.handle();
        let worker = thread::spawn(move || evloop.run());

        let (reader, writer) = fd::pipe();
        // The loop closes the descriptor after unregistration.
        let raw = reader.into_raw();

        let (tx, rx) = mpsc::channel();
        handle
            .register_handler(
                raw,
                EventKind::READ | EventKind::EDGE_TRIGGERED,
                Box::new(FnHandler::new(move |fd| {
                    drain(fd);
                    tx.send(fd).unwrap();
                })),
            )
            .unwrap();

        write_byte(writer.as_raw_fd());
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), raw);

        handle.unregister_handler(raw, EventKind::READ).unwrap();
        thread::sleep(Duration::from_millis(200));

        // The loop closed the only read end, so writing must fail with
        // a broken pipe, and no callback may fire anymore.
        let byte = [1u8];
        let n =
            unsafe { libc::write(writer.as_raw_fd(), byte.as_ptr() as *const libc::c_void, 1) };
        assert_eq!(n, -1, "pipe must be broken after the loop closed the reader");
        assert_eq!(io::Error::last_os_error().raw_os_error(), Some(libc::EPIPE));
        assert!(rx.try_recv().is_err(), "no callbacks after unregistration");

        handle.stop();
        worker.join().unwrap();
    }
}
