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

mod epoll;
mod select;

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel as chan;

pub use self::epoll::EpollLoop;
pub use self::select::SelectLoop;
use crate::handler::EventHandler;
use crate::poller::epoll::Waker;
use crate::poller::EventKind;

/// Event loop errors
#[derive(Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum Error {
    /// event loop is gone and does not accept operations
    Disconnected,

    /// invalid file descriptor {0}
    InvalidFd(RawFd),

    /// OS-level error: {0}
    #[from]
    Io(io::Error),
}

/// Selects which readiness backend an event loop is built on.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display)]
pub enum LoopKind {
    /// Level-triggered `select` backend; single-threaded, bounded by the
    /// bitset width of the primitive.
    #[display("select")]
    Select,
    /// Edge-capable `epoll` backend with thread-safe registration through
    /// an internal wakeup descriptor.
    #[display("epoll")]
    Epoll,
}

/// Interest-set mutation deferred onto the loop thread.
pub(crate) enum PendingOp {
    Register {
        fd: RawFd,
        kind: EventKind,
        handler: Box<dyn EventHandler + Send>,
    },
    Unregister {
        fd: RawFd,
        kind: EventKind,
    },
    Close(RawFd),
}

/// Cloneable control surface of an event loop.
///
/// All operations are deferred: they enqueue a [`PendingOp`] which the loop
/// applies on its own thread. On the epoll backend every enqueue also pokes
/// the wakeup descriptor, so operations submitted from other threads are
/// applied on or before the next tick. The select backend has no wakeup
/// descriptor: operations enqueued while its wait is blocked are applied
/// only once some registered descriptor becomes ready.
#[derive(Clone)]
pub struct Handle {
    kind: LoopKind,
    ops: chan::Sender<PendingOp>,
    waker: Option<Waker>,
    running: Arc<AtomicBool>,
}

impl Handle {
    pub(crate) fn new(
        kind: LoopKind,
        ops: chan::Sender<PendingOp>,
        waker: Option<Waker>,
        running: Arc<AtomicBool>,
    ) -> Self {
        Handle {
            kind,
            ops,
            waker,
            running,
        }
    }

    /// The backend flavor of the loop this handle controls.
    pub fn kind(&self) -> LoopKind { self.kind }

    /// Schedules `handler` to watch `fd` for `kind` events.
    ///
    /// Registering an already-watched descriptor replaces its handler and
    /// refreshes the interest; the previous handler is never dispatched to
    /// again.
    pub fn register_handler(
        &self,
        fd: RawFd,
        kind: EventKind,
        handler: Box<dyn EventHandler + Send>,
    ) -> Result<(), Error> {
        if fd < 0 {
            return Err(Error::InvalidFd(fd));
        }
        #[cfg(feature = "log")]
        log::debug!(target: "reactor-controller", "Registering handler for fd={fd} ({kind})");

        self.ops
            .send(PendingOp::Register { fd, kind, handler })
            .map_err(|_| Error::Disconnected)?;
        self.wake()
    }

    /// Schedules removal of the handler watching `fd` for `kind` events.
    ///
    /// On the epoll backend unregistering also schedules the descriptor for
    /// close at the end of the tick applying the operation.
    pub fn unregister_handler(&self, fd: RawFd, kind: EventKind) -> Result<(), Error> {
        if fd < 0 {
            return Err(Error::InvalidFd(fd));
        }
        #[cfg(feature = "log")]
        log::debug!(target: "reactor-controller", "Unregistering handler for fd={fd} ({kind})");

        self.ops
            .send(PendingOp::Unregister { fd, kind })
            .map_err(|_| Error::Disconnected)?;
        self.wake()
    }

    /// Appends `fd` to the loop's deferred-close list without touching the
    /// interest set. Meant for descriptors already unregistered, or never
    /// registered at all; the close happens at the end of a tick, after all
    /// dispatch for that tick has completed.
    pub fn close_fd_safely(&self, fd: RawFd) -> Result<(), Error> {
        if fd < 0 {
            return Err(Error::InvalidFd(fd));
        }
        self.ops
            .send(PendingOp::Close(fd))
            .map_err(|_| Error::Disconnected)?;
        self.wake()
    }

    /// Stops the loop: it exits once the current tick completes.
    ///
    /// Safe to call from any thread and from signal handlers. On the epoll
    /// backend the wakeup descriptor is poked so a blocked wait returns
    /// promptly; on the select backend a blocked wait is only left once a
    /// registered descriptor becomes ready.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(waker) = &self.waker {
            let _ = waker.wake();
        }
    }

    fn wake(&self) -> Result<(), Error> {
        if let Some(waker) = &self.waker {
            waker.wake()?;
        }
        Ok(())
    }
}

/// A readiness-dispatching event loop.
///
/// One thread calls [`EventLoop::run`] and executes every tick phase on it:
/// apply pending operations, wait on the backend, dispatch ready events,
/// close descriptors scheduled for close. Everything outside that thread
/// talks to the loop through [`Handle`] clones.
pub trait EventLoop {
    /// Returns a control surface for this loop.
    fn handle(&self) -> Handle;

    /// Runs ticks until [`Handle::stop`] is observed.
    fn run(&mut self);
}

/// Instantiates an event loop over the requested backend.
pub fn create_event_loop(kind: LoopKind) -> Result<Box<dyn EventLoop>, Error> {
    Ok(match kind {
        LoopKind::Select => Box::new(SelectLoop::new()),
        LoopKind::Epoll => Box::new(EpollLoop::new()?),
    })
}
