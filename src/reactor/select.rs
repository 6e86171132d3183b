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
use crate::poller::select::Selector;
use crate::poller::{EventKind, Poll, Token};
use crate::reactor::{EventLoop, Handle, LoopKind, PendingOp};

type Slot = Option<Box<dyn EventHandler + Send>>;

/// Per-descriptor handler table of the select loop: one independent slot
/// for each of the read, write and exception conditions.
#[derive(Default)]
struct HandlerSlots {
    read: Slot,
    write: Slot,
    except: Slot,
}

impl HandlerSlots {
    fn supports(kind: EventKind) -> bool {
        kind == EventKind::READ || kind == EventKind::WRITE || kind == EventKind::EXCEPTION
    }

    fn set(&mut self, kind: EventKind, handler: Box<dyn EventHandler + Send>) {
        if kind == EventKind::READ {
            self.read = Some(handler);
        } else if kind == EventKind::WRITE {
            self.write = Some(handler);
        } else if kind == EventKind::EXCEPTION {
            self.except = Some(handler);
        }
    }

    fn clear(&mut self, kind: EventKind) {
        if kind.contains(EventKind::READ) {
            self.read = None;
        }
        if kind.contains(EventKind::WRITE) {
            self.write = None;
        }
        if kind.contains(EventKind::EXCEPTION) {
            self.except = None;
        }
    }

    fn is_empty(&self) -> bool {
        self.read.is_none() && self.write.is_none() && self.except.is_none()
    }

    fn interests(&self) -> EventKind {
        let mut kind = EventKind::none();
        if self.read.is_some() {
            kind |= EventKind::READ;
        }
        if self.write.is_some() {
            kind |= EventKind::WRITE;
        }
        if self.except.is_some() {
            kind |= EventKind::EXCEPTION;
        }
        kind
    }
}

/// Level-triggered event loop over the [`Selector`] backend.
///
/// A descriptor may carry a distinct handler for each of the read, write
/// and exception conditions; every registration covers exactly one of them.
/// There is no wakeup descriptor, so all operations are expected to be
/// submitted from the loop thread itself (from inside handlers); operations
/// submitted elsewhere are only applied once the blocking wait returns.
pub struct SelectLoop {
    poller: Selector,
    handlers: HashMap<RawFd, HandlerSlots>,
    ops: chan::Receiver<PendingOp>,
    handle: Handle,
    pending_closes: Vec<RawFd>,
    running: Arc<AtomicBool>,
}

impl SelectLoop {
    pub fn new() -> Self {
        let (ops_send, ops_recv) = chan::unbounded();
        let running = Arc::new(AtomicBool::new(true));
        let handle = Handle::new(LoopKind::Select, ops_send, None, running.clone());
        SelectLoop {
            poller: Selector::new(),
            handlers: empty!(),
            ops: ops_recv,
            handle,
            pending_closes: empty!(),
            running,
        }
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
        // The trigger mode bit is silently ignored: select is always
        // level-triggered.
        let events = kind.events();
        if !HandlerSlots::supports(events) {
            #[cfg(feature = "log")]
            log::warn!(
                target: "reactor",
                "Select registration takes a single event kind, ignoring `{kind}` for fd={fd}"
            );
            return;
        }

        let slots = self.handlers.entry(fd).or_default();
        slots.set(events, handler);
        let interests = slots.interests();
        if let Err(err) = self.poller.modify(fd, interests) {
            #[cfg(feature = "log")]
            log::error!(target: "reactor", "Unable to register fd={fd}: {err}");
            slots.clear(events);
            if slots.is_empty() {
                self.handlers.remove(&fd);
            }
        }
    }

    fn apply_unregister(&mut self, fd: RawFd, kind: EventKind) {
        let events = kind.events();
        let (empty, interests) = match self.handlers.get_mut(&fd) {
            None => return,
            Some(slots) => {
                slots.clear(events);
                (slots.is_empty(), slots.interests())
            }
        };
        let result = if empty {
            self.handlers.remove(&fd);
            self.poller.remove(fd)
        } else {
            self.poller.modify(fd, interests)
        };
        if let Err(err) = result {
            #[cfg(feature = "log")]
            log::error!(target: "reactor", "Unable to narrow interest for fd={fd}: {err}");
        }
    }

    fn dispatch(&mut self) {
        while let Some((token, kind)) = self.poller.next() {
            let Token::Fd(fd) = token else {
                // The select backend has no wakeup descriptor.
                continue;
            };
            let Some(slots) = self.handlers.get_mut(&fd) else {
                #[cfg(feature = "log")]
                log::warn!(target: "reactor", "No handler registered for fd={fd}");
                continue;
            };
            if kind.contains(EventKind::READ) {
                if let Some(handler) = slots.read.as_mut() {
                    handler.on_read(fd);
                }
            }
            if kind.contains(EventKind::WRITE) {
                if let Some(handler) = slots.write.as_mut() {
                    handler.on_write(fd);
                }
            }
            if kind.contains(EventKind::EXCEPTION) {
                if let Some(handler) = slots.except.as_mut() {
                    handler.on_exception(fd);
                }
            }
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

impl Default for SelectLoop {
    fn default() -> Self { Self::new() }
}

impl EventLoop for SelectLoop {
    fn handle(&self) -> Handle { self.handle.clone() }

    fn run(&mut self) {
        while self.running.load(Ordering::Acquire) {
            self.apply_pending_ops();

            // Blocking call
            match self.poller.wait(None) {
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    #[cfg(feature = "log")]
                    log::error!(target: "reactor", "Error during select: {err}");
                    continue;
                }
            }

            self.dispatch();
            // Operations enqueued by handlers during dispatch take effect
            // before the loop blocks again, so their closes happen within
            // the current tick.
            self.apply_pending_ops();
            self.process_pending_closes();
        }
    }
}
