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

use std::collections::VecDeque;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr;
use std::sync::Arc;
use std::time::Duration;

use crate::fd::FileDesc;
use crate::poller::{EventKind, Poll, Token};

/// Sentinel distinguishing the wakeup descriptor from user descriptors in
/// kernel-returned readiness records.
const WAKEUP_TOKEN: u64 = u64::MAX;

fn epoll_interest(kind: EventKind) -> u32 {
    let mut events = 0;
    if kind.contains(EventKind::READ) {
        events |= libc::EPOLLIN;
    }
    if kind.contains(EventKind::WRITE) {
        events |= libc::EPOLLOUT;
    }
    if kind.contains(EventKind::EXCEPTION) {
        events |= libc::EPOLLERR | libc::EPOLLHUP;
    }
    if kind.contains(EventKind::HANGUP) {
        events |= libc::EPOLLHUP;
    }
    if kind.contains(EventKind::EDGE_TRIGGERED) {
        events |= libc::EPOLLET;
    }
    events as u32
}

fn ready_kind(events: u32) -> EventKind {
    let mut kind = EventKind::none();
    if events & libc::EPOLLIN as u32 != 0 {
        kind |= EventKind::READ;
    }
    if events & libc::EPOLLOUT as u32 != 0 {
        kind |= EventKind::WRITE;
    }
    if events & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
        kind |= EventKind::EXCEPTION;
    }
    if events & libc::EPOLLHUP as u32 != 0 {
        kind |= EventKind::HANGUP;
    }
    kind
}

/// Writing side of the wakeup descriptor of an [`Epoll`] backend.
///
/// Clones can be sent to any thread; a wake makes the current or next
/// blocking wait of the owning backend return promptly. The underlying
/// eventfd counter coalesces an arbitrary number of wakes into a single
/// readiness record.
#[derive(Clone)]
pub struct Waker(Arc<FileDesc>);

impl Waker {
    pub fn wake(&self) -> io::Result<()> {
        let increment = 1u64.to_ne_bytes();
        let written = unsafe {
            libc::write(
                self.0.as_raw_fd(),
                increment.as_ptr() as *const libc::c_void,
                increment.len(),
            )
        };
        if written == increment.len() as isize {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            // Counter saturated: a wake is already pending.
            return Ok(());
        }
        Err(err)
    }
}

/// Edge-capable readiness backend over a kernel-managed interest set.
///
/// Owns the multiplexer descriptor and an eventfd wakeup descriptor which
/// is registered edge-triggered under [`WAKEUP_TOKEN`] at construction.
/// When a wait collects the sentinel the eventfd is drained to empty and a
/// [`Token::Wakeup`] record is yielded in the batch position the kernel
/// reported it.
pub struct Epoll {
    epfd: FileDesc,
    waker_fd: Arc<FileDesc>,
    events: Vec<libc::epoll_event>,
    ready: VecDeque<(Token, EventKind)>,
}

impl Epoll {
    /// Creates the multiplexer and its wakeup descriptor. `max_events`
    /// bounds the number of readiness records collected per wait.
    pub fn with_capacity(max_events: usize) -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        let epfd = FileDesc::new(epfd);

        let waker_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if waker_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let waker_fd = Arc::new(FileDesc::new(waker_fd));

        let mut ev = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLET) as u32,
            u64: WAKEUP_TOKEN,
        };
        if unsafe {
            libc::epoll_ctl(
                epfd.as_raw_fd(),
                libc::EPOLL_CTL_ADD,
                waker_fd.as_raw_fd(),
                &mut ev,
            )
        } < 0
        {
            return Err(io::Error::last_os_error());
        }

        Ok(Epoll {
            epfd,
            waker_fd,
            events: vec![libc::epoll_event { events: 0, u64: 0 }; max_events],
            ready: empty!(),
        })
    }

    /// Returns a cloneable handle waking the current or next blocking wait.
    pub fn waker(&self) -> Waker { Waker(self.waker_fd.clone()) }

    fn ctl(&self, op: libc::c_int, fd: RawFd, kind: Option<EventKind>) -> io::Result<()> {
        let mut ev = libc::epoll_event { events: 0, u64: 0 };
        let ev_ptr = match kind {
            Some(kind) => {
                ev.events = epoll_interest(kind);
                ev.u64 = fd as u64;
                &mut ev as *mut libc::epoll_event
            }
            None => ptr::null_mut(),
        };
        if unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, ev_ptr) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn drain_waker(&self) {
        let mut counter = [0u8; 8];
        loop {
            let read = unsafe {
                libc::read(
                    self.waker_fd.as_raw_fd(),
                    counter.as_mut_ptr() as *mut libc::c_void,
                    counter.len(),
                )
            };
            if read == counter.len() as isize {
                continue;
            }
            let err = io::Error::last_os_error();
            if read < 0 && err.kind() != io::ErrorKind::WouldBlock {
                #[cfg(feature = "log")]
                log::warn!(target: "reactor", "Unable to drain the wakeup descriptor: {err}");
            }
            return;
        }
    }
}

impl Iterator for Epoll {
    type Item = (Token, EventKind);

    fn next(&mut self) -> Option<Self::Item> { self.ready.pop_front() }
}

impl Poll for Epoll {
    fn add(&mut self, fd: RawFd, kind: EventKind) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, Some(kind))
    }

    fn modify(&mut self, fd: RawFd, kind: EventKind) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, Some(kind))
    }

    fn remove(&mut self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, None)
    }

    fn wait(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        let timeout_ms = timeout
            .map(|duration| duration.as_millis().min(i32::MAX as u128) as i32)
            .unwrap_or(-1);

        // Blocking call
        let count = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_ms,
            )
        };
        if count < 0 {
            return Err(io::Error::last_os_error());
        }

        let before = self.ready.len();
        for i in 0..count as usize {
            let ev = self.events[i];
            if ev.u64 == WAKEUP_TOKEN {
                self.drain_waker();
                self.ready.push_back((Token::Wakeup, EventKind::READ));
            } else {
                self.ready
                    .push_back((Token::Fd(ev.u64 as RawFd), ready_kind(ev.events)));
            }
        }
        Ok(self.ready.len() - before)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fd;

    const TICK: Option<Duration> = Some(Duration::from_millis(100));
    const IDLE: Option<Duration> = Some(Duration::from_millis(50));

    fn write_byte(fd: RawFd) {
        let byte = [1u8];
        let n = unsafe { libc::write(fd, byte.as_ptr() as *const libc::c_void, 1) };
        assert_eq!(n, 1);
    }

    #[test]
    fn wakeup_coalesces() {
        let mut epoll = Epoll::with_capacity(8).unwrap();
        let waker = epoll.waker();
        for _ in 0..5 {
            waker.wake().unwrap();
        }

        assert_eq!(epoll.wait(TICK).unwrap(), 1);
        assert_eq!(epoll.next(), Some((Token::Wakeup, EventKind::READ)));
        assert_eq!(epoll.next(), None);

        // Drained: no residual readiness on the next tick.
        assert_eq!(epoll.wait(IDLE).unwrap(), 0);
    }

    #[test]
    fn wakeup_fires_again_after_drain() {
        let mut epoll = Epoll::with_capacity(8).unwrap();
        let waker = epoll.waker();
        waker.wake().unwrap();
        assert_eq!(epoll.wait(TICK).unwrap(), 1);
        epoll.next();

        waker.wake().unwrap();
        assert_eq!(epoll.wait(TICK).unwrap(), 1);
        assert_eq!(epoll.next(), Some((Token::Wakeup, EventKind::READ)));
    }

    #[test]
    fn level_triggered_readiness() {
        let mut epoll = Epoll::with_capacity(8).unwrap();
        let (reader, writer) = fd::pipe();
        epoll.add(reader.as_raw_fd(), EventKind::READ).unwrap();

        write_byte(writer.as_raw_fd());
        assert_eq!(epoll.wait(TICK).unwrap(), 1);
        let (token, kind) = epoll.next().unwrap();
        assert_eq!(token, Token::Fd(reader.as_raw_fd()));
        assert!(kind.contains(EventKind::READ));

        // Data left unread: level mode keeps reporting.
        assert_eq!(epoll.wait(TICK).unwrap(), 1);
    }

    #[test]
    fn edge_triggered_notifies_once_per_edge() {
        let mut epoll = Epoll::with_capacity(8).unwrap();
        let (reader, writer) = fd::pipe();
        epoll
            .add(
                reader.as_raw_fd(),
                EventKind::READ | EventKind::EDGE_TRIGGERED,
            )
            .unwrap();

        write_byte(writer.as_raw_fd());
        assert_eq!(epoll.wait(TICK).unwrap(), 1);
        epoll.next();

        // Unconsumed data produces no further notification without a new edge.
        assert_eq!(epoll.wait(IDLE).unwrap(), 0);

        write_byte(writer.as_raw_fd());
        assert_eq!(epoll.wait(TICK).unwrap(), 1);
    }

    #[test]
    fn duplicate_add_conflicts() {
        let mut epoll = Epoll::with_capacity(8).unwrap();
        let (reader, _writer) = fd::pipe();
        epoll.add(reader.as_raw_fd(), EventKind::READ).unwrap();

        let err = epoll.add(reader.as_raw_fd(), EventKind::READ).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        epoll
            .modify(reader.as_raw_fd(), EventKind::READ | EventKind::WRITE)
            .unwrap();
    }

    #[test]
    fn removed_fd_stays_silent() {
        let mut epoll = Epoll::with_capacity(8).unwrap();
        let (reader, writer) = fd::pipe();
        epoll.add(reader.as_raw_fd(), EventKind::READ).unwrap();
        epoll.remove(reader.as_raw_fd()).unwrap();

        write_byte(writer.as_raw_fd());
        assert_eq!(epoll.wait(IDLE).unwrap(), 0);
    }
}
