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

use std::collections::VecDeque;
use std::io;
use std::mem::MaybeUninit;
use std::os::unix::io::RawFd;
use std::ptr;
use std::time::Duration;

use crate::poller::{EventKind, Poll, Token};

/// Level-triggered readiness backend over the `select` primitive.
///
/// Keeps one descriptor bitset per watched condition and the largest
/// registered descriptor as the bound passed to the syscall. Descriptor
/// values must stay below `FD_SETSIZE`; registrations beyond that bound are
/// rejected. The [`EventKind::EDGE_TRIGGERED`] and [`EventKind::HANGUP`]
/// bits are silently ignored.
///
/// There is no wakeup descriptor: all interest-set mutations are expected
/// to come from the thread running the event loop, and the iterator never
/// yields [`Token::Wakeup`].
pub struct Selector {
    read_set: libc::fd_set,
    write_set: libc::fd_set,
    except_set: libc::fd_set,
    max_fd: RawFd,
    ready: VecDeque<(Token, EventKind)>,
}

fn empty_fd_set() -> libc::fd_set {
    let mut set = MaybeUninit::<libc::fd_set>::uninit();
    unsafe {
        libc::FD_ZERO(set.as_mut_ptr());
        set.assume_init()
    }
}

impl Selector {
    pub fn new() -> Self {
        Selector {
            read_set: empty_fd_set(),
            write_set: empty_fd_set(),
            except_set: empty_fd_set(),
            max_fd: -1,
            ready: empty!(),
        }
    }

    fn check_bounds(fd: RawFd) -> io::Result<()> {
        if fd < 0 || fd >= libc::FD_SETSIZE as RawFd {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("descriptor {fd} does not fit into a select bitset"),
            ));
        }
        Ok(())
    }

    fn clear_bits(&mut self, fd: RawFd) {
        unsafe {
            libc::FD_CLR(fd, &mut self.read_set);
            libc::FD_CLR(fd, &mut self.write_set);
            libc::FD_CLR(fd, &mut self.except_set);
        }
    }

    fn set_bits(&mut self, fd: RawFd, kind: EventKind) {
        unsafe {
            if kind.contains(EventKind::READ) {
                libc::FD_SET(fd, &mut self.read_set);
            }
            if kind.contains(EventKind::WRITE) {
                libc::FD_SET(fd, &mut self.write_set);
            }
            if kind.contains(EventKind::EXCEPTION) {
                libc::FD_SET(fd, &mut self.except_set);
            }
        }
    }

    fn watched(&self, fd: RawFd) -> bool {
        unsafe {
            libc::FD_ISSET(fd, &self.read_set)
                || libc::FD_ISSET(fd, &self.write_set)
                || libc::FD_ISSET(fd, &self.except_set)
        }
    }

    // Scans downward from `from` for the largest still-watched descriptor.
    fn rescan_max(&mut self, from: RawFd) {
        let mut fd = from;
        while fd >= 0 && !self.watched(fd) {
            fd -= 1;
        }
        self.max_fd = fd;
    }
}

impl Iterator for Selector {
    type Item = (Token, EventKind);

    fn next(&mut self) -> Option<Self::Item> { self.ready.pop_front() }
}

impl Poll for Selector {
    fn add(&mut self, fd: RawFd, kind: EventKind) -> io::Result<()> {
        Self::check_bounds(fd)?;
        self.set_bits(fd, kind.events());
        if fd > self.max_fd {
            self.max_fd = fd;
        }
        Ok(())
    }

    fn modify(&mut self, fd: RawFd, kind: EventKind) -> io::Result<()> {
        Self::check_bounds(fd)?;
        self.clear_bits(fd);
        self.set_bits(fd, kind.events());
        if fd > self.max_fd {
            self.max_fd = fd;
        } else if fd == self.max_fd && !self.watched(fd) {
            self.rescan_max(fd);
        }
        Ok(())
    }

    fn remove(&mut self, fd: RawFd) -> io::Result<()> {
        Self::check_bounds(fd)?;
        self.clear_bits(fd);
        if fd == self.max_fd {
            self.rescan_max(fd);
        }
        Ok(())
    }

    fn wait(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        let mut read_copy = self.read_set;
        let mut write_copy = self.write_set;
        let mut except_copy = self.except_set;

        let mut tv = libc::timeval { tv_sec: 0, tv_usec: 0 };
        let tv_ptr = match timeout {
            Some(duration) => {
                tv.tv_sec = duration.as_secs() as libc::time_t;
                tv.tv_usec = duration.subsec_micros() as libc::suseconds_t;
                &mut tv as *mut libc::timeval
            }
            None => ptr::null_mut(),
        };

        // Blocking call
        let activity = unsafe {
            libc::select(
                self.max_fd + 1,
                &mut read_copy,
                &mut write_copy,
                &mut except_copy,
                tv_ptr,
            )
        };
        if activity < 0 {
            return Err(io::Error::last_os_error());
        }

        let before = self.ready.len();
        for fd in 0..=self.max_fd {
            unsafe {
                if libc::FD_ISSET(fd, &read_copy) {
                    self.ready.push_back((Token::Fd(fd), EventKind::READ));
                }
                if libc::FD_ISSET(fd, &write_copy) {
                    self.ready.push_back((Token::Fd(fd), EventKind::WRITE));
                }
                if libc::FD_ISSET(fd, &except_copy) {
                    self.ready.push_back((Token::Fd(fd), EventKind::EXCEPTION));
                }
            }
        }
        Ok(self.ready.len() - before)
    }
}

#[cfg(test)]
mod test {
    use std::os::unix::io::AsRawFd;

    use super::*;
    use crate::fd;

    const TICK: Option<Duration> = Some(Duration::from_millis(100));

    fn write_byte(fd: RawFd) {
        let byte = [1u8];
        let n = unsafe { libc::write(fd, byte.as_ptr() as *const libc::c_void, 1) };
        assert_eq!(n, 1);
    }

    #[test]
    fn read_readiness() {
        let mut selector = Selector::new();
        let (reader, writer) = fd::pipe();
        selector.add(reader.as_raw_fd(), EventKind::READ).unwrap();

        write_byte(writer.as_raw_fd());
        assert_eq!(selector.wait(TICK).unwrap(), 1);
        assert_eq!(
            selector.next(),
            Some((Token::Fd(reader.as_raw_fd()), EventKind::READ))
        );
        assert_eq!(selector.next(), None);
    }

    #[test]
    fn write_readiness() {
        let mut selector = Selector::new();
        let (_reader, writer) = fd::pipe();
        selector.add(writer.as_raw_fd(), EventKind::WRITE).unwrap();

        assert_eq!(selector.wait(TICK).unwrap(), 1);
        assert_eq!(
            selector.next(),
            Some((Token::Fd(writer.as_raw_fd()), EventKind::WRITE))
        );
    }

    #[test]
    fn level_triggered_rereports() {
        let mut selector = Selector::new();
        let (reader, writer) = fd::pipe();
        selector.add(reader.as_raw_fd(), EventKind::READ).unwrap();

        write_byte(writer.as_raw_fd());
        assert_eq!(selector.wait(TICK).unwrap(), 1);
        selector.next();
        // Data not consumed: the next wait must report the descriptor again.
        assert_eq!(selector.wait(TICK).unwrap(), 1);
    }

    #[test]
    fn removed_fd_stays_silent() {
        let mut selector = Selector::new();
        let (reader, writer) = fd::pipe();
        selector.add(reader.as_raw_fd(), EventKind::READ).unwrap();
        selector.remove(reader.as_raw_fd()).unwrap();

        write_byte(writer.as_raw_fd());
        assert_eq!(selector.wait(Some(Duration::from_millis(50))).unwrap(), 0);
        assert_eq!(selector.next(), None);
    }

    #[test]
    fn max_fd_rescan_keeps_lower_registrations() {
        let mut selector = Selector::new();
        let (low_reader, low_writer) = fd::pipe();
        let (high_reader, _high_writer) = fd::pipe();
        assert!(low_reader.as_raw_fd() < high_reader.as_raw_fd());

        selector.add(low_reader.as_raw_fd(), EventKind::READ).unwrap();
        selector.add(high_reader.as_raw_fd(), EventKind::READ).unwrap();
        selector.remove(high_reader.as_raw_fd()).unwrap();

        write_byte(low_writer.as_raw_fd());
        assert_eq!(selector.wait(TICK).unwrap(), 1);
        assert_eq!(
            selector.next(),
            Some((Token::Fd(low_reader.as_raw_fd()), EventKind::READ))
        );
    }

    #[test]
    fn rejects_fd_beyond_bitset() {
        let mut selector = Selector::new();
        let err = selector
            .add(libc::FD_SETSIZE as RawFd, EventKind::READ)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        let err = selector.add(-1, EventKind::READ).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
