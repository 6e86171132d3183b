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

pub mod epoll;
pub mod select;

use std::fmt::{self, Display, Formatter};
use std::io;
use std::ops;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Set of I/O conditions a descriptor can be watched for, plus the
/// edge-trigger registration mode.
///
/// [`EventKind::EDGE_TRIGGERED`] is a mode bit, not an event: it changes how
/// a registration behaves but is never reported back from a wait.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Default)]
pub struct EventKind(u8);

impl EventKind {
    /// The descriptor has data to read.
    pub const READ: EventKind = EventKind(0x01);
    /// The descriptor accepts writes without blocking.
    pub const WRITE: EventKind = EventKind(0x02);
    /// The peer hung up.
    pub const HANGUP: EventKind = EventKind(0x04);
    /// Register in edge-triggered mode (backends without edge support
    /// silently ignore the bit).
    pub const EDGE_TRIGGERED: EventKind = EventKind(0x08);
    /// An error or hangup condition on the descriptor.
    pub const EXCEPTION: EventKind = EventKind(0x10);

    pub fn none() -> Self { EventKind(0) }

    pub fn is_empty(self) -> bool { self.0 == 0 }

    /// Checks that every bit of `other` is present in `self`.
    pub fn contains(self, other: EventKind) -> bool { self.0 & other.0 == other.0 }

    /// Checks that at least one bit of `other` is present in `self`.
    pub fn intersects(self, other: EventKind) -> bool { self.0 & other.0 != 0 }

    /// The event bits with the [`EventKind::EDGE_TRIGGERED`] mode bit
    /// stripped off.
    pub fn events(self) -> EventKind { EventKind(self.0 & !Self::EDGE_TRIGGERED.0) }
}

impl ops::BitOr for EventKind {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output { EventKind(self.0 | rhs.0) }
}

impl ops::BitOrAssign for EventKind {
    fn bitor_assign(&mut self, rhs: Self) { self.0 |= rhs.0 }
}

impl ops::BitAnd for EventKind {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self::Output { EventKind(self.0 & rhs.0) }
}

impl Display for EventKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let mut first = true;
        for (bit, name) in [
            (Self::READ, "read"),
            (Self::WRITE, "write"),
            (Self::HANGUP, "hangup"),
            (Self::EDGE_TRIGGERED, "edge-triggered"),
            (Self::EXCEPTION, "exception"),
        ] {
            if self.contains(bit) {
                if !first {
                    f.write_str("+")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Identity of a readiness record returned from [`Poll::wait`].
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Token {
    /// The backend's internal wakeup descriptor became readable; the
    /// descriptor has already been drained by the backend.
    Wakeup,
    /// A user-registered descriptor.
    Fd(RawFd),
}

/// Readiness multiplexer used by the event loop.
///
/// After a successful [`Poll::wait`] the collected readiness records are
/// consumed through the iterator interface, in the order the underlying
/// primitive reported them.
pub trait Poll
where Self: Send + Iterator<Item = (Token, EventKind)>
{
    /// Adds a descriptor to the interest set. `kind` carries the trigger
    /// mode along with the event bits.
    fn add(&mut self, fd: RawFd, kind: EventKind) -> io::Result<()>;

    /// Replaces the interest of an already-watched descriptor.
    fn modify(&mut self, fd: RawFd, kind: EventKind) -> io::Result<()>;

    /// Removes a descriptor from the interest set entirely.
    fn remove(&mut self, fd: RawFd) -> io::Result<()>;

    /// Blocks until at least one descriptor is ready, a signal interrupts
    /// (`ErrorKind::Interrupted`, retried by callers) or `timeout` elapses.
    /// `None` blocks indefinitely. Returns the number of collected records.
    fn wait(&mut self, timeout: Option<Duration>) -> io::Result<usize>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn kind_algebra() {
        let kind = EventKind::READ | EventKind::EDGE_TRIGGERED;
        assert!(kind.contains(EventKind::READ));
        assert!(kind.contains(EventKind::EDGE_TRIGGERED));
        assert!(!kind.contains(EventKind::WRITE));
        assert!(kind.intersects(EventKind::READ | EventKind::WRITE));
        assert!(!kind.intersects(EventKind::WRITE | EventKind::EXCEPTION));
        assert_eq!(kind & EventKind::READ, EventKind::READ);
        assert_eq!(kind.events(), EventKind::READ);
        assert!(EventKind::none().is_empty());
    }

    #[test]
    fn kind_accumulates() {
        let mut kind = EventKind::none();
        kind |= EventKind::WRITE;
        kind |= EventKind::EXCEPTION;
        assert_eq!(kind, EventKind::WRITE | EventKind::EXCEPTION);
    }

    #[test]
    fn kind_display() {
        assert_eq!(EventKind::none().to_string(), "none");
        assert_eq!(EventKind::READ.to_string(), "read");
        assert_eq!(
            (EventKind::READ | EventKind::EDGE_TRIGGERED).to_string(),
            "read+edge-triggered"
        );
        assert_eq!(
            (EventKind::WRITE | EventKind::EXCEPTION).to_string(),
            "write+exception"
        );
    }
}
