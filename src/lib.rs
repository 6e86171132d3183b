//! Readiness-based I/O event dispatch with two interchangeable backends: a
//! level-triggered reactor over the `select` primitive and an edge-capable
//! reactor over `epoll` with thread-safe cross-thread registration through
//! an internal wakeup descriptor.
//!
//! An event loop owns a readiness backend, a registry mapping descriptors
//! to their handlers, a queue of deferred interest-set operations and a
//! deferred-close list. One thread runs the loop and executes all handler
//! callbacks; everything else talks to the loop through cloneable
//! [`Handle`]s. Interest-set mutations and closes are always deferred onto
//! the loop thread, which keeps descriptor lifecycle free of close-then-
//! reuse races with readiness records still in flight.
//!
//! The [`acceptor`] module drives such a loop as a minimal non-blocking
//! HTTP responder and doubles as the reference for writing handlers.

#[macro_use]
extern crate amplify;

pub mod acceptor;
mod fd;
mod handler;
pub mod poller;
pub mod reactor;

pub use acceptor::Acceptor;
pub use fd::FileDesc;
pub use handler::{EventHandler, FnHandler};
pub use poller::{EventKind, Poll, Token};
pub use reactor::{create_event_loop, EpollLoop, Error, EventLoop, Handle, LoopKind, SelectLoop};
