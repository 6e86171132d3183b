use std::os::unix::io::RawFd;

/// Callback surface dispatched by an event loop.
///
/// All entry points are invoked from the thread running the loop, with the
/// descriptor whose readiness triggered the call. A handler must not block:
/// the loop has a single suspension point and a blocking callback stalls
/// every other connection. Handlers may freely call the deferred
/// [`crate::Handle`] operations for any descriptor, including their own.
///
/// A handler registered edge-triggered must drain its descriptor until the
/// operation reports `WouldBlock` on every invocation; the loop will not
/// notify again until new I/O arrives.
pub trait EventHandler {
    /// The descriptor is ready for reading.
    fn on_read(&mut self, fd: RawFd);

    /// The descriptor is ready for writing.
    fn on_write(&mut self, _fd: RawFd) {}

    /// An error or hangup condition was reported for the descriptor.
    fn on_exception(&mut self, _fd: RawFd) {}
}

/// Adapter exposing a plain closure as a read handler.
pub struct FnHandler<F: FnMut(RawFd)>(F);

impl<F: FnMut(RawFd)> FnHandler<F> {
    pub fn new(on_read: F) -> Self { FnHandler(on_read) }
}

impl<F: FnMut(RawFd)> EventHandler for FnHandler<F> {
    fn on_read(&mut self, fd: RawFd) { (self.0)(fd) }
}
