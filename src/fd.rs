use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};

/// Owning wrapper around a raw OS file descriptor.
///
/// Move-only: there is no way to copy a `FileDesc`, and the descriptor is
/// closed exactly once when the value is dropped. [`FileDesc::into_raw`]
/// hands the descriptor over to another owner without closing it.
#[derive(Debug)]
pub struct FileDesc(RawFd);

impl FileDesc {
    /// Takes ownership of an already-open descriptor.
    pub fn new(fd: RawFd) -> Self {
        debug_assert!(fd >= 0, "FileDesc over a negative descriptor");
        FileDesc(fd)
    }

    /// Releases ownership without closing the descriptor.
    pub fn into_raw(self) -> RawFd {
        let fd = self.0;
        mem::forget(self);
        fd
    }

    /// Puts the descriptor into non-blocking mode.
    pub fn set_nonblocking(&self) -> io::Result<()> {
        let flags = unsafe { libc::fcntl(self.0, libc::F_GETFL, 0) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::fcntl(self.0, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Marks the descriptor close-on-exec.
    pub fn set_cloexec(&self) -> io::Result<()> {
        let flags = unsafe { libc::fcntl(self.0, libc::F_GETFD, 0) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::fcntl(self.0, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl AsRawFd for FileDesc {
    fn as_raw_fd(&self) -> RawFd { self.0 }
}

impl Drop for FileDesc {
    fn drop(&mut self) {
        // Nothing useful can be done about a failing close at this point.
        unsafe { libc::close(self.0) };
    }
}

#[cfg(test)]
pub(crate) fn pipe() -> (FileDesc, FileDesc) {
    let mut fds = [0 as RawFd; 2];
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
    assert_eq!(ret, 0, "pipe2: {}", io::Error::last_os_error());
    (FileDesc::new(fds[0]), FileDesc::new(fds[1]))
}
