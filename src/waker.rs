use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use crate::sys::EventFd;

/// Wakes a thread blocked in `Epoll::wait` from any other thread.
///
/// Backed by an eventfd registered with the selector; waking writes to it,
/// and the woken loop drains it before going back to sleep.
#[derive(Debug)]
pub struct Waker {
    inner: EventFd,
}

impl Waker {
    pub fn new() -> io::Result<Waker> {
        Ok(Waker {
            inner: EventFd::new()?,
        })
    }

    pub fn wakeup(&self) -> io::Result<()> {
        match self.inner.write(1) {
            Ok(_) => Ok(()),
            Err(e) => {
                if e.kind() == io::ErrorKind::WouldBlock {
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }

    pub fn drain(&self) -> io::Result<()> {
        match self.inner.read() {
            Ok(_) => Ok(()),
            Err(e) => {
                if e.kind() == io::ErrorKind::WouldBlock {
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }
}

impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}
