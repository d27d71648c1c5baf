macro_rules! syscall {
    ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

mod epoll;
mod eventfd;
mod fd;

pub use epoll::{Epoll, Event, Events};
pub use eventfd::EventFd;
pub use fd::FileDesc;
