//! Owned pipe pairs and fd mode switching over raw libc calls.
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

/// Both ends of an anonymous pipe. Each end closes itself on drop, in
/// whatever order the caller tears them down.
pub struct Pipe {
    pub rd: OwnedFd,
    pub wr: OwnedFd,
}

impl Pipe {
    pub fn create() -> io::Result<Pipe> {
        Self::create_with_flags(libc::O_CLOEXEC)
    }

    pub fn create_non_blocking() -> io::Result<Pipe> {
        Self::create_with_flags(libc::O_CLOEXEC | libc::O_NONBLOCK)
    }

    fn create_with_flags(flags: libc::c_int) -> io::Result<Pipe> {
        let mut fds = [0 as libc::c_int; 2];
        let res = unsafe { libc::pipe2(fds.as_mut_ptr(), flags) };
        if res != 0 {
            return Err(io::Error::last_os_error());
        }
        unsafe {
            Ok(Pipe {
                rd: OwnedFd::from_raw_fd(fds[0]),
                wr: OwnedFd::from_raw_fd(fds[1]),
            })
        }
    }
}

pub fn set_blocking(fd: BorrowedFd<'_>, blocking: bool) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let flags = if blocking {
        flags & !libc::O_NONBLOCK
    } else {
        flags | libc::O_NONBLOCK
    };
    let res = unsafe { libc::fcntl(raw, libc::F_SETFL, flags) };
    if res != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
