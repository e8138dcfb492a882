//! Thin wrappers around the Linux system calls used by the backends.
//!
//! Every descriptor created here is returned as an [`OwnedFd`], so it is
//! closed on every exit path, including early returns on error.

use libc::{
    EPOLL_CLOEXEC, CLOCK_MONOTONIC, TFD_CLOEXEC, TFD_NONBLOCK, c_int, epoll_create1, epoll_ctl,
    epoll_event, epoll_wait, itimerspec, poll, pollfd, timerfd_create, timerfd_settime, timespec,
};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

/// Converts a wait duration to a poll timeout in milliseconds.
///
/// Sub-millisecond remainders round up so a short wait never turns into a
/// busy poll.
pub(crate) fn timeout_ms(timeout: Duration) -> c_int {
    let mut ms = timeout.as_millis();
    if timeout.subsec_nanos() % 1_000_000 != 0 {
        ms += 1;
    }
    ms.min(c_int::MAX as u128) as c_int
}

/// Creates a close-on-exec `epoll` instance.
pub(crate) fn sys_epoll_create() -> io::Result<OwnedFd> {
    let fd = unsafe { epoll_create1(EPOLL_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Adds, modifies or deletes `fd` in the interest list of `epoll`.
pub(crate) fn sys_epoll_ctl(epoll: RawFd, op: c_int, fd: RawFd, events: u32, data: u64) -> io::Result<()> {
    let mut event = epoll_event { events, u64: data };

    let rc = unsafe { epoll_ctl(epoll, op, fd, &mut event) };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Waits for events on `epoll`, filling `buffer` up to its capacity.
///
/// An interrupted wait reports zero events.
pub(crate) fn sys_epoll_wait(epoll: RawFd, buffer: &mut Vec<epoll_event>, timeout: c_int) -> io::Result<usize> {
    buffer.clear();

    let n = unsafe {
        epoll_wait(
            epoll,
            buffer.as_mut_ptr(),
            buffer.capacity() as c_int,
            timeout,
        )
    };

    if n < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(0);
        }
        return Err(err);
    }

    unsafe {
        buffer.set_len(n as usize);
    }

    Ok(n as usize)
}

/// Creates a non-blocking monotonic `timerfd`.
pub(crate) fn sys_timerfd_create() -> io::Result<OwnedFd> {
    let fd = unsafe { timerfd_create(CLOCK_MONOTONIC, TFD_NONBLOCK | TFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Arms `timer` to fire once after `delay`, or disarms it with `None`.
///
/// A zero `it_value` disarms a timerfd, so callers wanting an immediate
/// expiry must pass a non-zero delay.
pub(crate) fn sys_timerfd_settime(timer: &OwnedFd, delay: Option<Duration>) -> io::Result<()> {
    let value = match delay {
        Some(delay) => timespec {
            tv_sec: delay.as_secs() as _,
            tv_nsec: delay.subsec_nanos() as _,
        },
        None => timespec {
            tv_sec: 0,
            tv_nsec: 0,
        },
    };

    let spec = itimerspec {
        it_interval: timespec {
            tv_sec: 0,
            tv_nsec: 0,
        },
        it_value: value,
    };

    let rc = unsafe { timerfd_settime(timer.as_raw_fd(), 0, &spec, std::ptr::null_mut()) };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Reads and clears the expiration counter of `timer`.
///
/// Returns `0` when the timer has not expired.
pub(crate) fn sys_timerfd_read(timer: &OwnedFd) -> io::Result<u64> {
    let mut expirations = 0u64;

    let n = unsafe {
        libc::read(
            timer.as_raw_fd(),
            &mut expirations as *mut u64 as *mut _,
            std::mem::size_of::<u64>(),
        )
    };

    if n < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(0);
        }
        return Err(err);
    }

    Ok(expirations)
}

/// `poll(2)` over `fds`. An interrupted wait reports zero ready entries.
pub(crate) fn sys_poll(fds: &mut [pollfd], timeout: c_int) -> io::Result<usize> {
    let n = unsafe { poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout) };

    if n < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(0);
        }
        return Err(err);
    }

    Ok(n as usize)
}
