//! Detach from the controlling terminal.

use std::ffi::CStr;
use std::io;

/// Fork, let the parent exit, and start a new session in the child with
/// stdio pointed at `/dev/null`.
///
/// Must run before any threads are spawned: only the calling thread
/// survives the fork.
pub(crate) fn daemonize() -> io::Result<()> {
    // Safety: single-threaded at this point; the parent only calls _exit.
    match unsafe { libc::fork() } {
        -1 => return Err(io::Error::last_os_error()),
        0 => {}
        _ => unsafe { libc::_exit(0) },
    }
    if unsafe { libc::setsid() } == -1 {
        return Err(io::Error::last_os_error());
    }

    let dev_null: &CStr = c"/dev/null";
    let fd = unsafe { libc::open(dev_null.as_ptr(), libc::O_RDWR) };
    if fd == -1 {
        return Err(io::Error::last_os_error());
    }
    for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        if unsafe { libc::dup2(fd, target) } == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    if fd > libc::STDERR_FILENO {
        unsafe { libc::close(fd) };
    }
    Ok(())
}
