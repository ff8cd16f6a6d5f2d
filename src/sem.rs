//! Cross-process binary semaphore.
//!
//! The queue uses a pair of these to emulate condition variables across
//! address spaces: one is signaled on the empty -> maybe-not-empty transition,
//! the other on full -> maybe-not-full. Signaling is edge-triggered — the
//! producer and consumer only signal when `is_available` reports the
//! semaphore unset, and the contract is merely that the semaphore was
//! non-zero at some point after the corresponding cursor store, not that
//! every operation produces a wake-up. Waiters must therefore treat a
//! successful wait as a hint and re-check queue state.

use std::sync::Arc;
use std::time::Duration;

use crate::{Error, Result};

/// Exported identity of a semaphore, importable by a peer process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SemHandle {
    pub pid: u32,
    pub fd: i32,
}

impl SemHandle {
    /// A handle is usable only if it names a real descriptor in a live
    /// process.
    pub fn is_valid(&self) -> bool {
        self.pid != 0 && self.fd >= 0
    }
}

#[cfg(target_os = "linux")]
mod platform {
    use std::mem;
    use std::os::unix::io::RawFd;
    use std::time::{Duration, Instant};

    use libc::{poll, pollfd, POLLIN};

    use super::SemHandle;
    use crate::{Error, Result};

    pub struct SemaphoreImpl {
        fd: RawFd,
    }

    impl SemaphoreImpl {
        pub fn create(initial: u32) -> Result<Self> {
            // EFD_SEMAPHORE makes each read decrement the counter by one,
            // which is exactly sem_wait; EFD_NONBLOCK lets a raced read after
            // poll() report WouldBlock instead of hanging.
            let fd = unsafe {
                libc::eventfd(
                    initial,
                    libc::EFD_CLOEXEC | libc::EFD_NONBLOCK | libc::EFD_SEMAPHORE,
                )
            };
            if fd < 0 {
                return Err(Error::Io(std::io::Error::last_os_error()));
            }
            Ok(Self { fd })
        }

        pub fn from_handle(handle: SemHandle) -> Result<Self> {
            if !handle.is_valid() {
                return Err(Error::Fatal("invalid semaphore handle"));
            }
            let fd = open_proc_fd(handle.pid, handle.fd)?;
            Ok(Self { fd })
        }

        pub fn handle(&self) -> SemHandle {
            SemHandle {
                pid: std::process::id(),
                fd: self.fd,
            }
        }

        /// Blocks until the semaphore can be decremented or the timeout
        /// expires. Returns false on timeout.
        pub fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
            let deadline = timeout.map(|t| Instant::now() + t);
            loop {
                let poll_ms: libc::c_int = match deadline {
                    None => -1,
                    Some(deadline) => {
                        let remaining = deadline.saturating_duration_since(Instant::now());
                        if remaining.is_zero() {
                            return Ok(false);
                        }
                        // Round up so a sub-millisecond budget still sleeps.
                        remaining
                            .as_millis()
                            .max(1)
                            .try_into()
                            .unwrap_or(libc::c_int::MAX)
                    }
                };
                let mut pfd = pollfd {
                    fd: self.fd,
                    events: POLLIN,
                    revents: 0,
                };
                let res = unsafe { poll(&mut pfd, 1, poll_ms) };
                if res < 0 {
                    let err = std::io::Error::last_os_error();
                    if err.kind() == std::io::ErrorKind::Interrupted {
                        continue;
                    }
                    return Err(Error::Io(err));
                }
                if res == 0 {
                    // poll timed out; loop re-checks the deadline and exits.
                    continue;
                }
                let mut value: u64 = 0;
                let n = unsafe {
                    libc::read(
                        self.fd,
                        &mut value as *mut u64 as *mut _,
                        mem::size_of::<u64>(),
                    )
                };
                if n >= 0 {
                    return Ok(true);
                }
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::WouldBlock {
                    // Raced with another decrement; wait again.
                    continue;
                }
                return Err(Error::Io(err));
            }
        }

        pub fn signal(&self) -> Result<()> {
            let value: u64 = 1;
            let res = unsafe {
                libc::write(
                    self.fd,
                    &value as *const u64 as *const _,
                    mem::size_of::<u64>(),
                )
            };
            if res < 0 {
                return Err(Error::Io(std::io::Error::last_os_error()));
            }
            Ok(())
        }

        /// Best-effort: true if the semaphore could currently be decremented.
        /// The answer may be stale by the time the caller acts on it; the
        /// edge-triggered signaling protocol tolerates that.
        pub fn is_available(&self) -> bool {
            let mut pfd = pollfd {
                fd: self.fd,
                events: POLLIN,
                revents: 0,
            };
            let res = unsafe { poll(&mut pfd, 1, 0) };
            res > 0 && (pfd.revents & POLLIN) != 0
        }
    }

    impl Drop for SemaphoreImpl {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.fd);
            }
        }
    }

    fn open_proc_fd(pid: u32, fd: RawFd) -> Result<RawFd> {
        use std::ffi::CString;
        let path = format!("/proc/{pid}/fd/{fd}");
        let cpath = CString::new(path).map_err(|_| Error::Unsupported("proc path contains NUL"))?;
        let new_fd = unsafe { libc::open(cpath.as_ptr(), libc::O_RDWR | libc::O_CLOEXEC) };
        if new_fd < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Ok(new_fd)
    }
}

#[cfg(not(target_os = "linux"))]
mod platform {
    use std::sync::{Condvar, Mutex};
    use std::time::Duration;

    use super::SemHandle;
    use crate::{Error, Result};

    /// In-process stand-in. Correct for a producer and consumer on two
    /// threads of one process; export to another process is not supported
    /// on this platform.
    pub struct SemaphoreImpl {
        count: Mutex<u64>,
        cond: Condvar,
    }

    impl SemaphoreImpl {
        pub fn create(initial: u32) -> Result<Self> {
            Ok(Self {
                count: Mutex::new(u64::from(initial)),
                cond: Condvar::new(),
            })
        }

        pub fn from_handle(_handle: SemHandle) -> Result<Self> {
            Err(Error::Unsupported(
                "cross-process semaphore import requires linux",
            ))
        }

        pub fn handle(&self) -> SemHandle {
            SemHandle { pid: 0, fd: -1 }
        }

        pub fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
            let mut count = self
                .count
                .lock()
                .map_err(|_| Error::Fatal("semaphore lock poisoned"))?;
            match timeout {
                None => {
                    while *count == 0 {
                        count = self
                            .cond
                            .wait(count)
                            .map_err(|_| Error::Fatal("semaphore lock poisoned"))?;
                    }
                }
                Some(timeout) => {
                    let (guard, result) = self
                        .cond
                        .wait_timeout_while(count, timeout, |count| *count == 0)
                        .map_err(|_| Error::Fatal("semaphore lock poisoned"))?;
                    count = guard;
                    if result.timed_out() && *count == 0 {
                        return Ok(false);
                    }
                }
            }
            *count -= 1;
            Ok(true)
        }

        pub fn signal(&self) -> Result<()> {
            let mut count = self
                .count
                .lock()
                .map_err(|_| Error::Fatal("semaphore lock poisoned"))?;
            *count += 1;
            self.cond.notify_one();
            Ok(())
        }

        pub fn is_available(&self) -> bool {
            self.count.lock().map(|count| *count > 0).unwrap_or(false)
        }
    }
}

/// Reference-counted handle to a cross-process binary semaphore.
///
/// Cloning shares the underlying primitive; the producer and consumer ends of
/// one queue hold clones of the same two semaphores.
#[derive(Clone)]
pub struct Semaphore {
    inner: Arc<platform::SemaphoreImpl>,
}

impl Semaphore {
    /// Creates a semaphore with the given initial count (0 or 1 for the
    /// queue's use).
    pub fn create(initial: u32) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(platform::SemaphoreImpl::create(initial)?),
        })
    }

    /// Re-imports a semaphore exported by `share_handle` in another process.
    pub fn from_handle(handle: SemHandle) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(platform::SemaphoreImpl::from_handle(handle)?),
        })
    }

    /// Exports this semaphore for transfer to a peer process. The exporting
    /// process must keep its end alive until the peer has imported the
    /// handle.
    pub fn share_handle(&self) -> Result<SemHandle> {
        let handle = self.inner.handle();
        if !handle.is_valid() {
            return Err(Error::Unsupported(
                "cross-process semaphore export requires linux",
            ));
        }
        Ok(handle)
    }

    /// Waits for the semaphore, decrementing it on success. `None` waits
    /// indefinitely. Returns false if the timeout elapsed first.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        self.inner.wait(timeout)
    }

    /// Increments the semaphore, waking a waiter if one is parked.
    pub fn signal(&self) -> Result<()> {
        self.inner.signal()
    }

    /// Best-effort check whether the semaphore is currently signaled.
    pub fn is_available(&self) -> bool {
        self.inner.is_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn signal_then_wait_succeeds_immediately() {
        let sem = Semaphore::create(0).unwrap();
        assert!(!sem.is_available());
        sem.signal().unwrap();
        assert!(sem.is_available());
        assert!(sem.wait(Some(Duration::from_millis(100))).unwrap());
        assert!(!sem.is_available());
    }

    #[test]
    fn initial_count_is_honored() {
        let sem = Semaphore::create(1).unwrap();
        assert!(sem.is_available());
        assert!(sem.wait(Some(Duration::from_millis(100))).unwrap());
        assert!(!sem.is_available());
    }

    #[test]
    fn bounded_wait_times_out() {
        let sem = Semaphore::create(0).unwrap();
        let start = Instant::now();
        let acquired = sem.wait(Some(Duration::from_millis(50))).unwrap();
        assert!(!acquired);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(45));
        assert!(elapsed < Duration::from_secs(2));
    }

    #[test]
    fn wakes_waiter_on_another_thread() {
        let sem = Semaphore::create(0).unwrap();
        let waiter = sem.clone();
        let handle = std::thread::spawn(move || waiter.wait(Some(Duration::from_secs(5))).unwrap());
        std::thread::sleep(Duration::from_millis(20));
        sem.signal().unwrap();
        assert!(handle.join().unwrap());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn handle_round_trip_within_process() {
        let sem = Semaphore::create(0).unwrap();
        let imported = Semaphore::from_handle(sem.share_handle().unwrap()).unwrap();
        sem.signal().unwrap();
        assert!(imported.wait(Some(Duration::from_millis(100))).unwrap());
    }
}
