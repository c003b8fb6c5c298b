use std::{
    io,
    os::fd::{AsRawFd, OwnedFd, RawFd},
    sync::Mutex,
    time::Duration,
};

use tracing::{debug, warn};
use trellis_object::Fault;

use crate::Handle;

/// Receive and send timeout applied to every pooled socket so a hung
/// peer cannot block a worker indefinitely.
pub const SOCKET_TIMEOUT: Duration = Duration::from_secs(5);

type Hook<S> = Box<dyn Fn(Handle, &mut S) + Send + Sync>;

struct Slot<S> {
    fd: Option<OwnedFd>,
    generation: u16,
    state: S,
}

/// Fixed-capacity table of owned socket fds addressed by generational
/// [`Handle`]s.
///
/// The pool is the only owner of each fd. Slot metadata is guarded by a
/// single mutex; fd I/O happens with the mutex released, and a released
/// handle observed after the fact surfaces as `NotConnected`.
pub struct SocketPool<S> {
    slots: Mutex<Box<[Slot<S>]>>,
    on_register: Option<Hook<S>>,
    on_release: Option<Hook<S>>,
}

impl<S: Default> SocketPool<S> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0 && capacity <= u16::MAX as usize + 1);
        let slots = (0..capacity)
            .map(|_| Slot { fd: None, generation: 0, state: S::default() })
            .collect();
        Self { slots: Mutex::new(slots), on_register: None, on_release: None }
    }

    /// Runs after a slot is claimed, with the slot's state reset window
    /// still open (under the pool mutex).
    pub fn with_on_register(mut self, hook: impl Fn(Handle, &mut S) + Send + Sync + 'static) -> Self {
        self.on_register = Some(Box::new(hook));
        self
    }

    /// Runs as a slot is released, before the fd is closed (under the
    /// pool mutex). Must not re-enter this pool.
    pub fn with_on_release(mut self, hook: impl Fn(Handle, &mut S) + Send + Sync + 'static) -> Self {
        self.on_release = Some(Box::new(hook));
        self
    }
}

impl<S: Default> SocketPool<S> {
    /// Claims a free slot for `fd`. Fails `NoMem` when the pool is full.
    pub fn register(&self, fd: OwnedFd) -> Result<Handle, Fault> {
        let mut slots = self.slots.lock().unwrap();
        let Some(index) = slots.iter().position(|s| s.fd.is_none()) else {
            warn!("socket pool exhausted");
            return Err(Fault::NoMem);
        };

        let slot = &mut slots[index];
        slot.generation = slot.generation.wrapping_add(1);
        slot.fd = Some(fd);
        slot.state = S::default();

        let handle = Handle::new(index as u16, slot.generation);
        if let Some(hook) = &self.on_register {
            hook(handle, &mut slot.state);
        }
        debug!(handle = handle.raw(), "registered socket");
        Ok(handle)
    }

    /// Releases the slot, firing the release hook and closing the fd.
    /// Stale handles are silent no-ops.
    pub fn close(&self, handle: Handle) {
        let released = {
            let mut slots = self.slots.lock().unwrap();
            let Some(slot) = live_slot(&mut slots, handle) else {
                return;
            };
            let fd = slot.fd.take();
            if let Some(hook) = &self.on_release {
                hook(handle, &mut slot.state);
            }
            slot.generation = slot.generation.wrapping_add(1);
            fd
        };
        // Closing outside the lock; dropping OwnedFd closes the fd and
        // removes it from any epoll interest lists.
        drop(released);
        debug!(handle = handle.raw(), "closed socket");
    }

    /// Runs `f` on the slot state while holding the pool mutex, so the
    /// slot cannot be released underneath.
    pub fn with_slot<R>(&self, handle: Handle, f: impl FnOnce(&mut S) -> R) -> Result<R, Fault> {
        let mut slots = self.slots.lock().unwrap();
        let slot = live_slot(&mut slots, handle).ok_or(Fault::NotConnected)?;
        Ok(f(&mut slot.state))
    }

    fn fd_of(&self, handle: Handle) -> Result<RawFd, Fault> {
        let mut slots = self.slots.lock().unwrap();
        let slot = live_slot(&mut slots, handle).ok_or(Fault::NotConnected)?;
        Ok(slot.fd.as_ref().expect("live slot has fd").as_raw_fd())
    }

    fn still_live(&self, handle: Handle) -> bool {
        let mut slots = self.slots.lock().unwrap();
        live_slot(&mut slots, handle).is_some()
    }

    /// Reads exactly `buf.len()` bytes. `EINTR` is retried; the socket
    /// timeout bounds the total wait.
    pub fn read(&self, handle: Handle, buf: &mut [u8]) -> Result<(), Fault> {
        let fd = self.fd_of(handle)?;
        let mut filled = 0;
        while filled < buf.len() {
            let n = unsafe {
                libc::read(fd, buf[filled..].as_mut_ptr().cast(), buf.len() - filled)
            };
            match n {
                0 => return Err(Fault::NotConnected),
                n if n > 0 => filled += n as usize,
                _ => io_retry_or_fail("read")?,
            }
        }
        if self.still_live(handle) { Ok(()) } else { Err(Fault::NotConnected) }
    }

    /// Writes all of `buf`, retrying partial writes and `EINTR`.
    pub fn write(&self, handle: Handle, buf: &[u8]) -> Result<(), Fault> {
        let fd = self.fd_of(handle)?;
        let mut sent = 0;
        while sent < buf.len() {
            let n = unsafe { libc::write(fd, buf[sent..].as_ptr().cast(), buf.len() - sent) };
            match n {
                n if n > 0 => sent += n as usize,
                0 => return Err(Fault::NotConnected),
                _ => io_retry_or_fail("write")?,
            }
        }
        if self.still_live(handle) { Ok(()) } else { Err(Fault::NotConnected) }
    }

    /// Whether buffered input is already available on the socket.
    pub fn has_pending_input(&self, handle: Handle) -> Result<bool, Fault> {
        let fd = self.fd_of(handle)?;
        let mut pfd = libc::pollfd { fd, events: libc::POLLIN, revents: 0 };
        let ret = unsafe { libc::poll(&mut pfd, 1, 0) };
        if ret < 0 {
            return Err(Fault::Failure);
        }
        Ok(ret > 0 && (pfd.revents & libc::POLLIN) != 0)
    }

    /// Pid of the connected peer, via `SO_PEERCRED`.
    pub fn peer_pid(&self, handle: Handle) -> Result<i32, Fault> {
        let fd = self.fd_of(handle)?;
        let mut cred = libc::ucred { pid: 0, uid: 0, gid: 0 };
        let mut len = size_of::<libc::ucred>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_PEERCRED,
                std::ptr::from_mut(&mut cred).cast(),
                &mut len,
            )
        };
        if ret != 0 {
            warn!(err = ?io::Error::last_os_error(), "SO_PEERCRED failed");
            return Err(Fault::Failure);
        }
        Ok(cred.pid)
    }
}

fn live_slot<'s, S>(slots: &'s mut [Slot<S>], handle: Handle) -> Option<&'s mut Slot<S>> {
    let slot = slots.get_mut(handle.index() as usize)?;
    (slot.fd.is_some() && slot.generation == handle.generation()).then_some(slot)
}

fn io_retry_or_fail(op: &str) -> Result<(), Fault> {
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EINTR) => Ok(()),
        Some(libc::EAGAIN) => {
            warn!(op, "socket timed out");
            Err(Fault::Failure)
        }
        _ => {
            debug!(op, ?err, "socket io failed");
            Err(Fault::Failure)
        }
    }
}

/// Applies the pool's receive and send timeouts to a freshly accepted
/// or connected socket.
pub fn set_socket_timeouts(fd: RawFd) -> io::Result<()> {
    let timeout = libc::timeval {
        tv_sec: SOCKET_TIMEOUT.as_secs() as libc::time_t,
        tv_usec: 0,
    };
    for opt in [libc::SO_RCVTIMEO, libc::SO_SNDTIMEO] {
        let ret = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                opt,
                std::ptr::from_ref(&timeout).cast(),
                size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixStream;

    use super::*;

    fn pair() -> (OwnedFd, OwnedFd) {
        let (a, b) = UnixStream::pair().unwrap();
        (a.into(), b.into())
    }

    #[test]
    fn register_close_invalidates_handle() {
        let pool: SocketPool<()> = SocketPool::new(4);
        let (a, _keep) = pair();
        let handle = pool.register(a).unwrap();
        assert!(pool.with_slot(handle, |_| ()).is_ok());

        pool.close(handle);
        assert_eq!(pool.with_slot(handle, |_| ()), Err(Fault::NotConnected));
        assert_eq!(pool.read(handle, &mut [0u8; 1]), Err(Fault::NotConnected));
        // Closing again is a silent no-op.
        pool.close(handle);
    }

    #[test]
    fn generation_strictly_increases_per_slot() {
        let pool: SocketPool<()> = SocketPool::new(1);
        let mut last_gen = 0;
        for _ in 0..4 {
            let (a, _b) = pair();
            let handle = pool.register(a).unwrap();
            assert_eq!(handle.index(), 0);
            assert!(handle.generation() > last_gen);
            assert_eq!(handle.generation() % 2, 1);
            last_gen = handle.generation();
            pool.close(handle);
        }
    }

    #[test]
    fn full_pool_fails_nomem() {
        let pool: SocketPool<()> = SocketPool::new(1);
        let (a, _ka) = pair();
        let (b, _kb) = pair();
        let first = pool.register(a).unwrap();
        assert_eq!(pool.register(b).unwrap_err(), Fault::NoMem);
        pool.close(first);
    }

    #[test]
    fn read_write_roundtrip() {
        let pool: SocketPool<()> = SocketPool::new(2);
        let (a, b) = pair();
        let left = pool.register(a).unwrap();
        let right = pool.register(b).unwrap();

        pool.write(left, b"ping").unwrap();
        let mut buf = [0u8; 4];
        pool.read(right, &mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        assert!(pool.has_pending_input(right).is_ok_and(|ready| !ready));
        pool.write(left, b"x").unwrap();
        assert!(pool.has_pending_input(right).unwrap());
    }

    #[test]
    fn release_hook_sees_slot_state() {
        use std::sync::atomic::{AtomicU32, Ordering};
        static RELEASED: AtomicU32 = AtomicU32::new(0);

        let pool: SocketPool<u32> = SocketPool::new(2)
            .with_on_register(|_, state| *state = 7)
            .with_on_release(|handle, state| {
                RELEASED.store(handle.raw() + *state, Ordering::SeqCst);
            });

        let (a, _keep) = pair();
        let handle = pool.register(a).unwrap();
        pool.close(handle);
        assert_eq!(RELEASED.load(Ordering::SeqCst), handle.raw() + 7);
    }
}
