use std::{
    fs,
    io::ErrorKind,
    os::{
        fd::{AsRawFd, OwnedFd},
        unix::{fs::PermissionsExt, net::UnixListener},
    },
    path::Path,
};

use mio::{Events, Interest, Poll, Token, unix::SourceFd};
use tracing::{debug, info, warn};
use trellis_object::Fault;

use crate::{Handle, SocketPool, pool::set_socket_timeouts};

const LISTENER: Token = Token(usize::MAX);

/// Binds a Unix listener at `path` with the given mode and serves it
/// forever on the calling thread.
///
/// Accepted sockets are registered into `pool` (blocking, with the pool
/// timeouts) and watched for readability; `on_ready` is invoked once per
/// buffered frame and must consume exactly one frame per call. An error
/// from `on_ready` releases the connection.
pub fn listen<S: Default>(
    path: &Path,
    mode: u32,
    pool: &SocketPool<S>,
    mut on_ready: impl FnMut(Handle) -> Result<(), Fault>,
) -> Result<(), Fault> {
    // Stale socket files from a previous run would fail the bind.
    match fs::remove_file(path) {
        Ok(()) => debug!(?path, "removed stale socket"),
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => {
            warn!(?path, ?err, "couldn't remove stale socket");
            return Err(Fault::Failure);
        }
    }

    let listener = UnixListener::bind(path).map_err(|err| {
        warn!(?path, ?err, "couldn't bind listener");
        Fault::Failure
    })?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|err| {
        warn!(?path, ?err, "couldn't set socket mode");
        Fault::Failure
    })?;
    listener.set_nonblocking(true).map_err(|_| Fault::Fatal)?;

    let mut poll = Poll::new().map_err(|err| {
        warn!(?err, "couldn't create poll");
        Fault::Fatal
    })?;
    poll.registry()
        .register(&mut SourceFd(&listener.as_raw_fd()), LISTENER, Interest::READABLE)
        .map_err(|_| Fault::Fatal)?;

    info!(?path, "listening");

    let mut events = Events::with_capacity(128);
    loop {
        if let Err(err) = poll.poll(&mut events, None) {
            if err.kind() == ErrorKind::Interrupted {
                continue;
            }
            warn!(?err, "poll failed");
            return Err(Fault::Fatal);
        }

        for event in &events {
            match event.token() {
                LISTENER => accept_pending(&listener, pool, poll.registry()),
                token => {
                    let handle = Handle::from_raw(token.0 as u32);
                    drive_connection(pool, handle, &mut on_ready);
                }
            }
        }
    }
}

fn accept_pending<S: Default>(
    listener: &UnixListener,
    pool: &SocketPool<S>,
    registry: &mio::Registry,
) {
    loop {
        let stream = match listener.accept() {
            Ok((stream, _)) => stream,
            Err(err) if err.kind() == ErrorKind::WouldBlock => return,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                warn!(?err, "accept failed");
                return;
            }
        };

        let raw = stream.as_raw_fd();
        if let Err(err) = set_socket_timeouts(raw) {
            warn!(?err, "couldn't set socket timeouts, dropping connection");
            continue;
        }

        let fd: OwnedFd = stream.into();
        let handle = match pool.register(fd) {
            Ok(handle) => handle,
            Err(err) => {
                // Dropping the fd refuses the connection.
                warn!(?err, "couldn't pool accepted connection");
                continue;
            }
        };

        if let Err(err) = registry.register(
            &mut SourceFd(&raw),
            Token(handle.raw() as usize),
            Interest::READABLE,
        ) {
            warn!(?err, "couldn't watch accepted connection");
            pool.close(handle);
            continue;
        }
        debug!(handle = handle.raw(), "client connected");
    }
}

/// Readiness is edge-triggered; consume every frame already buffered
/// before returning to the poll.
fn drive_connection<S: Default>(
    pool: &SocketPool<S>,
    handle: Handle,
    on_ready: &mut impl FnMut(Handle) -> Result<(), Fault>,
) {
    loop {
        if let Err(err) = on_ready(handle) {
            debug!(handle = handle.raw(), ?err, "releasing connection");
            pool.close(handle);
            return;
        }
        // The handler may have closed the connection itself.
        match pool.has_pending_input(handle) {
            Ok(true) => {}
            _ => return,
        }
    }
}
