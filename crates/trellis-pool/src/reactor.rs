use std::{
    io::{self, ErrorKind},
    os::fd::RawFd,
    thread::{self, JoinHandle},
};

use mio::{Events, Interest, Poll, Token, unix::SourceFd};
use tracing::{debug, warn};

use crate::Handle;

/// Readiness reactor multiplexing many pooled sockets onto one thread.
///
/// Sockets are added by raw fd and reported back by handle; closing a
/// pooled fd removes it from the interest set, so there is no explicit
/// removal. Used by the bus client to demultiplex subscription
/// responses.
pub struct Reactor {
    registry: mio::Registry,
}

impl Reactor {
    /// Starts the reactor thread. `on_ready` runs on that thread for
    /// every readable socket and must consume the available input.
    pub fn spawn(
        name: &str,
        mut on_ready: impl FnMut(Handle) + Send + 'static,
    ) -> io::Result<(Self, JoinHandle<()>)> {
        let mut poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;

        let thread = thread::Builder::new().name(name.to_string()).spawn(move || {
            let mut events = Events::with_capacity(128);
            loop {
                if let Err(err) = poll.poll(&mut events, None) {
                    if err.kind() == ErrorKind::Interrupted {
                        continue;
                    }
                    warn!(?err, "reactor poll failed, exiting");
                    return;
                }
                for event in &events {
                    on_ready(Handle::from_raw(event.token().0 as u32));
                }
            }
        })?;

        Ok((Self { registry }, thread))
    }

    /// Watches `fd` for readability, reporting it as `handle`.
    pub fn add(&self, fd: RawFd, handle: Handle) -> io::Result<()> {
        debug!(handle = handle.raw(), "watching subscription socket");
        self.registry
            .register(&mut SourceFd(&fd), Token(handle.raw() as usize), Interest::READABLE)
    }
}
