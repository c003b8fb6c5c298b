use std::{
    os::fd::{AsRawFd, OwnedFd},
    sync::Arc,
    thread::JoinHandle,
};

use once_cell::sync::OnceCell;
use tracing::{debug, error, warn};
use trellis_object::{Fault, Map, Object, decode};
use trellis_pool::{Handle, Reactor, SocketPool};
use trellis_wire::{HeaderValue, RequestType};

use crate::{
    CallError,
    client::{read_response, send_request, stream_reader},
};

/// Maximum live bus subscriptions per process.
const MAX_SUBSCRIPTIONS: usize = 50;

/// Invoked on the subscription thread for every response on a
/// subscription. An error return closes the subscription. Re-entrant
/// bus calls from inside the callback are allowed.
pub type SubResponseFn = Box<dyn Fn(Handle, &Object<'_>) -> Result<(), Fault> + Send + Sync>;

/// Invoked when a subscription's connection goes away, from whichever
/// thread releases it.
pub type SubCloseFn = Box<dyn Fn(Handle) + Send + Sync>;

struct SubCallbacks {
    on_response: SubResponseFn,
    on_close: Option<SubCloseFn>,
}

#[derive(Default)]
struct SubState {
    callbacks: Option<Arc<SubCallbacks>>,
}

static CLIENT: OnceCell<SubscriptionClient> = OnceCell::new();

/// Process-wide subscription demultiplexer.
///
/// One reactor thread watches every subscription connection; responses
/// are decoded and fanned out to per-subscription callbacks. Started
/// explicitly during runtime init so shutdown can join the thread.
pub struct SubscriptionClient {
    pool: Arc<SocketPool<SubState>>,
    reactor: Reactor,
    /// Kept so an orderly shutdown path can join the reactor.
    _thread: JoinHandle<()>,
}

impl SubscriptionClient {
    /// Starts (or returns) the process-wide client.
    pub fn start() -> &'static Self {
        CLIENT.get_or_init(|| {
            Self::spawn().unwrap_or_else(|err| {
                // Matching the reference runtime: a fabric without its
                // subscription reactor cannot run at all.
                error!(?err, "failed to start subscription reactor");
                std::process::abort();
            })
        })
    }

    /// The started client, or `Fatal` when init was skipped.
    pub fn get() -> Result<&'static Self, Fault> {
        CLIENT.get().ok_or(Fault::Fatal)
    }

    fn spawn() -> std::io::Result<Self> {
        let pool = Arc::new(SocketPool::new(MAX_SUBSCRIPTIONS).with_on_release(
            |handle, state: &mut SubState| {
                if let Some(callbacks) = state.callbacks.take() {
                    if let Some(on_close) = &callbacks.on_close {
                        on_close(handle);
                    }
                }
            },
        ));

        let reactor_pool = Arc::clone(&pool);
        let (reactor, thread) = Reactor::spawn("bus-subscriptions", move |handle| {
            // Edge-triggered: drain every buffered response before
            // returning to the poll.
            loop {
                if let Err(err) = dispatch_response(&reactor_pool, handle) {
                    debug!(handle = handle.raw(), ?err, "closing subscription");
                    reactor_pool.close(handle);
                    return;
                }
                match reactor_pool.has_pending_input(handle) {
                    Ok(true) => {}
                    _ => return,
                }
            }
        })?;

        debug!("subscription reactor started");
        Ok(Self { pool, reactor, _thread: thread })
    }

    /// Opens a subscription on `interface`/`method`. The initial
    /// response must carry `accepted=1`; afterwards events are
    /// delivered to `on_response` in arrival order.
    pub fn subscribe(
        &self,
        interface: &str,
        method: &str,
        params: &Map<'_>,
        on_response: SubResponseFn,
        on_close: Option<SubCloseFn>,
    ) -> Result<Handle, CallError> {
        let mut stream = send_request(interface, RequestType::Subscribe, method, params)
            .map_err(CallError::Local)?;

        {
            let mut buf = Vec::new();
            let msg = read_response(stream_reader(&mut stream), &mut buf)?;
            let accepted = msg
                .header(b"accepted")
                .and_then(HeaderValue::as_i32)
                .is_some_and(|v| v == 1);
            if !accepted {
                warn!(interface, method, "subscription not accepted");
                return Err(CallError::Local(Fault::Failure));
            }
        }

        let raw = stream.as_raw_fd();
        let fd: OwnedFd = stream.into();
        let handle = self.pool.register(fd).map_err(CallError::Local)?;

        let callbacks = Arc::new(SubCallbacks { on_response, on_close });
        self.pool
            .with_slot(handle, |state| state.callbacks = Some(callbacks))
            .map_err(CallError::Local)?;

        if let Err(err) = self.reactor.add(raw, handle) {
            warn!(?err, "failed to watch subscription");
            self.pool.close(handle);
            return Err(CallError::Local(Fault::Fatal));
        }
        Ok(handle)
    }

    /// Cancels a subscription; fires its close callback.
    pub fn close(&self, handle: Handle) {
        self.pool.close(handle);
    }
}

fn dispatch_response(pool: &SocketPool<SubState>, handle: Handle) -> Result<(), Fault> {
    // Separate receive buffer from the synchronous client path, so a
    // callback may itself issue bus calls.
    let mut buf = Vec::new();
    let msg = read_response(|chunk| pool.read(handle, chunk), &mut buf).map_err(|err| match err {
        CallError::Local(fault) => fault,
        CallError::Remote(fault) => fault,
    })?;

    let value =
        if msg.payload.is_empty() { Object::Null } else { decode(msg.payload)? };

    let callbacks = pool
        .with_slot(handle, |state| state.callbacks.clone())?
        .ok_or(Fault::Failure)?;

    (callbacks.on_response)(handle, &value)
}
