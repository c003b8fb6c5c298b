use std::sync::{Condvar, Mutex};

use tracing::{debug, warn};
use trellis_object::{Fault, Map, Object, decode, encode_into};
use trellis_pool::{Handle, SocketPool};
use trellis_wire::{
    Header, HeaderValue, MAX_FRAME_LEN, PRELUDE_LEN, RequestType, decode_frame, decode_prelude,
    encode_frame,
};

/// Maximum simultaneous clients per bus interface.
const MAX_CLIENTS: usize = 50;

type HandlerFn = Box<dyn Fn(&BusServer, &Map<'_>, Handle) -> Result<(), Fault> + Send + Sync>;

/// Fires when the pool releases a subscription's connection.
pub type CloseFn = Box<dyn Fn(Handle) + Send + Sync>;

/// One entry in an interface's method table.
pub struct Method {
    name: &'static str,
    is_subscription: bool,
    handler: HandlerFn,
}

impl Method {
    /// A `call`/`notify` method. The handler must end in exactly one of
    /// [`BusServer::respond`] or an error return.
    pub fn unary(
        name: &'static str,
        handler: impl Fn(&BusServer, &Map<'_>, Handle) -> Result<(), Fault> + Send + Sync + 'static,
    ) -> Self {
        Self { name, is_subscription: false, handler: Box::new(handler) }
    }

    /// A `subscribe` method. The handler must end in exactly one of
    /// [`BusServer::sub_accept`] or an error return.
    pub fn subscription(
        name: &'static str,
        handler: impl Fn(&BusServer, &Map<'_>, Handle) -> Result<(), Fault> + Send + Sync + 'static,
    ) -> Self {
        Self { name, is_subscription: true, handler: Box::new(handler) }
    }
}

struct ClientState {
    request_type: RequestType,
    on_close: Option<CloseFn>,
}

impl Default for ClientState {
    fn default() -> Self {
        Self { request_type: RequestType::Call, on_close: None }
    }
}

/// Barrier tracking the handle whose handler is currently running.
///
/// `sub_respond` against that handle blocks until the handler has
/// yielded via `sub_accept`, so a subscription callback may push
/// responses concurrently with the accept path without reordering the
/// initial `accepted` frame.
#[derive(Default)]
struct CurrentHandle {
    handle: Mutex<u32>,
    cleared: Condvar,
}

impl CurrentHandle {
    fn set(&self, handle: Handle) {
        *self.handle.lock().unwrap() = handle.raw();
    }

    fn get(&self) -> u32 {
        *self.handle.lock().unwrap()
    }

    fn clear(&self) {
        *self.handle.lock().unwrap() = 0;
        self.cleared.notify_all();
    }

    fn clear_if(&self, handle: Handle) {
        let mut current = self.handle.lock().unwrap();
        if *current == handle.raw() {
            *current = 0;
            self.cleared.notify_all();
        }
    }

    fn wait_while(&self, handle: Handle) {
        let mut current = self.handle.lock().unwrap();
        while *current == handle.raw() {
            current = self.cleared.wait(current).unwrap();
        }
    }
}

/// One core-bus interface: a listener socket, a method table, and the
/// response surface handlers use to answer requests.
pub struct BusServer {
    pool: SocketPool<ClientState>,
    methods: Vec<Method>,
    /// Serializes response encoding; never held across a read.
    encode_buf: Mutex<Vec<u8>>,
    recv_buf: Mutex<Vec<u8>>,
    current: CurrentHandle,
}

impl BusServer {
    pub fn new(methods: Vec<Method>) -> Self {
        let pool = SocketPool::new(MAX_CLIENTS).with_on_release(|handle, state: &mut ClientState| {
            if let Some(on_close) = state.on_close.take() {
                on_close(handle);
            }
        });
        Self {
            pool,
            methods,
            encode_buf: Mutex::new(Vec::with_capacity(MAX_FRAME_LEN)),
            recv_buf: Mutex::new(vec![0; MAX_FRAME_LEN]),
            current: CurrentHandle::default(),
        }
    }

    /// Serves `interface` forever on the calling thread. The socket is
    /// created mode 0700: bus interfaces are for same-user daemons.
    pub fn listen(&self, interface: &str) -> Result<(), Fault> {
        let path = crate::interface_socket_path(interface)?;
        debug!(interface, "bus interface starting");
        trellis_pool::listen(&path, 0o700, &self.pool, |handle| self.client_ready(handle))
    }

    fn client_ready(&self, handle: Handle) -> Result<(), Fault> {
        debug!(handle = handle.raw(), "handling client request");

        let mut recv_buf = self.recv_buf.lock().unwrap();
        self.pool.read(handle, &mut recv_buf[..PRELUDE_LEN])?;

        let prelude = match decode_prelude(&recv_buf[..PRELUDE_LEN]) {
            Ok(prelude) => prelude,
            Err(err) => {
                self.send_err_response(handle, err);
                return Ok(());
            }
        };

        if prelude.data_len() > recv_buf.len() - PRELUDE_LEN {
            warn!("frame does not fit in bus buffer");
            self.send_err_response(handle, Fault::NoMem);
            return Ok(());
        }

        let data_len = prelude.data_len();
        self.pool.read(handle, &mut recv_buf[..data_len])?;

        let msg = match decode_frame(&prelude, &recv_buf[..data_len]) {
            Ok(msg) => msg,
            Err(err) => {
                self.send_err_response(handle, err);
                return Ok(());
            }
        };

        let method = msg.header(b"method").and_then(HeaderValue::as_string);
        let request_type = msg
            .header(b"type")
            .and_then(HeaderValue::as_i32)
            .and_then(RequestType::from_wire);
        let (Some(method), Some(request_type)) = (method, request_type) else {
            warn!("request missing method or type header");
            self.send_err_response(handle, Fault::Invalid);
            return Ok(());
        };

        let params = if msg.payload.is_empty() {
            Map::new()
        } else {
            let payload = match decode(msg.payload) {
                Ok(obj) => obj,
                Err(err) => {
                    warn!("failed to decode request payload");
                    self.send_err_response(handle, err);
                    return Ok(());
                }
            };
            match payload {
                Object::Map(map) => map,
                _ => {
                    warn!("request payload is not a map");
                    self.send_err_response(handle, Fault::Invalid);
                    return Ok(());
                }
            }
        };

        self.pool.with_slot(handle, |state| state.request_type = request_type)?;

        let method_name = String::from_utf8_lossy(method);
        debug!(method = %method_name, "dispatching request");

        let Some(desc) = self.methods.iter().find(|m| m.name.as_bytes() == method) else {
            warn!(method = %method_name, "no handler for method");
            self.send_err_response(handle, Fault::NoEntry);
            return Ok(());
        };

        if desc.is_subscription != (request_type == RequestType::Subscribe) {
            warn!(method = %method_name, "request type unsupported for method");
            self.send_err_response(handle, Fault::Invalid);
            return Ok(());
        }

        self.current.set(handle);
        let result = (desc.handler)(self, &params, handle);

        // The handler contract: exactly one of respond/sub_accept (which
        // clear the current handle) or an error return.
        if let Err(err) = result {
            self.send_err_response(handle, err);
            self.current.clear();
        } else if self.current.get() == handle.raw() {
            warn!(method = %method_name, "handler returned without responding");
            self.send_err_response(handle, Fault::Failure);
            self.current.clear();
        }
        Ok(())
    }

    fn send_err_response(&self, handle: Handle, error: Fault) {
        let mut buf = self.encode_buf.lock().unwrap();
        let headers = [Header::new(b"error", HeaderValue::Int32(error.to_wire()))];
        let encoded = encode_frame(&mut buf, &headers, MAX_FRAME_LEN, |_, _| Ok(()));
        if encoded.is_ok() {
            let _ = self.pool.write(handle, &buf);
        }
        drop(buf);
        self.pool.close(handle);
    }

    /// Completes a `call` (send the value, close) or a `notify` (close
    /// silently). Must be invoked from the method's handler.
    pub fn respond(&self, handle: Handle, value: &Object<'_>) {
        debug_assert_eq!(self.current.get(), handle.raw());
        self.respond_inner(handle, value);
        self.current.clear_if(handle);
    }

    fn respond_inner(&self, handle: Handle, value: &Object<'_>) {
        let Ok(request_type) = self.pool.with_slot(handle, |state| state.request_type) else {
            return;
        };

        if request_type == RequestType::Notify {
            debug!(handle = handle.raw(), "closing notify without response");
            self.pool.close(handle);
            return;
        }
        debug_assert_eq!(request_type, RequestType::Call);

        let mut buf = self.encode_buf.lock().unwrap();
        let encoded = encode_frame(&mut buf, &[], MAX_FRAME_LEN, |out, budget| {
            encode_into(value, out, out.len() + budget)
        });
        if let Err(err) = encoded {
            warn!(?err, "failed to encode call response");
        } else if let Err(err) = self.pool.write(handle, &buf) {
            debug!(?err, "failed to write call response");
        }
        drop(buf);
        self.pool.close(handle);
    }

    /// Accepts a subscription: sends `accepted=1`, retains the
    /// connection, and arms `on_close` to fire when the pool releases
    /// the slot. Must be invoked from the method's handler; the
    /// current-handle barrier is lifted only after the `accepted` frame
    /// is on the wire, so racing `sub_respond` calls cannot overtake it.
    pub fn sub_accept(&self, handle: Handle, on_close: Option<CloseFn>) {
        debug_assert_eq!(self.current.get(), handle.raw());
        self.sub_accept_inner(handle, on_close);
        self.current.clear_if(handle);
    }

    fn sub_accept_inner(&self, handle: Handle, on_close: Option<CloseFn>) {
        if let Some(on_close) = on_close {
            let mut pending = Some(on_close);
            let stored = self.pool.with_slot(handle, |state| state.on_close = pending.take());
            if stored.is_err() {
                if let Some(on_close) = pending {
                    on_close(handle);
                }
                return;
            }
        }

        let mut buf = self.encode_buf.lock().unwrap();
        let headers = [Header::new(b"accepted", HeaderValue::Int32(1))];
        let encoded = encode_frame(&mut buf, &headers, MAX_FRAME_LEN, |_, _| Ok(()));
        let written = match encoded {
            Ok(()) => self.pool.write(handle, &buf),
            Err(err) => Err(err),
        };
        drop(buf);
        if let Err(err) = written {
            debug!(?err, "failed to accept subscription");
            self.pool.close(handle);
        }
    }

    /// Pushes one response on an accepted subscription, keeping the
    /// connection open. Blocks while the handle's accept handler is
    /// still running; serialized per connection by the encode mutex.
    pub fn sub_respond(&self, handle: Handle, value: &Object<'_>) {
        #[cfg(debug_assertions)]
        if let Ok(request_type) = self.pool.with_slot(handle, |state| state.request_type) {
            debug_assert_eq!(request_type, RequestType::Subscribe);
        }

        self.current.wait_while(handle);

        let mut buf = self.encode_buf.lock().unwrap();
        let encoded = encode_frame(&mut buf, &[], MAX_FRAME_LEN, |out, budget| {
            encode_into(value, out, out.len() + budget)
        });
        let written = match encoded {
            Ok(()) => self.pool.write(handle, &buf),
            Err(err) => Err(err),
        };
        drop(buf);
        if let Err(err) = written {
            debug!(?err, "failed to push subscription response");
            self.pool.close(handle);
        }
    }

    /// Terminates a subscription from the server side.
    pub fn sub_close(&self, handle: Handle) {
        self.pool.close(handle);
    }
}
