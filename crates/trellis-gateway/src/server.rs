use std::{path::Path, sync::Arc};

use tracing::{debug, info, warn};
use trellis_object::{Fault, Object, obj_map};
use trellis_pool::{Handle, SocketPool};
use trellis_wire::{
    CommonHeaders, Header, HeaderValue, MAX_FRAME_LEN, Message, MessageFlags, MessageType,
    PRELUDE_LEN, decode_frame, decode_prelude, encode_frame,
};

use crate::{
    ComponentHandle, ComponentRegistry, IpcError, PeerAuth, Svcuid,
    dispatch,
    json::{decode_json_map, encode_json_payload},
    subscriptions::SubscriptionBridge,
};

/// Maximum simultaneous component connections.
const MAX_CLIENTS: usize = 50;

const PROTOCOL_VERSION: &[u8] = b"0.1.0";

/// Per-connection state: `None` until the connect handshake succeeds.
#[derive(Default, Clone, Copy)]
struct ConnState {
    component: Option<ComponentHandle>,
}

/// The external IPC gateway: one listener terminating the eventstream
/// RPC protocol spoken by application components, translating
/// operations onto the core bus.
pub struct Gateway {
    pool: SocketPool<ConnState>,
    recv_buf: std::sync::Mutex<Vec<u8>>,
    resp_buf: std::sync::Mutex<Vec<u8>>,
    pub(crate) registry: Arc<ComponentRegistry>,
    pub(crate) bridge: Arc<SubscriptionBridge>,
    auth: Box<dyn PeerAuth>,
}

impl Gateway {
    pub fn new(registry: Arc<ComponentRegistry>, auth: Box<dyn PeerAuth>) -> Arc<Self> {
        let bridge = Arc::new(SubscriptionBridge::new());
        let hook_bridge = Arc::clone(&bridge);
        let pool = SocketPool::new(MAX_CLIENTS).with_on_release(move |handle, _: &mut ConnState| {
            hook_bridge.release_conn(handle);
        });
        Arc::new(Self {
            pool,
            recv_buf: std::sync::Mutex::new(vec![0; MAX_FRAME_LEN]),
            resp_buf: std::sync::Mutex::new(Vec::with_capacity(MAX_FRAME_LEN)),
            registry,
            bridge,
            auth,
        })
    }

    /// Serves the gateway socket forever on the calling thread. Mode
    /// 0666: unprivileged local components must be able to connect.
    pub fn listen(self: &Arc<Self>, socket_path: &Path) -> Result<(), Fault> {
        info!(?socket_path, "gateway starting");
        trellis_pool::listen(socket_path, 0o666, &self.pool, |handle| self.client_ready(handle))
    }

    fn client_ready(self: &Arc<Self>, handle: Handle) -> Result<(), Fault> {
        let mut recv_buf = self.recv_buf.lock().unwrap();

        self.pool.read(handle, &mut recv_buf[..PRELUDE_LEN])?;
        let prelude = decode_prelude(&recv_buf[..PRELUDE_LEN])?;

        if prelude.data_len() > recv_buf.len() - PRELUDE_LEN {
            warn!("frame does not fit in gateway buffer");
            return Err(Fault::NoMem);
        }
        let data_len = prelude.data_len();
        self.pool.read(handle, &mut recv_buf[..data_len])?;

        let msg = decode_frame(&prelude, &recv_buf[..data_len])?;
        let common = msg.common_headers()?;

        match common.message_type {
            MessageType::Ping => return self.handle_ping(handle, &msg),
            MessageType::PingResponse => return Ok(()),
            _ => {}
        }

        let component = self.pool.with_slot(handle, |state| state.component)?;
        match component {
            None => self.handle_conn_init(handle, &msg, common),
            Some(component) => self.handle_operation(handle, &msg, common, component),
        }
    }

    fn handle_conn_init(
        self: &Arc<Self>,
        handle: Handle,
        msg: &Message<'_>,
        common: CommonHeaders,
    ) -> Result<(), Fault> {
        debug!(handle = handle.raw(), "handling connect");

        match self.conn_init_inner(handle, msg, common) {
            Ok(svcuid) => {
                self.send_conn_ack(handle, svcuid.as_ref(), true)?;
                debug!("successful connection");
                Ok(())
            }
            Err(err) => {
                let _ = self.send_conn_ack(handle, None, false);
                Err(err)
            }
        }
    }

    /// Authenticates the connect message. Returns the svcuid to echo in
    /// the ack (peer-credential mode only).
    fn conn_init_inner(
        &self,
        handle: Handle,
        msg: &Message<'_>,
        common: CommonHeaders,
    ) -> Result<Option<Svcuid>, Fault> {
        if common.message_type != MessageType::Connect {
            warn!("client initial message not of type connect");
            return Err(Fault::Invalid);
        }
        if common.stream_id != 0 {
            warn!("connect message has non-zero :stream-id");
            return Err(Fault::Invalid);
        }
        if !common.flags().is_empty() {
            warn!("connect message has flags set");
            return Err(Fault::Invalid);
        }
        let version = msg.header(b":version").and_then(HeaderValue::as_string);
        if version != Some(PROTOCOL_VERSION) {
            warn!("client protocol version not 0.1.0");
            return Err(Fault::Invalid);
        }

        let payload = decode_json_map(msg.payload).map_err(|err| {
            warn!("connect payload is not a json object");
            err
        })?;
        let auth_token = payload.get(b"authToken").and_then(Object::as_bytes);
        let component_name = payload.get(b"componentName").and_then(Object::as_bytes);

        let (component, svcuid) = match (auth_token, component_name) {
            (Some(token), name) => {
                debug!(handle = handle.raw(), "client provided authToken");
                let svcuid = Svcuid::from_str_form(token)?;
                let component = self.registry.lookup(svcuid)?;

                if let Some(name) = name {
                    if name != self.registry.name_of(component) {
                        warn!("componentName does not match svcuid");
                        return Err(Fault::Failure);
                    }
                }
                (component, None)
            }
            (None, Some(name)) => {
                debug!(handle = handle.raw(), "client provided componentName");
                let pid = self.pool.peer_pid(handle)?;
                if !self.auth.allows(pid, name) {
                    warn!(pid, "peer not authorized to claim component name");
                    return Err(Fault::Failure);
                }
                let (component, svcuid) = self.registry.register(name)?;
                (component, Some(svcuid))
            }
            (None, None) => {
                warn!("connect provided neither authToken nor componentName");
                return Err(Fault::Invalid);
            }
        };

        self.pool.with_slot(handle, |state| state.component = Some(component))?;
        Ok(svcuid)
    }

    fn send_conn_ack(
        &self,
        handle: Handle,
        svcuid: Option<&Svcuid>,
        accepted: bool,
    ) -> Result<(), Fault> {
        let flags = if accepted { MessageFlags::CONNECTION_ACCEPTED.bits() } else { 0 };
        let svcuid_str = svcuid.map(Svcuid::to_str_form);

        let mut headers = vec![
            Header::new(b":message-type", HeaderValue::Int32(MessageType::ConnectAck as i32)),
            Header::new(b":message-flags", HeaderValue::Int32(flags)),
            Header::new(b":stream-id", HeaderValue::Int32(0)),
        ];
        if let Some(svcuid_str) = &svcuid_str {
            headers.push(Header::new(b"svcuid", HeaderValue::String(svcuid_str.as_bytes())));
        }

        let mut buf = self.resp_buf.lock().unwrap();
        encode_frame(&mut buf, &headers, MAX_FRAME_LEN, |_, _| Ok(()))?;
        self.pool.write(handle, &buf)
    }

    fn handle_operation(
        self: &Arc<Self>,
        handle: Handle,
        msg: &Message<'_>,
        common: CommonHeaders,
        component: ComponentHandle,
    ) -> Result<(), Fault> {
        if common.stream_id == 0 {
            warn!("application message has zero :stream-id");
            return Err(Fault::Invalid);
        }

        if let Err(err) = self.stream_operation(handle, msg, common, component) {
            return self.send_stream_error(handle, common.stream_id, &err);
        }
        Ok(())
    }

    fn stream_operation(
        self: &Arc<Self>,
        handle: Handle,
        msg: &Message<'_>,
        common: CommonHeaders,
        component: ComponentHandle,
    ) -> Result<(), IpcError> {
        if common.message_type != MessageType::ApplicationMessage {
            warn!("client sent unhandled message type");
            return Err(IpcError::default());
        }

        let flags = common.flags();
        if flags.contains(MessageFlags::TERMINATE_STREAM) {
            // The stream ends from the client side; drop its bridged
            // subscriptions and send nothing back.
            debug!(stream = common.stream_id, "client terminated stream");
            self.bridge.release_stream(handle, common.stream_id);
            return Ok(());
        }
        if !flags.is_empty() {
            warn!("client request has flags set");
            return Err(IpcError::default());
        }

        let Some(operation) = msg.header(b"operation").and_then(HeaderValue::as_string) else {
            warn!("client request missing operation header");
            return Err(IpcError::default());
        };

        let args = decode_json_map(msg.payload).map_err(|_| IpcError::default())?;

        dispatch::handle_operation(self, operation, &args, handle, common.stream_id, component)
    }

    fn handle_ping(&self, handle: Handle, msg: &Message<'_>) -> Result<(), Fault> {
        let mut headers = vec![
            Header::new(b":message-type", HeaderValue::Int32(MessageType::PingResponse as i32)),
            Header::new(b":message-flags", HeaderValue::Int32(0)),
            Header::new(b":stream-id", HeaderValue::Int32(0)),
        ];
        // Everything outside the reserved namespace echoes back.
        for (name, value) in msg.headers() {
            if !name.starts_with(b":") {
                headers.push(Header::new(name, value));
            }
        }

        let mut buf = self.resp_buf.lock().unwrap();
        encode_frame(&mut buf, &headers, MAX_FRAME_LEN, |out, budget| {
            if msg.payload.len() > budget {
                return Err(Fault::NoMem);
            }
            out.extend_from_slice(msg.payload);
            Ok(())
        })?;
        self.pool.write(handle, &buf)
    }

    /// Sends a modeled response frame on `stream_id`. An empty
    /// `service_model_type` elides the header.
    pub(crate) fn response_send(
        &self,
        handle: Handle,
        stream_id: i32,
        service_model_type: &str,
        payload: &Object<'_>,
    ) -> Result<(), Fault> {
        let mut headers = vec![
            Header::new(
                b":message-type",
                HeaderValue::Int32(MessageType::ApplicationMessage as i32),
            ),
            Header::new(b":message-flags", HeaderValue::Int32(0)),
            Header::new(b":stream-id", HeaderValue::Int32(stream_id)),
            Header::new(b":content-type", HeaderValue::String(b"application/json")),
        ];
        if !service_model_type.is_empty() {
            headers.push(Header::new(
                b"service-model-type",
                HeaderValue::String(service_model_type.as_bytes()),
            ));
        }

        let mut buf = self.resp_buf.lock().unwrap();
        encode_frame(&mut buf, &headers, MAX_FRAME_LEN, |out, budget| {
            encode_json_payload(payload, out, budget)
        })?;
        self.pool.write(handle, &buf)
    }

    fn send_stream_error(
        &self,
        handle: Handle,
        stream_id: i32,
        error: &IpcError,
    ) -> Result<(), Fault> {
        warn!(handle = handle.raw(), stream_id, %error, "sending error on stream");

        let headers = [
            Header::new(b":message-type", HeaderValue::Int32(MessageType::ApplicationError as i32)),
            Header::new(
                b":message-flags",
                HeaderValue::Int32(MessageFlags::TERMINATE_STREAM.bits()),
            ),
            Header::new(b":stream-id", HeaderValue::Int32(stream_id)),
            Header::new(b":content-type", HeaderValue::String(b"application/json")),
            Header::new(
                b"service-model-type",
                HeaderValue::String(error.code.service_model_type().as_bytes()),
            ),
        ];

        let payload = obj_map! {
            b"_message" => Object::bytes(error.message.as_bytes()),
            b"_errorCode" => Object::str(error.code.error_code()),
        };

        let mut buf = self.resp_buf.lock().unwrap();
        encode_frame(&mut buf, &headers, MAX_FRAME_LEN, |out, budget| {
            encode_json_payload(&payload, out, budget)
        })?;
        self.pool.write(handle, &buf)
    }
}
