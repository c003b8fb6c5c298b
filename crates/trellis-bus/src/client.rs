use std::{
    io::{ErrorKind, Read, Write},
    os::{fd::AsRawFd, unix::net::UnixStream},
};

use thiserror::Error;
use tracing::{debug, warn};
use trellis_object::{Fault, Map, Object, decode, encode_map_into};
use trellis_pool::set_socket_timeouts;
use trellis_wire::{
    Header, HeaderValue, MAX_FRAME_LEN, Message, PRELUDE_LEN, RequestType, decode_frame,
    decode_prelude, encode_frame,
};

/// Client-side bus error: a local fault, or an error the peer sent in
/// its response's `error` header.
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error(transparent)]
    Local(#[from] Fault),
    #[error("peer returned error: {0}")]
    Remote(Fault),
}

impl CallError {
    /// The remote kind, when the peer answered with an error.
    pub const fn remote(self) -> Option<Fault> {
        match self {
            Self::Remote(fault) => Some(fault),
            Self::Local(_) => None,
        }
    }
}

fn interface_connect(interface: &str) -> Result<UnixStream, Fault> {
    let path = crate::interface_socket_path(interface)?;
    let stream = UnixStream::connect(&path).map_err(|err| {
        warn!(interface, ?err, "failed to connect to interface");
        Fault::Failure
    })?;
    // A hung server must not wedge the caller.
    set_socket_timeouts(stream.as_raw_fd()).map_err(|err| {
        warn!(?err, "failed to set socket timeouts");
        Fault::Fatal
    })?;
    Ok(stream)
}

/// Opens a connection to `interface` and sends one framed request.
pub(crate) fn send_request(
    interface: &str,
    request_type: RequestType,
    method: &str,
    params: &Map<'_>,
) -> Result<UnixStream, Fault> {
    let mut stream = interface_connect(interface)?;

    let headers = [
        Header::new(b"method", HeaderValue::String(method.as_bytes())),
        Header::new(b"type", HeaderValue::Int32(request_type as i32)),
    ];
    let mut buf = Vec::with_capacity(256);
    encode_frame(&mut buf, &headers, MAX_FRAME_LEN, |out, budget| {
        encode_map_into(params, out, out.len() + budget)
    })?;

    stream.write_all(&buf).map_err(|err| {
        warn!(interface, method, ?err, "failed to send request");
        Fault::Failure
    })?;
    Ok(stream)
}

fn map_read_err(err: &std::io::Error) -> Fault {
    match err.kind() {
        ErrorKind::UnexpectedEof => Fault::NotConnected,
        ErrorKind::WouldBlock | ErrorKind::TimedOut => {
            warn!("response read timed out");
            Fault::Failure
        }
        _ => {
            debug!(?err, "response read failed");
            Fault::Failure
        }
    }
}

/// Reads one response frame into `buf` using `read_exact`, surfacing a
/// peer `error` header as [`CallError::Remote`].
pub(crate) fn read_response<'b>(
    mut read_exact: impl FnMut(&mut [u8]) -> Result<(), Fault>,
    buf: &'b mut Vec<u8>,
) -> Result<Message<'b>, CallError> {
    buf.resize(MAX_FRAME_LEN, 0);

    read_exact(&mut buf[..PRELUDE_LEN])?;
    let prelude = decode_prelude(&buf[..PRELUDE_LEN])?;

    if prelude.data_len() > buf.len() - PRELUDE_LEN {
        warn!("response does not fit in bus buffer");
        return Err(Fault::NoMem.into());
    }
    let data_len = prelude.data_len();
    read_exact(&mut buf[..data_len])?;

    let msg = decode_frame(&prelude, &buf[..data_len])?;

    if let Some(value) = msg.header(b"error") {
        let fault = value.as_i32().map_or(Fault::Failure, Fault::from_wire);
        return Err(CallError::Remote(fault));
    }
    Ok(msg)
}

pub(crate) fn stream_reader(stream: &mut UnixStream) -> impl FnMut(&mut [u8]) -> Result<(), Fault> {
    move |chunk| stream.read_exact(chunk).map_err(|err| map_read_err(&err))
}

/// Fire-and-forget request: send and close, reading no response.
pub fn notify(interface: &str, method: &str, params: &Map<'_>) -> Result<(), Fault> {
    send_request(interface, RequestType::Notify, method, params).map(drop)
}

/// Round-trip request: send, read exactly one response frame, close.
/// Connections are never reused.
pub fn call(interface: &str, method: &str, params: &Map<'_>) -> Result<Object<'static>, CallError> {
    let mut stream = send_request(interface, RequestType::Call, method, params)
        .map_err(CallError::Local)?;

    let mut buf = Vec::new();
    let msg = read_response(stream_reader(&mut stream), &mut buf)?;

    if msg.payload.is_empty() {
        return Ok(Object::Null);
    }
    let value = decode(msg.payload).map_err(CallError::Local)?;
    Ok(value.into_owned())
}
