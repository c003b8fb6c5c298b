use bitflags::bitflags;

/// Eventstream message classification, carried in the `:message-type`
/// header on gateway connections.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(i32)]
pub enum MessageType {
    ApplicationMessage = 0,
    ApplicationError = 1,
    Ping = 2,
    PingResponse = 3,
    Connect = 4,
    ConnectAck = 5,
}

impl MessageType {
    pub const fn from_wire(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::ApplicationMessage),
            1 => Some(Self::ApplicationError),
            2 => Some(Self::Ping),
            3 => Some(Self::PingResponse),
            4 => Some(Self::Connect),
            5 => Some(Self::ConnectAck),
            _ => None,
        }
    }
}

bitflags! {
    /// `:message-flags` bits. Bits outside the mask are tolerated on
    /// receive so newer peers can set flags we don't know.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct MessageFlags: i32 {
        const CONNECTION_ACCEPTED = 1;
        const TERMINATE_STREAM = 2;
    }
}

/// Core-bus request classification, carried in the `type` header as an
/// int32.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(i32)]
pub enum RequestType {
    Notify = 0,
    Call = 1,
    Subscribe = 2,
}

impl RequestType {
    pub const fn from_wire(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Notify),
            1 => Some(Self::Call),
            2 => Some(Self::Subscribe),
            _ => None,
        }
    }
}

/// Header value type tags on the wire.
pub(crate) mod tag {
    pub const BOOL_TRUE: u8 = 0;
    pub const BOOL_FALSE: u8 = 1;
    pub const INT32: u8 = 4;
    pub const INT64: u8 = 5;
    pub const BYTE_BUF: u8 = 6;
    pub const STRING: u8 = 7;
    pub const TIMESTAMP: u8 = 8;
    pub const UUID: u8 = 9;
}

/// A decoded header value. Multi-byte integers are big-endian on the
/// wire; strings are length-prefixed bytes with no encoding implied.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HeaderValue<'a> {
    Bool(bool),
    Int32(i32),
    Int64(i64),
    ByteBuf(&'a [u8]),
    String(&'a [u8]),
    Timestamp(i64),
    Uuid(&'a [u8; 16]),
}

impl<'a> HeaderValue<'a> {
    pub fn as_i32(self) -> Option<i32> {
        match self {
            Self::Int32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_string(self) -> Option<&'a [u8]> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

/// One header as passed to the frame encoder.
#[derive(Debug, Copy, Clone)]
pub struct Header<'a> {
    pub name: &'a [u8],
    pub value: HeaderValue<'a>,
}

impl<'a> Header<'a> {
    pub const fn new(name: &'a [u8], value: HeaderValue<'a>) -> Self {
        Self { name, value }
    }
}
