use tracing::warn;
use trellis_object::Fault;

use crate::{
    MIN_FRAME_LEN, PRELUDE_LEN,
    types::{HeaderValue, MessageFlags, MessageType, tag},
};

/// Validated frame prelude.
#[derive(Debug, Copy, Clone)]
pub struct Prelude {
    pub total_len: u32,
    pub headers_len: u32,
    /// CRC32 of the full 12 prelude bytes, used to seed the message CRC.
    crc: u32,
}

impl Prelude {
    /// Bytes remaining on the socket after the prelude.
    pub const fn data_len(&self) -> usize {
        self.total_len as usize - PRELUDE_LEN
    }
}

/// Validates the 12-byte prelude and returns the declared lengths.
pub fn decode_prelude(buf: &[u8]) -> Result<Prelude, Fault> {
    let buf: &[u8; PRELUDE_LEN] = buf.try_into().map_err(|_| Fault::Parse)?;

    let declared_crc = u32::from_be_bytes(buf[8..12].try_into().unwrap());
    if crc32fast::hash(&buf[..8]) != declared_crc {
        warn!("prelude CRC mismatch");
        return Err(Fault::Parse);
    }

    let total_len = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    let headers_len = u32::from_be_bytes(buf[4..8].try_into().unwrap());

    if (total_len as usize) < MIN_FRAME_LEN || headers_len as usize > total_len as usize - MIN_FRAME_LEN
    {
        warn!(total_len, headers_len, "prelude declares impossible lengths");
        return Err(Fault::Parse);
    }

    Ok(Prelude { total_len, headers_len, crc: crc32fast::hash(buf) })
}

/// A decoded frame. Headers and payload borrow the receive buffer.
#[derive(Debug, Copy, Clone)]
pub struct Message<'a> {
    headers: &'a [u8],
    pub payload: &'a [u8],
}

/// Headers already present in every gateway frame.
#[derive(Debug, Copy, Clone)]
pub struct CommonHeaders {
    pub message_type: MessageType,
    pub stream_id: i32,
    raw_flags: i32,
}

impl CommonHeaders {
    /// Known flag bits; unknown bits are tolerated on receive.
    pub const fn flags(&self) -> MessageFlags {
        MessageFlags::from_bits_truncate(self.raw_flags)
    }
}

fn take<'a>(rest: &mut &'a [u8], n: usize) -> Result<&'a [u8], Fault> {
    if n > rest.len() {
        warn!("frame decode exceeded bounds");
        return Err(Fault::Parse);
    }
    let (head, tail) = rest.split_at(n);
    *rest = tail;
    Ok(head)
}

fn take_header<'a>(rest: &mut &'a [u8]) -> Result<(&'a [u8], HeaderValue<'a>), Fault> {
    let name_len = take(rest, 1)?[0];
    if name_len > 127 {
        warn!(name_len, "header name length overflow");
        return Err(Fault::Parse);
    }
    let name = take(rest, name_len as usize)?;

    let value = match take(rest, 1)?[0] {
        tag::BOOL_TRUE => HeaderValue::Bool(true),
        tag::BOOL_FALSE => HeaderValue::Bool(false),
        tag::INT32 => HeaderValue::Int32(i32::from_be_bytes(take(rest, 4)?.try_into().unwrap())),
        tag::INT64 => HeaderValue::Int64(i64::from_be_bytes(take(rest, 8)?.try_into().unwrap())),
        t @ (tag::BYTE_BUF | tag::STRING) => {
            let len = u16::from_be_bytes(take(rest, 2)?.try_into().unwrap());
            let bytes = take(rest, len as usize)?;
            if t == tag::STRING {
                HeaderValue::String(bytes)
            } else {
                HeaderValue::ByteBuf(bytes)
            }
        }
        tag::TIMESTAMP => {
            HeaderValue::Timestamp(i64::from_be_bytes(take(rest, 8)?.try_into().unwrap()))
        }
        tag::UUID => HeaderValue::Uuid(take(rest, 16)?.try_into().unwrap()),
        t => {
            warn!(tag = t, "unknown header value tag");
            return Err(Fault::Parse);
        }
    };

    Ok((name, value))
}

/// Decodes the post-prelude section of a frame.
///
/// `data` must hold exactly [`Prelude::data_len`] bytes. The trailing
/// message CRC is validated, and every header is walked once so that
/// later [`HeaderIter`] passes cannot fail.
pub fn decode_frame<'a>(prelude: &Prelude, data: &'a [u8]) -> Result<Message<'a>, Fault> {
    if data.len() != prelude.data_len() {
        warn!("frame body length does not match prelude");
        return Err(Fault::Parse);
    }

    let (body, crc_bytes) = data.split_at(data.len() - 4);
    let declared_crc = u32::from_be_bytes(crc_bytes.try_into().unwrap());

    let mut hasher = crc32fast::Hasher::new_with_initial(prelude.crc);
    hasher.update(body);
    if hasher.finalize() != declared_crc {
        warn!("message CRC mismatch");
        return Err(Fault::Parse);
    }

    let (headers, payload) = body.split_at(prelude.headers_len as usize);

    let mut rest = headers;
    while !rest.is_empty() {
        take_header(&mut rest)?;
    }

    Ok(Message { headers, payload })
}

impl<'a> Message<'a> {
    /// Restartable iterator over `(name, value)` pairs.
    pub const fn headers(&self) -> HeaderIter<'a> {
        HeaderIter { rest: self.headers }
    }

    /// First header with the given name, if any.
    pub fn header(&self, name: &[u8]) -> Option<HeaderValue<'a>> {
        self.headers().find(|(n, _)| *n == name).map(|(_, v)| v)
    }

    /// Extracts `:message-type`, `:message-flags` and `:stream-id`.
    pub fn common_headers(&self) -> Result<CommonHeaders, Fault> {
        let mut message_type = None;
        let mut stream_id = 0;
        let mut raw_flags = 0;

        for (name, value) in self.headers() {
            match name {
                b":message-type" => {
                    let raw = value.as_i32().ok_or(Fault::Invalid)?;
                    message_type = Some(MessageType::from_wire(raw).ok_or_else(|| {
                        warn!(raw, "unknown :message-type");
                        Fault::Invalid
                    })?);
                }
                b":message-flags" => raw_flags = value.as_i32().ok_or(Fault::Invalid)?,
                b":stream-id" => stream_id = value.as_i32().ok_or(Fault::Invalid)?,
                _ => {}
            }
        }

        let Some(message_type) = message_type else {
            warn!("frame missing :message-type header");
            return Err(Fault::Invalid);
        };
        Ok(CommonHeaders { message_type, stream_id, raw_flags })
    }
}

/// Iterates decoded headers. Infallible: the bytes were validated by
/// [`decode_frame`].
#[derive(Debug, Copy, Clone)]
pub struct HeaderIter<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for HeaderIter<'a> {
    type Item = (&'a [u8], HeaderValue<'a>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        take_header(&mut self.rest).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prelude_bytes(total_len: u32, headers_len: u32) -> [u8; PRELUDE_LEN] {
        let mut buf = [0u8; PRELUDE_LEN];
        buf[0..4].copy_from_slice(&total_len.to_be_bytes());
        buf[4..8].copy_from_slice(&headers_len.to_be_bytes());
        let crc = crc32fast::hash(&buf[..8]);
        buf[8..12].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    #[test]
    fn prelude_reports_declared_lengths() {
        let prelude = decode_prelude(&prelude_bytes(100, 20)).unwrap();
        assert_eq!(prelude.total_len, 100);
        assert_eq!(prelude.headers_len, 20);
        assert_eq!(prelude.data_len(), 88);
    }

    #[test]
    fn impossible_declared_lengths_fail_parse() {
        // Shorter than prelude + message CRC.
        assert!(decode_prelude(&prelude_bytes(15, 0)).is_err());
        // Headers would overlap the trailing CRC.
        assert!(decode_prelude(&prelude_bytes(20, 5)).is_err());
        // Wrong input size.
        assert!(decode_prelude(&[0u8; 11]).is_err());
    }
}
