use tracing::warn;
use trellis_object::Fault;

use crate::{
    PRELUDE_LEN,
    types::{Header, HeaderValue, tag},
};

fn put_header(out: &mut Vec<u8>, header: &Header<'_>) -> Result<(), Fault> {
    if header.name.len() > 127 {
        warn!("header name too long");
        return Err(Fault::Range);
    }
    out.push(header.name.len() as u8);
    out.extend_from_slice(header.name);

    match header.value {
        HeaderValue::Bool(true) => out.push(tag::BOOL_TRUE),
        HeaderValue::Bool(false) => out.push(tag::BOOL_FALSE),
        HeaderValue::Int32(v) => {
            out.push(tag::INT32);
            out.extend_from_slice(&v.to_be_bytes());
        }
        HeaderValue::Int64(v) => {
            out.push(tag::INT64);
            out.extend_from_slice(&v.to_be_bytes());
        }
        HeaderValue::ByteBuf(b) | HeaderValue::String(b) => {
            let len = u16::try_from(b.len()).map_err(|_| {
                warn!("header value too long");
                Fault::Range
            })?;
            out.push(if matches!(header.value, HeaderValue::String(_)) {
                tag::STRING
            } else {
                tag::BYTE_BUF
            });
            out.extend_from_slice(&len.to_be_bytes());
            out.extend_from_slice(b);
        }
        HeaderValue::Timestamp(v) => {
            out.push(tag::TIMESTAMP);
            out.extend_from_slice(&v.to_be_bytes());
        }
        HeaderValue::Uuid(b) => {
            out.push(tag::UUID);
            out.extend_from_slice(b);
        }
    }
    Ok(())
}

/// Encodes one frame into `out` (which is cleared first).
///
/// `write_payload` appends the payload bytes and receives the remaining
/// byte budget; exceeding `max_len` fails `NoMem`. Both CRC fields are
/// computed as the frame is assembled.
pub fn encode_frame(
    out: &mut Vec<u8>,
    headers: &[Header<'_>],
    max_len: usize,
    write_payload: impl FnOnce(&mut Vec<u8>, usize) -> Result<(), Fault>,
) -> Result<(), Fault> {
    out.clear();
    out.resize(PRELUDE_LEN, 0);

    for header in headers {
        put_header(out, header)?;
    }
    let headers_len = out.len() - PRELUDE_LEN;

    let budget = max_len.saturating_sub(out.len() + 4);
    write_payload(out, budget)?;

    let total_len = out.len() + 4;
    if total_len > max_len {
        warn!(total_len, max_len, "frame exceeds max length");
        return Err(Fault::NoMem);
    }

    out[0..4].copy_from_slice(&(total_len as u32).to_be_bytes());
    out[4..8].copy_from_slice(&(headers_len as u32).to_be_bytes());
    let prelude_crc = crc32fast::hash(&out[..8]);
    out[8..12].copy_from_slice(&prelude_crc.to_be_bytes());

    let message_crc = crc32fast::hash(out);
    out.extend_from_slice(&message_crc.to_be_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MAX_FRAME_LEN, Message, MessageType, Prelude, decode_frame, decode_prelude};

    fn encode(headers: &[Header<'_>], payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        encode_frame(&mut out, headers, MAX_FRAME_LEN, |buf, _| {
            buf.extend_from_slice(payload);
            Ok(())
        })
        .unwrap();
        out
    }

    fn decode(frame: &[u8]) -> (Prelude, Message<'_>) {
        let prelude = decode_prelude(&frame[..PRELUDE_LEN]).unwrap();
        let msg = decode_frame(&prelude, &frame[PRELUDE_LEN..]).unwrap();
        (prelude, msg)
    }

    #[test]
    fn frame_roundtrip() {
        let headers = [
            Header::new(b":message-type", HeaderValue::Int32(MessageType::Connect as i32)),
            Header::new(b":stream-id", HeaderValue::Int32(0)),
            Header::new(b"operation", HeaderValue::String(b"do.thing")),
            Header::new(b"ok", HeaderValue::Bool(true)),
            Header::new(b"big", HeaderValue::Int64(1 << 40)),
            Header::new(b"blob", HeaderValue::ByteBuf(b"\x00\x01")),
            Header::new(b"when", HeaderValue::Timestamp(1_700_000_000_000)),
            Header::new(b"id", HeaderValue::Uuid(&[7; 16])),
        ];
        let frame = encode(&headers, b"{\"a\":1}");
        let (prelude, msg) = decode(&frame);

        assert_eq!(prelude.total_len as usize, frame.len());
        assert_eq!(msg.payload, b"{\"a\":1}");

        let decoded: Vec<_> = msg.headers().collect();
        assert_eq!(decoded.len(), headers.len());
        assert_eq!(decoded[2], (b"operation".as_slice(), HeaderValue::String(b"do.thing")));
        assert_eq!(decoded[3], (b"ok".as_slice(), HeaderValue::Bool(true)));
        assert_eq!(decoded[4], (b"big".as_slice(), HeaderValue::Int64(1 << 40)));
        assert_eq!(decoded[6], (b"when".as_slice(), HeaderValue::Timestamp(1_700_000_000_000)));
        assert_eq!(decoded[7], (b"id".as_slice(), HeaderValue::Uuid(&[7; 16])));

        // Restartable: a second pass yields the same sequence.
        assert_eq!(msg.headers().count(), headers.len());

        let common = msg.common_headers().unwrap();
        assert_eq!(common.message_type, MessageType::Connect);
        assert_eq!(common.stream_id, 0);
        assert!(common.flags().is_empty());
    }

    #[test]
    fn empty_frame_roundtrip() {
        let frame = encode(&[], b"");
        let (prelude, msg) = decode(&frame);
        assert_eq!(prelude.total_len as usize, crate::MIN_FRAME_LEN);
        assert_eq!(msg.headers().count(), 0);
        assert!(msg.payload.is_empty());
    }

    #[test]
    fn corrupt_prelude_fails_parse() {
        let mut frame = encode(&[], b"x");
        frame[0] ^= 0x40;
        assert!(matches!(
            decode_prelude(&frame[..PRELUDE_LEN]),
            Err(trellis_object::Fault::Parse)
        ));
    }

    #[test]
    fn corrupt_body_fails_parse() {
        let mut frame = encode(&[Header::new(b"k", HeaderValue::Int32(1))], b"payload");
        let last = frame.len() - 5;
        frame[last] ^= 0xff;
        let prelude = decode_prelude(&frame[..PRELUDE_LEN]).unwrap();
        assert!(matches!(
            decode_frame(&prelude, &frame[PRELUDE_LEN..]),
            Err(trellis_object::Fault::Parse)
        ));
    }

    #[test]
    fn unknown_header_tag_fails_parse() {
        let mut frame = encode(&[Header::new(b"k", HeaderValue::Int32(7))], b"");
        // Patch the value tag in place and fix the message CRC back up.
        let tag_at = PRELUDE_LEN + 1 + 1;
        frame[tag_at] = 0x20;
        let body_end = frame.len() - 4;
        let crc = crc32fast::hash(&frame[..body_end]);
        frame[body_end..].copy_from_slice(&crc.to_be_bytes());

        let prelude = decode_prelude(&frame[..PRELUDE_LEN]).unwrap();
        assert!(decode_frame(&prelude, &frame[PRELUDE_LEN..]).is_err());
    }

    #[test]
    fn oversize_frame_fails_nomem() {
        let mut out = Vec::new();
        let err = encode_frame(&mut out, &[], 64, |buf, _| {
            buf.extend_from_slice(&[0u8; 128]);
            Ok(())
        });
        assert_eq!(err, Err(trellis_object::Fault::NoMem));
    }
}
