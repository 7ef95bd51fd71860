//! # RESP2 Encoding and Parsing
//!
//! Purpose: Encode client commands and decode server replies straight out of
//! the connection's read buffer, so frames can be parsed as bytes arrive.
//!
//! ## Design Principles
//! 1. **Incremental Decoding**: `decode` returns `Ok(None)` until a whole frame
//!    is buffered and consumes nothing in that case.
//! 2. **Buffer Reuse**: Callers own the `BytesMut` buffers for both directions.
//! 3. **Binary-Safe**: Bulk strings are treated as raw bytes.
//! 4. **Fail Fast**: Invalid framing returns protocol errors immediately.

use bytes::{Buf, BufMut, BytesMut};

use crate::client::{ClientError, ClientResult};

/// RESP response value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// +OK or +PONG style responses.
    Simple(Vec<u8>),
    /// -ERR ... responses.
    Error(Vec<u8>),
    /// :123 responses.
    Integer(i64),
    /// $... bulk strings, with None for null.
    Bulk(Option<Vec<u8>>),
    /// *... arrays. A null array decodes as an empty one.
    Array(Vec<RespValue>),
}

impl RespValue {
    /// Returns the payload of a string-like value.
    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self {
            RespValue::Simple(data) | RespValue::Bulk(Some(data)) => Some(data),
            _ => None,
        }
    }
}

/// Encodes a RESP2 array command into the provided buffer.
pub fn encode_command(args: &[&[u8]], out: &mut BytesMut) {
    out.put_u8(b'*');
    push_usize(out, args.len());
    out.extend_from_slice(b"\r\n");
    for arg in args {
        out.put_u8(b'$');
        push_usize(out, arg.len());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
}

/// Decodes one RESP value from the front of `buf`.
///
/// Returns `Ok(None)` when the buffer holds only part of a frame.
pub fn decode(buf: &mut BytesMut) -> ClientResult<Option<RespValue>> {
    match parse_value(&buf[..], 0)? {
        Some((value, consumed)) => {
            buf.advance(consumed);
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

fn parse_value(data: &[u8], pos: usize) -> ClientResult<Option<(RespValue, usize)>> {
    let (line, next) = match read_line(data, pos)? {
        Some(found) => found,
        None => return Ok(None),
    };
    if line.is_empty() {
        return Err(ClientError::Protocol);
    }

    match line[0] {
        b'+' => Ok(Some((RespValue::Simple(line[1..].to_vec()), next))),
        b'-' => Ok(Some((RespValue::Error(line[1..].to_vec()), next))),
        b':' => Ok(Some((RespValue::Integer(parse_i64(&line[1..])?), next))),
        b'$' => {
            let len = parse_i64(&line[1..])?;
            parse_bulk(data, len, next)
        }
        b'*' => {
            let len = parse_i64(&line[1..])?;
            parse_array(data, len, next)
        }
        _ => Err(ClientError::Protocol),
    }
}

fn parse_bulk(data: &[u8], len: i64, start: usize) -> ClientResult<Option<(RespValue, usize)>> {
    if len < 0 {
        return Ok(Some((RespValue::Bulk(None), start)));
    }
    let end = start + len as usize;
    if data.len() < end + 2 {
        return Ok(None);
    }
    if &data[end..end + 2] != b"\r\n" {
        return Err(ClientError::Protocol);
    }
    Ok(Some((RespValue::Bulk(Some(data[start..end].to_vec())), end + 2)))
}

fn parse_array(data: &[u8], len: i64, start: usize) -> ClientResult<Option<(RespValue, usize)>> {
    if len <= 0 {
        return Ok(Some((RespValue::Array(Vec::new()), start)));
    }

    // The length is peer-controlled; cap the up-front reservation.
    let mut items = Vec::with_capacity((len as usize).min(1024));
    let mut cursor = start;
    for _ in 0..len {
        match parse_value(data, cursor)? {
            Some((item, after)) => {
                items.push(item);
                cursor = after;
            }
            None => return Ok(None),
        }
    }
    Ok(Some((RespValue::Array(items), cursor)))
}

fn read_line(data: &[u8], pos: usize) -> ClientResult<Option<(&[u8], usize)>> {
    let rest = &data[pos..];
    match rest.iter().position(|&b| b == b'\n') {
        Some(idx) => {
            if idx == 0 || rest[idx - 1] != b'\r' {
                return Err(ClientError::Protocol);
            }
            Ok(Some((&rest[..idx - 1], pos + idx + 1)))
        }
        None => Ok(None),
    }
}

fn parse_i64(data: &[u8]) -> ClientResult<i64> {
    let (negative, digits) = match data.split_first() {
        Some((&b'-', rest)) => (true, rest),
        _ => (false, data),
    };
    if digits.is_empty() {
        return Err(ClientError::Protocol);
    }

    let mut value: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(ClientError::Protocol);
        }
        value = value.saturating_mul(10).saturating_add((b - b'0') as i64);
    }

    if negative {
        Ok(-value)
    } else {
        Ok(value)
    }
}

fn push_usize(out: &mut BytesMut, mut value: usize) {
    // Write digits into a small stack buffer to avoid heap allocations.
    let mut buf = [0u8; 20];
    let mut len = 0;
    if value == 0 {
        buf[0] = b'0';
        len = 1;
    } else {
        while value > 0 {
            buf[len] = b'0' + (value % 10) as u8;
            value /= 10;
            len += 1;
        }
    }
    for idx in (0..len).rev() {
        out.put_u8(buf[idx]);
    }
}
