//! Length-prefixed strings and blobs shared by the wire, save and replay
//! formats.
//!
//! Fixed-width integers go through `byteorder` at the call sites. Order
//! strings use a 7-bit variable length prefix followed by UTF-8 bytes; file
//! text blobs use an `i32` length.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

use crate::error::ProtocolError;
use crate::MAX_PACKET_SIZE;

/// Write a string with a 7-bit encoded length prefix.
pub fn write_string(w: &mut impl Write, s: &str) -> Result<(), ProtocolError> {
    let mut len = s.len() as u32;
    while len >= 0x80 {
        w.write_u8((len as u8) | 0x80)?;
        len >>= 7;
    }
    w.write_u8(len as u8)?;
    w.write_all(s.as_bytes())?;
    Ok(())
}

/// Write a string as `[len:i32][utf8]`.
pub fn write_text_blob(w: &mut impl Write, s: &str) -> Result<(), ProtocolError> {
    write_byte_blob(w, s.as_bytes())
}

/// Write a byte array as `[len:i32][bytes]`.
pub fn write_byte_blob(w: &mut impl Write, b: &[u8]) -> Result<(), ProtocolError> {
    w.write_i32::<LittleEndian>(b.len() as i32)?;
    w.write_all(b)?;
    Ok(())
}

/// Read a string written by [`write_string`]. Strings longer than a packet
/// are rejected before anything is allocated.
pub fn read_string(r: &mut impl Read) -> Result<String, ProtocolError> {
    let mut len: u32 = 0;
    let mut shift = 0;
    loop {
        let b = r.read_u8()?;
        len |= ((b & 0x7F) as u32) << shift;
        if b & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift > 28 {
            return Err(ProtocolError::MalformedOrder(
                "string length prefix is too long".to_string(),
            ));
        }
    }

    if len as usize > MAX_PACKET_SIZE {
        return Err(ProtocolError::MalformedOrder(format!(
            "string length {} exceeds {}",
            len, MAX_PACKET_SIZE
        )));
    }

    let buf = read_exact_len(r, len as usize)?;
    String::from_utf8(buf)
        .map_err(|e| ProtocolError::MalformedOrder(format!("invalid UTF-8 string: {}", e)))
}

/// Read a length that must be non-negative and at most `max`.
pub fn read_length(r: &mut impl Read, max: usize) -> Result<usize, ProtocolError> {
    let len = r.read_i32::<LittleEndian>()?;
    if len < 0 || len as usize > max {
        return Err(ProtocolError::MalformedPacket(format!(
            "length {} outside 0..={}",
            len, max
        )));
    }
    Ok(len as usize)
}

/// Read a blob written by [`write_text_blob`].
pub fn read_text_blob(r: &mut impl Read, max: usize) -> Result<String, ProtocolError> {
    let bytes = read_byte_blob(r, max)?;
    String::from_utf8(bytes)
        .map_err(|e| ProtocolError::MalformedPacket(format!("invalid UTF-8 text: {}", e)))
}

/// Read a blob written by [`write_byte_blob`].
pub fn read_byte_blob(r: &mut impl Read, max: usize) -> Result<Vec<u8>, ProtocolError> {
    let len = read_length(r, max)?;
    read_exact_len(r, len)
}

/// Reads exactly `len` bytes, growing the buffer only as data arrives.
fn read_exact_len(r: &mut impl Read, len: usize) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = Vec::new();
    r.take(len as u64).read_to_end(&mut buf)?;
    if buf.len() != len {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("expected {} bytes, got {}", len, buf.len()),
        )
        .into());
    }
    Ok(buf)
}
