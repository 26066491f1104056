//! Big-endian wire codec shared by the handshake and message loop.
//!
//! All RFB integers are big-endian; strings are 4-byte length-prefixed UTF-8. Every read here
//! treats a short read (including EOF mid-message) as [`VncError::ConnectionClosed`] rather than
//! a protocol fault — the peer going away is not malformed input.

use std::io::{self, Read, Write};

use crate::error::{Result, VncError};

fn map_read_err(e: io::Error) -> VncError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        VncError::ConnectionClosed
    } else {
        VncError::Io(e)
    }
}

/// Reads exactly `buf.len()` bytes, never leaving a message half-consumed.
pub fn read_exact(stream: &mut impl Read, buf: &mut [u8]) -> Result<()> {
    stream.read_exact(buf).map_err(map_read_err)
}

/// Reads a single unsigned byte.
pub fn read_u8(stream: &mut impl Read) -> Result<u8> {
    let mut buf = [0u8; 1];
    read_exact(stream, &mut buf)?;
    Ok(buf[0])
}

/// Reads a big-endian `u16`.
pub fn read_u16(stream: &mut impl Read) -> Result<u16> {
    let mut buf = [0u8; 2];
    read_exact(stream, &mut buf)?;
    Ok(u16::from_be_bytes(buf))
}

/// Reads a big-endian `u32`.
pub fn read_u32(stream: &mut impl Read) -> Result<u32> {
    let mut buf = [0u8; 4];
    read_exact(stream, &mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

/// Reads a big-endian signed `i32`, used for encoding numbers (RFB encodes pseudo-encodings as
/// negative values).
pub fn read_i32(stream: &mut impl Read) -> Result<i32> {
    let mut buf = [0u8; 4];
    read_exact(stream, &mut buf)?;
    Ok(i32::from_be_bytes(buf))
}

/// Skips `n` bytes (used for the fixed padding fields RFB scatters through its messages).
pub fn skip(stream: &mut impl Read, n: usize) -> Result<()> {
    let mut buf = [0u8; 16];
    let mut remaining = n;
    while remaining > 0 {
        let chunk = remaining.min(buf.len());
        read_exact(stream, &mut buf[..chunk])?;
        remaining -= chunk;
    }
    Ok(())
}

/// Reads a 4-byte-length-prefixed UTF-8 string, rejecting invalid UTF-8 as a protocol error.
pub fn read_string(stream: &mut impl Read, max_len: u32) -> Result<String> {
    let len = read_u32(stream)?;
    if len > max_len {
        return Err(VncError::Protocol(format!(
            "string length {len} exceeds limit {max_len}"
        )));
    }
    let mut buf = vec![0u8; len as usize];
    read_exact(stream, &mut buf)?;
    String::from_utf8(buf).map_err(|e| VncError::Protocol(format!("invalid UTF-8: {e}")))
}

/// Writes a single byte.
pub fn write_u8(stream: &mut impl Write, v: u8) -> Result<()> {
    stream.write_all(&[v]).map_err(VncError::Io)
}

/// Writes a big-endian `u16`.
pub fn write_u16(stream: &mut impl Write, v: u16) -> Result<()> {
    stream.write_all(&v.to_be_bytes()).map_err(VncError::Io)
}

/// Writes a big-endian `u32`.
pub fn write_u32(stream: &mut impl Write, v: u32) -> Result<()> {
    stream.write_all(&v.to_be_bytes()).map_err(VncError::Io)
}

/// Writes a big-endian signed `i32`.
pub fn write_i32(stream: &mut impl Write, v: i32) -> Result<()> {
    stream.write_all(&v.to_be_bytes()).map_err(VncError::Io)
}

/// Writes `n` zero padding bytes.
pub fn write_padding(stream: &mut impl Write, n: usize) -> Result<()> {
    static ZEROES: [u8; 16] = [0u8; 16];
    let mut remaining = n;
    while remaining > 0 {
        let chunk = remaining.min(ZEROES.len());
        stream.write_all(&ZEROES[..chunk]).map_err(VncError::Io)?;
        remaining -= chunk;
    }
    Ok(())
}

/// Writes a 4-byte-length-prefixed UTF-8 string.
pub fn write_string(stream: &mut impl Write, s: &str) -> Result<()> {
    let bytes = s.as_bytes();
    write_u32(stream, bytes.len() as u32)?;
    stream.write_all(bytes).map_err(VncError::Io)
}
