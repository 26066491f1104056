// Copyright 2025 Dustin McAfee
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! VNC Remote Framebuffer (RFB) protocol constants and structures.
//!
//! This module provides the fundamental building blocks for VNC protocol communication:
//! protocol version negotiation, message types, security handshake constants, encodings,
//! and the pixel format descriptor. It implements the subset of RFC 6143 this server speaks.
//!
//! # Protocol overview
//!
//! 1. **Protocol version** - server and client agree on the highest mutually supported version.
//! 2. **Security handshake** - authentication method selection and execution.
//! 3. **Initialization** - exchange of framebuffer parameters and capabilities.
//! 4. **Normal operation** - ongoing message exchange for input events and screen updates.

use std::io::{Read, Write};

use crate::error::{Result, VncError};
use crate::wire;

/// The RFB protocol version string advertised by the server.
pub const PROTOCOL_VERSION: &str = "RFB 003.008\n";

/// The RFB 3.3 version string, offered as a downgrade target during negotiation.
pub const PROTOCOL_VERSION_3_3: &str = "RFB 003.003\n";

// Client-to-server message types.

/// Client requests to change the pixel format used for subsequent `FramebufferUpdate`s.
pub const CLIENT_MSG_SET_PIXEL_FORMAT: u8 = 0;
/// Client specifies supported encodings, ordered by preference.
pub const CLIENT_MSG_SET_ENCODINGS: u8 = 2;
/// Client requests a framebuffer update, incremental or full.
pub const CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST: u8 = 3;
/// Client sends a keyboard event.
pub const CLIENT_MSG_KEY_EVENT: u8 = 4;
/// Client sends a pointer (mouse) event.
pub const CLIENT_MSG_POINTER_EVENT: u8 = 5;
/// Client sends clipboard (cut text) data.
pub const CLIENT_MSG_CLIENT_CUT_TEXT: u8 = 6;

// Server-to-client message types.

/// Server sends one or more rectangles of pixel data.
pub const SERVER_MSG_FRAMEBUFFER_UPDATE: u8 = 0;

// Encodings. Only Raw is ever used to carry pixel data; CopyRect is recognised in
// `SetEncodings` but never emitted. DesktopSize/DesktopName are pseudo-encodings: their
// rectangles carry no Raw pixel payload, only an out-of-band signal.

/// Encoding: raw, uncompressed pixel data.
pub const ENCODING_RAW: i32 = 0;
/// Encoding: CopyRect. Recognised when negotiated; this server never emits it.
pub const ENCODING_COPYRECT: i32 = 1;
/// Pseudo-encoding: desktop size. Signals a framebuffer dimension change.
pub const ENCODING_DESKTOP_SIZE: i32 = -223;
/// Pseudo-encoding: desktop name. Signals a `change_name` update.
pub const ENCODING_DESKTOP_NAME: i32 = -307;

// Security types.

/// Security type: no authentication.
pub const SECURITY_TYPE_NONE: u8 = 1;
/// Security type: VNC challenge/response authentication.
pub const SECURITY_TYPE_VNC_AUTH: u8 = 2;

// Security results.

/// Security result: authentication succeeded.
pub const SECURITY_RESULT_OK: u32 = 0;
/// Security result: authentication failed.
pub const SECURITY_RESULT_FAILED: u32 = 1;

/// Maximum accepted length for a desktop name or `ClientCutText` payload.
pub const MAX_STRING_LEN: u32 = 10 * 1024 * 1024;

/// The pixel format of a framebuffer, as negotiated between client and server.
///
/// This is the 16-byte `PIXEL_FORMAT` structure from RFC 6143 §7.4.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelFormat {
    /// Number of bits used to hold one pixel: 8, 16, or 32.
    pub bits_per_pixel: u8,
    /// Number of useful bits in the pixel value.
    pub depth: u8,
    /// 1 if multi-byte pixels are big-endian on the wire, 0 for little-endian.
    pub big_endian_flag: u8,
    /// 1 for true-color, 0 for a color-mapped palette (unsupported; see [`PixelFormat::is_valid`]).
    pub true_colour_flag: u8,
    /// Maximum value of the red component.
    pub red_max: u16,
    /// Maximum value of the green component.
    pub green_max: u16,
    /// Maximum value of the blue component.
    pub blue_max: u16,
    /// Number of bits to left-shift a red component into its position.
    pub red_shift: u8,
    /// Number of bits to left-shift a green component into its position.
    pub green_shift: u8,
    /// Number of bits to left-shift a blue component into its position.
    pub blue_shift: u8,
}

impl PixelFormat {
    /// The server's native format: 32bpp ARGB (blue in the low byte, alpha unused on the wire).
    #[must_use]
    pub fn argb32() -> Self {
        Self {
            bits_per_pixel: 32,
            depth: 24,
            big_endian_flag: 0,
            true_colour_flag: 1,
            red_max: 255,
            green_max: 255,
            blue_max: 255,
            red_shift: 16,
            green_shift: 8,
            blue_shift: 0,
        }
    }

    /// Validates invariants required before this format can be used for a conversion.
    ///
    /// A color-mapped format (`true_colour_flag == 0`) is rejected outright: palette
    /// negotiation is not implemented, per this server's closed Open Question. A true-color
    /// format is rejected if its `(max << shift)` fields would overlap, since that would make
    /// the packed pixel ambiguous to unpack.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        if !matches!(self.bits_per_pixel, 8 | 16 | 32) {
            return false;
        }
        if self.depth == 0 || self.depth > self.bits_per_pixel {
            return false;
        }
        if self.true_colour_flag == 0 {
            // Color-mapped mode requires a palette, which this server does not support.
            return false;
        }
        if self.red_max == 0 || self.green_max == 0 || self.blue_max == 0 {
            return false;
        }

        let span = |shift: u8, max: u16| -> Option<(u32, u32)> {
            let lo = u32::from(shift);
            let bits = 16 - u32::from(max.leading_zeros()).min(16);
            Some((lo, lo + bits))
        };
        let Some(r) = span(self.red_shift, self.red_max) else {
            return false;
        };
        let Some(g) = span(self.green_shift, self.green_max) else {
            return false;
        };
        let Some(b) = span(self.blue_shift, self.blue_max) else {
            return false;
        };
        let overlaps = |a: (u32, u32), b: (u32, u32)| a.0 < b.1 && b.0 < a.1;
        if overlaps(r, g) || overlaps(g, b) || overlaps(r, b) {
            return false;
        }
        u32::from(self.bits_per_pixel) >= r.1.max(g.1).max(b.1)
    }

    /// Writes the 16-byte wire representation of this format.
    pub fn write_to(&self, stream: &mut impl Write) -> Result<()> {
        wire::write_u8(stream, self.bits_per_pixel)?;
        wire::write_u8(stream, self.depth)?;
        wire::write_u8(stream, self.big_endian_flag)?;
        wire::write_u8(stream, self.true_colour_flag)?;
        wire::write_u16(stream, self.red_max)?;
        wire::write_u16(stream, self.green_max)?;
        wire::write_u16(stream, self.blue_max)?;
        wire::write_u8(stream, self.red_shift)?;
        wire::write_u8(stream, self.green_shift)?;
        wire::write_u8(stream, self.blue_shift)?;
        wire::write_padding(stream, 3)
    }

    /// Reads the 16-byte wire representation of a pixel format.
    pub fn read_from(stream: &mut impl Read) -> Result<Self> {
        let pf = Self {
            bits_per_pixel: wire::read_u8(stream)?,
            depth: wire::read_u8(stream)?,
            big_endian_flag: wire::read_u8(stream)?,
            true_colour_flag: wire::read_u8(stream)?,
            red_max: wire::read_u16(stream)?,
            green_max: wire::read_u16(stream)?,
            blue_max: wire::read_u16(stream)?,
            red_shift: wire::read_u8(stream)?,
            green_shift: wire::read_u8(stream)?,
            blue_shift: wire::read_u8(stream)?,
        };
        wire::skip(stream, 3)?;
        Ok(pf)
    }
}

/// The `ServerInit` message sent once, right after the security handshake completes.
#[derive(Debug, Clone)]
pub struct ServerInit {
    /// Framebuffer width in pixels.
    pub width: u16,
    /// Framebuffer height in pixels.
    pub height: u16,
    /// The server's native pixel format (always [`PixelFormat::argb32`]).
    pub pixel_format: PixelFormat,
    /// The desktop name, sent length-prefixed.
    pub name: String,
}

impl ServerInit {
    /// Serializes and writes the `ServerInit` message.
    pub fn write_to(&self, stream: &mut impl Write) -> Result<()> {
        wire::write_u16(stream, self.width)?;
        wire::write_u16(stream, self.height)?;
        self.pixel_format.write_to(stream)?;
        wire::write_string(stream, &self.name)
    }
}

/// A single rectangle header within a `FramebufferUpdate` message.
#[derive(Debug, Clone, Copy)]
pub struct RectangleHeader {
    /// X coordinate of the rectangle's top-left corner.
    pub x: u16,
    /// Y coordinate of the rectangle's top-left corner.
    pub y: u16,
    /// Rectangle width in pixels.
    pub width: u16,
    /// Rectangle height in pixels.
    pub height: u16,
    /// The encoding this rectangle's body uses.
    pub encoding: i32,
}

impl RectangleHeader {
    /// Writes the 12-byte rectangle header (the body, if any, follows separately).
    pub fn write_to(&self, stream: &mut impl Write) -> Result<()> {
        wire::write_u16(stream, self.x)?;
        wire::write_u16(stream, self.y)?;
        wire::write_u16(stream, self.width)?;
        wire::write_u16(stream, self.height)?;
        wire::write_i32(stream, self.encoding)
    }
}

/// Ranks a 12-byte RFB version string against the two versions this server knows: `3.3` below
/// `3.8`. `None` for anything else.
fn version_rank(version: &str) -> Option<u8> {
    match version {
        PROTOCOL_VERSION_3_3 => Some(3),
        PROTOCOL_VERSION => Some(8),
        _ => None,
    }
}

/// Negotiates the protocol version: reads the client's 12-byte version string and rejects it
/// unless it is one of the two versions this server knows and does not exceed `max_version`
/// (the server's configured ceiling, itself one of those two strings).
pub fn negotiate_version(stream: &mut impl Read, max_version: &str) -> Result<()> {
    let mut buf = [0u8; 12];
    wire::read_exact(stream, &mut buf)?;
    let client_version = String::from_utf8_lossy(&buf).into_owned();

    let client_rank = version_rank(&client_version).ok_or_else(|| {
        VncError::Protocol(format!("unsupported client protocol version: {client_version:?}"))
    })?;
    let max_rank = version_rank(max_version).ok_or_else(|| {
        VncError::Protocol(format!("unsupported server protocol_version_max: {max_version:?}"))
    })?;
    if client_rank > max_rank {
        return Err(VncError::Protocol(format!(
            "client requested protocol version {client_version:?}, server only supports up to {max_version:?}"
        )));
    }
    Ok(())
}
