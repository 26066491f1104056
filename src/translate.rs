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

//! Pixel format conversion (C2): server-native ARGB32 to a client's negotiated [`PixelFormat`].
//!
//! The server's surface is always a packed 32-bit ARGB word per pixel, native-endian, alpha in
//! the high byte (`0xAARRGGBB`) — the layout Cairo/PixMan call `ARGB32`. Every
//! `FramebufferUpdate` rectangle is translated from that fixed source into whatever format the
//! client's `SetPixelFormat` last requested.

use crate::protocol::PixelFormat;

/// Extracts the 8-bit R, G, B components from one native ARGB32 pixel word.
#[inline]
fn extract_argb32(pixel: u32) -> (u8, u8, u8) {
    let r = (pixel >> 16) as u8;
    let g = (pixel >> 8) as u8;
    let b = pixel as u8;
    (r, g, b)
}

/// Scales an 8-bit component down to the target format's `0..=max` range, per RFC 6143's
/// `(c * max) / 255` with integer rounding toward zero.
#[inline]
fn scale(component: u8, max: u16) -> u32 {
    (u32::from(component) * u32::from(max)) / 255
}

/// Packs an (r, g, b) triple into a target pixel format's integer representation.
#[inline]
fn pack(r: u8, g: u8, b: u8, format: &PixelFormat) -> u32 {
    (scale(r, format.red_max) << format.red_shift)
        | (scale(g, format.green_max) << format.green_shift)
        | (scale(b, format.blue_max) << format.blue_shift)
}

/// Serializes one packed pixel value as `bits_per_pixel / 8` bytes, honoring
/// `big_endian_flag`, and appends it to `out`.
fn write_packed(out: &mut Vec<u8>, value: u32, format: &PixelFormat) {
    match format.bits_per_pixel {
        8 => out.push(value as u8),
        16 => {
            let v = value as u16;
            if format.big_endian_flag != 0 {
                out.extend_from_slice(&v.to_be_bytes());
            } else {
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        32 => {
            if format.big_endian_flag != 0 {
                out.extend_from_slice(&value.to_be_bytes());
            } else {
                out.extend_from_slice(&value.to_le_bytes());
            }
        }
        _ => out.push(value as u8),
    }
}

/// Converts one ARGB32 pixel to the target format's on-wire byte representation.
pub fn convert_pixel(argb: u32, format: &PixelFormat) -> Vec<u8> {
    let (r, g, b) = extract_argb32(argb);
    let packed = pack(r, g, b, format);
    let mut out = Vec::with_capacity(usize::from(format.bits_per_pixel / 8));
    write_packed(&mut out, packed, format);
    out
}

/// Converts a rectangle of native ARGB32 pixels (4 bytes each, `width * height` pixels, no row
/// padding — callers slice rows out of the surface's stride themselves) into the target
/// format's wire representation.
///
/// # Panics
///
/// Panics if `src.len()` is not a multiple of 4.
pub fn convert_rect(src: &[u8], format: &PixelFormat) -> Vec<u8> {
    assert_eq!(src.len() % 4, 0, "source rectangle must be ARGB32 (4 bytes/pixel)");
    let bytes_per_pixel = usize::from(format.bits_per_pixel / 8).max(1);
    let mut out = Vec::with_capacity((src.len() / 4) * bytes_per_pixel);
    for chunk in src.chunks_exact(4) {
        let argb = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        let (r, g, b) = extract_argb32(argb);
        let packed = pack(r, g, b, format);
        write_packed(&mut out, packed, format);
    }
    out
}
