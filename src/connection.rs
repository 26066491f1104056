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

//! Per-connection state machine (C5): handshake, then the running message loop.
//!
//! Each accepted socket gets its own thread running [`Connection::run`] end to end. All state
//! here is connection-local except for the [`FramebufferHub`] and [`SurfaceLock`] the connection
//! borrows — nothing in this module reaches across to another connection.

use std::io::Write;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};

use crate::auth::{self, AuthOutcome};
use crate::error::{Result, VncError};
use crate::events::{EventSender, InputEvent};
use crate::protocol::{
    self, PixelFormat, RectangleHeader, ServerInit, CLIENT_MSG_CLIENT_CUT_TEXT,
    CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST, CLIENT_MSG_KEY_EVENT, CLIENT_MSG_POINTER_EVENT,
    CLIENT_MSG_SET_ENCODINGS, CLIENT_MSG_SET_PIXEL_FORMAT, ENCODING_DESKTOP_NAME,
    ENCODING_DESKTOP_SIZE, MAX_STRING_LEN, SECURITY_RESULT_FAILED, SECURITY_RESULT_OK,
    SECURITY_TYPE_NONE, SECURITY_TYPE_VNC_AUTH, SERVER_MSG_FRAMEBUFFER_UPDATE,
};
use crate::surface::{ConnectionShared, FramebufferHub, SurfaceLock};
use crate::translate;
use crate::wire;

/// How long a client has to complete the handshake (version through `ClientInit`) before the
/// connection is dropped.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Credentials and limits a connection needs during the security handshake. Shared (read-only)
/// across every connection of one server.
pub struct AuthConfig {
    /// Full-access password, if VNCAuth is offered at all.
    pub password: Option<String>,
    /// Read-only password, checked after `password` if both are configured.
    pub read_only_password: Option<String>,
    /// Forces every connection read-only regardless of which password matched.
    pub force_read_only: bool,
}

impl AuthConfig {
    fn security_types(&self) -> Vec<u8> {
        if self.password.is_some() || self.read_only_password.is_some() {
            vec![SECURITY_TYPE_NONE, SECURITY_TYPE_VNC_AUTH]
        } else {
            vec![SECURITY_TYPE_NONE]
        }
    }
}

/// Everything a connection thread needs that is shared with the rest of the server.
pub struct ConnectionContext {
    /// The framebuffer hub this connection registers damage and pending-change flags with.
    pub hub: Arc<FramebufferHub>,
    /// The external lock guarding reads of the animator's pixel memory.
    pub surface_lock: Arc<SurfaceLock>,
    /// Producer handle for the server's bounded input event queue.
    pub events: EventSender,
    /// Security configuration (passwords, forced read-only).
    pub auth: Arc<AuthConfig>,
    /// The highest RFB protocol version string to advertise, per `ServerOptions::protocol_version_max`.
    pub protocol_version: Arc<str>,
}

/// One connected client, from accept to socket close.
pub struct Connection {
    stream: TcpStream,
    ctx: ConnectionContext,
    shared: Arc<ConnectionShared>,
    conn_id: u64,
    read_only: bool,
    chosen_format: Mutex<PixelFormat>,
    supports_desktop_size: AtomicBool,
    supports_desktop_name: AtomicBool,
    last_buttons: AtomicU8,
}

impl Connection {
    /// Runs one connection to completion on the calling thread: handshake, then the message
    /// loop until the peer disconnects or a fatal protocol error occurs.
    ///
    /// Returns `Ok(())` on an ordinary disconnect; protocol/auth/resource errors are returned so
    /// the caller can log them, but they never propagate beyond this one connection.
    pub fn run(stream: TcpStream, ctx: ConnectionContext) -> Result<()> {
        stream.set_nodelay(true).ok();
        let peer = stream.peer_addr().map(|a| a.to_string()).unwrap_or_else(|_| "?".to_string());

        let mut handshake_stream = stream.try_clone().map_err(VncError::Io)?;
        handshake_stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT)).ok();

        let (conn_id, shared) = ctx.hub.register();
        let outcome = match Self::handshake(&mut handshake_stream, &ctx) {
            Ok(outcome) => outcome,
            Err(e) => {
                ctx.hub.unregister(conn_id);
                return Err(e);
            }
        };
        handshake_stream.set_read_timeout(None).ok();

        let mut connection = Connection {
            stream,
            ctx,
            shared,
            conn_id,
            read_only: outcome.read_only,
            chosen_format: Mutex::new(PixelFormat::argb32()),
            supports_desktop_size: AtomicBool::new(false),
            supports_desktop_name: AtomicBool::new(false),
            last_buttons: AtomicU8::new(0),
        };

        info!("vnc: client {peer} connected (read_only={})", connection.read_only);
        let result = connection.message_loop();
        connection.ctx.hub.unregister(connection.conn_id);
        match &result {
            Ok(()) => info!("vnc: client {peer} disconnected"),
            Err(e) if e.is_connection_closed() => info!("vnc: client {peer} disconnected"),
            Err(e) => warn!("vnc: client {peer} dropped: {e}"),
        }
        result
    }

    /// Runs the version, security, and init phases. Returns the negotiated [`AuthOutcome`].
    fn handshake(stream: &mut TcpStream, ctx: &ConnectionContext) -> Result<AuthOutcome> {
        stream.write_all(ctx.protocol_version.as_bytes()).map_err(VncError::Io)?;
        protocol::negotiate_version(stream, &ctx.protocol_version)?;

        let security_types = ctx.auth.security_types();
        wire::write_u8(stream, security_types.len() as u8)?;
        for ty in &security_types {
            wire::write_u8(stream, *ty)?;
        }

        let selected = wire::read_u8(stream)?;
        if !security_types.contains(&selected) {
            return Err(VncError::Protocol(format!("client selected unoffered security type {selected}")));
        }

        let outcome = if selected == SECURITY_TYPE_VNC_AUTH {
            match Self::perform_vnc_auth(stream, ctx) {
                Ok(outcome) => {
                    wire::write_u32(stream, SECURITY_RESULT_OK)?;
                    outcome
                }
                Err(e) => {
                    wire::write_u32(stream, SECURITY_RESULT_FAILED)?;
                    wire::write_string(stream, "authentication failed")?;
                    return Err(e);
                }
            }
        } else {
            wire::write_u32(stream, SECURITY_RESULT_OK)?;
            AuthOutcome { read_only: false }
        };
        let read_only = outcome.read_only || ctx.auth.force_read_only;

        // ClientInit: one byte, shared-flag. This server always allows sharing; the value is
        // read and discarded.
        wire::read_u8(stream)?;

        let (descriptor, name) = ctx.hub.snapshot();
        ServerInit {
            width: descriptor.width(),
            height: descriptor.height(),
            pixel_format: PixelFormat::argb32(),
            name,
        }
        .write_to(stream)?;

        Ok(AuthOutcome { read_only })
    }

    fn perform_vnc_auth(stream: &mut TcpStream, ctx: &ConnectionContext) -> Result<AuthOutcome> {
        let challenge = auth::generate_challenge();
        stream.write_all(&challenge).map_err(VncError::Io)?;

        let mut response = [0u8; auth::CHALLENGE_LEN];
        wire::read_exact(stream, &mut response)?;

        auth::verify(
            &challenge,
            &response,
            ctx.auth.password.as_deref(),
            ctx.auth.read_only_password.as_deref(),
        )
    }

    /// The `Running` state: read one message, dispatch, repeat until the peer disconnects.
    fn message_loop(&mut self) -> Result<()> {
        loop {
            let message_type = wire::read_u8(&mut self.stream)?;
            match message_type {
                CLIENT_MSG_SET_PIXEL_FORMAT => self.handle_set_pixel_format()?,
                CLIENT_MSG_SET_ENCODINGS => self.handle_set_encodings()?,
                CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST => self.handle_framebuffer_update_request()?,
                CLIENT_MSG_KEY_EVENT => self.handle_key_event()?,
                CLIENT_MSG_POINTER_EVENT => self.handle_pointer_event()?,
                CLIENT_MSG_CLIENT_CUT_TEXT => self.handle_client_cut_text()?,
                other => {
                    return Err(VncError::Protocol(format!("unknown client message type {other}")));
                }
            }
        }
    }

    fn handle_set_pixel_format(&mut self) -> Result<()> {
        wire::skip(&mut self.stream, 3)?;
        let format = PixelFormat::read_from(&mut self.stream)?;
        if !format.is_valid() {
            return Err(VncError::Protocol(format!("invalid pixel format: {format:?}")));
        }
        *self.chosen_format.lock().unwrap() = format;
        // The client will see stale pixels under its old format otherwise.
        let (descriptor, _) = self.ctx.hub.snapshot();
        self.shared.damage.mark_all(descriptor.bounds());
        Ok(())
    }

    fn handle_set_encodings(&mut self) -> Result<()> {
        wire::skip(&mut self.stream, 1)?;
        let count = wire::read_u16(&mut self.stream)?;
        let mut supports_desktop_size = false;
        let mut supports_desktop_name = false;
        for _ in 0..count {
            let encoding = wire::read_i32(&mut self.stream)?;
            if encoding == ENCODING_DESKTOP_SIZE {
                supports_desktop_size = true;
            } else if encoding == ENCODING_DESKTOP_NAME {
                supports_desktop_name = true;
            }
        }
        self.supports_desktop_size.store(supports_desktop_size, Ordering::Relaxed);
        self.supports_desktop_name.store(supports_desktop_name, Ordering::Relaxed);
        Ok(())
    }

    fn handle_framebuffer_update_request(&mut self) -> Result<()> {
        let incremental = wire::read_u8(&mut self.stream)?;
        // The requested rectangle only matters for non-incremental requests, and even then RFB
        // servers commonly just resend the whole surface; this server does the same.
        wire::skip(&mut self.stream, 8)?;

        if incremental == 0 {
            let (descriptor, _) = self.ctx.hub.snapshot();
            self.shared.damage.mark_all(descriptor.bounds());
        }

        self.send_update()
    }

    /// Builds and writes one `FramebufferUpdate`: pseudo-rectangles first (size, then name),
    /// then Raw rectangles for whatever damage is pending.
    fn send_update(&mut self) -> Result<()> {
        let (descriptor, name) = self.ctx.hub.snapshot();
        let bounds = descriptor.bounds();

        let emit_size = self.supports_desktop_size.load(Ordering::Relaxed)
            && self.shared.pending_size_change.swap(false, Ordering::Relaxed);
        let emit_name = self.supports_desktop_name.load(Ordering::Relaxed)
            && self.shared.pending_name_change.swap(false, Ordering::Relaxed);

        let damage_rects = self.shared.damage.drain_intersect(bounds);

        let format = self.chosen_format.lock().unwrap().clone();
        let mut bodies: Vec<(RectangleHeader, Vec<u8>)> = Vec::new();

        if emit_size {
            bodies.push((
                RectangleHeader { x: 0, y: 0, width: bounds.w, height: bounds.h, encoding: ENCODING_DESKTOP_SIZE },
                Vec::new(),
            ));
        }
        if emit_name {
            let mut payload = Vec::new();
            wire::write_string(&mut payload, &name)?;
            bodies.push((
                RectangleHeader { x: 0, y: 0, width: 0, height: 0, encoding: ENCODING_DESKTOP_NAME },
                payload,
            ));
        }
        for rect in damage_rects {
            let guard = self.ctx.surface_lock.lock().unwrap();
            let pixels = descriptor.read_rect(&guard, rect);
            drop(guard);
            let converted = translate::convert_rect(&pixels, &format);
            bodies.push((
                RectangleHeader { x: rect.x, y: rect.y, width: rect.w, height: rect.h, encoding: protocol::ENCODING_RAW },
                converted,
            ));
        }

        if bodies.is_empty() {
            return Ok(());
        }

        wire::write_u8(&mut self.stream, SERVER_MSG_FRAMEBUFFER_UPDATE)?;
        wire::write_padding(&mut self.stream, 1)?;
        wire::write_u16(&mut self.stream, bodies.len() as u16)?;
        for (header, payload) in bodies {
            header.write_to(&mut self.stream)?;
            if !payload.is_empty() {
                self.stream.write_all(&payload).map_err(VncError::Io)?;
            }
        }
        Ok(())
    }

    fn handle_key_event(&mut self) -> Result<()> {
        let down = wire::read_u8(&mut self.stream)? != 0;
        wire::skip(&mut self.stream, 2)?;
        let sym = wire::read_u32(&mut self.stream)?;
        if !self.read_only {
            self.ctx.events.push(InputEvent::Key { sym, down });
        }
        Ok(())
    }

    fn handle_pointer_event(&mut self) -> Result<()> {
        let buttons = wire::read_u8(&mut self.stream)?;
        let x = i32::from(wire::read_u16(&mut self.stream)?);
        let y = i32::from(wire::read_u16(&mut self.stream)?);

        if self.read_only {
            self.last_buttons.store(buttons, Ordering::Relaxed);
            return Ok(());
        }

        self.ctx.events.push(InputEvent::PointerMove { x, y, buttons });

        let previous = self.last_buttons.swap(buttons, Ordering::Relaxed);
        let changed = previous ^ buttons;
        for bit in 0u8..8 {
            if changed & (1 << bit) != 0 {
                let down = buttons & (1 << bit) != 0;
                self.ctx.events.push(InputEvent::PointerClick { x, y, button: bit, down });
            }
        }
        Ok(())
    }

    fn handle_client_cut_text(&mut self) -> Result<()> {
        wire::skip(&mut self.stream, 3)?;
        let len = wire::read_u32(&mut self.stream)?;
        if len > MAX_STRING_LEN {
            return Err(VncError::Protocol(format!("ClientCutText length {len} exceeds limit")));
        }
        wire::skip(&mut self.stream, len as usize)?;
        debug!("vnc: discarded {len}-byte ClientCutText payload");
        Ok(())
    }
}

/// Handles a connection that arrived while the server was already at `max_clients`: performs
/// just enough of the handshake to report [`SECURITY_RESULT_FAILED`] with a reason, then closes.
pub fn reject_resource_limit(mut stream: TcpStream) -> Result<()> {
    stream.write_all(protocol::PROTOCOL_VERSION.as_bytes()).map_err(VncError::Io)?;
    protocol::negotiate_version(&mut stream, protocol::PROTOCOL_VERSION)?;

    wire::write_u8(&mut stream, 1)?;
    wire::write_u8(&mut stream, SECURITY_TYPE_NONE)?;
    wire::read_u8(&mut stream)?;

    wire::write_u32(&mut stream, SECURITY_RESULT_FAILED)?;
    wire::write_string(&mut stream, "too many clients")?;
    Err(VncError::ResourceLimit)
}
