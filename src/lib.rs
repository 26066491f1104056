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

//! # rustvncserver
//!
//! A pure Rust VNC (Virtual Network Computing) server library, speaking the subset of RFC 6143
//! needed to drive a single animator-owned pixel surface: version/security handshake, VNCAuth,
//! Raw framebuffer updates, the DesktopSize/DesktopName pseudo-encodings, and keyboard/pointer
//! input.
//!
//! ## Ownership model
//!
//! This library never owns the pixels it serves. The embedding application (the "animator")
//! keeps its own framebuffer in memory, builds a [`SurfaceDescriptor`] over it, and hands that
//! descriptor to a [`VncServer`] along with a [`SurfaceLock`] the two sides share: the animator
//! holds the lock while drawing, and the server holds it while copying pixels out to a client.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::{Arc, Mutex};
//! use std::time::Duration;
//! use rustvncserver::{ServerOptions, SurfaceDescriptor, SurfaceLock, VncServer};
//!
//! let pixels: Vec<u8> = vec![0u8; 640 * 480 * 4]; // native ARGB32
//! let surface_lock: Arc<SurfaceLock> = Arc::new(Mutex::new(()));
//!
//! // SAFETY: `pixels` outlives the server and is only mutated while `surface_lock` is held.
//! let surface = unsafe { SurfaceDescriptor::new(640, 480, 640 * 4, pixels.as_ptr()) };
//!
//! let server = VncServer::new(surface, Arc::clone(&surface_lock), ServerOptions {
//!     port: 5900,
//!     ..ServerOptions::default()
//! }).expect("valid server options");
//!
//! server.daemonise().expect("bind the listening socket");
//! if let Some(event) = server.get_event(Duration::from_millis(100)) {
//!     println!("{event:?}");
//! }
//! server.stop();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod auth;
pub mod connection;
pub mod damage;
pub mod error;
pub mod events;
pub mod protocol;
pub mod server;
pub mod surface;
pub mod translate;
pub mod wire;

// Re-exports: the library surface an embedding animator needs day to day.
pub use damage::Rect;
pub use error::{Result, VncError};
pub use events::InputEvent;
pub use protocol::PixelFormat;
pub use server::{ServerOptions, VncServer};
pub use surface::{SurfaceDescriptor, SurfaceLock};

/// Highest RFB protocol version this server advertises.
pub const PROTOCOL_VERSION: &str = protocol::PROTOCOL_VERSION;

/// Default VNC port.
pub const DEFAULT_PORT: u16 = 5900;
