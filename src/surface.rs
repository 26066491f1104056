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

//! The surface descriptor and the framebuffer hub (C6).
//!
//! The animator owns the pixel memory; this crate never allocates or frees it. A
//! [`SurfaceDescriptor`] is a thin, non-owning view over that memory — width, height, stride, and
//! a raw pointer to the first byte. It is valid only while the caller holds the server's
//! `surface_lock`, the same external mutex the animator takes while drawing.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::damage::{DamageRegion, Rect};

/// An external mutex the animator and this crate both take around reads/writes of the pixel
/// memory a [`SurfaceDescriptor`] points at. A plain `Mutex<()>`: its only job is mutual
/// exclusion, never protecting data of its own.
pub type SurfaceLock = Mutex<()>;

/// A non-owning view over pixel memory the animator owns: native ARGB32, native-endian,
/// `stride_bytes` between the start of consecutive rows (may exceed `width * 4` if the
/// animator's buffer is padded).
///
/// Constructing one is `unsafe`: the caller asserts that `base_address` stays valid for
/// `height * stride_bytes` bytes for as long as the descriptor is in use, and that every read
/// through it happens while the server's `surface_lock` is held.
#[derive(Debug, Clone, Copy)]
pub struct SurfaceDescriptor {
    width: u16,
    height: u16,
    stride_bytes: usize,
    base_address: *const u8,
}

impl SurfaceDescriptor {
    /// Builds a descriptor over animator-owned memory.
    ///
    /// # Safety
    ///
    /// `base_address` must be valid for reads of `height as usize * stride_bytes` bytes for the
    /// entire lifetime of this descriptor, and the memory must not be mutated except while the
    /// caller holds the `surface_lock` passed to the same server.
    #[must_use]
    pub unsafe fn new(width: u16, height: u16, stride_bytes: usize, base_address: *const u8) -> Self {
        Self { width, height, stride_bytes, base_address }
    }

    /// Framebuffer width in pixels.
    #[must_use]
    pub fn width(&self) -> u16 {
        self.width
    }

    /// Framebuffer height in pixels.
    #[must_use]
    pub fn height(&self) -> u16 {
        self.height
    }

    /// A rectangle covering the entire surface.
    #[must_use]
    pub fn bounds(&self) -> Rect {
        Rect::new(0, 0, self.width, self.height)
    }

    /// Copies out the ARGB32 bytes of `rect`, row by row per `stride_bytes`, clipped to
    /// [`Self::bounds`].
    ///
    /// The `_lock` parameter is proof, not a capability: its only role is to force every call
    /// site to be holding the server's `surface_lock` guard, per this crate's non-owning-pointer
    /// contract. Passing a guard from a different mutex would compile but defeats the point —
    /// callers are expected to pass the one guard the server handed them.
    #[must_use]
    pub fn read_rect(&self, _lock: &MutexGuard<'_, ()>, rect: Rect) -> Vec<u8> {
        let Some(rect) = rect.clip(self.bounds()) else {
            return Vec::new();
        };
        let row_bytes = usize::from(rect.w) * 4;
        let mut out = Vec::with_capacity(row_bytes * usize::from(rect.h));
        for row in 0..rect.h {
            let y = usize::from(rect.y) + usize::from(row);
            let row_start = y * self.stride_bytes + usize::from(rect.x) * 4;
            // SAFETY: `rect` is clipped to `self.bounds()`, so `row_start + row_bytes` stays
            // within `height * stride_bytes`, which the caller guaranteed in `Self::new`. The
            // `_lock` parameter establishes that the caller holds `surface_lock`.
            let row_slice = unsafe {
                std::slice::from_raw_parts(self.base_address.add(row_start), row_bytes)
            };
            out.extend_from_slice(row_slice);
        }
        out
    }
}

// `SurfaceDescriptor` holds a raw pointer and is therefore neither `Send` nor `Sync` on its own.
// `SurfaceState` below carries the `unsafe impl`, justified by the same contract as
// `SurfaceDescriptor::new`: the pointer is only ever dereferenced under `surface_lock`, which is
// itself `Send + Sync`, so sharing the descriptor across connection threads is sound as long as
// every reader goes through `read_rect`.
struct SurfaceState {
    descriptor: SurfaceDescriptor,
    name: String,
}

unsafe impl Send for SurfaceState {}
unsafe impl Sync for SurfaceState {}

/// Per-connection state the hub fans damage and pending-update flags out to. Owned jointly by
/// the hub (for fan-out) and the connection thread (for draining).
#[derive(Default)]
pub struct ConnectionShared {
    /// This connection's pending damage.
    pub damage: DamageRegion,
    /// Set when `change_surface` has run since this connection's last update and not yet been
    /// emitted as a DesktopSize pseudo-rectangle (or consumed as full damage).
    pub pending_size_change: AtomicBool,
    /// Set when `change_name` has run since this connection's last update and not yet been
    /// emitted as a DesktopName pseudo-rectangle.
    pub pending_name_change: AtomicBool,
}

impl ConnectionShared {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

/// Registers every live connection, owns the current surface descriptor and desktop name, and
/// fans out damage and change notifications. One hub per server.
pub struct FramebufferHub {
    state: Mutex<SurfaceState>,
    connections: Mutex<Vec<(u64, Arc<ConnectionShared>)>>,
    next_id: AtomicU64,
}

impl FramebufferHub {
    /// Creates a hub over the animator's initial surface and desktop name.
    #[must_use]
    pub fn new(descriptor: SurfaceDescriptor, name: String) -> Self {
        Self {
            state: Mutex::new(SurfaceState { descriptor, name }),
            connections: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Registers a new connection, returning its id (for [`Self::unregister`]) and the shared
    /// state the connection thread drains from.
    pub fn register(&self) -> (u64, Arc<ConnectionShared>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let shared = ConnectionShared::new();
        self.connections.lock().unwrap().push((id, Arc::clone(&shared)));
        (id, shared)
    }

    /// Removes a connection from the fan-out registry. A no-op if already removed.
    pub fn unregister(&self, id: u64) {
        self.connections.lock().unwrap().retain(|(existing, _)| *existing != id);
    }

    /// Marks `rect` dirty on every live connection.
    pub fn mark_damage(&self, rect: Rect) {
        for (_, shared) in self.connections.lock().unwrap().iter() {
            shared.damage.mark(rect);
        }
    }

    /// Atomically swaps in a new surface, marks every connection's full-surface damage, and
    /// raises `pending_size_change` on each so the next update can lead with a DesktopSize
    /// pseudo-rectangle where the client supports it.
    pub fn change_surface(&self, descriptor: SurfaceDescriptor) {
        let bounds = descriptor.bounds();
        self.state.lock().unwrap().descriptor = descriptor;
        for (_, shared) in self.connections.lock().unwrap().iter() {
            shared.damage.mark_all(bounds);
            shared.pending_size_change.store(true, Ordering::Relaxed);
        }
    }

    /// Updates the desktop name and raises `pending_name_change` on every connection. Does not
    /// force any pixel damage.
    pub fn change_name(&self, name: String) {
        self.state.lock().unwrap().name = name;
        for (_, shared) in self.connections.lock().unwrap().iter() {
            shared.pending_name_change.store(true, Ordering::Relaxed);
        }
    }

    /// Returns the current surface descriptor and desktop name. Reading pixel bytes through the
    /// returned descriptor still requires holding `surface_lock`.
    #[must_use]
    pub fn snapshot(&self) -> (SurfaceDescriptor, String) {
        let state = self.state.lock().unwrap();
        (state.descriptor, state.name.clone())
    }
}
