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

//! Server lifecycle (C7): options validation, the accept loop, and the three ways to run it.

use std::collections::HashMap;
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::connection::{self, AuthConfig, Connection, ConnectionContext};
use crate::error::{Result, VncError};
use crate::events::{EventQueue, InputEvent, DEFAULT_EVENT_QUEUE_CAPACITY};
use crate::protocol::{PROTOCOL_VERSION, PROTOCOL_VERSION_3_3};
use crate::surface::{FramebufferHub, SurfaceDescriptor, SurfaceLock};

/// How often the accept loop wakes to re-check the shutdown flag while waiting for a
/// connection.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long [`VncServer::stop`] waits for each thread to join before giving up on it.
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Construction-time configuration for a [`VncServer`]. Immutable once the server is built;
/// `desktop_name` is changed later only via [`VncServer::change_name`].
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Address to bind the listening socket to.
    pub host: String,
    /// Port to bind the listening socket to.
    pub port: u16,
    /// Full-access password. `None` disables VNCAuth for full access.
    pub password: Option<String>,
    /// Read-only password, checked after `password`.
    pub read_only_password: Option<String>,
    /// Forces every connection read-only, regardless of which password matched.
    pub read_only: bool,
    /// Maximum number of simultaneously connected clients.
    pub max_clients: usize,
    /// Initial desktop name sent in `ServerInit`.
    pub desktop_name: String,
    /// Highest protocol version to advertise: `"RFB 003.008\n"` or `"RFB 003.003\n"`.
    pub protocol_version_max: String,
    /// Capacity of the bounded input event queue.
    pub event_queue_capacity: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5900,
            password: None,
            read_only_password: None,
            read_only: false,
            max_clients: 16,
            desktop_name: "rustvncserver".to_string(),
            protocol_version_max: PROTOCOL_VERSION.to_string(),
            event_queue_capacity: DEFAULT_EVENT_QUEUE_CAPACITY,
        }
    }
}

impl ServerOptions {
    /// Validates the options, returning a [`VncError::ConfigurationError`] describing the first
    /// problem found.
    fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(VncError::ConfigurationError("host must not be empty".to_string()));
        }
        if self.max_clients == 0 {
            return Err(VncError::ConfigurationError("max_clients must be at least 1".to_string()));
        }
        if self.event_queue_capacity == 0 {
            return Err(VncError::ConfigurationError("event_queue_capacity must be at least 1".to_string()));
        }
        if self.protocol_version_max != PROTOCOL_VERSION && self.protocol_version_max != PROTOCOL_VERSION_3_3 {
            return Err(VncError::ConfigurationError(format!(
                "unsupported protocol_version_max {:?}",
                self.protocol_version_max
            )));
        }
        Ok(())
    }
}

/// A running (or not-yet-started) VNC server: one listening socket, zero or more connection
/// threads, and the shared hub/event queue/surface lock they all talk through.
pub struct VncServer {
    options: ServerOptions,
    hub: Arc<FramebufferHub>,
    surface_lock: Arc<SurfaceLock>,
    auth: Arc<AuthConfig>,
    protocol_version: Arc<str>,
    events: Arc<EventQueue>,
    shutdown: Arc<AtomicBool>,
    listener: Mutex<Option<TcpListener>>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
    connection_threads: Arc<Mutex<Vec<JoinHandle<()>>>>,
    live_sockets: Arc<Mutex<HashMap<u64, TcpStream>>>,
    active_count: Arc<AtomicUsize>,
    next_conn_id: AtomicU64,
}

impl VncServer {
    /// Builds a server over the animator's initial surface. Fails with
    /// [`VncError::ConfigurationError`] if `options` is invalid; no socket is touched yet.
    ///
    /// # Safety
    ///
    /// See [`SurfaceDescriptor::new`]: `surface` must stay valid, under `surface_lock`, for as
    /// long as the server runs, until a `change_surface` call supersedes it.
    pub fn new(surface: SurfaceDescriptor, surface_lock: Arc<SurfaceLock>, options: ServerOptions) -> Result<Self> {
        options.validate()?;
        let auth = Arc::new(AuthConfig {
            password: options.password.clone(),
            read_only_password: options.read_only_password.clone(),
            force_read_only: options.read_only,
        });
        let protocol_version: Arc<str> = Arc::from(options.protocol_version_max.as_str());
        Ok(Self {
            hub: Arc::new(FramebufferHub::new(surface, options.desktop_name.clone())),
            surface_lock,
            auth,
            protocol_version,
            events: Arc::new(EventQueue::new(options.event_queue_capacity)),
            shutdown: Arc::new(AtomicBool::new(false)),
            listener: Mutex::new(None),
            accept_thread: Mutex::new(None),
            connection_threads: Arc::new(Mutex::new(Vec::new())),
            live_sockets: Arc::new(Mutex::new(HashMap::new())),
            active_count: Arc::new(AtomicUsize::new(0)),
            next_conn_id: AtomicU64::new(0),
            options,
        })
    }

    /// Replaces the surface the hub serves. See [`FramebufferHub::change_surface`].
    ///
    /// # Safety
    ///
    /// Same contract as [`SurfaceDescriptor::new`].
    pub fn change_surface(&self, surface: SurfaceDescriptor) {
        self.hub.change_surface(surface);
    }

    /// Updates the desktop name announced to clients supporting the DesktopName pseudo-encoding.
    pub fn change_name(&self, name: impl Into<String>) {
        self.hub.change_name(name.into());
    }

    /// Marks `rect` dirty on every connection, without replacing the surface descriptor itself.
    /// The animator calls this after drawing into the same pixel memory in place (under
    /// `surface_lock`); use [`Self::change_surface`] only when the descriptor itself changes
    /// (a resize, or a swap to a different buffer).
    pub fn mark_damage(&self, rect: crate::damage::Rect) {
        self.hub.mark_damage(rect);
    }

    /// Pops the next input event, blocking up to `timeout`. `None` on timeout.
    #[must_use]
    pub fn get_event(&self, timeout: Duration) -> Option<InputEvent> {
        self.events.get_event(timeout)
    }

    fn bind(&self) -> Result<TcpListener> {
        TcpListener::bind((self.options.host.as_str(), self.options.port)).map_err(VncError::Io)
    }

    /// Runs the accept loop on the calling thread until [`Self::stop`] is called from another
    /// thread.
    pub fn serve_forever(&self) -> Result<()> {
        let listener = self.bind()?;
        *self.listener.lock().unwrap() = listener.try_clone().ok();
        self.accept_loop(listener);
        Ok(())
    }

    /// Spawns a background thread running the accept loop and returns immediately.
    pub fn daemonise(&self) -> Result<()> {
        let listener = self.bind()?;
        *self.listener.lock().unwrap() = listener.try_clone().ok();
        let shutdown = Arc::clone(&self.shutdown);
        let hub = Arc::clone(&self.hub);
        let surface_lock = Arc::clone(&self.surface_lock);
        let auth = Arc::clone(&self.auth);
        let protocol_version = Arc::clone(&self.protocol_version);
        let events = self.events.sender();
        let live_sockets = Arc::clone(&self.live_sockets);
        let active_count = Arc::clone(&self.active_count);
        let connection_threads = Arc::clone(&self.connection_threads);
        let max_clients = self.options.max_clients;

        let handle = thread::spawn(move || {
            accept_loop_body(
                listener,
                shutdown,
                hub,
                surface_lock,
                auth,
                protocol_version,
                events,
                live_sockets,
                active_count,
                max_clients,
                connection_threads,
            );
        });
        *self.accept_thread.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Binds a non-blocking listener for use with [`Self::poll`], without spawning any thread.
    pub fn start(&self) -> Result<()> {
        let listener = self.bind()?;
        listener.set_nonblocking(true).map_err(VncError::Io)?;
        *self.listener.lock().unwrap() = Some(listener);
        Ok(())
    }

    /// Accepts at most one pending connection, waiting up to `timeout`. Returns `true` if a
    /// connection was accepted. Requires [`Self::start`] to have been called first.
    pub fn poll(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return Ok(false);
            }
            let accepted = {
                let guard = self.listener.lock().unwrap();
                let Some(listener) = guard.as_ref() else {
                    return Err(VncError::ConfigurationError("poll called before start".to_string()));
                };
                listener.accept()
            };
            match accepted {
                Ok((stream, _addr)) => {
                    self.spawn_connection(stream);
                    return Ok(true);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Ok(false);
                    }
                    thread::sleep(ACCEPT_POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now())));
                }
                Err(e) => return Err(VncError::Io(e)),
            }
        }
    }

    fn accept_loop(&self, listener: TcpListener) {
        let events = self.events.sender();
        accept_loop_body(
            listener,
            Arc::clone(&self.shutdown),
            Arc::clone(&self.hub),
            Arc::clone(&self.surface_lock),
            Arc::clone(&self.auth),
            Arc::clone(&self.protocol_version),
            events,
            Arc::clone(&self.live_sockets),
            Arc::clone(&self.active_count),
            self.options.max_clients,
            Arc::clone(&self.connection_threads),
        );
    }

    fn spawn_connection(&self, stream: TcpStream) {
        spawn_connection_thread(
            stream,
            Arc::clone(&self.hub),
            Arc::clone(&self.surface_lock),
            Arc::clone(&self.auth),
            Arc::clone(&self.protocol_version),
            self.events.sender(),
            Arc::clone(&self.live_sockets),
            Arc::clone(&self.active_count),
            self.options.max_clients,
            &self.next_conn_id,
            Arc::clone(&self.connection_threads),
        );
    }

    /// Stops the server: idempotent. Marks shutdown, closes every live connection socket so
    /// blocked reads unwind, then joins the accept thread (if any) and every connection thread.
    pub fn stop(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.listener.lock().unwrap() = None;
        for (_, stream) in self.live_sockets.lock().unwrap().drain() {
            stream.shutdown(Shutdown::Both).ok();
        }
        if let Some(handle) = self.accept_thread.lock().unwrap().take() {
            join_with_timeout(handle, "accept thread");
        }
        loop {
            let next = self.connection_threads.lock().unwrap().pop();
            let Some(handle) = next else { break };
            join_with_timeout(handle, "connection thread");
        }
    }
}

impl Drop for VncServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn join_with_timeout(handle: JoinHandle<()>, label: &str) {
    // `JoinHandle::join` has no timeout in std; every thread we join here is expected to unwind
    // promptly once its socket is shut down, so we just join directly and log slow ones after
    // the fact rather than leaking the handle.
    let start = Instant::now();
    if handle.join().is_err() {
        warn!("vnc: {label} panicked");
    } else if start.elapsed() > STOP_JOIN_TIMEOUT {
        warn!("vnc: {label} took {:?} to join during stop", start.elapsed());
    }
}

#[allow(clippy::too_many_arguments)]
fn accept_loop_body(
    listener: TcpListener,
    shutdown: Arc<AtomicBool>,
    hub: Arc<FramebufferHub>,
    surface_lock: Arc<SurfaceLock>,
    auth: Arc<AuthConfig>,
    protocol_version: Arc<str>,
    events: crate::events::EventSender,
    live_sockets: Arc<Mutex<HashMap<u64, TcpStream>>>,
    active_count: Arc<AtomicUsize>,
    max_clients: usize,
    connection_threads: Arc<Mutex<Vec<JoinHandle<()>>>>,
) {
    listener.set_nonblocking(true).ok();
    let next_conn_id = AtomicU64::new(0);
    while !shutdown.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, addr)) => {
                info!("vnc: accepted connection from {addr}");
                spawn_connection_thread(
                    stream,
                    Arc::clone(&hub),
                    Arc::clone(&surface_lock),
                    Arc::clone(&auth),
                    Arc::clone(&protocol_version),
                    events.clone(),
                    Arc::clone(&live_sockets),
                    Arc::clone(&active_count),
                    max_clients,
                    &next_conn_id,
                    Arc::clone(&connection_threads),
                );
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(e) => {
                warn!("vnc: accept failed: {e}");
                break;
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_connection_thread(
    stream: TcpStream,
    hub: Arc<FramebufferHub>,
    surface_lock: Arc<SurfaceLock>,
    auth: Arc<AuthConfig>,
    protocol_version: Arc<str>,
    events: crate::events::EventSender,
    live_sockets: Arc<Mutex<HashMap<u64, TcpStream>>>,
    active_count: Arc<AtomicUsize>,
    max_clients: usize,
    next_conn_id: &AtomicU64,
    connection_threads: Arc<Mutex<Vec<JoinHandle<()>>>>,
) {
    let id = next_conn_id.fetch_add(1, Ordering::Relaxed);
    if let Ok(registry_handle) = stream.try_clone() {
        live_sockets.lock().unwrap().insert(id, registry_handle);
    }

    if active_count.load(Ordering::SeqCst) >= max_clients {
        warn!("vnc: rejecting connection: max_clients ({max_clients}) reached");
        let live_sockets2 = Arc::clone(&live_sockets);
        let handle = thread::spawn(move || {
            connection::reject_resource_limit(stream).ok();
            live_sockets2.lock().unwrap().remove(&id);
        });
        connection_threads.lock().unwrap().push(handle);
        return;
    }

    active_count.fetch_add(1, Ordering::SeqCst);
    let ctx = ConnectionContext { hub, surface_lock, events, auth, protocol_version };
    let live_sockets2 = Arc::clone(&live_sockets);
    let active_count2 = Arc::clone(&active_count);
    let handle = thread::spawn(move || {
        if let Err(e) = Connection::run(stream, ctx) {
            if !e.is_connection_closed() {
                warn!("vnc: connection ended with error: {e}");
            }
        }
        live_sockets2.lock().unwrap().remove(&id);
        active_count2.fetch_sub(1, Ordering::SeqCst);
    });
    connection_threads.lock().unwrap().push(handle);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor_over(buf: &[u8], width: u16, height: u16) -> SurfaceDescriptor {
        let stride = usize::from(width) * 4;
        unsafe { SurfaceDescriptor::new(width, height, stride, buf.as_ptr()) }
    }

    #[test]
    fn rejects_empty_host() {
        let options = ServerOptions { host: String::new(), ..ServerOptions::default() };
        assert!(options.validate().is_err());
    }

    #[test]
    fn rejects_zero_max_clients() {
        let options = ServerOptions { max_clients: 0, ..ServerOptions::default() };
        assert!(options.validate().is_err());
    }

    #[test]
    fn rejects_unsupported_protocol_version() {
        let options = ServerOptions { protocol_version_max: "RFB 003.999\n".to_string(), ..ServerOptions::default() };
        assert!(options.validate().is_err());
    }

    #[test]
    fn new_surfaces_configuration_errors_without_binding_a_socket() {
        let buf = vec![0u8; 4 * 4 * 4];
        let surface = descriptor_over(&buf, 4, 4);
        let lock = Arc::new(Mutex::new(()));
        let options = ServerOptions { max_clients: 0, ..ServerOptions::default() };
        let err = VncServer::new(surface, lock, options).unwrap_err();
        assert!(matches!(err, VncError::ConfigurationError(_)));
    }

    #[test]
    fn stop_is_idempotent_even_if_never_started() {
        let buf = vec![0u8; 4 * 4 * 4];
        let surface = descriptor_over(&buf, 4, 4);
        let lock = Arc::new(Mutex::new(()));
        let server = VncServer::new(surface, lock, ServerOptions { port: 0, ..ServerOptions::default() }).unwrap();
        server.stop();
        server.stop();
    }
}
