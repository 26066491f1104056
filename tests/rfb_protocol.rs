//! End-to-end tests driving a [`VncServer`] over real loopback TCP, covering the handshake,
//! VNCAuth, pixel conversion, pointer click synthesis, surface resize, and event-queue
//! backpressure.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustvncserver::{ServerOptions, SurfaceDescriptor, SurfaceLock, VncServer};

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

fn surface_over(buf: &[u8], width: u16, height: u16) -> SurfaceDescriptor {
    let stride = usize::from(width) * 4;
    // SAFETY: `buf` outlives every server built over it in these tests.
    unsafe { SurfaceDescriptor::new(width, height, stride, buf.as_ptr()) }
}

fn connect(port: u16) -> TcpStream {
    let stream = TcpStream::connect(("127.0.0.1", port)).expect("connect");
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream
}

// --- tiny big-endian RFB wire helpers, independent of the crate's internal `wire` module ---

fn read_exact(stream: &mut TcpStream, buf: &mut [u8]) {
    stream.read_exact(buf).expect("read");
}

fn read_u8(stream: &mut TcpStream) -> u8 {
    let mut b = [0u8; 1];
    read_exact(stream, &mut b);
    b[0]
}

fn read_u16(stream: &mut TcpStream) -> u16 {
    let mut b = [0u8; 2];
    read_exact(stream, &mut b);
    u16::from_be_bytes(b)
}

fn read_u32(stream: &mut TcpStream) -> u32 {
    let mut b = [0u8; 4];
    read_exact(stream, &mut b);
    u32::from_be_bytes(b)
}

fn read_i32(stream: &mut TcpStream) -> i32 {
    read_u32(stream) as i32
}

fn read_string(stream: &mut TcpStream) -> String {
    let len = read_u32(stream) as usize;
    let mut buf = vec![0u8; len];
    read_exact(stream, &mut buf);
    String::from_utf8(buf).unwrap()
}

fn write_u8(stream: &mut TcpStream, v: u8) {
    stream.write_all(&[v]).unwrap();
}

fn write_u16(stream: &mut TcpStream, v: u16) {
    stream.write_all(&v.to_be_bytes()).unwrap();
}

struct ServerInitMsg {
    width: u16,
    height: u16,
    name: String,
}

/// Runs the version + security(None) + ClientInit/ServerInit handshake, returning `ServerInit`.
fn handshake_no_auth(stream: &mut TcpStream) -> ServerInitMsg {
    let mut version = [0u8; 12];
    read_exact(stream, &mut version);
    assert_eq!(&version, b"RFB 003.008\n");
    stream.write_all(&version).unwrap();

    let count = read_u8(stream);
    let mut types = vec![0u8; count as usize];
    read_exact(stream, &mut types);
    assert!(types.contains(&1), "server must offer security type None");
    write_u8(stream, 1); // select None

    let result = read_u32(stream);
    assert_eq!(result, 0, "SecurityResult must be OK");

    write_u8(stream, 1); // ClientInit: shared

    read_server_init(stream)
}

fn read_server_init(stream: &mut TcpStream) -> ServerInitMsg {
    let width = read_u16(stream);
    let height = read_u16(stream);
    let mut pixel_format = [0u8; 16];
    read_exact(stream, &mut pixel_format);
    let name = read_string(stream);
    ServerInitMsg { width, height, name }
}

fn write_bgr233_set_pixel_format(stream: &mut TcpStream) {
    write_u8(stream, 0); // SetPixelFormat
    stream.write_all(&[0u8; 3]).unwrap(); // padding
    write_u8(stream, 8); // bits_per_pixel
    write_u8(stream, 6); // depth
    write_u8(stream, 0); // big_endian_flag
    write_u8(stream, 1); // true_colour_flag
    write_u16(stream, 3); // red_max
    write_u16(stream, 3); // green_max
    write_u16(stream, 3); // blue_max
    write_u8(stream, 0); // red_shift
    write_u8(stream, 2); // green_shift
    write_u8(stream, 4); // blue_shift
    stream.write_all(&[0u8; 3]).unwrap(); // padding
}

fn write_framebuffer_update_request(stream: &mut TcpStream, incremental: u8, x: u16, y: u16, w: u16, h: u16) {
    write_u8(stream, 3); // FramebufferUpdateRequest
    write_u8(stream, incremental);
    write_u16(stream, x);
    write_u16(stream, y);
    write_u16(stream, w);
    write_u16(stream, h);
}

fn write_set_encodings(stream: &mut TcpStream, encodings: &[i32]) {
    write_u8(stream, 2); // SetEncodings
    write_u8(stream, 0); // padding
    write_u16(stream, encodings.len() as u16);
    for e in encodings {
        stream.write_all(&e.to_be_bytes()).unwrap();
    }
}

fn write_pointer_event(stream: &mut TcpStream, buttons: u8, x: u16, y: u16) {
    write_u8(stream, 5); // PointerEvent
    write_u8(stream, buttons);
    write_u16(stream, x);
    write_u16(stream, y);
}

struct RectHeader {
    x: u16,
    y: u16,
    w: u16,
    h: u16,
    encoding: i32,
}

fn read_framebuffer_update(stream: &mut TcpStream, bytes_per_pixel: usize) -> Vec<(RectHeader, Vec<u8>)> {
    let msg_type = read_u8(stream);
    assert_eq!(msg_type, 0, "expected FramebufferUpdate");
    read_u8(stream); // padding
    let count = read_u16(stream);
    let mut rects = Vec::new();
    for _ in 0..count {
        let header = RectHeader {
            x: read_u16(stream),
            y: read_u16(stream),
            w: read_u16(stream),
            h: read_u16(stream),
            encoding: read_i32(stream),
        };
        let payload = if header.encoding == 0 {
            let mut buf = vec![0u8; usize::from(header.w) * usize::from(header.h) * bytes_per_pixel];
            read_exact(stream, &mut buf);
            buf
        } else {
            Vec::new()
        };
        rects.push((header, payload));
    }
    rects
}

#[test]
fn handshake_no_auth_converts_red_and_green_to_bgr233() {
    // 2x1 ARGB32: red, then green.
    let mut buf = Vec::new();
    buf.extend_from_slice(&0xFFFF_0000u32.to_ne_bytes());
    buf.extend_from_slice(&0xFF00_FF00u32.to_ne_bytes());
    let surface = surface_over(&buf, 2, 1);
    let surface_lock: Arc<SurfaceLock> = Arc::new(Mutex::new(()));

    let port = free_port();
    let server = VncServer::new(
        surface,
        Arc::clone(&surface_lock),
        ServerOptions { port, desktop_name: "x".to_string(), ..ServerOptions::default() },
    )
    .unwrap();
    server.daemonise().unwrap();

    let mut client = connect(port);
    let init = handshake_no_auth(&mut client);
    assert_eq!(init.width, 2);
    assert_eq!(init.height, 1);
    assert_eq!(init.name, "x");

    write_bgr233_set_pixel_format(&mut client);
    write_framebuffer_update_request(&mut client, 0, 0, 0, 2, 1);

    let rects = read_framebuffer_update(&mut client, 1);
    assert_eq!(rects.len(), 1);
    let (header, payload) = &rects[0];
    assert_eq!((header.x, header.y, header.w, header.h, header.encoding), (0, 0, 2, 1, 0));
    assert_eq!(payload, &vec![0x03, 0x0C]);

    server.stop();
}

#[test]
fn vnc_auth_succeeds_with_the_correct_password() {
    let buf = vec![0u8; 4 * 4 * 4];
    let surface = surface_over(&buf, 4, 4);
    let surface_lock: Arc<SurfaceLock> = Arc::new(Mutex::new(()));

    let port = free_port();
    let server = VncServer::new(
        surface,
        Arc::clone(&surface_lock),
        ServerOptions { port, password: Some("pw".to_string()), ..ServerOptions::default() },
    )
    .unwrap();
    server.daemonise().unwrap();

    let mut client = connect(port);
    let mut version = [0u8; 12];
    read_exact(&mut client, &mut version);
    client.write_all(&version).unwrap();

    let count = read_u8(&mut client);
    let mut types = vec![0u8; count as usize];
    read_exact(&mut client, &mut types);
    assert!(types.contains(&2), "server must offer VNCAuth when a password is configured");
    write_u8(&mut client, 2); // select VNCAuth

    let mut challenge = [0u8; rustvncserver::auth::CHALLENGE_LEN];
    read_exact(&mut client, &mut challenge);
    let response = rustvncserver::auth::expected_response("pw", &challenge);
    client.write_all(&response).unwrap();

    let result = read_u32(&mut client);
    assert_eq!(result, 0, "SecurityResult must be OK for the correct password");

    server.stop();
}

#[test]
fn vnc_auth_read_only_password_suppresses_input_events() {
    let buf = vec![0u8; 4 * 4 * 4];
    let surface = surface_over(&buf, 4, 4);
    let surface_lock: Arc<SurfaceLock> = Arc::new(Mutex::new(()));

    let port = free_port();
    let server = VncServer::new(
        surface,
        Arc::clone(&surface_lock),
        ServerOptions {
            port,
            password: Some("abc".to_string()),
            read_only_password: Some("xyz".to_string()),
            ..ServerOptions::default()
        },
    )
    .unwrap();
    server.daemonise().unwrap();

    let mut client = connect(port);
    let mut version = [0u8; 12];
    read_exact(&mut client, &mut version);
    client.write_all(&version).unwrap();

    let count = read_u8(&mut client);
    let mut types = vec![0u8; count as usize];
    read_exact(&mut client, &mut types);
    write_u8(&mut client, 2); // select VNCAuth

    let mut challenge = [0u8; rustvncserver::auth::CHALLENGE_LEN];
    read_exact(&mut client, &mut challenge);
    let response = rustvncserver::auth::expected_response("xyz", &challenge);
    client.write_all(&response).unwrap();

    assert_eq!(read_u32(&mut client), 0);
    write_u8(&mut client, 1); // ClientInit
    read_server_init(&mut client);

    write_pointer_event(&mut client, 0x01, 10, 20);
    write_pointer_event(&mut client, 0x00, 10, 20);

    // Give the connection thread a moment to process both messages before asserting nothing
    // landed on the event queue.
    std::thread::sleep(Duration::from_millis(50));
    assert!(server.get_event(Duration::from_millis(50)).is_none());

    server.stop();
}

#[test]
fn pointer_events_synthesize_move_and_click_in_order() {
    let buf = vec![0u8; 4 * 4 * 4];
    let surface = surface_over(&buf, 4, 4);
    let surface_lock: Arc<SurfaceLock> = Arc::new(Mutex::new(()));

    let port = free_port();
    let server =
        VncServer::new(surface, Arc::clone(&surface_lock), ServerOptions { port, ..ServerOptions::default() })
            .unwrap();
    server.daemonise().unwrap();

    let mut client = connect(port);
    handshake_no_auth(&mut client);

    write_pointer_event(&mut client, 0x00, 10, 20);
    write_pointer_event(&mut client, 0x05, 10, 20);
    write_pointer_event(&mut client, 0x04, 11, 20);

    use rustvncserver::InputEvent;
    let timeout = Duration::from_millis(200);
    assert_eq!(server.get_event(timeout), Some(InputEvent::PointerMove { x: 10, y: 20, buttons: 0x00 }));
    assert_eq!(server.get_event(timeout), Some(InputEvent::PointerMove { x: 10, y: 20, buttons: 0x05 }));
    let click_a = server.get_event(timeout).unwrap();
    let click_b = server.get_event(timeout).unwrap();
    let mut clicks = vec![click_a, click_b];
    clicks.sort_by_key(|e| match e {
        InputEvent::PointerClick { button, .. } => *button,
        _ => panic!("expected PointerClick"),
    });
    assert_eq!(
        clicks,
        vec![
            InputEvent::PointerClick { x: 10, y: 20, button: 0, down: true },
            InputEvent::PointerClick { x: 10, y: 20, button: 2, down: true },
        ]
    );
    assert_eq!(server.get_event(timeout), Some(InputEvent::PointerMove { x: 11, y: 20, buttons: 0x04 }));
    assert_eq!(
        server.get_event(timeout),
        Some(InputEvent::PointerClick { x: 11, y: 20, button: 0, down: false })
    );

    server.stop();
}

#[test]
fn change_surface_sends_a_desktop_size_pseudo_rect_then_full_damage() {
    let buf = vec![0u8; 100 * 100 * 4];
    let surface = surface_over(&buf, 100, 100);
    let surface_lock: Arc<SurfaceLock> = Arc::new(Mutex::new(()));

    let port = free_port();
    let server =
        VncServer::new(surface, Arc::clone(&surface_lock), ServerOptions { port, ..ServerOptions::default() })
            .unwrap();
    server.daemonise().unwrap();

    let mut client = connect(port);
    handshake_no_auth(&mut client);
    write_set_encodings(&mut client, &[0, -223]); // Raw, DesktopSize

    let new_buf = vec![0u8; 50 * 80 * 4];
    {
        let _guard = surface_lock.lock().unwrap();
        server.change_surface(surface_over(&new_buf, 50, 80));
    }

    write_framebuffer_update_request(&mut client, 0, 0, 0, 50, 80);

    let msg_type = read_u8(&mut client);
    assert_eq!(msg_type, 0);
    read_u8(&mut client); // padding
    let rect_count = read_u16(&mut client);
    assert!(rect_count >= 1);

    let first = RectHeader {
        x: read_u16(&mut client),
        y: read_u16(&mut client),
        w: read_u16(&mut client),
        h: read_u16(&mut client),
        encoding: read_i32(&mut client),
    };
    assert_eq!((first.x, first.y, first.w, first.h, first.encoding), (0, 0, 50, 80, -223));

    // Remaining rectangles are Raw and carry the new surface's pixels; drain them so the socket
    // doesn't leave unread bytes behind.
    for _ in 1..rect_count {
        let header = RectHeader {
            x: read_u16(&mut client),
            y: read_u16(&mut client),
            w: read_u16(&mut client),
            h: read_u16(&mut client),
            encoding: read_i32(&mut client),
        };
        assert_eq!(header.encoding, 0);
        let mut payload = vec![0u8; usize::from(header.w) * usize::from(header.h) * 4];
        read_exact(&mut client, &mut payload);
    }

    server.stop();
}

#[test]
fn full_event_queue_blocks_the_connection_thread_until_drained() {
    let buf = vec![0u8; 4 * 4 * 4];
    let surface = surface_over(&buf, 4, 4);
    let surface_lock: Arc<SurfaceLock> = Arc::new(Mutex::new(()));

    let port = free_port();
    let server = VncServer::new(
        surface,
        Arc::clone(&surface_lock),
        ServerOptions { port, event_queue_capacity: 1, ..ServerOptions::default() },
    )
    .unwrap();
    server.daemonise().unwrap();

    let mut client = connect(port);
    handshake_no_auth(&mut client);

    // Fills the one-slot queue with a Move event.
    write_pointer_event(&mut client, 0x00, 1, 1);
    // This second message's Move event has nowhere to go: the connection thread blocks inside
    // `push` before it ever reads the FramebufferUpdateRequest written right after it.
    write_pointer_event(&mut client, 0x00, 2, 2);
    write_framebuffer_update_request(&mut client, 0, 0, 0, 4, 4);

    client.set_read_timeout(Some(Duration::from_millis(100))).unwrap();
    let mut probe = [0u8; 1];
    let result = client.read(&mut probe);
    assert!(
        matches!(result, Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut),
        "server must not have responded yet while its event queue is full"
    );

    assert!(server.get_event(Duration::from_millis(100)).is_some());
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let rects = read_framebuffer_update(&mut client, 4);
    assert!(!rects.is_empty());

    server.stop();
}
