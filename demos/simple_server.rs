//! Simple VNC server example.
//!
//! This example creates a VNC server over a static test pattern.
//!
//! Usage:
//!   cargo run --example simple_server
//!
//! Then connect with a VNC viewer to localhost:5900

use std::error::Error;
use std::sync::{Arc, Mutex};

use rustvncserver::{ServerOptions, SurfaceDescriptor, VncServer};

const WIDTH: u16 = 800;
const HEIGHT: u16 = 600;

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    println!("Starting VNC server on port 5900...");
    println!("Connect with: vncviewer localhost:5900");
    println!("Password: test123");

    // Native ARGB32 gradient test pattern.
    let mut pixels = vec![0u8; usize::from(WIDTH) * usize::from(HEIGHT) * 4];
    for y in 0..usize::from(HEIGHT) {
        for x in 0..usize::from(WIDTH) {
            let r = (x * 255 / usize::from(WIDTH)) as u32;
            let g = (y * 255 / usize::from(HEIGHT)) as u32;
            let b = 128u32;
            let argb = (0xFFu32 << 24) | (r << 16) | (g << 8) | b;
            let offset = (y * usize::from(WIDTH) + x) * 4;
            pixels[offset..offset + 4].copy_from_slice(&argb.to_ne_bytes());
        }
    }

    let surface_lock = Arc::new(Mutex::new(()));
    // SAFETY: `pixels` outlives the server (it's held in this function's scope for the whole
    // run), and nothing else mutates it, so no lock contention is even possible here.
    let surface = unsafe {
        SurfaceDescriptor::new(WIDTH, HEIGHT, usize::from(WIDTH) * 4, pixels.as_ptr())
    };

    let server = VncServer::new(
        surface,
        Arc::clone(&surface_lock),
        ServerOptions {
            port: 5900,
            password: Some("test123".to_string()),
            desktop_name: "rustvncserver demo".to_string(),
            ..ServerOptions::default()
        },
    )?;

    println!("Server ready for connections");
    server.serve_forever()?;

    Ok(())
}
