//! Headless VNC server example with animated content.
//!
//! This example creates a VNC server that continuously updates the framebuffer with animated
//! content, demonstrating how to use the server without any real screen capture.
//!
//! Usage:
//!   cargo run --example headless_server

use std::error::Error;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use rustvncserver::{Rect, ServerOptions, SurfaceDescriptor, VncServer};

const WIDTH: u16 = 640;
const HEIGHT: u16 = 480;

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    println!("Starting headless VNC server on port 5900...");
    println!("Connect with: vncviewer localhost:5900");

    let pixels = Arc::new(Mutex::new(vec![0u8; usize::from(WIDTH) * usize::from(HEIGHT) * 4]));
    let surface_lock: Arc<Mutex<()>> = Arc::new(Mutex::new(()));

    let base_address = pixels.lock().unwrap().as_ptr();
    // SAFETY: `pixels` is never reallocated (we only ever write through the existing Vec in
    // place below) and is held alive for the program's whole lifetime via the `Arc`. Every write
    // to it happens while `surface_lock` is held, matching what we hand the server.
    let surface = unsafe { SurfaceDescriptor::new(WIDTH, HEIGHT, usize::from(WIDTH) * 4, base_address) };

    let server = Arc::new(VncServer::new(
        surface,
        Arc::clone(&surface_lock),
        ServerOptions { port: 5900, ..ServerOptions::default() },
    )?);

    server.daemonise()?;
    println!("Server started, generating animated content...");
    println!("Press Ctrl+C to stop");

    let mut frame = 0u32;
    loop {
        {
            let _guard = surface_lock.lock().unwrap();
            let mut pixels = pixels.lock().unwrap();
            for y in 0..usize::from(HEIGHT) {
                for x in 0..usize::from(WIDTH) {
                    let r = ((x as u32 + frame) % 256) as u32;
                    let g = ((y as u32 + frame) % 256) as u32;
                    let b = (frame / 2) % 256;
                    let argb = (0xFFu32 << 24) | (r << 16) | (g << 8) | b;
                    let offset = (y * usize::from(WIDTH) + x) * 4;
                    pixels[offset..offset + 4].copy_from_slice(&argb.to_ne_bytes());
                }
            }
        }
        server.mark_damage(Rect::new(0, 0, WIDTH, HEIGHT));

        frame = frame.wrapping_add(1);
        thread::sleep(Duration::from_millis(33)); // ~30 FPS

        if frame % 300 == 0 {
            println!("Frame: {frame}");
        }
    }
}
