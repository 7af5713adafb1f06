//! framewire: length-prefixed TCP transport tools
//!
//! - `serve`: echo server answering every frame with the same payload
//! - `ping`: client sending payloads to an echo server and timing the replies
//!
//! Configuration via CLI arguments or TOML file.

use framewire::config::{Config, Mode};
use framewire::{Client, Event, Server};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Sleep between polls while the event queue is empty.
const IDLE_WAIT: Duration = Duration::from_millis(1);

/// How long `ping` waits for the connection and for each reply.
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        mode = ?config.mode,
        port = config.port,
        chunk_size = config.transport.chunk_size,
        chunk_count = config.transport.chunk_count,
        max_frame_size = config.transport.max_frame_size,
        "Starting framewire"
    );

    match config.mode {
        Mode::Serve => run_server(config),
        Mode::Ping { count, size } => run_ping(config, count, size),
    }
}

/// Echo every received frame back to its sender
fn run_server(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let mut server = Server::new(config.transport)?;
    server.start(config.port)?;

    loop {
        let Some(event) = server.poll_event() else {
            std::thread::sleep(IDLE_WAIT);
            continue;
        };

        match event {
            Event::Connected { id } => {
                info!(conn_id = %id, peer = ?server.remote_address(id), "Client connected");
            }
            Event::Data { id, payload } => {
                debug!(conn_id = %id, len = payload.len(), "Echoing");
                if !server.send(id, &payload) {
                    warn!(conn_id = %id, "Echo refused");
                }
            }
            Event::Disconnected { id } => {
                info!(conn_id = %id, "Client disconnected");
            }
        }
    }
}

/// Send `count` payloads of `size` bytes and verify each echo
fn run_ping(config: Config, count: usize, size: usize) -> Result<(), Box<dyn std::error::Error>> {
    let client = Client::new(config.transport)?;
    client.connect(&config.host, config.port)?;

    match wait_event(&client)? {
        Event::Connected { .. } => info!(host = %config.host, port = config.port, "Connected"),
        _ => return Err(format!("could not connect to {}:{}", config.host, config.port).into()),
    }

    let mut total = Duration::ZERO;
    for seq in 0..count {
        let payload: Vec<u8> = (0..size.max(1)).map(|i| (seq + i) as u8).collect();

        let start = Instant::now();
        if let Err(e) = client.try_send(&payload) {
            return Err(format!("send {} failed: {}", seq, e).into());
        }

        match wait_event(&client)? {
            Event::Data { payload: echo, .. } if echo == payload => {
                let rtt = start.elapsed();
                total += rtt;
                info!(seq, bytes = payload.len(), rtt_us = rtt.as_micros() as u64, "Reply");
            }
            Event::Data { .. } => return Err(format!("reply {} does not match", seq).into()),
            _ => return Err("connection closed".into()),
        }
    }

    if count > 0 {
        info!(
            count,
            avg_rtt_us = (total / count as u32).as_micros() as u64,
            "Done"
        );
    }
    client.disconnect();
    Ok(())
}

fn wait_event(client: &Client) -> Result<Event, Box<dyn std::error::Error>> {
    let deadline = Instant::now() + REPLY_TIMEOUT;
    while Instant::now() < deadline {
        if let Some(event) = client.poll_event() {
            return Ok(event);
        }
        std::thread::sleep(IDLE_WAIT);
    }
    Err("timed out waiting for the server".into())
}
