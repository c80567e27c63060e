//! Listening socket sandboxes connect back to
//!
//! Every accepted connection must open with a handshake frame. The decoded
//! handshake and the framed connection are handed to the controller, which
//! correlates them with a pending spawn.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::SandboxError;
use crate::protocol::{decode_json, FrameReader, FrameWriter, Handshake, SANDBOX_DELIMITER};

use super::SandboxConnection;

/// Receives every handshaken connection
pub type ConnectionSink = Arc<dyn Fn(Handshake, SandboxConnection) + Send + Sync>;

pub struct EnvironmentsServer {
    local_addr: SocketAddr,
    accept_handle: JoinHandle<()>,
}

impl EnvironmentsServer {
    /// Bind the listener and start accepting. Port 0 picks an ephemeral port.
    pub async fn bind(host: &str, port: u16, sink: ConnectionSink) -> Result<Self, SandboxError> {
        let listener = TcpListener::bind((host, port)).await?;
        let local_addr = listener.local_addr()?;
        info!("Environments server listening on {}", local_addr);

        let accept_handle = tokio::spawn(accept_loop(listener, sink));
        Ok(Self {
            local_addr,
            accept_handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }
}

impl Drop for EnvironmentsServer {
    fn drop(&mut self) {
        self.accept_handle.abort();
    }
}

async fn accept_loop(listener: TcpListener, sink: ConnectionSink) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!("Sandbox connection from {}", peer);
                tokio::spawn(read_handshake(stream, sink.clone()));
            }
            Err(e) => {
                warn!("Environments server accept failed: {}", e);
            }
        }
    }
}

async fn read_handshake(stream: TcpStream, sink: ConnectionSink) {
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half, SANDBOX_DELIMITER);

    let frame = match reader.read_frame().await {
        Ok(Some(frame)) => frame,
        Ok(None) => {
            warn!("Sandbox connection closed before handshake");
            return;
        }
        Err(e) => {
            warn!("Failed to read sandbox handshake: {}", e);
            return;
        }
    };

    let handshake: Handshake = match decode_json(&frame) {
        Ok(handshake) => handshake,
        Err(e) => {
            warn!("Malformed sandbox handshake, dropping connection: {}", e);
            return;
        }
    };

    let writer = FrameWriter::new(write_half, SANDBOX_DELIMITER);
    sink(handshake, SandboxConnection::from_parts(reader, writer));
}
