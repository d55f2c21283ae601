//! In-band control protocol: `POST /stopproxy` asks a running proxy to exit.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

/// Prefix that identifies a stop command.
const STOP_PREFIX: &[u8] = b"POST /stopproxy";

/// Exact bytes sent by [`send_stop`].
pub const STOP_REQUEST: &[u8] = b"POST /stopproxy HTTP/1.1\r\n\r\n";

/// Reply to a stop command that persistent mode refuses.
pub const STOP_ACK: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n";

/// Connect budget for [`send_stop`].
pub const STOP_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// What the loop does with a stop command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    /// Close the sender and leave the serving loop.
    Stop,
    /// Reply with [`STOP_ACK`] and keep serving.
    Acknowledge,
}

pub fn is_stop_command(raw: &[u8]) -> bool {
    raw.starts_with(STOP_PREFIX)
}

/// Persistent mode never stops on request.
pub fn on_stop_command(persistent: bool) -> ControlAction {
    if persistent {
        ControlAction::Acknowledge
    } else {
        ControlAction::Stop
    }
}

/// Ask the proxy listening on `addr` to stop. Fire-and-forget: failures are only logged.
pub async fn send_stop(addr: SocketAddr) {
    let result = async {
        let mut stream = tokio::time::timeout(STOP_CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))??;
        stream.write_all(STOP_REQUEST).await?;
        stream.shutdown().await
    }
    .await;
    match result {
        Ok(()) => tracing::info!(%addr, "stop command sent"),
        Err(e) => tracing::info!(%addr, error = %e, "failed to stop proxy"),
    }
}
