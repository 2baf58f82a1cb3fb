//! Small shared helpers.

use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

/// Budget for the pre-flight port checks.
const PORT_CHECK_TIMEOUT: Duration = Duration::from_secs(1);

/// Whether `host:port` can still be bound by this process.
pub async fn port_available(host: &str, port: u16) -> bool {
    match timeout(PORT_CHECK_TIMEOUT, TcpListener::bind((host, port))).await {
        Ok(Ok(listener)) => {
            drop(listener);
            true
        }
        _ => false,
    }
}

/// Whether something is accepting connections on `host:port`.
pub async fn port_responding(host: &str, port: u16) -> bool {
    matches!(
        timeout(PORT_CHECK_TIMEOUT, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

/// Human-readable byte count for CLI output.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
