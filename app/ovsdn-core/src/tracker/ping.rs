use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use nix::errno::Errno;
use tokio::net::TcpStream;

/// TCP "discard" service. Nothing is expected to listen on it; the point is
/// the shape of the failure, not the connection.
const DISCARD_PORT: u16 = 9;

/// Probes whether a node is reachable by attempting a TCP connection to its
/// discard port. A timeout or "no route to host" means the node is offline;
/// any other outcome (including connection refused) means something answered
/// and the node is up.
pub async fn ping_node(target: Ipv4Addr, probe_timeout: Duration) -> bool {
    let address = SocketAddr::from((target, DISCARD_PORT));
    match tokio::time::timeout(probe_timeout, TcpStream::connect(address)).await {
        Err(_) => false,
        Ok(Ok(_)) => true,
        Ok(Err(error)) => error.raw_os_error() != Some(Errno::EHOSTUNREACH as i32),
    }
}
