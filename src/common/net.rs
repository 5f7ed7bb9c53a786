//! Network utilities

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};

/// Per-attempt connect timeout used by the port probes
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Loopback socket address for a local port
#[inline]
pub fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}

/// Check whether something accepts TCP connections on the loopback port
pub async fn is_port_open(port: u16) -> bool {
    matches!(
        timeout(CONNECT_TIMEOUT, TcpStream::connect(loopback(port))).await,
        Ok(Ok(_))
    )
}

/// Poll until the loopback port is released or the deadline passes
pub async fn wait_port_free(port: u16, limit: Duration, poll: Duration) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        if !is_port_open(port).await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(poll).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_loopback_addr() {
        assert_eq!(loopback(7890).to_string(), "127.0.0.1:7890");
    }

    #[tokio::test]
    async fn test_wait_for_open_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(is_port_open(port).await);
        assert!(!wait_port_free(port, Duration::from_millis(200), Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn test_wait_for_closed_port() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        assert!(!is_port_open(port).await);
        assert!(wait_port_free(port, Duration::from_secs(1), Duration::from_millis(50)).await);
    }
}
