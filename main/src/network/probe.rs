use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use mockall::automock;
use std::net::SocketAddrV4;
use std::time::Duration;
use tokio::net::TcpStream;

/// How long a reachability probe waits for a TCP handshake.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Checks whether a TCP port accepts connections.
#[automock]
pub trait PortProbe {
    fn is_reachable(&self, address: SocketAddrV4, timeout: Duration) -> BoxFuture<'static, bool>;
}

pub struct TcpPortProbe;

impl TcpPortProbe {
    async fn probe(address: SocketAddrV4, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
            Ok(Ok(_)) => {
                log::debug!("Port {} is reachable", address);
                true
            }
            Ok(Err(e)) => {
                log::debug!("Port {} is unreachable: {}", address, e);
                false
            }
            Err(_) => {
                log::debug!("Port {} did not answer within {:?}", address, timeout);
                false
            }
        }
    }
}

impl PortProbe for TcpPortProbe {
    fn is_reachable(&self, address: SocketAddrV4, timeout: Duration) -> BoxFuture<'static, bool> {
        Self::probe(address, timeout).boxed()
    }
}
