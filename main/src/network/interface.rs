use socket2::Domain;
use socket2::Protocol;
use socket2::Socket;
use socket2::Type;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::SocketAddrV4;
use std::net::UdpSocket as StdUdpSocket;
use tokio::net::UdpSocket;

/// An IPv4 address assigned to a local network interface.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct NetworkInterface {
    pub name: String,
    pub address: Ipv4Addr,
}

impl NetworkInterface {
    pub fn new(name: impl Into<String>, address: Ipv4Addr) -> Self {
        Self {
            name: name.into(),
            address,
        }
    }
}

/// Lists every IPv4 address of every local network interface, loopback included.
///
/// An interface carrying several IPv4 addresses yields one entry per address.
pub fn ipv4_interfaces() -> std::io::Result<Vec<NetworkInterface>> {
    let interfaces: Vec<_> = get_if_addrs::get_if_addrs()?
        .into_iter()
        .filter_map(|i| match i.ip() {
            IpAddr::V4(address) => Some(NetworkInterface::new(i.name, address)),
            IpAddr::V6(_) => None,
        })
        .collect();
    log::debug!("Found IPv4 network interfaces: {:?}", interfaces);
    Ok(interfaces)
}

/// Opens a UDP socket on an ephemeral port of `interface`.
///
/// Multicast datagrams sent from the socket leave through the same interface.
pub async fn bind_discovery_socket(interface: &NetworkInterface) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    if let Err(e) = socket.set_multicast_if_v4(&interface.address) {
        log::warn!(
            "Failed to select {} ({}) as the multicast interface: {}",
            interface.name,
            interface.address,
            e
        );
    }
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddrV4::new(interface.address, 0).into())?;

    let socket: StdUdpSocket = socket.into();
    let socket = UdpSocket::from_std(socket)?;
    log::info!(
        "Discovery socket listening at {} on {}",
        socket.local_addr()?,
        interface.name
    );
    Ok(socket)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lists_loopback() -> anyhow::Result<()> {
        let interfaces = ipv4_interfaces()?;
        assert!(
            interfaces.iter().any(|i| i.address.is_loopback()),
            "Loopback should exist in all CI environments"
        );
        Ok(())
    }

    #[tokio::test]
    async fn bind_loopback() -> anyhow::Result<()> {
        crate::test::init();

        let interface = NetworkInterface::new("lo", Ipv4Addr::LOCALHOST);

        // When
        let socket = bind_discovery_socket(&interface).await?;

        // Then
        let local_address = socket.local_addr()?;
        assert_eq!(local_address.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_ne!(local_address.port(), 0);

        Ok(())
    }

    #[tokio::test]
    async fn bind_foreign_address() {
        crate::test::init();

        // TEST-NET-1 is never assigned to a local interface.
        let interface = NetworkInterface::new("bogus", Ipv4Addr::new(192, 0, 2, 1));

        assert!(bind_discovery_socket(&interface).await.is_err());
    }
}
