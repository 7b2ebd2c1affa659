use crate::network::interface::bind_discovery_socket;
use crate::network::interface::NetworkInterface;
use crate::ssdp::message::search_query;
use crate::ssdp::message::SsdpCodec;
use crate::ssdp::message::SsdpMessage;
use futures_channel::mpsc::UnboundedReceiver;
use futures_channel::mpsc::UnboundedSender;
use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::net::SocketAddrV4;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::udp::UdpFramed;

/// Multicast group and port SSDP queries are sent to.
pub const SSDP_MULTICAST_ADDRESS: SocketAddrV4 =
    SocketAddrV4::new(Ipv4Addr::new(239, 255, 255, 250), 1900);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryConfig {
    /// Destination of every search query.
    pub multicast_address: SocketAddrV4,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            multicast_address: SSDP_MULTICAST_ADDRESS,
        }
    }
}

/// Per-search overrides of [DiscoveryConfig].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchOptions {
    pub multicast_address: Option<SocketAddrV4>,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum EngineState {
    Binding,
    Ready,
    Closed,
}

#[derive(Debug)]
pub enum DiscoveryEvent {
    /// A socket was bound on `interface`.
    Listening {
        interface: NetworkInterface,
        local_address: SocketAddr,
    },

    /// A socket could not be bound on `interface`.
    BindError {
        interface: NetworkInterface,
        error: std::io::Error,
    },

    /// Every socket reached a bind outcome. Emitted once per engine.
    Ready,

    /// A device replied or announced itself.
    Device(DeviceFound),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFound {
    pub message: SsdpMessage,
    pub interface: NetworkInterface,
    pub local_address: SocketAddr,
    pub remote_address: SocketAddr,
}

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Discovery engine is not ready")]
    NotReady,

    #[error("Failed to enumerate network interfaces")]
    Interfaces(#[from] std::io::Error),
}

/// Counts bind outcomes down to readiness.
#[derive(Debug)]
pub struct ReadinessCountdown {
    remaining: usize,
    fired: bool,
}

impl ReadinessCountdown {
    pub fn new(sockets: usize) -> Self {
        Self {
            remaining: sockets,
            fired: false,
        }
    }

    /// Records a terminal bind outcome, successful or not.
    ///
    /// Returns `true` exactly once: when the last outstanding outcome is recorded.
    pub fn complete(&mut self) -> bool {
        self.remaining = self.remaining.saturating_sub(1);
        self.fire()
    }

    /// Returns `true` if nothing was ever outstanding and readiness has not fired yet.
    pub fn complete_if_empty(&mut self) -> bool {
        self.fire()
    }

    fn fire(&mut self) -> bool {
        if self.remaining == 0 && !self.fired {
            self.fired = true;
            true
        } else {
            false
        }
    }
}

struct DiscoverySocket {
    interface: NetworkInterface,
    socket: Arc<UdpSocket>,
    receiver: JoinHandle<()>,
}

/// Sends SSDP searches from every local IPv4 interface and reports every reply.
///
/// The engine goes from [EngineState::Binding] to [EngineState::Ready] once [DiscoveryEngine::start] has seen
/// every socket either bind or fail, and to [EngineState::Closed] on [DiscoveryEngine::close].
/// Events are delivered through the receiver returned on construction.
pub struct DiscoveryEngine {
    config: DiscoveryConfig,
    interfaces: Vec<NetworkInterface>,
    state: EngineState,
    sockets: Vec<DiscoverySocket>,
    events: UnboundedSender<DiscoveryEvent>,
}

impl DiscoveryEngine {
    /// Creates an engine covering every local IPv4 interface.
    pub fn new(
        config: DiscoveryConfig,
    ) -> Result<(Self, UnboundedReceiver<DiscoveryEvent>), DiscoveryError> {
        let interfaces = crate::network::interface::ipv4_interfaces()?;
        Ok(Self::with_interfaces(config, interfaces))
    }

    pub fn with_interfaces(
        config: DiscoveryConfig,
        interfaces: Vec<NetworkInterface>,
    ) -> (Self, UnboundedReceiver<DiscoveryEvent>) {
        let (events, event_receiver) = futures_channel::mpsc::unbounded();
        let engine = Self {
            config,
            interfaces,
            state: EngineState::Binding,
            sockets: Vec::default(),
            events,
        };
        (engine, event_receiver)
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == EngineState::Ready
    }

    /// Binds one socket per interface and waits for every bind to finish.
    ///
    /// Does nothing unless the engine is still binding.
    pub async fn start(&mut self) {
        if self.state != EngineState::Binding {
            return;
        }

        let mut countdown = ReadinessCountdown::new(self.interfaces.len());
        if countdown.complete_if_empty() {
            log::info!("No IPv4 network interface to discover devices on");
            self.become_ready();
            return;
        }

        let mut binds: FuturesUnordered<_> = self
            .interfaces
            .clone()
            .into_iter()
            .map(|interface| async move {
                let result = bind_discovery_socket(&interface).await;
                (interface, result)
            })
            .collect();
        while let Some((interface, result)) = binds.next().await {
            match result.and_then(|socket| Ok((socket.local_addr()?, socket))) {
                Ok((local_address, socket)) => {
                    self.emit(DiscoveryEvent::Listening {
                        interface: interface.clone(),
                        local_address,
                    });
                    let socket = Arc::new(socket);
                    let receiver =
                        self.spawn_receiver(interface.clone(), socket.clone(), local_address);
                    self.sockets.push(DiscoverySocket {
                        interface,
                        socket,
                        receiver,
                    });
                }
                Err(error) => {
                    log::warn!(
                        "Failed to bind a discovery socket on {} ({}): {}",
                        interface.name,
                        interface.address,
                        error
                    );
                    self.emit(DiscoveryEvent::BindError { interface, error });
                }
            }
            if countdown.complete() {
                self.become_ready();
            }
        }
    }

    /// Multicasts one search query from every bound socket.
    ///
    /// Sending is fire-and-forget: a failed send is logged and the remaining sockets still send.
    pub async fn search(
        &self,
        search_target: &str,
        options: SearchOptions,
    ) -> Result<(), DiscoveryError> {
        if !self.is_ready() {
            return Err(DiscoveryError::NotReady);
        }

        let destination = options
            .multicast_address
            .unwrap_or(self.config.multicast_address);
        let query = search_query(search_target, destination);
        for s in self.sockets.iter() {
            log::debug!(
                "Sending M-SEARCH for {} to {} from {}",
                search_target,
                destination,
                s.interface.name
            );
            if let Err(e) = s.socket.send_to(query.as_bytes(), destination).await {
                log::warn!(
                    "Failed to send M-SEARCH from {} ({}): {}",
                    s.interface.name,
                    s.interface.address,
                    e
                );
            }
        }
        Ok(())
    }

    /// Closes every socket and ends the event stream.
    pub fn close(&mut self) {
        if self.state == EngineState::Closed {
            return;
        }
        for s in self.sockets.drain(..) {
            s.receiver.abort();
        }
        self.events.close_channel();
        self.state = EngineState::Closed;
        log::debug!("Discovery engine closed");
    }

    fn become_ready(&mut self) {
        log::info!(
            "Discovery engine ready with {} socket(s) out of {} interface(s)",
            self.sockets.len(),
            self.interfaces.len()
        );
        self.state = EngineState::Ready;
        self.emit(DiscoveryEvent::Ready);
    }

    fn emit(&self, event: DiscoveryEvent) {
        if self.events.unbounded_send(event).is_err() {
            log::debug!("Discovery event dropped because no one is listening");
        }
    }

    fn spawn_receiver(
        &self,
        interface: NetworkInterface,
        socket: Arc<UdpSocket>,
        local_address: SocketAddr,
    ) -> JoinHandle<()> {
        let events = self.events.clone();
        let mut frames = UdpFramed::new(socket, SsdpCodec);
        tokio::spawn(async move {
            while let Some(frame) = frames.next().await {
                let (message, remote_address) = match frame {
                    Ok(inner) => inner,
                    Err(e) => {
                        log::warn!("Failed to receive on {}: {}", interface.name, e);
                        continue;
                    }
                };
                log::debug!("Device reply from {} on {}", remote_address, interface.name);
                let found = DeviceFound {
                    message,
                    interface: interface.clone(),
                    local_address,
                    remote_address,
                };
                if events.unbounded_send(DiscoveryEvent::Device(found)).is_err() {
                    break;
                }
            }
        })
    }
}

impl Drop for DiscoveryEngine {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn loopback() -> NetworkInterface {
        NetworkInterface::new("lo", Ipv4Addr::LOCALHOST)
    }

    async fn responder() -> anyhow::Result<(UdpSocket, SocketAddrV4)> {
        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        let SocketAddr::V4(address) = socket.local_addr()? else {
            anyhow::bail!("Must be IPv4");
        };
        Ok((socket, address))
    }

    async fn next_event(
        events: &mut UnboundedReceiver<DiscoveryEvent>,
    ) -> anyhow::Result<Option<DiscoveryEvent>> {
        Ok(tokio::time::timeout(TIMEOUT, events.next()).await?)
    }

    #[test]
    fn countdown_fires_once() {
        let mut countdown = ReadinessCountdown::new(3);

        let fired: Vec<_> = (0..5).map(|_| countdown.complete()).collect();

        assert_eq!(fired, vec![false, false, true, false, false]);
        assert!(!countdown.complete_if_empty());
    }

    #[test]
    fn countdown_empty() {
        let mut countdown = ReadinessCountdown::new(0);

        assert!(countdown.complete_if_empty());
        assert!(!countdown.complete_if_empty());
        assert!(!countdown.complete());
    }

    #[tokio::test]
    async fn search_before_ready() {
        crate::test::init();

        let (engine, _events) =
            DiscoveryEngine::with_interfaces(DiscoveryConfig::default(), vec![loopback()]);

        // When
        let e = engine
            .search("urn:foo", SearchOptions::default())
            .await
            .unwrap_err();

        // Then
        assert_eq!(engine.state(), EngineState::Binding);
        if let DiscoveryError::NotReady = e {
        } else {
            panic!("Searching while binding must fail");
        }
    }

    #[tokio::test]
    async fn ready_after_every_bind_outcome() -> anyhow::Result<()> {
        crate::test::init();

        let (_responder, responder_address) = responder().await?;
        let config = DiscoveryConfig {
            multicast_address: responder_address,
        };
        let interfaces = vec![
            loopback(),
            NetworkInterface::new("bogus", Ipv4Addr::new(192, 0, 2, 1)),
        ];
        let (mut engine, mut events) = DiscoveryEngine::with_interfaces(config, interfaces);

        // When
        engine.start().await;

        // Then
        let mut listening = 0;
        let mut errors = 0;
        for _ in 0..2 {
            match next_event(&mut events).await? {
                Some(DiscoveryEvent::Listening { .. }) => listening += 1,
                Some(DiscoveryEvent::BindError { .. }) => errors += 1,
                other => panic!("Unexpected event before readiness: {:?}", other),
            }
        }
        assert_eq!((listening, errors), (1, 1));
        assert!(matches!(
            next_event(&mut events).await?,
            Some(DiscoveryEvent::Ready)
        ));
        assert!(engine.is_ready());

        // Starting again must not fire readiness twice.
        engine.start().await;
        engine.close();
        assert!(next_event(&mut events).await?.is_none());

        Ok(())
    }

    #[tokio::test]
    async fn no_interface() -> anyhow::Result<()> {
        crate::test::init();

        let (mut engine, mut events) =
            DiscoveryEngine::with_interfaces(DiscoveryConfig::default(), vec![]);

        // When
        engine.start().await;

        // Then
        assert!(engine.is_ready());
        assert!(matches!(
            next_event(&mut events).await?,
            Some(DiscoveryEvent::Ready)
        ));
        engine.search("urn:foo", SearchOptions::default()).await?;
        Ok(())
    }

    #[tokio::test]
    async fn search_and_receive() -> anyhow::Result<()> {
        crate::test::init();

        let (responder, responder_address) = responder().await?;
        let config = DiscoveryConfig {
            multicast_address: responder_address,
        };
        let (mut engine, mut events) = DiscoveryEngine::with_interfaces(config, vec![loopback()]);
        engine.start().await;
        assert!(matches!(
            next_event(&mut events).await?,
            Some(DiscoveryEvent::Listening { .. })
        ));
        assert!(matches!(
            next_event(&mut events).await?,
            Some(DiscoveryEvent::Ready)
        ));

        // When
        engine
            .search(
                "urn:schemas-upnp-org:device:InternetGatewayDevice:1",
                SearchOptions::default(),
            )
            .await?;

        // Then
        let mut buffer = vec![0; 2048];
        let (size, engine_address) =
            tokio::time::timeout(TIMEOUT, responder.recv_from(&mut buffer)).await??;
        let query = String::from_utf8(buffer[..size].to_vec())?;
        assert!(query.starts_with("M-SEARCH * HTTP/1.1\r\n"));
        assert!(query.contains("ST: urn:schemas-upnp-org:device:InternetGatewayDevice:1\r\n"));
        assert!(query.contains(&format!("HOST: {}\r\n", responder_address)));

        // Garbage and replies without `ST` are dropped.
        responder.send_to(b"garbage", engine_address).await?;
        responder
            .send_to(b"HTTP/1.1 200 OK\r\nLOCATION: http://x\r\n\r\n", engine_address)
            .await?;
        responder
            .send_to(
                b"HTTP/1.1 200 OK\r\nST: urn:schemas-upnp-org:device:InternetGatewayDevice:1\r\nLOCATION: http://127.0.0.1:5000/rootDesc.xml\r\n\r\n",
                engine_address,
            )
            .await?;

        let Some(DiscoveryEvent::Device(found)) = next_event(&mut events).await? else {
            panic!("Expected a device");
        };
        assert_eq!(
            found.message.location(),
            Some("http://127.0.0.1:5000/rootDesc.xml")
        );
        assert_eq!(found.interface, loopback());
        assert_eq!(found.local_address, engine_address);
        assert_eq!(found.remote_address, SocketAddr::V4(responder_address));

        Ok(())
    }

    #[tokio::test]
    async fn one_query_per_bound_socket() -> anyhow::Result<()> {
        crate::test::init();

        let (responder, responder_address) = responder().await?;
        let config = DiscoveryConfig {
            multicast_address: responder_address,
        };
        let interfaces = vec![
            loopback(),
            NetworkInterface::new("lo2", Ipv4Addr::new(127, 0, 0, 2)),
        ];
        let (mut engine, mut events) = DiscoveryEngine::with_interfaces(config, interfaces);
        engine.start().await;

        // Binding 127.0.0.2 fails on some hosts, which still counts as an outcome.
        let mut bound = Vec::default();
        loop {
            match next_event(&mut events).await? {
                Some(DiscoveryEvent::Listening { local_address, .. }) => bound.push(local_address),
                Some(DiscoveryEvent::BindError { .. }) => {}
                Some(DiscoveryEvent::Ready) => break,
                other => panic!("Unexpected event: {:?}", other),
            }
        }
        assert!(!bound.is_empty());

        // When
        engine.search("urn:foo", SearchOptions::default()).await?;

        // Then
        let mut senders = Vec::default();
        let mut buffer = vec![0; 2048];
        while let Ok(received) = tokio::time::timeout(
            Duration::from_millis(500),
            responder.recv_from(&mut buffer),
        )
        .await
        {
            let (size, sender) = received?;
            assert!(buffer[..size].starts_with(b"M-SEARCH * HTTP/1.1\r\n"));
            senders.push(sender);
        }
        senders.sort();
        bound.sort();
        assert_eq!(senders, bound);
        Ok(())
    }

    #[tokio::test]
    async fn search_after_close() -> anyhow::Result<()> {
        crate::test::init();

        let (mut engine, _events) =
            DiscoveryEngine::with_interfaces(DiscoveryConfig::default(), vec![loopback()]);
        engine.start().await;

        // When
        engine.close();

        // Then
        assert_eq!(engine.state(), EngineState::Closed);
        assert!(engine
            .search("urn:foo", SearchOptions::default())
            .await
            .is_err());
        Ok(())
    }
}
