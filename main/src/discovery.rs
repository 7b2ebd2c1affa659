use crate::description::ServiceSet;
use crate::gateway::Gateway;
use crate::gateway::GatewayError;
use crate::http::SharedHttpClient;
use crate::network::interface::NetworkInterface;
use crate::ssdp::engine::DiscoveryConfig;
use crate::ssdp::engine::DiscoveryEngine;
use crate::ssdp::engine::DiscoveryError;
use crate::ssdp::engine::DiscoveryEvent;
use crate::ssdp::engine::SearchOptions;
use futures_channel::mpsc::UnboundedReceiver;
use futures_util::future::BoxFuture;
use futures_util::stream::FuturesUnordered;
use futures_util::FutureExt;
use futures_util::Stream;
use futures_util::StreamExt;
use std::time::Duration;
use tokio::time::Instant;

pub const INTERNET_GATEWAY_DEVICE: &str = "urn:schemas-upnp-org:device:InternetGatewayDevice:1";

#[derive(Debug, Clone)]
pub struct GatewayDiscoveryOptions {
    /// Search target of the query.
    pub target: String,

    /// Service types a found gateway must offer one of.
    pub services: ServiceSet,

    /// Closes the session this long after it started. `None` keeps it open until closed.
    pub timeout: Option<Duration>,

    pub discovery: DiscoveryConfig,
}

impl Default for GatewayDiscoveryOptions {
    fn default() -> Self {
        Self {
            target: INTERNET_GATEWAY_DEVICE.into(),
            services: ServiceSet::default(),
            timeout: None,
            discovery: DiscoveryConfig::default(),
        }
    }
}

enum Step {
    Deadline,
    Event(Option<DiscoveryEvent>),
    Resolved(Result<Gateway, GatewayError>),
}

/// Searches for Internet Gateway Devices and resolves every reply into a [Gateway].
///
/// Every reply is resolved on its own, so a device answering twice yields two gateways. Replies
/// whose description cannot be resolved are skipped.
pub struct GatewayDiscovery {
    engine: DiscoveryEngine,
    events: UnboundedReceiver<DiscoveryEvent>,
    events_done: bool,
    pending: FuturesUnordered<BoxFuture<'static, Result<Gateway, GatewayError>>>,
    deadline: Option<Instant>,
    services: ServiceSet,
    http: SharedHttpClient,
    found: Vec<Gateway>,
}

impl GatewayDiscovery {
    /// Starts a search on every local IPv4 interface.
    pub async fn start(
        options: GatewayDiscoveryOptions,
        http: SharedHttpClient,
    ) -> Result<Self, DiscoveryError> {
        let (engine, events) = DiscoveryEngine::new(options.discovery.clone())?;
        Self::start_with(engine, events, options, http).await
    }

    /// Starts a search on the given interfaces only.
    pub async fn start_on(
        interfaces: Vec<NetworkInterface>,
        options: GatewayDiscoveryOptions,
        http: SharedHttpClient,
    ) -> Result<Self, DiscoveryError> {
        let (engine, events) =
            DiscoveryEngine::with_interfaces(options.discovery.clone(), interfaces);
        Self::start_with(engine, events, options, http).await
    }

    async fn start_with(
        mut engine: DiscoveryEngine,
        events: UnboundedReceiver<DiscoveryEvent>,
        options: GatewayDiscoveryOptions,
        http: SharedHttpClient,
    ) -> Result<Self, DiscoveryError> {
        let deadline = options.timeout.map(|t| Instant::now() + t);
        engine.start().await;
        engine
            .search(&options.target, SearchOptions::default())
            .await?;
        Ok(Self {
            engine,
            events,
            events_done: false,
            pending: FuturesUnordered::default(),
            deadline,
            services: options.services,
            http,
            found: Vec::default(),
        })
    }

    /// Waits for the next gateway to become ready.
    ///
    /// Returns `None` once the session is closed and every reply received so far is resolved.
    pub async fn next_gateway(&mut self) -> Option<Gateway> {
        loop {
            let deadline = self.deadline;
            let events_open = !self.events_done;
            let has_pending = !self.pending.is_empty();
            let step = tokio::select! {
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => Step::Deadline,
                event = self.events.next(), if events_open => Step::Event(event),
                Some(result) = self.pending.next(), if has_pending => Step::Resolved(result),
                else => return None,
            };
            match step {
                Step::Deadline => {
                    log::debug!("Gateway discovery timed out");
                    self.close();
                }
                Step::Event(None) => self.events_done = true,
                Step::Event(Some(DiscoveryEvent::Device(found))) => {
                    let Some(location) = found.message.location() else {
                        log::debug!("Ignoring a reply without location from {}", found.remote_address);
                        continue;
                    };
                    let location = location.to_owned();
                    let interface = found.interface;
                    let services = self.services.clone();
                    let http = self.http.clone();
                    self.pending.push(
                        async move { Gateway::connect(&location, interface, &services, http).await }
                            .boxed(),
                    );
                }
                Step::Event(Some(_)) => {}
                Step::Resolved(Ok(gateway)) => {
                    self.found.push(gateway.clone());
                    return Some(gateway);
                }
                Step::Resolved(Err(e)) => {
                    log::debug!("Skipping a gateway: {}", e);
                }
            }
        }
    }

    /// Gateways found so far, in the order they became ready.
    pub fn found(&self) -> &[Gateway] {
        &self.found
    }

    /// Stops listening for replies. Replies already received still resolve.
    pub fn close(&mut self) {
        self.deadline = None;
        self.engine.close();
    }

    pub fn gateways(self) -> impl Stream<Item = Gateway> {
        futures_util::stream::unfold(self, |mut session| async move {
            let gateway = session.next_gateway().await?;
            Some((gateway, session))
        })
    }
}
