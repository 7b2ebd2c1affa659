use crate::description::DescriptionError;
use crate::description::FlatDescription;
use crate::description::ServiceSet;
use crate::http::SharedHttpClient;
use crate::network::interface::NetworkInterface;
use crate::network::probe::PortProbe;
use crate::network::probe::TcpPortProbe;
use crate::soap::ActionError;
use crate::soap::ActionInvoker;
use crate::soap::ActionResponse;
use crate::soap::Argument;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::sync::Arc;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Gateway device is unavailable")]
    DeviceUnavailable(#[from] DescriptionError),
}

/// A gateway whose description has been resolved and which is ready to take actions.
///
/// A `Gateway` only exists once readiness is reached; a device that never gets there surfaces as
/// [GatewayError::DeviceUnavailable] from [Gateway::connect] instead.
#[derive(Clone)]
pub struct Gateway {
    url: Url,
    interface: NetworkInterface,
    description: FlatDescription,
    scpd_url: Url,
    invoker: ActionInvoker,
    pub(crate) probe: Arc<dyn PortProbe + Send + Sync>,
}

impl Gateway {
    /// Fetches the description at `url` and selects the first service listed in `services`.
    ///
    /// `interface` is the local interface the gateway was discovered on.
    pub async fn connect(
        url: &str,
        interface: NetworkInterface,
        services: &ServiceSet,
        http: SharedHttpClient,
    ) -> Result<Self, GatewayError> {
        let url = Url::parse(url).map_err(DescriptionError::from)?;
        let (description, service) =
            crate::description::resolve(http.as_ref(), &url, services).await?;
        log::info!(
            "Gateway at {} ready with {} on {}",
            url,
            service.service_type,
            interface.name
        );
        Ok(Self {
            url,
            interface,
            description,
            scpd_url: service.scpd_url,
            invoker: ActionInvoker::new(http, service.control_url, service.service_type),
            probe: Arc::new(TcpPortProbe),
        })
    }

    /// Replaces the probe checking internal ports before a mapping is added.
    pub fn with_probe(mut self, probe: Arc<dyn PortProbe + Send + Sync>) -> Self {
        self.probe = probe;
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn host(&self) -> Option<&str> {
        self.url.host_str()
    }

    pub fn port(&self) -> Option<u16> {
        self.url.port_or_known_default()
    }

    pub fn interface(&self) -> &NetworkInterface {
        &self.interface
    }

    pub fn service_type(&self) -> &str {
        self.invoker.service_type()
    }

    pub fn control_url(&self) -> &Url {
        self.invoker.control_url()
    }

    pub fn scpd_url(&self) -> &Url {
        &self.scpd_url
    }

    pub fn description(&self) -> &FlatDescription {
        &self.description
    }

    /// Invokes an arbitrary action of the selected service.
    pub async fn call(
        &self,
        action: &str,
        arguments: &[Argument<'_>],
    ) -> Result<ActionResponse, ActionError> {
        self.invoker.call(action, arguments).await
    }
}

impl Debug for Gateway {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("url", &self.url.as_str())
            .field("interface", &self.interface)
            .field("service_type", &self.service_type())
            .field("control_url", &self.control_url().as_str())
            .field("scpd_url", &self.scpd_url.as_str())
            .finish()
    }
}
