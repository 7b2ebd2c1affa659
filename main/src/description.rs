use crate::http::HttpClient;
use crate::http::HttpError;
use thiserror::Error;
use url::Url;
use xmltree::Element;

pub const WAN_IP_CONNECTION: &str = "urn:schemas-upnp-org:service:WANIPConnection:1";
pub const WAN_PPP_CONNECTION: &str = "urn:schemas-upnp-org:service:WANPPPConnection:1";

#[derive(Error, Debug)]
pub enum DescriptionError {
    #[error("Failed to fetch the device description")]
    Http(#[from] HttpError),

    #[error("Device description answered with HTTP status {0}")]
    Status(u16),

    #[error("Invalid device description XML")]
    Xml(#[from] xmltree::ParseError),

    #[error("Document is not a device description")]
    NotDescription,

    #[error("No accepted service in the device description")]
    NoService,

    #[error("Accepted service has no control URL or no SCPD URL")]
    MissingUrls,

    #[error("Invalid service URL")]
    InvalidUrl(#[from] url::ParseError),
}

/// Service types a gateway may be driven through, in no particular order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSet(Vec<String>);

impl ServiceSet {
    pub fn contains(&self, service_type: &str) -> bool {
        self.0.iter().any(|s| s == service_type)
    }
}

impl Default for ServiceSet {
    fn default() -> Self {
        [WAN_IP_CONNECTION, WAN_PPP_CONNECTION].into_iter().collect()
    }
}

impl<S: Into<String>> FromIterator<S> for ServiceSet {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Service {
    pub service_type: Option<String>,
    pub service_id: Option<String>,
    pub control_url: Option<String>,
    pub scpd_url: Option<String>,
    pub event_sub_url: Option<String>,
    pub base_url: Option<String>,
}

impl Service {
    fn from_element(element: &Element) -> Self {
        Self {
            service_type: text(element, "serviceType"),
            service_id: text(element, "serviceId"),
            control_url: text(element, "controlURL"),
            scpd_url: text(element, "SCPDURL"),
            event_sub_url: text(element, "eventSubURL"),
            base_url: text(element, "baseURL"),
        }
    }
}

/// A device node of a description. `devices` and `services` hold the direct children only.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Device {
    pub device_type: Option<String>,
    pub friendly_name: Option<String>,
    pub manufacturer: Option<String>,
    pub model_name: Option<String>,
    pub udn: Option<String>,
    pub devices: Vec<Device>,
    pub services: Vec<Service>,
}

impl Device {
    fn from_element(element: &Element) -> Self {
        Self {
            device_type: text(element, "deviceType"),
            friendly_name: text(element, "friendlyName"),
            manufacturer: text(element, "manufacturer"),
            model_name: text(element, "modelName"),
            udn: text(element, "UDN"),
            devices: list(element, "deviceList", "device")
                .map(Device::from_element)
                .collect(),
            services: list(element, "serviceList", "service")
                .map(Service::from_element)
                .collect(),
        }
    }
}

/// Every service and every embedded device of a description, at any depth, in document order.
///
/// Root devices appear in neither list themselves; their services do.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FlatDescription {
    pub services: Vec<Service>,
    pub devices: Vec<Device>,
}

impl FlatDescription {
    pub fn new(root_devices: &[Device]) -> Self {
        let mut flat = Self::default();
        root_devices.iter().for_each(|d| flat.collect(d));
        flat
    }

    fn collect(&mut self, device: &Device) {
        self.services.extend(device.services.iter().cloned());
        self.devices.extend(device.devices.iter().cloned());
        device.devices.iter().for_each(|d| self.collect(d));
    }

    /// First service in document order whose type is accepted.
    pub fn select(&self, accepted: &ServiceSet) -> Option<&Service> {
        self.services.iter().find(|s| {
            s.service_type
                .as_deref()
                .is_some_and(|t| accepted.contains(t))
        })
    }
}

/// The service a gateway is driven through, with absolute URLs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedService {
    pub service_type: String,
    pub control_url: Url,
    pub scpd_url: Url,
}

impl ResolvedService {
    /// Resolves the service URLs against its `baseURL`, falling back to the description URL.
    pub fn new(service: &Service, description_url: &Url) -> Result<Self, DescriptionError> {
        let (Some(service_type), Some(control_url), Some(scpd_url)) = (
            service.service_type.as_ref(),
            service.control_url.as_ref(),
            service.scpd_url.as_ref(),
        ) else {
            return Err(DescriptionError::MissingUrls);
        };
        let base = match &service.base_url {
            Some(base_url) => Url::parse(base_url)?,
            None => description_url.clone(),
        };
        Ok(Self {
            service_type: service_type.clone(),
            control_url: base.join(control_url)?,
            scpd_url: base.join(scpd_url)?,
        })
    }
}

/// Parses the root devices out of a description document.
pub fn parse(xml: &str) -> Result<Vec<Device>, DescriptionError> {
    let root = Element::parse(xml.as_bytes())?;
    if root.name != "root" {
        return Err(DescriptionError::NotDescription);
    }
    Ok(children(&root, "device").map(Device::from_element).collect())
}

/// Fetches the description at `url` and picks the first accepted service out of it.
pub async fn resolve(
    http: &(dyn HttpClient + Send + Sync),
    url: &Url,
    accepted: &ServiceSet,
) -> Result<(FlatDescription, ResolvedService), DescriptionError> {
    log::debug!("Fetching device description at {}", url);
    let response = http.get(url.as_str()).await?;
    if response.status != 200 {
        return Err(DescriptionError::Status(response.status));
    }

    let description = FlatDescription::new(&parse(&response.body)?);
    let service = description
        .select(accepted)
        .ok_or(DescriptionError::NoService)?;
    let resolved = ResolvedService::new(service, url)?;
    log::debug!(
        "Selected {} at {} out of {} service(s)",
        resolved.service_type,
        resolved.control_url,
        description.services.len()
    );
    Ok((description, resolved))
}

fn children<'a>(element: &'a Element, name: &'a str) -> impl Iterator<Item = &'a Element> {
    element
        .children
        .iter()
        .filter_map(|n| n.as_element())
        .filter(move |e| e.name == name)
}

fn list<'a>(
    element: &'a Element,
    list_name: &'a str,
    item_name: &'a str,
) -> impl Iterator<Item = &'a Element> {
    children(element, list_name).flat_map(move |l| children(l, item_name))
}

fn text(element: &Element, name: &str) -> Option<String> {
    let value = element.get_child(name)?.get_text()?;
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_owned())
    }
}
