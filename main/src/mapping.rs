use crate::gateway::Gateway;
use crate::network::probe::DEFAULT_PROBE_TIMEOUT;
use crate::soap::ActionError;
use crate::soap::ActionResponse;
use futures_util::Stream;
use futures_util::StreamExt;
use serde::Serialize;
use std::fmt::Display;
use std::fmt::Formatter;
use std::net::Ipv4Addr;
use std::net::SocketAddrV4;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_MAPPING_DESCRIPTION: &str = "igdmap";

/// Lease duration of a new mapping, in seconds.
pub const DEFAULT_MAPPING_TTL: u32 = 1800;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl Protocol {
    /// Name as sent to the gateway.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
        }
    }
}

impl Display for Protocol {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("Unknown protocol `{0}`")]
pub struct UnknownProtocol(String);

impl FromStr for Protocol {
    type Err = UnknownProtocol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("tcp") {
            Ok(Self::Tcp)
        } else if s.eq_ignore_ascii_case("udp") {
            Ok(Self::Udp)
        } else {
            Err(UnknownProtocol(s.to_owned()))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

/// One row of the gateway's port mapping table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortMappingEntry {
    /// Remote side. An empty host means any remote host.
    pub public: Endpoint,
    pub private: Endpoint,

    /// Lower-cased protocol name as reported by the gateway.
    pub protocol: String,
    pub enabled: bool,
    pub description: String,
    pub ttl: u32,
}

impl PortMappingEntry {
    fn from_response(response: &ActionResponse) -> Result<Self, MalformedEntry> {
        let text = |name: &str| field(response, name);
        Ok(Self {
            public: Endpoint {
                host: text("NewRemoteHost").to_owned(),
                port: number(response, "NewExternalPort")?,
            },
            private: Endpoint {
                host: text("NewInternalClient").to_owned(),
                port: number(response, "NewInternalPort")?,
            },
            protocol: text("NewProtocol").to_lowercase(),
            enabled: text("NewEnabled") == "1",
            description: text("NewPortMappingDescription").to_owned(),
            ttl: number(response, "NewLeaseDuration")?,
        })
    }
}

fn field<'a>(response: &'a ActionResponse, name: &str) -> &'a str {
    response.get(name).map(|v| v.trim()).unwrap_or_default()
}

fn number<T: FromStr>(response: &ActionResponse, name: &'static str) -> Result<T, MalformedEntry> {
    field(response, name)
        .parse()
        .map_err(|_| MalformedEntry(name))
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("Port mapping entry has an invalid `{0}`")]
pub struct MalformedEntry(&'static str);

#[derive(Error, Debug)]
pub enum MappingError {
    #[error("Internal port {} is not accepting connections", .0)]
    PreflightUnreachable(SocketAddrV4),

    #[error("Port mapping entry {index} is malformed")]
    Malformed {
        index: u32,
        #[source]
        source: MalformedEntry,
    },

    #[error(transparent)]
    Action(#[from] ActionError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddMappingOptions {
    /// Address the mapping forwards to. Defaults to the address of the interface the gateway was
    /// discovered on.
    pub internal_host: Option<Ipv4Addr>,
    pub remote_host: String,
    pub protocol: Protocol,
    pub description: String,
    pub ttl: u32,

    /// Whether to check that the internal port accepts TCP connections before asking the gateway.
    pub port_scan: bool,
}

impl Default for AddMappingOptions {
    fn default() -> Self {
        Self {
            internal_host: None,
            remote_host: String::default(),
            protocol: Protocol::default(),
            description: DEFAULT_MAPPING_DESCRIPTION.into(),
            ttl: DEFAULT_MAPPING_TTL,
            port_scan: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteMappingOptions {
    pub internal_host: Option<Ipv4Addr>,
    pub remote_host: String,
    pub protocol: Protocol,
}

impl Gateway {
    /// Reads one entry of the port mapping table.
    pub async fn get_mapping_entry(&self, index: u32) -> Result<PortMappingEntry, MappingError> {
        let response = self
            .call(
                "GetGenericPortMappingEntry",
                &[("NewPortMappingIndex", Some(index.to_string()))],
            )
            .await?;
        PortMappingEntry::from_response(&response)
            .map_err(|source| MappingError::Malformed { index, source })
    }

    /// Walks the port mapping table from index 0 until the first entry that cannot be read.
    ///
    /// The gateway signals the end of its table with an error, so enumeration cannot tell the end
    /// apart from a failure. Either way the stream just ends.
    pub fn mappings(&self) -> impl Stream<Item = PortMappingEntry> + '_ {
        futures_util::stream::unfold(0u32, move |index| async move {
            match self.get_mapping_entry(index).await {
                Ok(entry) => Some((entry, index + 1)),
                Err(MappingError::Action(e))
                    if matches!(e.error_code(), Some("713") | Some("714")) =>
                {
                    log::debug!("Port mapping table of {} ends at {}", self.url(), index);
                    None
                }
                Err(e) => {
                    log::warn!(
                        "Stopped reading port mappings of {} at {}: {}",
                        self.url(),
                        index,
                        e
                    );
                    None
                }
            }
        })
    }

    pub async fn get_mappings(&self) -> Vec<PortMappingEntry> {
        self.mappings().collect().await
    }

    /// Forwards `remote_port` on the gateway to `internal_port` on the internal host.
    pub async fn add_mapping(
        &self,
        internal_port: u16,
        remote_port: u16,
        options: AddMappingOptions,
    ) -> Result<ActionResponse, MappingError> {
        let internal_host = options.internal_host.unwrap_or(self.interface().address);
        if options.port_scan {
            let address = SocketAddrV4::new(internal_host, internal_port);
            if !self
                .probe
                .is_reachable(address, DEFAULT_PROBE_TIMEOUT)
                .await
            {
                return Err(MappingError::PreflightUnreachable(address));
            }
        }

        let response = self
            .call(
                "AddPortMapping",
                &[
                    ("NewInternalPort", Some(internal_port.to_string())),
                    ("NewInternalClient", Some(internal_host.to_string())),
                    ("NewExternalPort", Some(remote_port.to_string())),
                    ("NewRemoteHost", Some(options.remote_host)),
                    ("NewProtocol", Some(options.protocol.to_string())),
                    ("NewEnabled", Some("1".into())),
                    ("NewPortMappingDescription", Some(options.description)),
                    ("NewLeaseDuration", Some(options.ttl.to_string())),
                ],
            )
            .await?;
        log::info!(
            "Mapped {} port {} of {} to {}:{}",
            options.protocol,
            remote_port,
            self.url(),
            internal_host,
            internal_port
        );
        Ok(response)
    }

    pub async fn delete_mapping(
        &self,
        internal_port: u16,
        remote_port: u16,
        options: DeleteMappingOptions,
    ) -> Result<ActionResponse, MappingError> {
        let internal_host = options.internal_host.unwrap_or(self.interface().address);
        let response = self
            .call(
                "DeletePortMapping",
                &[
                    ("NewInternalPort", Some(internal_port.to_string())),
                    ("NewInternalClient", Some(internal_host.to_string())),
                    ("NewExternalPort", Some(remote_port.to_string())),
                    ("NewRemoteHost", Some(options.remote_host)),
                    ("NewProtocol", Some(options.protocol.to_string())),
                ],
            )
            .await?;
        log::info!(
            "Removed {} port {} mapping of {}",
            options.protocol,
            remote_port,
            self.url()
        );
        Ok(response)
    }

    pub async fn get_external_ip(&self) -> Result<String, MappingError> {
        let mut response = self.call("GetExternalIPAddress", &[]).await?;
        response
            .remove("NewExternalIPAddress")
            .ok_or_else(|| ActionError::MissingResponse("NewExternalIPAddress".into()).into())
    }
}
