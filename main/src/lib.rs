//! Discovers UPnP Internet Gateway Devices on the local network and manages their port mappings.

pub mod description;
pub mod discovery;
pub mod gateway;
pub mod http;
pub mod mapping;
pub mod network;
pub mod soap;
pub mod ssdp;

pub use discovery::GatewayDiscovery;
pub use discovery::GatewayDiscoveryOptions;
pub use gateway::Gateway;
pub use gateway::GatewayError;
pub use http::ReqwestHttpClient;
pub use mapping::AddMappingOptions;
pub use mapping::DeleteMappingOptions;
pub use mapping::MappingError;
pub use mapping::PortMappingEntry;
pub use mapping::Protocol;
