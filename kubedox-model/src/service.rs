//! Services, ports and the instances behind them
//!
//! A service such as `catalog.shop.svc.cluster.local` listens on one or more
//! [`Port`]s and may carry a virtual address. Each workload backing it is a
//! [`ServiceInstance`], which binds a concrete [`NetworkEndpoint`] to the
//! service declaration.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Network protocol carried by a port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Tcp,
    Http,
    Http2,
    Https,
    Grpc,
    Udp,
    Unsupported,
}

impl Protocol {
    /// Parse a protocol name case-insensitively. Unknown names map to
    /// [`Protocol::Unsupported`].
    pub fn parse(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "tcp" => Protocol::Tcp,
            "udp" => Protocol::Udp,
            "grpc" => Protocol::Grpc,
            "http" => Protocol::Http,
            "http2" => Protocol::Http2,
            "https" => Protocol::Https,
            _ => Protocol::Unsupported,
        }
    }

    /// True for protocols that speak plain HTTP on the wire
    pub fn is_http(&self) -> bool {
        matches!(self, Protocol::Http | Protocol::Http2 | Protocol::Grpc)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Protocol::Tcp => "TCP",
            Protocol::Http => "HTTP",
            Protocol::Http2 => "HTTP2",
            Protocol::Https => "HTTPS",
            Protocol::Grpc => "GRPC",
            Protocol::Udp => "UDP",
            Protocol::Unsupported => "UNSUPPORTED",
        };
        f.write_str(name)
    }
}

/// A port a service listens on
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Port {
    /// Mandatory when the service exposes more than one port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub port: u16,
    pub protocol: Protocol,
}

/// Ordered list of port declarations
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortList(pub Vec<Port>);

impl PortList {
    /// Find a port declaration by name; `None` matches an unnamed port
    pub fn get(&self, name: Option<&str>) -> Option<&Port> {
        self.0.iter().find(|p| p.name.as_deref() == name)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Port> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<Port>> for PortList {
    fn from(ports: Vec<Port>) -> Self {
        Self(ports)
    }
}

impl<'a> IntoIterator for &'a PortList {
    type Item = &'a Port;
    type IntoIter = std::slice::Iter<'a, Port>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// A named, addressable service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    /// Fully qualified domain name, unique across the registry
    pub hostname: String,
    /// Virtual (cluster) address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub ports: PortList,
    /// DNS name of the backing service when it lives outside the cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_name: Option<String>,
    /// Set for headless services: neither an address nor an external name
    #[serde(skip)]
    pub load_balancing_disabled: bool,
}

impl Service {
    pub fn is_external(&self) -> bool {
        self.external_name.is_some()
    }
}

/// Concrete address an instance listens on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkEndpoint {
    pub address: String,
    /// Port on the instance; may differ from the service port
    pub port: u16,
    /// The service port this endpoint serves
    pub service_port: Port,
}

/// One workload instance behind a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub endpoint: NetworkEndpoint,
    pub service: Service,
}

impl ServiceInstance {
    /// Registry key built from the endpoint address and the instance's port
    /// identity, e.g. `10.1.0.4|http-api:8080/HTTP`. Instances of one service
    /// on the same address but different service ports get distinct keys.
    pub fn key(&self) -> String {
        let port = &self.endpoint.service_port;
        format!(
            "{}|{}:{}/{}",
            self.endpoint.address,
            port.name.as_deref().unwrap_or_default(),
            self.endpoint.port,
            port.protocol
        )
    }
}
