//! Device description parsing.
//!
//! Parses the UPnP device description XML served at a sighting's
//! `Location`, including the vendor element carrying the control port.

use serde::Deserialize;

use crate::error::{DiscoveryError, Result};

/// UPnP device description root element.
#[derive(Debug, Deserialize)]
struct Root {
    device: DeviceDescription,
}

/// Snapshot of a device description.
///
/// `DeviceDescription::default()` is the empty description handed to
/// listeners when a description cannot be read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDescription {
    #[serde(default)]
    pub device_type: String,
    #[serde(default)]
    pub friendly_name: String,
    #[serde(default)]
    pub manufacturer: String,
    #[serde(default)]
    pub model_name: String,
    #[serde(default)]
    pub model_number: Option<String>,
    #[serde(default)]
    pub serial_number: Option<String>,
    #[serde(rename = "UDN", default)]
    pub udn: String,
    /// Vendor extension naming the TCP control port
    #[serde(
        rename = "X_ipRemoteTcpPort",
        alias = "av:X_ipRemoteTcpPort",
        default
    )]
    pub control_port: Option<u16>,
    #[serde(rename = "serviceList", default)]
    pub(crate) service_list: ServiceList,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
struct ServiceList {
    #[serde(rename = "service", default)]
    services: Vec<Service>,
}

/// One entry of the description's service list
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Service {
    #[serde(rename = "serviceType", default)]
    pub service_type: String,
    #[serde(rename = "serviceId", default)]
    pub service_id: String,
    #[serde(rename = "controlURL", default)]
    pub control_url: String,
    #[serde(rename = "eventSubURL", default)]
    pub event_sub_url: String,
    #[serde(rename = "SCPDURL", default)]
    pub scpd_url: String,
}

impl DeviceDescription {
    /// Parse device description from XML.
    ///
    /// # Errors
    ///
    /// Returns `DiscoveryError::ParseError` if the XML is malformed.
    pub fn from_xml(xml: &str) -> Result<Self> {
        let root: Root = quick_xml::de::from_str(xml).map_err(|e| {
            DiscoveryError::ParseError(format!("Failed to parse device XML: {}", e))
        })?;

        Ok(root.device)
    }

    /// True for the placeholder handed out when a description was unreadable
    pub fn is_empty(&self) -> bool {
        self.udn.is_empty() && self.device_type.is_empty()
    }

    pub fn services(&self) -> &[Service] {
        &self.service_list.services
    }

    /// Look up a service by its type URN
    pub fn service(&self, service_type: &str) -> Option<&Service> {
        self.services()
            .iter()
            .find(|service| service.service_type == service_type)
    }
}
