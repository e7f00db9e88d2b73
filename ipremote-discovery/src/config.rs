//! Configuration types for discovery
//!
//! Defaults follow SSDP: the IPv4 site-local group and an IPv6 link-local
//! group on port 1900, and a fixed unicast port for search responses.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use crate::error::{DiscoveryError, Result};
use crate::packet::SsdpSearchRequest;

/// SSDP multicast port
pub const SSDP_PORT: u16 = 1900;

/// Port of the per-interface unicast receivers
pub const UNICAST_PORT: u16 = 8008;

/// IPv4 site-local SSDP group
pub const IPV4_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);

/// IPv6 link-local SSDP group
pub const IPV6_LINK_LOCAL_GROUP: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0xc);

/// IPv6 site-local SSDP group
pub const IPV6_SITE_LOCAL_GROUP: Ipv6Addr = Ipv6Addr::new(0xff05, 0, 0, 0, 0, 0, 0, 0xc);

/// Content types accepted for device descriptions
pub const DEFAULT_CONTENT_TYPES: [&str; 3] = ["text/xml", "text/html", "application/xml"];

/// Configuration for [`DiscoveryManager`](crate::DiscoveryManager)
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Multicast groups to join, one network per group
    /// Default: 239.255.255.250:1900 and [ff02::c]:1900
    pub multicast_groups: Vec<SocketAddr>,

    /// Port of the per-interface unicast receivers that searches are sent from
    /// Default: 8008
    pub unicast_port: u16,

    /// Interval between repeated searches
    /// Default: 25 minutes
    pub search_frequency: Duration,

    /// Request sent by the repeating search
    /// Default: ST upnp:rootdevice, MX 3
    pub search_request: SsdpSearchRequest,

    /// Lifetime of a sighting without a Cache-Control max-age
    /// Default: 1800 seconds
    pub default_max_age: Duration,

    /// Timeout for fetching a device description
    /// Default: 5 seconds
    pub http_timeout: Duration,

    /// Description content types that are parsed
    /// Default: text/xml, text/html, application/xml
    pub allowed_content_types: Vec<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            multicast_groups: vec![
                SocketAddr::new(IpAddr::V4(IPV4_GROUP), SSDP_PORT),
                SocketAddr::new(IpAddr::V6(IPV6_LINK_LOCAL_GROUP), SSDP_PORT),
            ],
            unicast_port: UNICAST_PORT,
            search_frequency: Duration::from_secs(25 * 60),
            search_request: SsdpSearchRequest::default(),
            default_max_age: Duration::from_secs(1800),
            http_timeout: Duration::from_secs(5),
            allowed_content_types: DEFAULT_CONTENT_TYPES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl DiscoveryConfig {
    /// Create a new DiscoveryConfig with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Only discover over IPv4
    pub fn ipv4_only() -> Self {
        Self {
            multicast_groups: vec![SocketAddr::new(IpAddr::V4(IPV4_GROUP), SSDP_PORT)],
            ..Default::default()
        }
    }

    /// Search every `frequency` instead of the default
    pub fn with_search_frequency(mut self, frequency: Duration) -> Self {
        self.search_frequency = frequency;
        self
    }

    /// True if `content_type` (parameters after `;` ignored) may be parsed
    pub fn accepts_content_type(&self, content_type: &str) -> bool {
        let media_type = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim();
        self.allowed_content_types
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(media_type))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.multicast_groups.is_empty() {
            return Err(DiscoveryError::Configuration(
                "at least one multicast group is required".to_string(),
            ));
        }

        if let Some(group) = self
            .multicast_groups
            .iter()
            .find(|group| !group.ip().is_multicast())
        {
            return Err(DiscoveryError::Configuration(format!(
                "{} is not a multicast address",
                group
            )));
        }

        if self.search_frequency.is_zero() {
            return Err(DiscoveryError::Configuration(
                "search_frequency must be greater than 0".to_string(),
            ));
        }

        if self.default_max_age.is_zero() {
            return Err(DiscoveryError::Configuration(
                "default_max_age must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_config() {
        let config = DiscoveryConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.multicast_groups.len(), 2);
        assert_eq!(config.unicast_port, 8008);
        assert_eq!(config.search_frequency, Duration::from_secs(1500));
        assert_eq!(config.default_max_age, Duration::from_secs(1800));
    }

    #[test]
    fn test_unicast_group_rejected() {
        let config = DiscoveryConfig {
            multicast_groups: vec!["192.168.1.1:1900".parse().unwrap()],
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(DiscoveryError::Configuration(_))
        ));
    }

    #[test]
    fn test_ipv4_only() {
        let config = DiscoveryConfig::ipv4_only();
        assert_eq!(
            config.multicast_groups,
            vec!["239.255.255.250:1900".parse::<SocketAddr>().unwrap()]
        );
    }

    #[rstest]
    #[case("text/xml", true)]
    #[case("text/xml; charset=\"utf-8\"", true)]
    #[case("TEXT/HTML;charset=ISO-8859-1", true)]
    #[case("application/xml", true)]
    #[case("application/json", false)]
    #[case("", false)]
    fn test_accepts_content_type(#[case] content_type: &str, #[case] expected: bool) {
        assert_eq!(
            DiscoveryConfig::default().accepts_content_type(content_type),
            expected
        );
    }
}
