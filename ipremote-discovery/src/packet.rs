//! SSDP packet parsing and search formatting
//!
//! A packet is an HTTP-like start line followed by case-insensitive
//! `Header: value` lines. The start line decides the packet type.

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::error::{DiscoveryError, Result};

/// Notification and search target naming every root device
pub const ROOT_DEVICE: &str = "upnp:rootdevice";

/// Kind of SSDP packet, from its start line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// `M-SEARCH * HTTP/1.1`
    Search,
    /// `HTTP/1.1 200 OK`
    SearchResponse,
    /// `NOTIFY * HTTP/1.1`
    Notify,
}

/// Value of the NTS header of a NOTIFY
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyState {
    Alive,
    ByeBye,
}

/// Parsed view of one SSDP datagram
#[derive(Debug, Clone, PartialEq)]
pub struct SsdpPacket {
    packet_type: PacketType,
    start_line: String,
    headers: HashMap<String, String>,
}

impl SsdpPacket {
    /// Parse a datagram payload
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|e| DiscoveryError::ParseError(format!("Packet is not UTF-8: {}", e)))?;
        Self::parse(text)
    }

    /// Parse packet text
    pub fn parse(text: &str) -> Result<Self> {
        let mut lines = text.lines();
        let start_line = lines
            .next()
            .map(|line| line.trim().to_uppercase())
            .filter(|line| !line.is_empty())
            .ok_or_else(|| DiscoveryError::ParseError("Empty packet".to_string()))?;

        let packet_type = if start_line.starts_with("NOTIFY ") {
            PacketType::Notify
        } else if start_line.starts_with("HTTP") {
            PacketType::SearchResponse
        } else if start_line.starts_with("M-SEARCH ") {
            PacketType::Search
        } else {
            return Err(DiscoveryError::ParseError(format!(
                "Unknown start line: {}",
                start_line
            )));
        };

        let headers = lines.filter_map(split_header).collect();

        Ok(Self {
            packet_type,
            start_line,
            headers,
        })
    }

    pub fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    /// Start line, upper-cased
    pub fn start_line(&self) -> &str {
        &self.start_line
    }

    /// Header value by case-insensitive name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// URL of the device description
    pub fn location(&self) -> Option<&str> {
        self.header("location")
    }

    pub fn usn(&self) -> Option<&str> {
        self.header("usn")
    }

    /// Unique device name: the USN up to its first `::`
    pub fn udn(&self) -> Option<&str> {
        let usn = self.usn()?;
        let udn = usn.split("::").next().unwrap_or(usn).trim();
        if udn.is_empty() {
            None
        } else {
            Some(udn)
        }
    }

    /// NTS of a NOTIFY
    pub fn notify_state(&self) -> Option<NotifyState> {
        match self.header("nts")?.trim() {
            "ssdp:alive" => Some(NotifyState::Alive),
            "ssdp:byebye" => Some(NotifyState::ByeBye),
            _ => None,
        }
    }

    /// NT of a NOTIFY, or ST of a search and its responses
    pub fn notification_type(&self) -> Option<&str> {
        let name = match self.packet_type {
            PacketType::Notify => "nt",
            PacketType::Search | PacketType::SearchResponse => "st",
        };
        self.header(name).map(str::trim)
    }

    /// `max-age` directive of Cache-Control, in seconds
    pub fn max_age(&self) -> Option<u64> {
        self.header("cache-control")?
            .split(',')
            .find_map(parse_max_age)
    }
}

fn split_header(line: &str) -> Option<(String, String)> {
    let (name, value) = line.split_once(':')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_ascii_lowercase(), value.trim().to_string()))
}

fn parse_max_age(directive: &str) -> Option<u64> {
    let directive = directive.trim();
    let prefix = directive.get(..7)?;
    if !prefix.eq_ignore_ascii_case("max-age") {
        return None;
    }
    directive[7..]
        .trim_start()
        .strip_prefix('=')?
        .trim()
        .parse()
        .ok()
}

/// An M-SEARCH request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsdpSearchRequest {
    /// Search target (ST)
    pub target: String,
    /// Maximum response delay in seconds (MX)
    pub mx: u32,
}

impl Default for SsdpSearchRequest {
    fn default() -> Self {
        Self {
            target: ROOT_DEVICE.to_string(),
            mx: 3,
        }
    }
}

impl SsdpSearchRequest {
    pub fn new(target: impl Into<String>, mx: u32) -> Self {
        Self {
            target: target.into(),
            mx,
        }
    }

    /// Request text addressed to `group`
    pub fn format(&self, group: SocketAddr) -> String {
        format!(
            "M-SEARCH * HTTP/1.1\r\n\
             ST: {}\r\n\
             MX: {}\r\n\
             MAN: \"ssdp:discover\"\r\n\
             HOST: {}\r\n\
             \r\n",
            self.target, self.mx, group
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const RECEIVER_ALIVE: &str = "NOTIFY * HTTP/1.1\r\n\
        HOST: 239.255.255.250:1900\r\n\
        CACHE-CONTROL: max-age=1800\r\n\
        LOCATION: http://192.168.1.20:8080/description.xml\r\n\
        NT: upnp:rootdevice\r\n\
        NTS: ssdp:alive\r\n\
        SERVER: Linux/2.6 UPnP/1.0 AVReceiver/1.0\r\n\
        USN: uuid:5F9EC1B3-ED59-79BB-4530-0011A5000001::upnp:rootdevice\r\n\
        \r\n";

    #[test]
    fn test_parse_notify_alive() {
        let packet = SsdpPacket::parse(RECEIVER_ALIVE).unwrap();

        assert_eq!(packet.packet_type(), PacketType::Notify);
        assert_eq!(packet.start_line(), "NOTIFY * HTTP/1.1");
        assert_eq!(
            packet.location(),
            Some("http://192.168.1.20:8080/description.xml")
        );
        assert_eq!(packet.notification_type(), Some(ROOT_DEVICE));
        assert_eq!(packet.notify_state(), Some(NotifyState::Alive));
        assert_eq!(
            packet.udn(),
            Some("uuid:5F9EC1B3-ED59-79BB-4530-0011A5000001")
        );
        assert_eq!(packet.max_age(), Some(1800));
    }

    #[test]
    fn test_parse_search_response_uses_st() {
        let response = "HTTP/1.1 200 OK\r\n\
            CACHE-CONTROL: max-age = 2000\r\n\
            EXT:\r\n\
            LOCATION: http://192.168.1.21:8080/description.xml\r\n\
            ST: upnp:rootdevice\r\n\
            USN: uuid:player-1::upnp:rootdevice\r\n\
            \r\n";

        let packet = SsdpPacket::parse(response).unwrap();

        assert_eq!(packet.packet_type(), PacketType::SearchResponse);
        assert_eq!(packet.notification_type(), Some(ROOT_DEVICE));
        assert_eq!(packet.notify_state(), None);
        assert_eq!(packet.udn(), Some("uuid:player-1"));
        assert_eq!(packet.max_age(), Some(2000));
        assert_eq!(packet.header("ext"), Some(""));
    }

    #[test]
    fn test_headers_are_case_insensitive() {
        let packet = SsdpPacket::parse(
            "notify * HTTP/1.1\r\nnt: upnp:rootdevice\r\nNts: ssdp:byebye\r\nuSn: uuid:tv\r\n\r\n",
        )
        .unwrap();

        assert_eq!(packet.packet_type(), PacketType::Notify);
        assert_eq!(packet.header("NT"), Some(ROOT_DEVICE));
        assert_eq!(packet.header("Nt"), Some(ROOT_DEVICE));
        assert_eq!(packet.notify_state(), Some(NotifyState::ByeBye));
        assert_eq!(packet.udn(), Some("uuid:tv"));
    }

    #[test]
    fn test_header_value_keeps_colons() {
        let packet = SsdpPacket::parse(RECEIVER_ALIVE).unwrap();
        assert_eq!(
            packet.header("location"),
            Some("http://192.168.1.20:8080/description.xml")
        );
    }

    #[test]
    fn test_search_packet() {
        let text = SsdpSearchRequest::default().format("239.255.255.250:1900".parse().unwrap());
        let packet = SsdpPacket::parse(&text).unwrap();

        assert_eq!(packet.packet_type(), PacketType::Search);
        assert_eq!(packet.header("man"), Some("\"ssdp:discover\""));
        assert_eq!(packet.header("mx"), Some("3"));
    }

    #[rstest]
    #[case("")]
    #[case("\r\n\r\n")]
    #[case("GET / HTTP/1.1\r\nHost: example\r\n\r\n")]
    fn test_rejects_unknown_packets(#[case] text: &str) {
        assert!(matches!(
            SsdpPacket::parse(text),
            Err(DiscoveryError::ParseError(_))
        ));
    }

    #[test]
    fn test_rejects_invalid_utf8() {
        assert!(SsdpPacket::from_bytes(&[0x4e, 0xff, 0xfe]).is_err());
    }

    #[rstest]
    #[case("max-age=1800", Some(1800))]
    #[case("max-age = 66", Some(66))]
    #[case("no-cache=\"Ext\", MAX-AGE=5", Some(5))]
    #[case("no-cache", None)]
    #[case("max-age=soon", None)]
    fn test_max_age(#[case] cache_control: &str, #[case] expected: Option<u64>) {
        let text = format!(
            "HTTP/1.1 200 OK\r\nCACHE-CONTROL: {}\r\nUSN: uuid:x\r\n\r\n",
            cache_control
        );
        assert_eq!(SsdpPacket::parse(&text).unwrap().max_age(), expected);
    }

    #[test]
    fn test_udn_without_suffix() {
        let packet =
            SsdpPacket::parse("HTTP/1.1 200 OK\r\nUSN: uuid:bare-device\r\n\r\n").unwrap();
        assert_eq!(packet.udn(), Some("uuid:bare-device"));

        let packet = SsdpPacket::parse("HTTP/1.1 200 OK\r\nUSN: ::upnp:rootdevice\r\n\r\n").unwrap();
        assert_eq!(packet.udn(), None);
    }

    #[test]
    fn test_format_search_request() {
        let request = SsdpSearchRequest::new("uuid:player-1", 5);

        assert_eq!(
            request.format("239.255.255.250:1900".parse().unwrap()),
            "M-SEARCH * HTTP/1.1\r\nST: uuid:player-1\r\nMX: 5\r\nMAN: \"ssdp:discover\"\r\nHOST: 239.255.255.250:1900\r\n\r\n"
        );
        assert!(request
            .format("[ff02::c]:1900".parse().unwrap())
            .contains("HOST: [ff02::c]:1900\r\n"));
    }
}
