//! Local network interfaces as the socket layer needs them

use std::io;
use std::net::{IpAddr, SocketAddr, SocketAddrV6};

/// One address of a local interface, with the OS index IPv6 memberships and
/// link-local binds are made by.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Interface {
    pub name: String,
    pub address: IpAddr,
    pub index: u32,
}

impl Interface {
    pub fn new(name: impl Into<String>, address: IpAddr, index: u32) -> Self {
        Self {
            name: name.into(),
            address,
            index,
        }
    }

    /// Look up the index of interface `name`.
    pub fn lookup(name: impl Into<String>, address: IpAddr) -> io::Result<Self> {
        let name = name.into();
        let index = interface_index(&name)?;
        Ok(Self::new(name, address, index))
    }

    pub fn is_ipv6(&self) -> bool {
        self.address.is_ipv6()
    }

    /// `address:port`, scoped to this interface when the address is IPv6
    /// link-local.
    pub fn socket_addr(&self, port: u16) -> SocketAddr {
        match self.address {
            IpAddr::V6(address) if is_link_local(&address.segments()) => {
                SocketAddr::V6(SocketAddrV6::new(address, port, 0, self.index))
            }
            address => SocketAddr::new(address, port),
        }
    }
}

// fe80::/10
fn is_link_local(segments: &[u16; 8]) -> bool {
    segments[0] & 0xffc0 == 0xfe80
}

#[cfg(unix)]
fn interface_index(name: &str) -> io::Result<u32> {
    let c_name = std::ffi::CString::new(name)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid interface name"))?;

    // SAFETY: c_name is a valid NUL-terminated string that outlives the call;
    // if_nametoindex only reads it and returns 0 on failure.
    let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    if index == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(index)
}

#[cfg(not(unix))]
fn interface_index(_name: &str) -> io::Result<u32> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "interface indexes are not available on this platform",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_link_local_address_is_scoped() {
        let interface = Interface::new("eth0", "fe80::1c2d:3e4f:5a6b:7c8d".parse().unwrap(), 3);

        match interface.socket_addr(8008) {
            SocketAddr::V6(address) => {
                assert_eq!(address.scope_id(), 3);
                assert_eq!(address.port(), 8008);
            }
            other => panic!("expected IPv6, got {}", other),
        }
    }

    #[test]
    fn test_other_addresses_are_unscoped() {
        let global = Interface::new("eth0", "2001:db8::5".parse().unwrap(), 3);
        let SocketAddr::V6(address) = global.socket_addr(8008) else {
            panic!("expected IPv6");
        };
        assert_eq!(address.scope_id(), 0);

        let v4 = Interface::new("eth0", IpAddr::V4(Ipv4Addr::new(192, 168, 1, 2)), 3);
        assert_eq!(v4.socket_addr(8008), "192.168.1.2:8008".parse().unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn test_unknown_interface_has_no_index() {
        let result = Interface::lookup("no-such-if0", IpAddr::V6(Ipv6Addr::LOCALHOST));
        assert!(result.is_err());
    }
}
