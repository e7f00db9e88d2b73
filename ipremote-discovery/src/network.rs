//! Discovery networks: one multicast scope and its local interfaces
//!
//! Each network joins its group on every supporting interface and opens one
//! unicast receiver per interface address. Searches are sent from the
//! unicast receivers so responses come back to them.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use ipremote_reactor::{ChannelCallback, ChannelManager, DatagramChannel, Interface};
use tracing::{debug, warn};

use crate::error::Result;
use crate::packet::SsdpSearchRequest;

/// Non-loopback local interface addresses of the requested family
pub fn local_interfaces(ipv6: bool) -> Vec<Interface> {
    let interfaces = match local_ip_address::list_afinet_netifas() {
        Ok(interfaces) => interfaces,
        Err(e) => {
            warn!("Failed to enumerate network interfaces: {}", e);
            return Vec::new();
        }
    };

    let mut found: Vec<Interface> = Vec::new();
    for (name, address) in interfaces {
        if address.is_loopback() || address.is_ipv6() != ipv6 {
            continue;
        }
        if found.iter().any(|interface| interface.address == address) {
            continue;
        }
        let interface = match Interface::lookup(name.as_str(), address) {
            Ok(interface) => interface,
            // IPv4 memberships and binds go by address alone.
            Err(_) if !ipv6 => Interface::new(name.as_str(), address, 0),
            Err(e) => {
                warn!("Skipping {} ({}): no interface index: {}", name, address, e);
                continue;
            }
        };
        debug!(
            "Using interface {} ({}, index {})",
            interface.name, interface.address, interface.index
        );
        found.push(interface);
    }
    found
}

pub(crate) struct Network {
    group: SocketAddr,
    multigram: DatagramChannel,
    unicast: Vec<DatagramChannel>,
}

impl Network {
    /// Join `group` on `interfaces` and bind a unicast receiver on each.
    pub(crate) fn open(
        reactor: &ChannelManager,
        group: SocketAddr,
        interfaces: &[Interface],
        unicast_port: u16,
        callback: Arc<dyn ChannelCallback>,
    ) -> Result<Self> {
        let multigram = reactor.listen_multigram(group, interfaces, Arc::clone(&callback))?;

        let mut unicast = Vec::new();
        for interface in interfaces {
            let address = interface.socket_addr(unicast_port);
            match reactor.listen_datagram(address, Arc::clone(&callback)) {
                Ok(channel) => unicast.push(channel),
                Err(e) => warn!(
                    "Unable to listen on {} ({}): {}",
                    address, interface.name, e
                ),
            }
        }
        if unicast.is_empty() {
            warn!("No unicast listener for {}; searches cannot be sent", group);
        }

        debug!(
            "Opened network {} with {} unicast listener(s)",
            group,
            unicast.len()
        );
        Ok(Self {
            group,
            multigram,
            unicast,
        })
    }

    pub(crate) fn group(&self) -> SocketAddr {
        self.group
    }

    /// Send `request` from every unicast receiver. Receivers that the reactor
    /// closed as unroutable are dropped. Returns the number of sends queued.
    pub(crate) fn send(&mut self, request: &SsdpSearchRequest) -> usize {
        let message = Bytes::from(request.format(self.group));
        let group = self.group;

        self.unicast.retain(|channel| {
            if !channel.is_open() {
                debug!("Dropping closed listener {:?}", channel.local_addr());
                return false;
            }
            match channel.send(message.clone(), group) {
                Ok(()) => true,
                Err(e) => {
                    debug!("Unable to search from {:?}: {}", channel.local_addr(), e);
                    channel.close();
                    false
                }
            }
        });
        self.unicast.len()
    }

    pub(crate) fn close(&self) {
        self.multigram.close();
        for channel in &self.unicast {
            channel.close();
        }
    }
}
