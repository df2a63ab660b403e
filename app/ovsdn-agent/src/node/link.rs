use std::net::{IpAddr, Ipv4Addr};

use futures::TryStreamExt;
use ipnet::Ipv4Net;
use log::debug;
use netlink_packet_route::{
    address::nlas::Nla as AddressNla, link::nlas::Nla as LinkNla, AddressMessage, AF_INET,
};
use nix::errno::Errno;
use tokio::task::JoinHandle;

use super::NodeError;

/// Longest address label the kernel accepts.
const MAX_ADDRESS_LABEL: usize = 15;

/// Label suffix discriminating the egress addresses this process owns from
/// anything an administrator put on the link.
const EGRESS_LABEL_SUFFIX: &str = ":eip";

/// The label all egress addresses on the link carry. A label must start with
/// the link name plus ":" and fit in 15 characters; a link name too long to
/// satisfy that leaves egress IPs unusable on this node.
pub fn egress_ip_label(link_name: &str) -> Result<String, NodeError> {
    let label = format!("{link_name}{EGRESS_LABEL_SUFFIX}");
    if label.len() > MAX_ADDRESS_LABEL {
        return Err(NodeError::LinkNameTooLong(link_name.to_owned()));
    }
    Ok(label)
}

#[derive(Debug, Clone)]
pub struct EgressLink {
    pub index: u32,
    pub name: String,
    pub network: Ipv4Net,
}

/// Persistent rtnetlink handle for all egress-link address operations.
pub struct NetlinkHandle {
    handle: rtnetlink::Handle,
    // keeps the connection task alive
    _conn_task: JoinHandle<()>,
}

impl NetlinkHandle {
    pub fn new() -> Result<Self, NodeError> {
        let (conn, handle, _) = rtnetlink::new_connection().map_err(NodeError::NetlinkConnection)?;
        let conn_task = tokio::spawn(conn);
        Ok(Self {
            handle,
            _conn_task: conn_task,
        })
    }

    /// Finds the interface carrying the node's primary IP. Egress IPs are
    /// hosted on that same link, inside its network.
    pub async fn egress_link(&self, local_ip: Ipv4Addr) -> Result<EgressLink, NodeError> {
        let mut addresses = self.handle.address().get().execute();
        let mut found = None;
        while let Some(message) = addresses.try_next().await? {
            if u16::from(message.header.family) != AF_INET {
                continue;
            }
            if message_address(&message) == Some(local_ip) {
                found = Some((message.header.index, message.header.prefix_len));
                break;
            }
        }
        let Some((index, prefix_len)) = found else {
            return Err(NodeError::EgressLinkNotFound(local_ip));
        };

        let name = self.link_name(index).await?;
        let network = Ipv4Net::new(local_ip, prefix_len)
            .map_err(|_| NodeError::EgressLinkNotFound(local_ip))?;

        Ok(EgressLink {
            index,
            name,
            network,
        })
    }

    async fn link_name(&self, index: u32) -> Result<String, NodeError> {
        let mut links = self.handle.link().get().match_index(index).execute();
        while let Some(message) = links.try_next().await? {
            for nla in message.nlas {
                if let LinkNla::IfName(name) = nla {
                    return Ok(name);
                }
            }
        }
        Err(NodeError::LinkNotFound(index))
    }

    /// Adds the egress address under the owning label. The address already
    /// being present is fine.
    pub async fn add_labeled_address(
        &self,
        link: &EgressLink,
        ip: Ipv4Addr,
        label: &str,
    ) -> Result<(), NodeError> {
        let mut request =
            self.handle
                .address()
                .add(link.index, IpAddr::V4(ip), link.network.prefix_len());
        request
            .message_mut()
            .nlas
            .push(AddressNla::Label(label.to_owned()));
        match request.execute().await {
            Ok(()) => Ok(()),
            Err(error) if netlink_errno(&error) == Some(Errno::EEXIST as i32) => {
                debug!("Egress IP {ip} already exists on {}", link.name);
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Removes the egress address. The address already being gone is fine.
    pub async fn delete_address(&self, link: &EgressLink, ip: Ipv4Addr) -> Result<(), NodeError> {
        let message = self
            .link_addresses(link)
            .await?
            .into_iter()
            .find(|message| message_address(message) == Some(ip));
        match message {
            Some(message) => self.delete_address_message(message).await,
            None => {
                debug!("Couldn't delete egress IP {ip} from {}: no such address", link.name);
                Ok(())
            }
        }
    }

    pub async fn delete_address_message(&self, message: AddressMessage) -> Result<(), NodeError> {
        match self.handle.address().del(message).execute().await {
            Ok(()) => Ok(()),
            Err(error) if netlink_errno(&error) == Some(Errno::EADDRNOTAVAIL as i32) => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    /// IPv4 addresses on the link carrying the given label.
    pub async fn labeled_addresses(
        &self,
        link: &EgressLink,
        label: &str,
    ) -> Result<Vec<(Ipv4Addr, AddressMessage)>, NodeError> {
        Ok(self
            .link_addresses(link)
            .await?
            .into_iter()
            .filter_map(|message| {
                let labeled = message
                    .nlas
                    .iter()
                    .any(|nla| matches!(nla, AddressNla::Label(existing) if existing == label));
                let address = message_address(&message)?;
                labeled.then_some((address, message))
            })
            .collect())
    }

    async fn link_addresses(&self, link: &EgressLink) -> Result<Vec<AddressMessage>, NodeError> {
        let mut stream = self
            .handle
            .address()
            .get()
            .set_link_index_filter(link.index)
            .execute();
        let mut messages = Vec::new();
        while let Some(message) = stream.try_next().await? {
            if u16::from(message.header.family) == AF_INET {
                messages.push(message);
            }
        }
        Ok(messages)
    }
}

fn message_address(message: &AddressMessage) -> Option<Ipv4Addr> {
    let mut fallback = None;
    for nla in &message.nlas {
        match nla {
            // IFA_LOCAL is the interface's own address; IFA_ADDRESS may be
            // the peer on point-to-point links
            AddressNla::Local(bytes) => {
                if let Ok(octets) = <[u8; 4]>::try_from(bytes.as_slice()) {
                    return Some(Ipv4Addr::from(octets));
                }
            }
            AddressNla::Address(bytes) => {
                if let Ok(octets) = <[u8; 4]>::try_from(bytes.as_slice()) {
                    fallback = Some(Ipv4Addr::from(octets));
                }
            }
            _ => {}
        }
    }
    fallback
}

fn netlink_errno(error: &rtnetlink::Error) -> Option<i32> {
    match error {
        rtnetlink::Error::NetlinkError(message) => message.code.map(|code| -code.get()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn egress_label_is_link_name_plus_suffix() {
        assert_eq!(egress_ip_label("eth0").unwrap(), "eth0:eip");
        // 11 characters leaves exactly 15 with the suffix
        assert_eq!(egress_ip_label("abcdefghijk").unwrap(), "abcdefghijk:eip");
    }

    #[test]
    fn too_long_link_names_disable_egress_labels() {
        // 12 characters would need a 16-character label
        assert!(matches!(
            egress_ip_label("abcdefghijkl"),
            Err(NodeError::LinkNameTooLong(_))
        ));
    }
}
