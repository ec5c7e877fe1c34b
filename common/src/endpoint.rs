//! Peer endpoints and network groups.
//!
//! An [`Endpoint`] is a peer's network address together with the services
//! it advertises and the time at which it was last advertised. Endpoints
//! are stored and serialized in 16-byte IPv6-mapped form, IPv4 included.
//!
//! The [`group`] of an endpoint is the canonical network prefix used to
//! disperse addresses under adversarial control: an attacker who owns a
//! single netblock maps to a single group, no matter how many addresses
//! they advertise.
use std::io;
use std::net;

use bitcoin::consensus::{encode, Decodable, Encodable};
use bitcoin::network::constants::ServiceFlags;

use crate::time::Timestamp;

/// Address class prefix for IPv4 groups.
const CLASS_IPV4: u8 = 1;
/// Address class prefix for IPv6 groups.
const CLASS_IPV6: u8 = 2;

/// A peer network endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Seconds since epoch at which this endpoint was last advertised.
    pub time: Timestamp,
    /// Services advertised by the peer.
    pub services: ServiceFlags,
    /// IP address.
    pub ip: net::IpAddr,
    /// TCP port.
    pub port: u16,
}

impl Endpoint {
    /// Create a new endpoint.
    pub fn new(ip: impl Into<net::IpAddr>, port: u16, services: ServiceFlags, time: Timestamp) -> Self {
        Self {
            time,
            services,
            ip: ip.into(),
            port,
        }
    }

    /// The socket address of this endpoint.
    pub fn socket_addr(&self) -> net::SocketAddr {
        net::SocketAddr::new(self.ip, self.port)
    }
}

impl From<net::SocketAddr> for Endpoint {
    fn from(addr: net::SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port(), ServiceFlags::NONE, 0)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

/// The fixed 30-byte binary endpoint layout: `u32` time, `u64` services,
/// 16-byte IPv6-mapped address, `u16` port. All integers little-endian.
impl Encodable for Endpoint {
    fn consensus_encode<W: io::Write>(&self, mut e: W) -> Result<usize, io::Error> {
        let mut len = 0;

        len += self.time.consensus_encode(&mut e)?;
        len += self.services.as_u64().consensus_encode(&mut e)?;
        len += to_mapped(&self.ip).consensus_encode(&mut e)?;
        len += self.port.consensus_encode(&mut e)?;

        Ok(len)
    }
}

impl Decodable for Endpoint {
    fn consensus_decode<D: io::Read>(mut d: D) -> Result<Self, encode::Error> {
        let time = Timestamp::consensus_decode(&mut d)?;
        let services = ServiceFlags::from(u64::consensus_decode(&mut d)?);
        let ip = from_mapped(<[u8; 16]>::consensus_decode(&mut d)?);
        let port = u16::consensus_decode(&mut d)?;

        Ok(Self {
            time,
            services,
            ip,
            port,
        })
    }
}

/// Return the 16-byte IPv6-mapped form of an address.
pub fn to_mapped(ip: &net::IpAddr) -> [u8; 16] {
    match ip {
        net::IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        net::IpAddr::V6(v6) => v6.octets(),
    }
}

/// Reconstruct an address from its 16-byte IPv6-mapped form. Mapped IPv4
/// addresses come back in canonical [`net::IpAddr::V4`] form.
pub fn from_mapped(octets: [u8; 16]) -> net::IpAddr {
    if octets[..10] == [0; 10] && octets[10..12] == [0xff, 0xff] {
        net::IpAddr::V4(net::Ipv4Addr::new(
            octets[12], octets[13], octets[14], octets[15],
        ))
    } else {
        net::IpAddr::V6(net::Ipv6Addr::from(octets))
    }
}

/// Get the canonical group of an address: a class byte followed by the
/// network prefix addresses are dispersed over.
///
/// * IPv4: the /16.
/// * IPv6 tunnels carrying an IPv4 address (6to4 `2002::/16`, Teredo
///   `2001::/32`): the embedded IPv4's /16.
/// * Hurricane Electric `2001:470::/30`: the /36, since HE hands out /48s
///   liberally.
/// * Other IPv6: the /32.
pub fn group(ip: &net::IpAddr) -> Vec<u8> {
    match ip {
        net::IpAddr::V4(v4) => ipv4_group(v4),
        net::IpAddr::V6(v6) => {
            if let Some(v4) = tunneled_ipv4(v6) {
                return ipv4_group(&v4);
            }
            let o = v6.octets();

            if o[0] == 0x20 && o[1] == 0x01 && o[2] == 0x04 && o[3] & 0xfc == 0x70 {
                vec![CLASS_IPV6, o[0], o[1], o[2], o[3], o[4] & 0xf0]
            } else {
                vec![CLASS_IPV6, o[0], o[1], o[2], o[3]]
            }
        }
    }
}

fn ipv4_group(ip: &net::Ipv4Addr) -> Vec<u8> {
    let o = ip.octets();

    vec![CLASS_IPV4, o[0], o[1]]
}

/// Extract the IPv4 address carried by a tunneled IPv6 address, if any.
fn tunneled_ipv4(ip: &net::Ipv6Addr) -> Option<net::Ipv4Addr> {
    let o = ip.octets();

    // 6to4: the IPv4 address follows the `2002::/16` prefix.
    if o[0] == 0x20 && o[1] == 0x02 {
        return Some(net::Ipv4Addr::new(o[2], o[3], o[4], o[5]));
    }
    // Teredo: the client's external IPv4 address is stored inverted in the
    // last four bytes.
    if o[..4] == [0x20, 0x01, 0x00, 0x00] {
        return Some(net::Ipv4Addr::new(
            !o[12], !o[13], !o[14], !o[15],
        ));
    }
    None
}

/// Check whether an IP address is globally routable.
pub fn is_routable(addr: &net::IpAddr) -> bool {
    if is_local(addr) {
        return false;
    }
    match addr {
        net::IpAddr::V4(addr) => ipv4_is_routable(addr),
        net::IpAddr::V6(addr) => ipv6_is_routable(addr),
    }
}

/// Check whether an IP address is locally routable.
pub fn is_local(addr: &net::IpAddr) -> bool {
    match addr {
        net::IpAddr::V4(addr) => {
            addr.is_private() || addr.is_loopback() || addr.is_link_local() || addr.is_unspecified()
        }
        net::IpAddr::V6(addr) => addr.is_loopback() || addr.is_unspecified(),
    }
}

/// Check whether an IPv4 address is globally routable.
///
/// This code is adapted from the Rust standard library's
/// `net::Ipv4Addr::is_global`. It can be replaced once that function is
/// stabilized.
fn ipv4_is_routable(addr: &net::Ipv4Addr) -> bool {
    // Check if this address is 192.0.0.9 or 192.0.0.10. These addresses are the only two
    // globally routable addresses in the 192.0.0.0/24 range.
    if u32::from(*addr) == 0xc0000009 || u32::from(*addr) == 0xc000000a {
        return true;
    }
    !addr.is_private()
        && !addr.is_loopback()
        && !addr.is_link_local()
        && !addr.is_broadcast()
        && !addr.is_documentation()
        // Make sure the address is not in 0.0.0.0/8.
        && addr.octets()[0] != 0
}

/// Check whether an IPv6 address is globally routable.
fn ipv6_is_routable(addr: &net::Ipv6Addr) -> bool {
    let o = addr.octets();

    // Link-local `fe80::/10`.
    if o[0] == 0xfe && o[1] & 0xc0 == 0x80 {
        return false;
    }
    // Unique-local `fc00::/7`.
    if o[0] & 0xfe == 0xfc {
        return false;
    }
    // Documentation `2001:db8::/32`.
    if o[..4] == [0x20, 0x01, 0x0d, 0xb8] {
        return false;
    }
    true
}
