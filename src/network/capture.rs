//! Parsing of raw IP packets read from the tunnel.
//!
//! The tunnel hands over bare IPv4 or IPv6 packets (no link layer). Only
//! UDP datagrams are of interest; everything else is dropped by the caller.

use std::net::IpAddr;

use pnet::packet::Packet;
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::udp::UdpPacket;

const UDP_HEADER_SIZE: usize = 8;

/// Addressing of a captured UDP datagram.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PacketInfo {
    pub source_ip: IpAddr,
    pub dest_ip: IpAddr,
    pub source_port: u16,
    pub dest_port: u16,
}

impl PacketInfo {
    /// The same flow seen from the other end.
    #[must_use]
    pub const fn reversed(&self) -> Self {
        Self {
            source_ip: self.dest_ip,
            dest_ip: self.source_ip,
            source_port: self.dest_port,
            dest_port: self.source_port,
        }
    }
}

/// Extract the addressing and payload of a UDP datagram.
///
/// Returns `None` when the packet:
/// - is neither IPv4 nor IPv6
/// - does not carry UDP
/// - is truncated or has an inconsistent UDP length
pub fn extract_udp_datagram(packet: &[u8]) -> Option<(PacketInfo, Vec<u8>)> {
    let version = packet.first()? >> 4;

    let (source_ip, dest_ip, transport) = match version {
        4 => {
            let ipv4 = Ipv4Packet::new(packet)?;
            if ipv4.get_next_level_protocol() != IpNextHeaderProtocols::Udp {
                return None;
            }
            (
                IpAddr::V4(ipv4.get_source()),
                IpAddr::V4(ipv4.get_destination()),
                ipv4.payload().to_vec(),
            )
        }
        6 => {
            let ipv6 = Ipv6Packet::new(packet)?;
            if ipv6.get_next_header() != IpNextHeaderProtocols::Udp {
                return None;
            }
            (
                IpAddr::V6(ipv6.get_source()),
                IpAddr::V6(ipv6.get_destination()),
                ipv6.payload().to_vec(),
            )
        }
        _ => return None,
    };

    let udp = UdpPacket::new(&transport)?;
    let udp_len = usize::from(udp.get_length());
    if udp_len < UDP_HEADER_SIZE || udp_len > transport.len() {
        return None;
    }

    let info = PacketInfo {
        source_ip,
        dest_ip,
        source_port: udp.get_source(),
        dest_port: udp.get_destination(),
    };

    Some((info, transport[UDP_HEADER_SIZE..udp_len].to_vec()))
}
