//! Construction of IP packets written back into the tunnel.
//!
//! Every answer travels back along the request's flow with addresses and
//! ports swapped, so the querying app sees a reply from the address it sent
//! to. Lengths and checksums are recomputed for the new payload.

// Payloads are bounded by the tunnel MTU, so lengths always fit in u16.
#![allow(clippy::cast_possible_truncation)]

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{self, MutableIpv4Packet};
use pnet::packet::ipv6::MutableIpv6Packet;
use pnet::packet::udp::{self, MutableUdpPacket, UdpPacket};

use super::buffer::BufferPool;
use super::capture::PacketInfo;
use crate::error::{NetworkError, Result};

/// IPv4 header size in bytes (without options).
const IPV4_HEADER_SIZE: usize = 20;
/// IPv6 header size in bytes.
const IPV6_HEADER_SIZE: usize = 40;
/// UDP header size in bytes.
const UDP_HEADER_SIZE: usize = 8;
const DEFAULT_HOP_LIMIT: u8 = 64;

/// Builds response packets from a pooled scratch buffer.
#[derive(Clone, Default)]
pub struct PacketBuilder {
    buffer_pool: BufferPool,
}

impl PacketBuilder {
    pub const fn new(buffer_pool: BufferPool) -> Self {
        Self { buffer_pool }
    }

    /// Wrap `payload` in an IP/UDP packet answering the request in `request`.
    ///
    /// `request` is the addressing of the original query; the result flows
    /// from its destination back to its source.
    pub fn build_response(&self, payload: &[u8], request: &PacketInfo) -> Result<Vec<u8>> {
        match (request.source_ip, request.dest_ip) {
            (IpAddr::V4(src_ip), IpAddr::V4(dst_ip)) => {
                self.build_ipv4_response(payload, request, src_ip, dst_ip)
            }
            (IpAddr::V6(src_ip), IpAddr::V6(dst_ip)) => {
                self.build_ipv6_response(payload, request, src_ip, dst_ip)
            }
            _ => Err(NetworkError::PacketConstruction("mixed IPv4/IPv6 addresses".into()).into()),
        }
    }

    fn build_ipv4_response(
        &self,
        payload: &[u8],
        request: &PacketInfo,
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
    ) -> Result<Vec<u8>> {
        let udp_len = UDP_HEADER_SIZE + payload.len();
        let total_len = IPV4_HEADER_SIZE + udp_len;

        let mut buffer = self.buffer_pool.get_zeroed(total_len);
        let packet_data = buffer.as_mut_slice();

        {
            let mut ipv4 = MutableIpv4Packet::new(packet_data).ok_or_else(|| {
                NetworkError::PacketConstruction("IPv4 packet creation failed".into())
            })?;
            ipv4.set_version(4);
            ipv4.set_header_length(5);
            ipv4.set_total_length(total_len as u16);
            ipv4.set_ttl(DEFAULT_HOP_LIMIT);
            ipv4.set_next_level_protocol(IpNextHeaderProtocols::Udp);
            ipv4.set_source(dst_ip);
            ipv4.set_destination(src_ip);
            ipv4.set_checksum(ipv4::checksum(&ipv4.to_immutable()));
        }

        write_udp(
            &mut packet_data[IPV4_HEADER_SIZE..],
            payload,
            request,
            |datagram| udp::ipv4_checksum(datagram, &dst_ip, &src_ip),
        )?;

        Ok(buffer.to_vec())
    }

    fn build_ipv6_response(
        &self,
        payload: &[u8],
        request: &PacketInfo,
        src_ip: Ipv6Addr,
        dst_ip: Ipv6Addr,
    ) -> Result<Vec<u8>> {
        let udp_len = UDP_HEADER_SIZE + payload.len();
        let total_len = IPV6_HEADER_SIZE + udp_len;

        let mut buffer = self.buffer_pool.get_zeroed(total_len);
        let packet_data = buffer.as_mut_slice();

        {
            let mut ipv6 = MutableIpv6Packet::new(packet_data).ok_or_else(|| {
                NetworkError::PacketConstruction("IPv6 packet creation failed".into())
            })?;
            ipv6.set_version(6);
            ipv6.set_payload_length(udp_len as u16);
            ipv6.set_next_header(IpNextHeaderProtocols::Udp);
            ipv6.set_hop_limit(DEFAULT_HOP_LIMIT);
            ipv6.set_source(dst_ip);
            ipv6.set_destination(src_ip);
        }

        write_udp(
            &mut packet_data[IPV6_HEADER_SIZE..],
            payload,
            request,
            |datagram| udp::ipv6_checksum(datagram, &dst_ip, &src_ip),
        )?;

        Ok(buffer.to_vec())
    }
}

/// Fill in the UDP header and payload, then the checksum over both.
fn write_udp(
    data: &mut [u8],
    payload: &[u8],
    request: &PacketInfo,
    checksum: impl FnOnce(&UdpPacket<'_>) -> u16,
) -> Result<()> {
    {
        let mut datagram = MutableUdpPacket::new(data).ok_or_else(|| {
            NetworkError::PacketConstruction("UDP packet creation failed".into())
        })?;
        datagram.set_source(request.dest_port);
        datagram.set_destination(request.source_port);
        datagram.set_length((UDP_HEADER_SIZE + payload.len()) as u16);
        datagram.set_payload(payload);
    }

    let sum = {
        let datagram = UdpPacket::new(data)
            .ok_or_else(|| NetworkError::PacketConstruction("UDP checksum failed".into()))?;
        checksum(&datagram)
    };

    MutableUdpPacket::new(data)
        .ok_or_else(|| NetworkError::PacketConstruction("UDP checksum failed".into()))?
        .set_checksum(sum);
    Ok(())
}
