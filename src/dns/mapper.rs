//! Virtualization of upstream DNS server addresses.
//!
//! The tunnel advertises synthetic DNS servers taken from documentation
//! subnets. Each real server gets the next free address in the subnet of
//! its family; queries sent to a synthetic address are forwarded to the
//! real server behind it.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use tracing::{debug, info, warn};

use crate::error::{ConfigError, Result};
use crate::vpn::platform::{NetworkInfo, Transport, TunnelBuilder};

/// RFC 5737 blocks tried in order for the IPv4 side of the tunnel.
const IPV4_CANDIDATES: [[u8; 3]; 3] = [[192, 0, 2], [198, 51, 100], [203, 0, 113]];

/// RFC 3849 documentation prefix, narrowed to a /120.
const IPV6_BASE: Ipv6Addr = Ipv6Addr::new(0x2001, 0x0db8, 0, 0, 0, 0, 0, 0);
const IPV6_PREFIX: u8 = 120;
const IPV4_PREFIX: u8 = 24;

/// Servers per family: synthetic last octets run from 2 to 255.
pub const MAX_SERVERS_PER_FAMILY: usize = 254;

/// Used as watchdog target when no server could be mapped.
const FALLBACK_SERVER: IpAddr = IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1));

/// A synthetic subnet owned by the tunnel interface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Subnet {
    pub base: IpAddr,
    pub prefix: u8,
}

impl Subnet {
    /// Address of the subnet with its last octet replaced.
    pub fn host(&self, last_octet: u8) -> IpAddr {
        match self.base {
            IpAddr::V4(base) => {
                let mut octets = base.octets();
                octets[3] = last_octet;
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            IpAddr::V6(base) => {
                let mut octets = base.octets();
                octets[15] = last_octet;
                IpAddr::V6(Ipv6Addr::from(octets))
            }
        }
    }

    /// Whether `address` differs from the base only in its last octet.
    pub fn contains(&self, address: IpAddr) -> bool {
        match (self.base, address) {
            (IpAddr::V4(base), IpAddr::V4(addr)) => base.octets()[..3] == addr.octets()[..3],
            (IpAddr::V6(base), IpAddr::V6(addr)) => base.octets()[..15] == addr.octets()[..15],
            _ => false,
        }
    }
}

/// Mapping between synthetic and real DNS servers for one tunnel session.
#[derive(Clone, Debug)]
pub struct DnsServerMapper {
    ipv4_subnet: Subnet,
    ipv6_subnet: Option<Subnet>,
    ipv4_servers: Vec<IpAddr>,
    ipv6_servers: Vec<IpAddr>,
    /// Last mapped server, as (real, synthetic).
    default: Option<(IpAddr, IpAddr)>,
}

impl DnsServerMapper {
    /// Claim the synthetic subnets on `builder` and map every server.
    ///
    /// Fails with [`ConfigError::NoIpv4Subnet`] when none of the IPv4
    /// candidate blocks can be bound.
    pub fn configure<B: TunnelBuilder>(
        builder: &mut B,
        servers: &[IpAddr],
        ipv6_enabled: bool,
    ) -> Result<Self> {
        let ipv4_subnet = claim_ipv4_subnet(builder)?;

        let has_ipv6_server = servers.iter().any(IpAddr::is_ipv6);
        let ipv6_subnet = if has_ipv6_server && (ipv6_enabled || servers.len() == 1) {
            claim_ipv6_subnet(builder)
        } else {
            None
        };

        let mut mapper = Self {
            ipv4_subnet,
            ipv6_subnet,
            ipv4_servers: Vec::new(),
            ipv6_servers: Vec::new(),
            default: None,
        };

        for &server in servers {
            mapper.add_server(builder, server)?;
        }

        info!(
            ipv4 = mapper.ipv4_servers.len(),
            ipv6 = mapper.ipv6_servers.len(),
            subnet = %mapper.ipv4_subnet.base,
            "Mapped upstream DNS servers"
        );
        Ok(mapper)
    }

    fn add_server<B: TunnelBuilder>(&mut self, builder: &mut B, server: IpAddr) -> Result<()> {
        let (subnet, list, host_prefix) = match server {
            IpAddr::V4(_) => (Some(self.ipv4_subnet), &mut self.ipv4_servers, 32),
            IpAddr::V6(_) => (self.ipv6_subnet, &mut self.ipv6_servers, 128),
        };
        let Some(subnet) = subnet else {
            debug!(server = %server, "No synthetic subnet for server family, skipping");
            return Ok(());
        };
        if list.len() >= MAX_SERVERS_PER_FAMILY {
            warn!(server = %server, "Synthetic subnet full, skipping server");
            return Ok(());
        }

        list.push(server);
        // Index is 1-based and the interface itself holds .1.
        let Ok(last_octet) = u8::try_from(list.len() + 1) else {
            return Ok(());
        };
        let synthetic = subnet.host(last_octet);

        builder.add_dns_server(synthetic)?;
        builder.add_route(synthetic, host_prefix)?;
        self.default = Some((server, synthetic));
        debug!(server = %server, synthetic = %synthetic, "Mapped DNS server");
        Ok(())
    }

    /// The real server behind a synthetic address.
    pub fn reverse_lookup(&self, synthetic: IpAddr) -> Option<IpAddr> {
        let (subnet, list, last_octet) = match synthetic {
            IpAddr::V4(addr) => (Some(self.ipv4_subnet), &self.ipv4_servers, addr.octets()[3]),
            IpAddr::V6(addr) => (self.ipv6_subnet, &self.ipv6_servers, addr.octets()[15]),
        };
        let subnet = subnet?;
        if !subnet.contains(synthetic) {
            return None;
        }
        let index = usize::from(last_octet).checked_sub(2)?;
        list.get(index).copied()
    }

    /// The synthetic addresses advertised to the tunnel, IPv4 first.
    pub fn synthetic_servers(&self) -> Vec<IpAddr> {
        let ipv4 = (0..self.ipv4_servers.len()).map(|index| synthetic_host(self.ipv4_subnet, index));
        let ipv6 = self
            .ipv6_subnet
            .into_iter()
            .flat_map(|subnet| (0..self.ipv6_servers.len()).map(move |index| synthetic_host(subnet, index)));
        ipv4.chain(ipv6).collect()
    }

    /// Subnets claimed on the interface.
    pub const fn subnets(&self) -> (Subnet, Option<Subnet>) {
        (self.ipv4_subnet, self.ipv6_subnet)
    }

    /// Real address of the server the watchdog guards: the last one mapped.
    pub fn default_server(&self) -> IpAddr {
        self.default.map_or(FALLBACK_SERVER, |(real, _)| real)
    }

    /// Where watchdog probes are sent.
    ///
    /// Probes go to the synthetic address of the default server so they
    /// travel through the tunnel; without any mapping the fallback server
    /// is probed directly.
    pub fn probe_target(&self) -> IpAddr {
        self.default.map_or(FALLBACK_SERVER, |(_, synthetic)| synthetic)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn synthetic_host(subnet: Subnet, index: usize) -> IpAddr {
    subnet.host((index + 2) as u8)
}

fn claim_ipv4_subnet<B: TunnelBuilder>(builder: &mut B) -> Result<Subnet> {
    for [a, b, c] in IPV4_CANDIDATES {
        let subnet = Subnet {
            base: IpAddr::V4(Ipv4Addr::new(a, b, c, 0)),
            prefix: IPV4_PREFIX,
        };
        match builder.add_address(subnet.host(1), subnet.prefix) {
            Ok(()) => return Ok(subnet),
            Err(e) => debug!(subnet = %subnet.base, error = %e, "Subnet unavailable, trying next"),
        }
    }
    Err(ConfigError::NoIpv4Subnet.into())
}

fn claim_ipv6_subnet<B: TunnelBuilder>(builder: &mut B) -> Option<Subnet> {
    let subnet = Subnet {
        base: IpAddr::V6(IPV6_BASE),
        prefix: IPV6_PREFIX,
    };
    match builder.add_address(subnet.host(1), subnet.prefix) {
        Ok(()) => Some(subnet),
        Err(e) => {
            warn!(error = %e, "Cannot add IPv6 address to tunnel, IPv6 DNS disabled");
            None
        }
    }
}

/// Pick the upstream DNS servers from the networks known to the host.
///
/// The active network's servers win when it is not a VPN. Without a usable
/// active network, the first non-VPN network carrying servers is used.
/// When the active network is a VPN (possibly ours), only a non-VPN network
/// of its transport is considered; cellular wins over Wi-Fi when the VPN
/// reports both.
pub fn discover_dns_servers(networks: &[NetworkInfo]) -> Vec<IpAddr> {
    let Some(active) = networks.iter().find(|network| network.active) else {
        return first_non_vpn_servers(networks);
    };

    if !active.is_vpn() {
        if active.dns_servers.is_empty() {
            return first_non_vpn_servers(networks);
        }
        return active.dns_servers.clone();
    }

    let Some(transport) = [Transport::Cellular, Transport::Wifi]
        .into_iter()
        .find(|transport| active.has_transport(*transport))
    else {
        return Vec::new();
    };
    networks
        .iter()
        .find(|network| {
            !network.is_vpn() && network.has_transport(transport) && !network.dns_servers.is_empty()
        })
        .map(|network| network.dns_servers.clone())
        .unwrap_or_default()
}

fn first_non_vpn_servers(networks: &[NetworkInfo]) -> Vec<IpAddr> {
    networks
        .iter()
        .find(|network| !network.is_vpn() && !network.dns_servers.is_empty())
        .map(|network| network.dns_servers.clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vpn::platform::tests::MockBuilder;

    fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    fn v6(last: u16) -> IpAddr {
        IpAddr::V6(Ipv6Addr::new(0x2606, 0x4700, 0, 0, 0, 0, 0, last))
    }

    #[test]
    fn should_claim_first_free_ipv4_block() {
        let mut builder = MockBuilder::default();
        let mapper = DnsServerMapper::configure(&mut builder, &[v4(8, 8, 8, 8)], false).unwrap();

        assert_eq!(mapper.subnets().0.base, v4(192, 0, 2, 0));
        assert_eq!(builder.log.lock().addresses, vec![(v4(192, 0, 2, 1), 24)]);
    }

    #[test]
    fn should_fall_back_to_next_block_when_taken() {
        let mut builder = MockBuilder {
            taken: vec![v4(192, 0, 2, 1), v4(198, 51, 100, 1)],
            ..MockBuilder::default()
        };
        let mapper = DnsServerMapper::configure(&mut builder, &[v4(8, 8, 8, 8)], false).unwrap();

        assert_eq!(mapper.subnets().0.base, v4(203, 0, 113, 0));
        assert_eq!(mapper.reverse_lookup(v4(203, 0, 113, 2)), Some(v4(8, 8, 8, 8)));
    }

    #[test]
    fn should_fail_when_every_block_is_taken() {
        let mut builder = MockBuilder {
            taken: vec![v4(192, 0, 2, 1), v4(198, 51, 100, 1), v4(203, 0, 113, 1)],
            ..MockBuilder::default()
        };
        let result = DnsServerMapper::configure(&mut builder, &[v4(8, 8, 8, 8)], false);

        assert!(matches!(
            result,
            Err(crate::Error::Config(ConfigError::NoIpv4Subnet))
        ));
    }

    #[test]
    fn should_advertise_synthetic_servers_with_host_routes() {
        let mut builder = MockBuilder::default();
        let servers = [v4(8, 8, 8, 8), v4(8, 8, 4, 4)];
        let mapper = DnsServerMapper::configure(&mut builder, &servers, false).unwrap();

        let log = builder.log.lock();
        assert_eq!(log.dns_servers, vec![v4(192, 0, 2, 2), v4(192, 0, 2, 3)]);
        assert_eq!(log.routes, vec![(v4(192, 0, 2, 2), 32), (v4(192, 0, 2, 3), 32)]);
        assert_eq!(mapper.synthetic_servers(), log.dns_servers);
    }

    #[test]
    fn should_recover_every_server_up_to_subnet_capacity() {
        for count in 1..=MAX_SERVERS_PER_FAMILY {
            let servers: Vec<IpAddr> = (0..count)
                .map(|i| v4(10, (i / 250) as u8, (i % 250) as u8, 53))
                .collect();
            let mut builder = MockBuilder::default();
            let mapper = DnsServerMapper::configure(&mut builder, &servers, false).unwrap();

            let synthetic = mapper.synthetic_servers();
            assert_eq!(synthetic.len(), count);
            for (index, address) in synthetic.iter().enumerate() {
                assert_eq!(mapper.reverse_lookup(*address), Some(servers[index]));
            }
        }
    }

    #[test]
    fn should_ignore_servers_beyond_capacity() {
        let servers: Vec<IpAddr> = (0..300).map(|i| v4(10, 0, (i / 256) as u8, (i % 256) as u8)).collect();
        let mut builder = MockBuilder::default();
        let mapper = DnsServerMapper::configure(&mut builder, &servers, false).unwrap();

        assert_eq!(mapper.synthetic_servers().len(), MAX_SERVERS_PER_FAMILY);
        assert_eq!(mapper.reverse_lookup(v4(192, 0, 2, 255)), Some(servers[253]));
    }

    #[test]
    fn should_not_match_out_of_range_or_foreign_addresses() {
        let mut builder = MockBuilder::default();
        let mapper = DnsServerMapper::configure(&mut builder, &[v4(8, 8, 8, 8)], false).unwrap();

        assert_eq!(mapper.reverse_lookup(v4(192, 0, 2, 1)), None);
        assert_eq!(mapper.reverse_lookup(v4(192, 0, 2, 0)), None);
        assert_eq!(mapper.reverse_lookup(v4(192, 0, 2, 3)), None);
        assert_eq!(mapper.reverse_lookup(v4(10, 0, 0, 2)), None);
        assert_eq!(mapper.reverse_lookup(IpAddr::V6(Ipv6Addr::LOCALHOST)), None);
    }

    #[test]
    fn should_index_families_independently() {
        let mut builder = MockBuilder::default();
        let servers = [v4(1, 1, 1, 1), v6(0x1111), v4(1, 0, 0, 1), v6(0x1001)];
        let mapper = DnsServerMapper::configure(&mut builder, &servers, true).unwrap();

        let synthetic_v6 = |last: u8| {
            let mut octets = IPV6_BASE.octets();
            octets[15] = last;
            IpAddr::V6(Ipv6Addr::from(octets))
        };

        assert_eq!(mapper.reverse_lookup(v4(192, 0, 2, 2)), Some(servers[0]));
        assert_eq!(mapper.reverse_lookup(v4(192, 0, 2, 3)), Some(servers[2]));
        assert_eq!(mapper.reverse_lookup(synthetic_v6(2)), Some(servers[1]));
        assert_eq!(mapper.reverse_lookup(synthetic_v6(3)), Some(servers[3]));
        assert_eq!(builder.log.lock().addresses.len(), 2);
        assert!(builder.log.lock().routes.contains(&(synthetic_v6(2), 128)));
    }

    #[test]
    fn should_skip_ipv6_when_disabled_with_several_servers() {
        let mut builder = MockBuilder::default();
        let servers = [v4(1, 1, 1, 1), v6(0x1111)];
        let mapper = DnsServerMapper::configure(&mut builder, &servers, false).unwrap();

        assert_eq!(mapper.subnets().1, None);
        assert_eq!(mapper.synthetic_servers(), vec![v4(192, 0, 2, 2)]);
    }

    #[test]
    fn should_map_lone_ipv6_server_even_when_disabled() {
        let mut builder = MockBuilder::default();
        let mapper = DnsServerMapper::configure(&mut builder, &[v6(0x1111)], false).unwrap();

        let (ipv4, ipv6) = mapper.subnets();
        assert_eq!(ipv4.base, v4(192, 0, 2, 0));
        assert_eq!(ipv6.map(|subnet| subnet.prefix), Some(120));
        assert_eq!(mapper.synthetic_servers().len(), 1);
    }

    #[test]
    fn should_use_last_mapped_server_as_default() {
        let mut builder = MockBuilder::default();
        let mapper =
            DnsServerMapper::configure(&mut builder, &[v4(8, 8, 8, 8), v4(9, 9, 9, 9)], false)
                .unwrap();
        assert_eq!(mapper.default_server(), v4(9, 9, 9, 9));
        assert_eq!(mapper.probe_target(), v4(192, 0, 2, 3));

        let empty = DnsServerMapper::configure(&mut MockBuilder::default(), &[], false).unwrap();
        assert_eq!(empty.default_server(), FALLBACK_SERVER);
        assert_eq!(empty.probe_target(), FALLBACK_SERVER);
    }

    fn network(active: bool, transports: &[Transport], dns: &[IpAddr]) -> NetworkInfo {
        NetworkInfo {
            active,
            transports: transports.to_vec(),
            dns_servers: dns.to_vec(),
        }
    }

    #[test]
    fn should_prefer_active_network_servers() {
        let networks = [
            network(false, &[Transport::Cellular], &[v4(10, 0, 0, 1)]),
            network(true, &[Transport::Wifi], &[v4(192, 168, 1, 1)]),
        ];
        assert_eq!(discover_dns_servers(&networks), vec![v4(192, 168, 1, 1)]);
    }

    #[test]
    fn should_match_transport_when_active_network_is_vpn() {
        let networks = [
            network(true, &[Transport::Vpn, Transport::Wifi], &[v4(192, 0, 2, 2)]),
            network(false, &[Transport::Cellular], &[v4(10, 0, 0, 1)]),
            network(false, &[Transport::Wifi], &[v4(192, 168, 1, 1)]),
        ];
        assert_eq!(discover_dns_servers(&networks), vec![v4(192, 168, 1, 1)]);
    }

    #[test]
    fn should_only_consider_one_transport_behind_vpn() {
        let cellular_vpn = [
            network(true, &[Transport::Vpn, Transport::Cellular], &[v4(192, 0, 2, 2)]),
            network(false, &[Transport::Wifi], &[v4(192, 168, 1, 1)]),
        ];
        assert!(discover_dns_servers(&cellular_vpn).is_empty());

        let both = [
            network(true, &[Transport::Vpn, Transport::Wifi, Transport::Cellular], &[]),
            network(false, &[Transport::Wifi], &[v4(192, 168, 1, 1)]),
            network(false, &[Transport::Cellular], &[v4(10, 0, 0, 1)]),
        ];
        assert_eq!(discover_dns_servers(&both), vec![v4(10, 0, 0, 1)]);
    }

    #[test]
    fn should_fall_back_when_active_network_has_no_servers() {
        let networks = [
            network(false, &[Transport::Vpn], &[v4(192, 0, 2, 2)]),
            network(true, &[Transport::Wifi], &[]),
            network(false, &[Transport::Cellular], &[v4(10, 0, 0, 1)]),
        ];
        assert_eq!(discover_dns_servers(&networks), vec![v4(10, 0, 0, 1)]);
    }

    #[test]
    fn should_fall_back_to_first_non_vpn_network() {
        let networks = [
            network(false, &[Transport::Vpn], &[v4(192, 0, 2, 2)]),
            network(false, &[Transport::Ethernet], &[]),
            network(false, &[Transport::Cellular], &[v4(10, 0, 0, 1)]),
        ];
        assert_eq!(discover_dns_servers(&networks), vec![v4(10, 0, 0, 1)]);
        assert!(discover_dns_servers(&[]).is_empty());
    }
}
