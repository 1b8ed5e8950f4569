//! Upstream forwarding when the process runs out of file descriptors.
//!
//! Lowers the descriptor limit of the whole process, so it lives in its own
//! test binary.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;

use nullroute::dns::resolver::{Resolution, UpstreamQuery};
use nullroute::dns::{DnsServerMapper, UdpForwarder, UpstreamResolver};
use nullroute::network::FdDevice;
use nullroute::vpn::session::SessionState;
use nullroute::vpn::{NoopProtector, TunnelBuilder};

struct AddressOnlyBuilder;

impl TunnelBuilder for AddressOnlyBuilder {
    type Device = FdDevice;

    fn add_address(&mut self, _address: IpAddr, _prefix: u8) -> io::Result<()> {
        Ok(())
    }

    fn add_route(&mut self, _address: IpAddr, _prefix: u8) -> io::Result<()> {
        Ok(())
    }

    fn add_dns_server(&mut self, _address: IpAddr) -> io::Result<()> {
        Ok(())
    }

    fn add_disallowed_application(&mut self, _package: &str) -> io::Result<()> {
        Ok(())
    }

    fn establish(self) -> io::Result<FdDevice> {
        Err(io::ErrorKind::Unsupported.into())
    }
}

fn set_descriptor_limit(limit: &libc::rlimit) {
    assert_eq!(unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, limit) }, 0);
}

fn descriptor_limit() -> libc::rlimit {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    assert_eq!(unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) }, 0);
    limit
}

/// Open sockets until the process hits its descriptor limit.
fn exhaust_descriptors() -> Vec<UdpSocket> {
    let mut held = Vec::new();
    loop {
        match UdpSocket::bind("127.0.0.1:0") {
            Ok(socket) => held.push(socket),
            Err(e) => {
                assert_eq!(e.raw_os_error(), Some(libc::EMFILE));
                return held;
            }
        }
        assert!(held.len() < 100_000, "descriptor limit was not applied");
    }
}

#[test]
fn should_drop_query_when_no_descriptor_is_left() {
    let mapper = DnsServerMapper::configure(
        &mut AddressOnlyBuilder,
        &[IpAddr::V4(Ipv4Addr::LOCALHOST)],
        false,
    )
    .unwrap();
    let (mut session, _completions) = SessionState::new(mapper, Arc::new(NoopProtector), 4);

    let original = descriptor_limit();
    set_descriptor_limit(&libc::rlimit {
        rlim_cur: original.rlim_cur.min(64),
        rlim_max: original.rlim_max,
    });
    let held = exhaust_descriptors();

    let query = UpstreamQuery {
        server: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 53),
        payload: b"query".to_vec(),
        reply: Some(Box::new(|answer: &[u8]| -> nullroute::Result<Vec<u8>> {
            Ok(answer.to_vec())
        })),
    };
    let resolution = UdpForwarder.resolve(query, &mut session);

    drop(held);
    set_descriptor_limit(&original);

    assert_eq!(resolution.unwrap(), Resolution::Dropped);
    assert!(session.pending.is_empty());
}
