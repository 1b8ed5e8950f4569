//! The host's tunnel facility.
//!
//! The engine never talks to the operating system's VPN service directly:
//! the embedding application implements [`VpnPlatform`] and hands it over.

use std::collections::HashSet;
use std::future::Future;
use std::io;
use std::net::IpAddr;
use std::os::fd::RawFd;
use std::sync::Arc;

use crate::config::{EngineConfig, SystemAppExclusion};
use crate::network::TunnelDevice;

/// Transport class of a network.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Transport {
    Wifi,
    Cellular,
    Ethernet,
    Vpn,
    Other,
}

/// A network known to the host, as reported by its connectivity service.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NetworkInfo {
    /// Whether this is the default (active) network.
    pub active: bool,
    pub transports: Vec<Transport>,
    pub dns_servers: Vec<IpAddr>,
}

impl NetworkInfo {
    pub fn is_vpn(&self) -> bool {
        self.has_transport(Transport::Vpn)
    }

    pub fn has_transport(&self, transport: Transport) -> bool {
        self.transports.contains(&transport)
    }
}

/// An installed application.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppInfo {
    pub package: String,
    pub system: bool,
}

/// A network interface and whether it is up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InterfaceStatus {
    pub name: String,
    pub up: bool,
}

/// Keeps sockets outside the tunnel so upstream traffic is not captured.
pub trait SocketProtector: Send + Sync {
    fn protect(&self, fd: RawFd) -> io::Result<()>;
}

/// Protector for hosts where upstream sockets bypass the tunnel anyway.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopProtector;

impl SocketProtector for NoopProtector {
    fn protect(&self, _fd: RawFd) -> io::Result<()> {
        Ok(())
    }
}

/// Configuration of a tunnel about to be established.
///
/// Address additions fail when the address cannot be bound, which is how
/// the virtualizer finds a free documentation subnet.
pub trait TunnelBuilder: Send {
    type Device: TunnelDevice + 'static;

    fn add_address(&mut self, address: IpAddr, prefix: u8) -> io::Result<()>;
    fn add_route(&mut self, address: IpAddr, prefix: u8) -> io::Result<()>;
    fn add_dns_server(&mut self, address: IpAddr) -> io::Result<()>;
    fn add_disallowed_application(&mut self, package: &str) -> io::Result<()>;

    /// Bring the interface up and hand over its device.
    fn establish(self) -> io::Result<Self::Device>;
}

/// Everything the engine needs from the host.
pub trait VpnPlatform: Send + Sync + 'static {
    type Builder: TunnelBuilder;

    /// Start configuring a fresh tunnel.
    fn builder(&self) -> Self::Builder;

    /// Networks currently known to the host.
    fn networks(&self) -> Vec<NetworkInfo>;

    fn installed_applications(&self) -> Vec<AppInfo>;

    /// Packages able to handle web URLs.
    fn browser_packages(&self) -> HashSet<String>;

    /// Package of the embedding application.
    fn own_package(&self) -> String;

    fn protector(&self) -> Arc<dyn SocketProtector>;

    /// Interfaces visible on the device, for the health monitor.
    fn interfaces(&self) -> impl Future<Output = Vec<InterfaceStatus>> + Send {
        async {
            pnet::datalink::interfaces()
                .into_iter()
                .map(|iface| InterfaceStatus {
                    up: iface.is_up(),
                    name: iface.name,
                })
                .collect()
        }
    }
}

/// Packages to exclude from the tunnel.
///
/// User-excluded packages are always excluded. System applications are
/// excluded under [`SystemAppExclusion::All`], or under
/// [`SystemAppExclusion::AllExceptBrowsers`] when they are not browsers.
/// The engine's own package is never excluded.
pub fn excluded_packages(
    config: &EngineConfig,
    installed: &[AppInfo],
    browsers: &HashSet<String>,
    own_package: &str,
) -> Vec<String> {
    installed
        .iter()
        .filter(|app| app.package != own_package)
        .filter(|app| {
            if config.excluded_apps.contains(&app.package) {
                return true;
            }
            if !app.system {
                return false;
            }
            match config.excluded_system_apps {
                SystemAppExclusion::None => false,
                SystemAppExclusion::All => true,
                SystemAppExclusion::AllExceptBrowsers => !browsers.contains(&app.package),
            }
        })
        .map(|app| app.package.clone())
        .collect()
}
