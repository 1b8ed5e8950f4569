//! Tunnel lifecycle: sessions, their event loop and everything keeping
//! them alive.

pub mod monitor;
pub mod platform;
pub mod session;
pub mod status;
pub mod throttle;
pub mod watchdog;
pub mod worker;

pub use platform::{
    AppInfo, InterfaceStatus, NetworkInfo, NoopProtector, SocketProtector, Transport,
    TunnelBuilder, VpnPlatform,
};
pub use status::{StatusListener, VpnStatus};
pub use worker::{NetworkType, VpnHandle, rules_classifier, start};
