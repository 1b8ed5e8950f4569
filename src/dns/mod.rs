//! DNS handling: classification, server virtualization, upstream
//! resolution and the packet proxy tying them together.

pub mod mapper;
pub mod pending;
pub mod proxy;
pub mod resolver;
pub mod response;
pub mod rules;

pub use mapper::DnsServerMapper;
pub use proxy::DnsPacketProxy;
pub use resolver::{DohResolver, UdpForwarder, UpstreamResolver};
pub use rules::{Classification, Classifier, HostRules, from_fn};
