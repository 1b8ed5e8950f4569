//! Wire codec and tunnel device.

mod buffer;
mod capture;
mod device;
mod packet;

pub use buffer::{BufferPool, MAX_PACKET_SIZE, PooledBuffer};
pub use capture::{PacketInfo, extract_udp_datagram};
pub use device::{FdDevice, TunnelDevice};
pub use packet::PacketBuilder;

#[cfg(test)]
pub use device::tests::MockTunnel;
