//! Liveness watchdog for the upstream path.
//!
//! When the tunnel goes quiet for a whole poll timeout the watchdog sends
//! an empty datagram to the default DNS server through the tunnel. Any
//! packet read from the tunnel afterwards proves the path alive and lets
//! the timeout grow; a second timeout with the probe still unanswered
//! declares the server unreachable.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{NetworkError, Result};

/// Penalty added to the start of every watched session.
const INIT_PENALTY_STEP: Duration = Duration::from_millis(200);
const INIT_PENALTY_MAX: Duration = Duration::from_secs(5);

const POLL_TIMEOUT_START: Duration = Duration::from_secs(1);
const POLL_TIMEOUT_END: Duration = Duration::from_secs(4096);
const POLL_TIMEOUT_GROW: u32 = 4;

/// Poll timeout while a probe awaits its echo.
const POLL_TIMEOUT_WAITING: Duration = Duration::from_secs(7);

const PROBE_PORT: u16 = 53;

/// Sends watchdog probes.
pub trait Prober: Send {
    fn send_probe(&self, target: SocketAddr) -> io::Result<()>;
}

/// Sends empty UDP datagrams from an unprotected socket, so they enter
/// the tunnel like any other application traffic.
#[derive(Clone, Copy, Debug, Default)]
pub struct UdpProber;

impl Prober for UdpProber {
    fn send_probe(&self, target: SocketAddr) -> io::Result<()> {
        let bind_addr = match target {
            SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };
        let socket = UdpSocket::bind(bind_addr)?;
        socket.send_to(&[], target)?;
        Ok(())
    }
}

/// Tracks tunnel traffic and probes the default server when idle.
pub struct Watchdog<P = UdpProber> {
    prober: P,
    enabled: bool,
    init_penalty: Duration,
    poll_timeout: Duration,
    last_sent: Option<Instant>,
    last_received: Option<Instant>,
    probe_target: Option<SocketAddr>,
    resolver: Option<IpAddr>,
}

impl<P: Prober> Watchdog<P> {
    pub const fn new(prober: P) -> Self {
        Self {
            prober,
            enabled: false,
            init_penalty: Duration::ZERO,
            poll_timeout: POLL_TIMEOUT_START,
            last_sent: None,
            last_received: None,
            probe_target: None,
            resolver: None,
        }
    }

    /// Reset for a new session.
    ///
    /// When enabled, sleeps the session penalty first; the penalty grows
    /// with every session so a flapping tunnel is not hammered.
    pub async fn initialize(&mut self, enabled: bool) {
        self.enabled = enabled;
        self.poll_timeout = POLL_TIMEOUT_START;
        self.last_sent = None;
        self.last_received = None;
        if !enabled {
            return;
        }

        if !self.init_penalty.is_zero() {
            debug!(penalty_ms = self.init_penalty.as_millis(), "Watchdog session penalty");
            tokio::time::sleep(self.init_penalty).await;
        }
        self.init_penalty = (self.init_penalty + INIT_PENALTY_STEP).min(INIT_PENALTY_MAX);
    }

    /// Watch `resolver`, probing it through `probe`.
    pub fn set_target(&mut self, probe: IpAddr, resolver: IpAddr) {
        self.probe_target = Some(SocketAddr::new(probe, PROBE_PORT));
        self.resolver = Some(resolver);
    }

    /// A probe was sent and nothing was read from the tunnel since.
    fn probe_outstanding(&self) -> bool {
        self.last_received < self.last_sent
    }

    /// How long the event loop may stay idle. `None` waits forever.
    pub fn poll_timeout(&self) -> Option<Duration> {
        if !self.enabled {
            return None;
        }
        if self.probe_outstanding() {
            return Some(POLL_TIMEOUT_WAITING);
        }
        Some(self.poll_timeout)
    }

    /// A packet was read from the tunnel.
    pub fn handle_packet(&mut self) {
        if self.enabled {
            self.last_received = Some(Instant::now());
        }
    }

    /// The event loop stayed idle for a whole poll timeout.
    pub fn handle_timeout(&mut self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let Some(target) = self.probe_target else {
            return Ok(());
        };

        if self.probe_outstanding() {
            self.poll_timeout = POLL_TIMEOUT_START;
            let resolver = self.resolver.unwrap_or(target.ip());
            info!(resolver = %resolver, "Watchdog probe unanswered");
            return Err(NetworkError::WatchdogTimeout { target: resolver }.into());
        }

        if self.poll_timeout < POLL_TIMEOUT_END {
            self.poll_timeout = (self.poll_timeout * POLL_TIMEOUT_GROW).min(POLL_TIMEOUT_END);
        }

        debug!(target_addr = %target, "Sending watchdog probe");
        self.prober
            .send_probe(target)
            .map_err(|e| NetworkError::SendFailed(e.to_string()))?;
        self.last_sent = Some(Instant::now());
        Ok(())
    }
}

impl Default for Watchdog<UdpProber> {
    fn default() -> Self {
        Self::new(UdpProber)
    }
}
