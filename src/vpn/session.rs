//! State owned by one established tunnel.
//!
//! A [`TunnelSession`] is built from scratch on every (re)connect and dropped
//! as a whole when the session ends, taking the device, every pending
//! upstream socket and the completion queue with it.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::platform::{SocketProtector, TunnelBuilder, VpnPlatform, excluded_packages};
use crate::config::EngineConfig;
use crate::dns::mapper::{DnsServerMapper, discover_dns_servers};
use crate::dns::pending::{Completion, PendingQueries, completion_channel};
use crate::error::{NetworkError, Result};
use crate::network::TunnelDevice;

/// Session state the packet proxy and resolvers work on.
pub struct SessionState {
    pub mapper: DnsServerMapper,
    pub pending: PendingQueries,
    /// Hands answers resolved off the event loop back to it.
    pub completions: mpsc::Sender<Completion>,
    /// Packets waiting to be written to the tunnel.
    pub outbound: VecDeque<Vec<u8>>,
    pub protector: Arc<dyn SocketProtector>,
    /// Resolutions running off the event loop; aborted with the session.
    pub tasks: JoinSet<()>,
}

impl SessionState {
    /// Fresh state with an empty tracker and a completion queue of
    /// `capacity` entries. The receiving end goes to the event loop.
    pub fn new(
        mapper: DnsServerMapper,
        protector: Arc<dyn SocketProtector>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Completion>) {
        let (completions, receiver) = completion_channel(capacity);
        let state = Self {
            mapper,
            pending: PendingQueries::new(),
            completions,
            outbound: VecDeque::new(),
            protector,
            tasks: JoinSet::new(),
        };
        (state, receiver)
    }

    /// Queue the packet assembled from an answer resolved off the loop.
    pub fn complete(&mut self, completion: Completion) {
        match completion.assemble() {
            Ok(packet) => self.outbound.push_back(packet),
            Err(e) => warn!(error = %e, "Failed to assemble resolved answer"),
        }
    }
}

/// An established tunnel and everything tied to its lifetime.
pub struct TunnelSession<D> {
    pub device: D,
    pub state: SessionState,
    pub completions: mpsc::Receiver<Completion>,
}

impl<D: TunnelDevice> TunnelSession<D> {
    /// Configure and bring up a new tunnel on `platform`.
    ///
    /// Discovers the upstream servers, maps them onto synthetic addresses,
    /// excludes the configured applications and establishes the interface.
    pub fn establish<P>(platform: &P, config: &EngineConfig) -> Result<Self>
    where
        P: VpnPlatform,
        P::Builder: TunnelBuilder<Device = D>,
    {
        let mut builder = platform.builder();

        let servers = discover_dns_servers(&platform.networks());
        if servers.is_empty() {
            warn!("No upstream DNS servers found");
        }
        let mapper = DnsServerMapper::configure(&mut builder, &servers, config.ipv6_enabled)?;

        let excluded = excluded_packages(
            config,
            &platform.installed_applications(),
            &platform.browser_packages(),
            &platform.own_package(),
        );
        for package in &excluded {
            if let Err(e) = builder.add_disallowed_application(package) {
                warn!(package = %package, error = %e, "Failed to exclude application");
            }
        }
        debug!(count = excluded.len(), "Excluded applications from tunnel");

        let device = builder.establish()?;
        info!(servers = servers.len(), "Tunnel established");

        let (state, completions) =
            SessionState::new(mapper, platform.protector(), config.completion_channel_capacity);
        Ok(Self {
            device,
            state,
            completions,
        })
    }

    /// Write every queued packet to the tunnel.
    pub async fn flush(&mut self) -> Result<()> {
        while let Some(packet) = self.state.outbound.pop_front() {
            self.device
                .write_packet(&packet)
                .await
                .map_err(NetworkError::TunnelWrite)?;
        }
        Ok(())
    }
}
