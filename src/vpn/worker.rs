//! Tunnel orchestration.
//!
//! [`start`] spawns the worker task that owns every tunnel session. The
//! worker connects, runs the session's event loop until it fails or is
//! told to stop, and reconnects under the [`ConnectionThrottler`]. Network
//! changes reported through the [`VpnHandle`] tear sessions down or bring
//! them back without restarting the worker.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::monitor::ConnectionMonitor;
use super::platform::{NetworkInfo, Transport, TunnelBuilder, VpnPlatform};
use super::session::TunnelSession;
use super::status::{StatusListener, VpnStatus};
use super::throttle::ConnectionThrottler;
use super::watchdog::Watchdog;
use crate::cache::CachedClassifier;
use crate::config::EngineConfig;
use crate::dns::proxy::DnsPacketProxy;
use crate::dns::resolver;
use crate::dns::rules::{Classifier, HostRules};
use crate::error::{NetworkError, Result};
use crate::network::{BufferPool, PacketBuilder, TunnelDevice};

type DeviceOf<P> = <<P as VpnPlatform>::Builder as TunnelBuilder>::Device;

/// Network classes the host reports availability for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NetworkType {
    Wifi,
    Cellular,
}

#[derive(Debug)]
enum Control {
    NetworkAvailable(NetworkType),
    NetworkLost(NetworkType),
    /// The monitor of session `generation` saw its interface go down.
    InterfaceDown(u64),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Connecting,
    WaitingForNetwork,
    Stopped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SessionEnd {
    Stopped,
    Reconnect,
    NetworkLost,
}

/// Available networks and the generation of the running session.
#[derive(Debug, Default)]
struct ControlState {
    networks: HashSet<NetworkType>,
    generation: u64,
}

impl ControlState {
    /// Start from the transports of the host's active network, so the
    /// host confirming it right after start does not cost a reconnect.
    fn seeded(networks: &[NetworkInfo]) -> Self {
        let mut state = Self::default();
        if let Some(active) = networks.iter().find(|network| network.active) {
            if active.has_transport(Transport::Wifi) {
                state.networks.insert(NetworkType::Wifi);
            }
            if active.has_transport(Transport::Cellular) {
                state.networks.insert(NetworkType::Cellular);
            }
        }
        state
    }

    /// Apply a control message to the running session.
    fn apply(&mut self, control: Control) -> Option<SessionEnd> {
        match control {
            Control::NetworkAvailable(network) => {
                let first = self.networks.is_empty();
                self.networks.insert(network);
                info!(?network, "Network available");
                first.then_some(SessionEnd::Reconnect)
            }
            Control::NetworkLost(network) => {
                self.networks.remove(&network);
                info!(?network, remaining = self.networks.len(), "Network lost");
                if self.networks.is_empty() {
                    Some(SessionEnd::NetworkLost)
                } else {
                    Some(SessionEnd::Reconnect)
                }
            }
            Control::InterfaceDown(generation) if generation == self.generation => {
                Some(SessionEnd::Reconnect)
            }
            Control::InterfaceDown(generation) => {
                debug!(generation, current = self.generation, "Ignoring stale monitor signal");
                None
            }
        }
    }
}

/// Handle to a running engine.
pub struct VpnHandle {
    control: mpsc::UnboundedSender<Control>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl VpnHandle {
    pub fn network_available(&self, network: NetworkType) {
        self.send(Control::NetworkAvailable(network));
    }

    pub fn network_lost(&self, network: NetworkType) {
        self.send(Control::NetworkLost(network));
    }

    fn send(&self, control: Control) {
        if self.control.send(control).is_err() {
            debug!("Worker already stopped");
        }
    }

    /// Ask the worker to stop without waiting for it.
    pub fn request_stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the worker and wait until the tunnel is torn down.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!(error = %e, "Worker task failed");
        }
    }
}

/// The classifier built from the `[rules]` table, behind a cache of
/// `cache_capacity` entries.
pub fn rules_classifier(config: &EngineConfig) -> Arc<dyn Classifier> {
    Arc::new(CachedClassifier::with_capacity(
        HostRules::from_settings(&config.rules),
        config.cache_capacity,
    ))
}

/// Start the engine on `platform`.
///
/// Fails only when the configuration is invalid; everything going wrong
/// later is handled by reconnecting.
pub fn start<P, S>(
    platform: Arc<P>,
    config: EngineConfig,
    classifier: Arc<dyn Classifier>,
    status: S,
) -> Result<VpnHandle>
where
    P: VpnPlatform,
    S: StatusListener,
{
    config.validate()?;
    let resolver = resolver::from_settings(&config.upstream)?;
    let buffers = BufferPool::new(config.buffer_pool_size);
    let proxy = DnsPacketProxy::new(classifier, resolver, PacketBuilder::new(buffers.clone()));

    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let control = ControlState::seeded(&platform.networks());

    let worker = VpnWorker {
        platform,
        config,
        proxy,
        buffers,
        status: Box::new(status),
        control_tx: control_tx.clone(),
        control_rx,
        cancel: cancel.clone(),
        control,
        throttle: ConnectionThrottler::new(),
        watchdog: Watchdog::default(),
    };
    let task = tokio::spawn(worker.run());

    Ok(VpnHandle {
        control: control_tx,
        cancel,
        task,
    })
}

struct VpnWorker<P> {
    platform: Arc<P>,
    config: EngineConfig,
    proxy: DnsPacketProxy,
    buffers: BufferPool,
    status: Box<dyn StatusListener>,
    control_tx: mpsc::UnboundedSender<Control>,
    control_rx: mpsc::UnboundedReceiver<Control>,
    cancel: CancellationToken,
    control: ControlState,
    throttle: ConnectionThrottler,
    watchdog: Watchdog,
}

impl<P: VpnPlatform> VpnWorker<P> {
    fn report(&self, status: VpnStatus) {
        debug!(%status, "Status changed");
        self.status.on_status(status);
    }

    async fn run(mut self) {
        info!("Starting engine");
        self.report(VpnStatus::Starting);

        let mut state = State::Connecting;
        while state != State::Stopped {
            state = match state {
                State::Connecting => self.connect().await,
                State::WaitingForNetwork => self.wait_for_network().await,
                State::Stopped => State::Stopped,
            };
        }

        self.report(VpnStatus::Stopping);
        self.report(VpnStatus::Stopped);
        info!("Engine stopped");
    }

    async fn connect(&mut self) -> State {
        let cancel = self.cancel.clone();

        tokio::select! {
            () = cancel.cancelled() => return State::Stopped,
            () = self.throttle.throttle() => {}
        }
        tokio::select! {
            () = cancel.cancelled() => return State::Stopped,
            () = self.watchdog.initialize(self.config.watchdog_enabled) => {}
        }

        let outcome = match TunnelSession::<DeviceOf<P>>::establish(self.platform.as_ref(), &self.config) {
            Ok(session) => self.run_session(session).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(SessionEnd::Stopped) => State::Stopped,
            Ok(SessionEnd::NetworkLost) => State::WaitingForNetwork,
            Ok(SessionEnd::Reconnect) => {
                self.reconnecting(VpnStatus::Reconnecting, "requested");
                State::Connecting
            }
            Err(_) if cancel.is_cancelled() => State::Stopped,
            Err(e) if !e.is_recoverable() => {
                error!(error = %e, "Unrecoverable engine failure");
                State::Stopped
            }
            Err(e) => {
                warn!(error = %e, "Session failed, reconnecting");
                self.reconnecting(VpnStatus::ReconnectingNetworkError, "error");
                State::Connecting
            }
        }
    }

    fn reconnecting(&self, status: VpnStatus, reason: &'static str) {
        metrics::counter!("nullroute_reconnects_total", "reason" => reason).increment(1);
        self.report(status);
    }

    async fn wait_for_network(&mut self) -> State {
        info!("Waiting for a network");
        self.report(VpnStatus::WaitingForNetwork);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return State::Stopped,
                Some(control) = self.control_rx.recv() => match control {
                    Control::NetworkAvailable(network) => {
                        self.control.networks.insert(network);
                        self.reconnecting(VpnStatus::Reconnecting, "network");
                        return State::Connecting;
                    }
                    Control::NetworkLost(network) => {
                        self.control.networks.remove(&network);
                    }
                    Control::InterfaceDown(_) => {}
                },
            }
        }
    }

    #[instrument(skip_all, fields(generation = self.control.generation + 1))]
    async fn run_session(&mut self, mut session: TunnelSession<DeviceOf<P>>) -> Result<SessionEnd> {
        self.control.generation += 1;
        let mapper = &session.state.mapper;
        self.watchdog.set_target(mapper.probe_target(), mapper.default_server());
        self.report(VpnStatus::Running);

        let monitor_cancel = self.cancel.child_token();
        let control = self.control_tx.clone();
        let generation = self.control.generation;
        let monitor = tokio::spawn(ConnectionMonitor::new(Arc::clone(&self.platform)).run(
            monitor_cancel.clone(),
            move || {
                let _ = control.send(Control::InterfaceDown(generation));
            },
        ));

        let outcome = self.drive(&mut session).await;

        monitor_cancel.cancel();
        if let Err(e) = monitor.await {
            warn!(error = %e, "Connection monitor failed");
        }
        outcome
    }

    /// The session event loop.
    ///
    /// Each turn waits for exactly one event: a control message, an
    /// upstream answer, a resolved completion, a tunnel packet or the
    /// watchdog timeout. Queued packets are flushed after every event.
    async fn drive(&mut self, session: &mut TunnelSession<DeviceOf<P>>) -> Result<SessionEnd> {
        let mut buffer = self.buffers.get_packet();

        loop {
            let idle = self.watchdog.poll_timeout();
            let TunnelSession {
                device,
                state,
                completions,
            } = &mut *session;

            tokio::select! {
                biased;

                () = self.cancel.cancelled() => return Ok(SessionEnd::Stopped),

                Some(control) = self.control_rx.recv() => {
                    if let Some(end) = self.control.apply(control) {
                        return Ok(end);
                    }
                }

                ready = state.pending.wait_ready() => {
                    ready.map_err(NetworkError::Poll)?;
                    state.pending.drain_completed(&mut state.outbound);
                }

                Some(completion) = completions.recv() => state.complete(completion),

                read = device.read_packet(buffer.as_mut_slice()) => {
                    let len = read.map_err(NetworkError::Poll)?;
                    if len == 0 {
                        return Err(NetworkError::TunnelClosed.into());
                    }
                    self.watchdog.handle_packet();
                    self.proxy.handle_request(&buffer.as_slice()[..len], state)?;
                }

                () = idle_timeout(idle) => self.watchdog.handle_timeout()?,
            }

            session.flush().await?;
        }
    }
}

async fn idle_timeout(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending().await,
    }
}
