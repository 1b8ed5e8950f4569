//! Coarse lifecycle status reported to the host.

use std::fmt;

use tokio::sync::watch;

/// Lifecycle status of the engine.
///
/// Codes are stable so hosts can persist them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum VpnStatus {
    Starting,
    Running,
    Stopping,
    WaitingForNetwork,
    Reconnecting,
    ReconnectingNetworkError,
    #[default]
    Stopped,
}

impl VpnStatus {
    pub const fn code(self) -> u8 {
        match self {
            Self::Starting => 10,
            Self::Running => 11,
            Self::Stopping => 20,
            Self::WaitingForNetwork => 21,
            Self::Reconnecting => 22,
            Self::ReconnectingNetworkError => 23,
            Self::Stopped => 0,
        }
    }

    /// Status for a persisted code. Unknown codes read as stopped.
    pub const fn from_code(code: u8) -> Self {
        match code {
            10 => Self::Starting,
            11 => Self::Running,
            20 => Self::Stopping,
            21 => Self::WaitingForNetwork,
            22 => Self::Reconnecting,
            23 => Self::ReconnectingNetworkError,
            _ => Self::Stopped,
        }
    }

    /// Whether the engine is up or trying to get up.
    pub const fn is_started(self) -> bool {
        !matches!(self, Self::Stopped)
    }
}

impl fmt::Display for VpnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::WaitingForNetwork => "waiting for network",
            Self::Reconnecting => "reconnecting",
            Self::ReconnectingNetworkError => "reconnecting after network error",
            Self::Stopped => "stopped",
        };
        f.write_str(text)
    }
}

/// Receives status changes. Notification is best effort and one-way.
pub trait StatusListener: Send + Sync + 'static {
    fn on_status(&self, status: VpnStatus);
}

impl<F> StatusListener for F
where
    F: Fn(VpnStatus) + Send + Sync + 'static,
{
    fn on_status(&self, status: VpnStatus) {
        self(status);
    }
}

impl StatusListener for watch::Sender<VpnStatus> {
    fn on_status(&self, status: VpnStatus) {
        self.send_replace(status);
    }
}
