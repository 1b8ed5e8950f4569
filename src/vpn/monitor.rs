//! Tunnel interface health monitor.
//!
//! One monitor runs beside each session. It identifies the session's
//! tunnel interface, polls it every [`CHECK_INTERVAL`], and signals a
//! reconnect once the interface is gone or down. It then stops; the next
//! session starts a fresh one.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::platform::{InterfaceStatus, VpnPlatform};

/// Delay between two liveness checks.
pub const CHECK_INTERVAL: Duration = Duration::from_secs(10);

const TUNNEL_PREFIX: &str = "tun";

/// Name of the newest tunnel interface: `tun<N>` with the highest `N`.
pub fn tunnel_interface(interfaces: &[InterfaceStatus]) -> Option<String> {
    interfaces
        .iter()
        .filter_map(|iface| {
            let number: u32 = iface.name.strip_prefix(TUNNEL_PREFIX)?.parse().ok()?;
            Some((number, &iface.name))
        })
        .max_by_key(|(number, _)| *number)
        .map(|(_, name)| name.clone())
}

/// Watches the tunnel interface of one session.
pub struct ConnectionMonitor<P> {
    platform: Arc<P>,
    interval: Duration,
    interface: Option<String>,
}

impl<P: VpnPlatform> ConnectionMonitor<P> {
    pub fn new(platform: Arc<P>) -> Self {
        Self::with_interval(platform, CHECK_INTERVAL)
    }

    pub fn with_interval(platform: Arc<P>, interval: Duration) -> Self {
        Self {
            platform,
            interval,
            interface: None,
        }
    }

    /// Whether the watched interface is still present and up.
    ///
    /// Until an interface has been identified the tunnel counts as alive.
    async fn check(&mut self) -> bool {
        let interfaces = self.platform.interfaces().await;
        let Some(name) = &self.interface else {
            self.interface = tunnel_interface(&interfaces);
            if let Some(name) = &self.interface {
                info!(interface = %name, "Monitoring tunnel interface");
            }
            return true;
        };

        let up = interfaces.iter().any(|iface| &iface.name == name && iface.up);
        debug!(interface = %name, up, "Checked tunnel interface");
        up
    }

    /// Poll until the interface goes down, then call `on_down` once.
    ///
    /// Returns early without signalling when `cancel` fires.
    pub async fn run<F>(mut self, cancel: CancellationToken, on_down: F)
    where
        F: FnOnce() + Send,
    {
        self.check().await;
        if self.interface.is_none() {
            warn!("No tunnel interface found yet");
        }

        let mut ticks = interval_at(Instant::now() + self.interval, self.interval);
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                _ = ticks.tick() => {}
            }
            if !self.check().await {
                warn!("Tunnel interface is down, requesting reconnect");
                on_down();
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vpn::platform::tests::MockBuilder;
    use crate::vpn::platform::{AppInfo, NetworkInfo, NoopProtector, SocketProtector};
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::future::Future;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn iface(name: &str, up: bool) -> InterfaceStatus {
        InterfaceStatus {
            name: name.to_string(),
            up,
        }
    }

    #[derive(Default)]
    struct InterfacePlatform {
        interfaces: Mutex<Vec<InterfaceStatus>>,
    }

    impl VpnPlatform for InterfacePlatform {
        type Builder = MockBuilder;

        fn builder(&self) -> MockBuilder {
            MockBuilder::default()
        }

        fn networks(&self) -> Vec<NetworkInfo> {
            Vec::new()
        }

        fn installed_applications(&self) -> Vec<AppInfo> {
            Vec::new()
        }

        fn browser_packages(&self) -> HashSet<String> {
            HashSet::new()
        }

        fn own_package(&self) -> String {
            String::new()
        }

        fn protector(&self) -> Arc<dyn SocketProtector> {
            Arc::new(NoopProtector)
        }

        fn interfaces(&self) -> impl Future<Output = Vec<InterfaceStatus>> + Send {
            let interfaces = self.interfaces.lock().clone();
            async move { interfaces }
        }
    }

    #[test]
    fn should_pick_newest_tunnel_interface() {
        let interfaces = [
            iface("lo", true),
            iface("tun0", true),
            iface("tun12", true),
            iface("tun3", true),
            iface("tunnel", true),
            iface("wlan0", true),
        ];
        assert_eq!(tunnel_interface(&interfaces), Some("tun12".to_string()));
        assert_eq!(tunnel_interface(&[iface("eth0", true)]), None);
    }

    #[tokio::test(start_paused = true)]
    async fn should_signal_once_interface_goes_down() {
        let platform = Arc::new(InterfacePlatform::default());
        *platform.interfaces.lock() = vec![iface("tun0", true), iface("tun1", true)];

        let signals = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&signals);
        let monitor = ConnectionMonitor::new(Arc::clone(&platform));
        let task = tokio::spawn(monitor.run(CancellationToken::new(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        tokio::time::sleep(CHECK_INTERVAL * 3).await;
        assert_eq!(signals.load(Ordering::SeqCst), 0);

        *platform.interfaces.lock() = vec![iface("tun0", true), iface("tun1", false)];
        task.await.unwrap();
        assert_eq!(signals.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn should_signal_when_interface_disappears() {
        let platform = Arc::new(InterfacePlatform::default());
        *platform.interfaces.lock() = vec![iface("tun0", true)];

        let signalled = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&signalled);
        let monitor = ConnectionMonitor::new(Arc::clone(&platform));
        let task = tokio::spawn(monitor.run(CancellationToken::new(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        tokio::time::sleep(Duration::from_secs(1)).await;
        platform.interfaces.lock().clear();
        task.await.unwrap();
        assert_eq!(signalled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn should_stop_silently_on_cancel() {
        let platform = Arc::new(InterfacePlatform::default());
        *platform.interfaces.lock() = vec![iface("tun0", true)];

        let cancel = CancellationToken::new();
        let signalled = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&signalled);
        let monitor = ConnectionMonitor::new(Arc::clone(&platform));
        let task = tokio::spawn(monitor.run(cancel.clone(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(signalled.load(Ordering::SeqCst), 0);
    }
}
