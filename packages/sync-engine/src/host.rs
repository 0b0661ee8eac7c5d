//! Host capability traits (§6.4): thin seams the embedding application fills
//! in to tell the engine about connectivity, app foreground/background
//! transitions, and OS background-execution slots. The engine never probes
//! these itself — the host platform owns that detection and pushes updates
//! in, matching how `reqwest`/`tokio` leave socket and OS integration to the
//! caller rather than reaching for it themselves.

use tokio::sync::watch;

/// Host-driven network connectivity. The embedding application calls
/// [`NetworkMonitor::set_online`] whenever the OS reports a connectivity
/// change; the scheduler watches [`NetworkMonitor::subscribe`] rather than
/// polling.
pub trait NetworkMonitor: Send + Sync {
    fn is_online(&self) -> bool;
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Always reports online and never changes; used when the host platform has
/// no connectivity API (tests, server-side embedding).
pub struct AlwaysOnline {
    sender: watch::Sender<bool>,
}

impl Default for AlwaysOnline {
    fn default() -> Self {
        let (sender, _) = watch::channel(true);
        Self { sender }
    }
}

impl NetworkMonitor for AlwaysOnline {
    fn is_online(&self) -> bool {
        *self.sender.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }
}

/// Host-driven connectivity that the embedder pushes updates into directly.
pub struct ManualNetworkMonitor {
    sender: watch::Sender<bool>,
}

impl ManualNetworkMonitor {
    #[must_use]
    pub fn new(initially_online: bool) -> Self {
        let (sender, _) = watch::channel(initially_online);
        Self { sender }
    }

    pub fn set_online(&self, online: bool) {
        let _ = self.sender.send(online);
    }
}

impl NetworkMonitor for ManualNetworkMonitor {
    fn is_online(&self) -> bool {
        *self.sender.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }
}

/// Whether the embedding application is currently foregrounded, used to
/// trigger `syncOnFocus`. Optional: a scheduler with none configured simply
/// never fires focus-triggered syncs, per §6.4 "degrades gracefully if
/// absent."
pub trait FocusSource: Send + Sync {
    fn is_foregrounded(&self) -> bool;
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Registers the engine's background sync handoff with the host OS's
/// background-execution facility (iOS `BGTaskScheduler`, Android
/// `WorkManager`, ...). The default does nothing, which is correct for
/// hosts that only sync in the foreground — real OS integration is an
/// embedder concern, out of scope for this engine.
pub trait BackgroundSyncRegistrar: Send + Sync {
    fn register(&self, tag: &str);
    fn unregister(&self, tag: &str);
}

pub struct NullBackgroundSync;

impl BackgroundSyncRegistrar for NullBackgroundSync {
    fn register(&self, _tag: &str) {}
    fn unregister(&self, _tag: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn always_online_reports_true() {
        assert!(AlwaysOnline::default().is_online());
    }

    #[test]
    fn manual_network_monitor_reflects_set_online() {
        let monitor = ManualNetworkMonitor::new(true);
        let mut rx = monitor.subscribe();
        monitor.set_online(false);
        assert!(!monitor.is_online());
        assert_eq!(*rx.borrow_and_update(), false);
    }

    #[test]
    fn null_background_sync_does_not_panic() {
        NullBackgroundSync.register("background-fetch");
        NullBackgroundSync.unregister("background-fetch");
    }
}
