use tokio::sync::watch;

/// Reports network reachability and its changes.
pub trait Connectivity: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Subscribe to reachability changes. The receiver starts at the current value.
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Connectivity state driven by the host platform (or by tests).
#[derive(Debug)]
pub struct ConnectivityMonitor {
    tx: watch::Sender<bool>,
}

impl ConnectivityMonitor {
    pub fn new(connected: bool) -> Self {
        let (tx, _) = watch::channel(connected);
        Self { tx }
    }

    /// Record a reachability change; subscribers are woken only on transitions.
    pub fn set_connected(&self, connected: bool) {
        self.tx.send_if_modified(|current| {
            if *current == connected {
                return false;
            }
            log::info!(
                "Connectivity changed: {}",
                if connected { "online" } else { "offline" }
            );
            *current = connected;
            true
        });
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Connectivity for ConnectivityMonitor {
    fn is_connected(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_monitor_notifies_transitions_only() {
        let monitor = ConnectivityMonitor::new(false);
        let mut rx = monitor.subscribe();
        assert!(!*rx.borrow_and_update());

        monitor.set_connected(false);
        assert!(!rx.has_changed().unwrap());

        monitor.set_connected(true);
        assert!(rx.has_changed().unwrap());
        assert!(*rx.borrow_and_update());
        assert!(monitor.is_connected());
    }
}
