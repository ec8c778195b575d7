//! Connectivity notifier.
//!
//! The host application reports network reachability through
//! [`Connectivity::set_online`]; the client reads the current value when
//! deciding whether to queue and subscribes to drain the queue on recovery.

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    Online,
    Offline,
}

#[derive(Debug, Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    /// Record the current reachability. Returns the event if the value changed.
    pub fn set_online(&self, online: bool) -> Option<ConnectivityEvent> {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            *current = online;
            true
        });
        if !changed {
            return None;
        }
        if online {
            tracing::info!("Connectivity restored");
            Some(ConnectivityEvent::Online)
        } else {
            tracing::warn!("Connectivity lost");
            Some(ConnectivityEvent::Offline)
        }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}
