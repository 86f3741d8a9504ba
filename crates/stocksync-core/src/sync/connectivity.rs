//! Backend reachability tracking.
//!
//! [`ConnectivityMonitor::probe`] pings the backend under a deadline and never
//! fails: a timeout or refused connection simply means offline. The cached
//! state is exposed three ways: [`ConnectivityMonitor::is_online`] for polling,
//! a `watch` channel for async consumers, and plain callbacks that fire once
//! per offline/online edge.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::remote::{with_timeout, RemoteBackend};

type TransitionCallback = Box<dyn Fn(bool) + Send + Sync>;

/// Cached reachability of the remote backend.
pub struct ConnectivityMonitor {
    remote: Arc<dyn RemoteBackend>,
    probe_timeout: Duration,
    online: AtomicBool,
    state_tx: watch::Sender<bool>,
    callbacks: Mutex<Vec<TransitionCallback>>,
}

impl ConnectivityMonitor {
    /// Starts offline until the first successful probe.
    pub fn new(remote: Arc<dyn RemoteBackend>, probe_timeout: Duration) -> Self {
        let (state_tx, _) = watch::channel(false);
        Self {
            remote,
            probe_timeout,
            online: AtomicBool::new(false),
            state_tx,
            callbacks: Mutex::new(Vec::new()),
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        self.probe_timeout
    }

    /// Ping the backend and update the cached state.
    pub async fn probe(&self) -> bool {
        let online = match with_timeout(self.probe_timeout, self.remote.ping()).await {
            Ok(()) => true,
            Err(e) => {
                debug!("probe failed: {}", e);
                false
            }
        };
        self.record(online);
        online
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Register a callback invoked with the new state on every transition.
    pub fn subscribe(&self, callback: impl Fn(bool) + Send + Sync + 'static) {
        self.callbacks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Box::new(callback));
    }

    /// Receiver tracking the cached state.
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.state_tx.subscribe()
    }

    /// Store an observed state. Returns `true` if it was a transition.
    pub fn record(&self, online: bool) -> bool {
        if self.online.swap(online, Ordering::SeqCst) == online {
            return false;
        }

        if online {
            info!("backend reachable, going online");
        } else {
            info!("backend unreachable, going offline");
        }
        self.state_tx.send_replace(online);

        let callbacks = self.callbacks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        for callback in callbacks.iter() {
            callback(online);
        }
        true
    }

    /// Probe every `interval` until `token` is cancelled.
    ///
    /// The first probe runs immediately.
    pub fn spawn(self: Arc<Self>, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("connectivity monitor stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = self.probe() => {}
                        }
                    }
                }
            }
        })
    }
}
