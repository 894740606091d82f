//! Connection Watchdog
//!
//! A background task per endpoint that re-establishes lost connections.
//!
//! ## Design
//!
//! The watchdog sleeps until the endpoint reports a lost connection, then:
//! 1. Waits for the current backoff delay (starting at `reconnect_min_delay`)
//! 2. Gives up quietly if reconnection was suspended in the meantime
//! 3. Connects and hands the connection to the endpoint
//! 4. Doubles the delay (up to `reconnect_max_delay`) after each failure
//!
//! ## Suspension
//!
//! Closing an endpoint first suspends its watchdog, so no new attempt starts
//! once close has begun. An attempt already past the suspension check can
//! still finish connecting; the endpoint refuses that connection under its
//! lock once its lifecycle has left `Open`/`Disconnected`, and the watchdog
//! stops.

use crate::connection::handler::{ConnectionError, ConnectionStats};
use crate::endpoint::Endpoint;
use crate::options::ClientOptions;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

#[derive(Debug)]
struct WatchdogShared {
    address: String,
    suspended: AtomicBool,
    attempts: AtomicU32,
    wake: Notify,
}

/// A handle to the running watchdog.
///
/// When this handle is dropped, the watchdog task will be stopped.
#[derive(Debug)]
pub struct ConnectionWatchdog {
    shared: Arc<WatchdogShared>,
    shutdown_tx: watch::Sender<bool>,
}

impl ConnectionWatchdog {
    /// Starts a watchdog for `endpoint` and registers it there.
    ///
    /// The task holds the endpoint weakly; it stops by itself once the
    /// endpoint is dropped or closed.
    pub fn start(
        endpoint: &Arc<Endpoint>,
        options: Arc<ClientOptions>,
        stats: Arc<ConnectionStats>,
    ) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(WatchdogShared {
            address: endpoint.address().to_string(),
            suspended: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
            wake: Notify::new(),
        });

        let watchdog = Arc::new(Self {
            shared: Arc::clone(&shared),
            shutdown_tx,
        });
        endpoint.attach_watchdog(&watchdog);

        tokio::spawn(watchdog_loop(
            shared,
            Arc::downgrade(endpoint),
            options,
            stats,
            shutdown_rx,
        ));

        debug!(address = %endpoint.address(), "Connection watchdog started");
        watchdog
    }

    /// Suspends or resumes reconnect attempts. Repeating the current value
    /// has no effect. Resuming triggers an attempt if the endpoint is
    /// disconnected.
    pub fn set_reconnect_suspended(&self, suspended: bool) {
        let previous = self.shared.suspended.swap(suspended, Ordering::SeqCst);
        if previous == suspended {
            return;
        }
        debug!(address = %self.shared.address, suspended, "Reconnect suspension changed");
        if !suspended {
            self.shared.wake.notify_one();
        }
    }

    pub fn is_reconnect_suspended(&self) -> bool {
        self.shared.suspended.load(Ordering::SeqCst)
    }

    /// Called by the endpoint when its connection dropped.
    pub fn connection_lost(&self) {
        self.shared.wake.notify_one();
    }

    /// Failed attempts since the last successful reconnect.
    pub fn attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::Relaxed)
    }

    /// Stops the watchdog task.
    ///
    /// This is called automatically when the handle is dropped.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for ConnectionWatchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn watchdog_loop(
    shared: Arc<WatchdogShared>,
    endpoint: Weak<Endpoint>,
    options: Arc<ClientOptions>,
    stats: Arc<ConnectionStats>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shared.wake.notified() => {}
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!(address = %shared.address, "Watchdog received shutdown signal");
                    return;
                }
            }
        }

        if !reconnect(&shared, &endpoint, &options, &stats, &mut shutdown_rx).await {
            debug!(address = %shared.address, "Watchdog stopped");
            return;
        }
    }
}

/// Runs attempts until connected or suspended. Returns `false` when the
/// watchdog has nothing left to watch.
async fn reconnect(
    shared: &WatchdogShared,
    endpoint: &Weak<Endpoint>,
    options: &ClientOptions,
    stats: &Arc<ConnectionStats>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> bool {
    let mut delay = options.reconnect_min_delay;

    loop {
        if shared.suspended.load(Ordering::SeqCst) {
            debug!(address = %shared.address, "Reconnect suspended");
            return true;
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    return false;
                }
            }
        }

        if shared.suspended.load(Ordering::SeqCst) {
            debug!(address = %shared.address, "Reconnect suspended");
            return true;
        }

        let Some(endpoint) = endpoint.upgrade() else {
            return false;
        };
        if endpoint.is_closed() {
            return false;
        }
        if endpoint.is_connected() {
            shared.attempts.store(0, Ordering::Relaxed);
            return true;
        }

        let attempt = shared.attempts.fetch_add(1, Ordering::Relaxed) + 1;
        stats.reconnect_attempted();

        match endpoint.establish(Arc::clone(stats)).await {
            Ok(()) => {
                info!(address = %shared.address, attempt, "Reconnected");
                shared.attempts.store(0, Ordering::Relaxed);
                return true;
            }
            Err(ConnectionError::EndpointClosed) => {
                debug!(address = %shared.address, "Endpoint closed while reconnecting, connection discarded");
                return false;
            }
            Err(e) => {
                delay = options.next_reconnect_delay(delay);
                warn!(
                    address = %shared.address,
                    attempt,
                    error = %e,
                    retry_in_ms = delay.as_millis(),
                    "Reconnect failed"
                );
            }
        }
    }
}
