//! Client Options
//!
//! One options value is shared (behind an `Arc`) by every endpoint, watchdog
//! and writer created for a client.

use std::time::Duration;

/// Default cap on queued commands per endpoint.
pub const DEFAULT_REQUEST_QUEUE_SIZE: usize = i32::MAX as usize;

/// Default number of MOVED/ASK hops a single command may take.
pub const DEFAULT_MAX_REDIRECTS: u32 = 5;

/// Behaviour switches for endpoints, watchdogs and the cluster writer.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Start a watchdog that reconnects lost connections (default: true)
    pub auto_reconnect: bool,

    /// Send each command as soon as it is written (default: true). When
    /// disabled, commands are buffered until `flush_commands`.
    pub auto_flush: bool,

    /// Maximum number of commands queued on one endpoint
    pub request_queue_size: usize,

    /// Reject writes while no connection is current instead of queueing
    /// them for the next one (default: false)
    pub reject_when_disconnected: bool,

    /// Maximum redirections followed for one command (default: 5)
    pub max_redirects: u32,

    /// Timeout for establishing a TCP connection (default: 10s)
    pub connect_timeout: Duration,

    /// First reconnect delay, doubled after every failed attempt (default: 10ms)
    pub reconnect_min_delay: Duration,

    /// Upper bound for the reconnect delay (default: 30s)
    pub reconnect_max_delay: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            auto_flush: true,
            request_queue_size: DEFAULT_REQUEST_QUEUE_SIZE,
            reject_when_disconnected: false,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            connect_timeout: Duration::from_secs(10),
            reconnect_min_delay: Duration::from_millis(10),
            reconnect_max_delay: Duration::from_secs(30),
        }
    }
}

impl ClientOptions {
    /// The reconnect delay that follows `current` after a failed attempt.
    pub fn next_reconnect_delay(&self, current: Duration) -> Duration {
        (current * 2)
            .max(Duration::from_millis(1))
            .min(self.reconnect_max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = ClientOptions::default();
        assert!(options.auto_reconnect);
        assert!(options.auto_flush);
        assert!(!options.reject_when_disconnected);
        assert_eq!(options.max_redirects, 5);
    }

    #[test]
    fn test_reconnect_backoff_is_capped() {
        let options = ClientOptions {
            reconnect_max_delay: Duration::from_millis(50),
            ..Default::default()
        };
        assert_eq!(
            options.next_reconnect_delay(Duration::from_millis(10)),
            Duration::from_millis(20)
        );
        assert_eq!(
            options.next_reconnect_delay(Duration::from_millis(40)),
            Duration::from_millis(50)
        );
        assert_eq!(
            options.next_reconnect_delay(Duration::ZERO),
            Duration::from_millis(1)
        );
    }
}
