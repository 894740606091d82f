//! Client
//!
//! The caller-facing entry point: one generic `submit` for every command and
//! result type, on top of either a single endpoint or a cluster writer.
//!
//! ## Example
//!
//! ```ignore
//! use flashkv_driver::{Client, ClientOptions};
//! use flashkv_driver::command::{Command, ValueOutput};
//!
//! let client = Client::connect("127.0.0.1:6379", ClientOptions::default()).await?;
//! let value = client
//!     .submit(Command::new("GET", ValueOutput::new()).key_arg("user:101"))
//!     .await?;
//! ```

use crate::cluster::{ClusterWriter, NodeConnector, NodeId, Topology};
use crate::command::{Command, CommandError, CommandHandle, RedisCommand};
use crate::connection::{ConnectionError, ConnectionStats, ConnectionWatchdog};
use crate::endpoint::{ChannelWriter, Endpoint};
use crate::options::ClientOptions;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::runtime::Handle;
use tracing::{info, warn};

pub struct Client {
    writer: Arc<dyn ChannelWriter>,
    watchdog: Option<Arc<ConnectionWatchdog>>,
    connector: Option<Arc<TcpNodeConnector>>,
    stats: Arc<ConnectionStats>,
}

impl Client {
    /// Connects to a single server.
    pub async fn connect(address: &str, options: ClientOptions) -> Result<Self, ConnectionError> {
        let options = Arc::new(options);
        let stats = Arc::new(ConnectionStats::new());

        let endpoint = Endpoint::new(address, Arc::clone(&options));
        // Attached before the first connection exists, so a drop right after
        // activation already finds it.
        let watchdog = options.auto_reconnect.then(|| {
            ConnectionWatchdog::start(&endpoint, Arc::clone(&options), Arc::clone(&stats))
        });
        endpoint.establish(Arc::clone(&stats)).await?;

        info!(address = %address, "Client connected");
        Ok(Self {
            writer: endpoint,
            watchdog,
            connector: None,
            stats,
        })
    }

    /// A client for a cluster described by `topology`. Node connections are
    /// opened lazily, on the first command routed to each node.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn cluster(
        topology: Arc<dyn Topology>,
        options: ClientOptions,
    ) -> Result<Self, ConnectionError> {
        let runtime = Handle::try_current().map_err(|_| ConnectionError::NoRuntime)?;
        let options = Arc::new(options);
        let stats = Arc::new(ConnectionStats::new());

        let connector = Arc::new(TcpNodeConnector::new(
            runtime,
            Arc::clone(&options),
            Arc::clone(&stats),
        ));
        let writer = ClusterWriter::new(topology, connector.clone(), options);

        Ok(Self {
            writer,
            watchdog: None,
            connector: Some(connector),
            stats,
        })
    }

    /// Sends `command` and returns its completion handle. A command the
    /// writer refuses comes back already failed.
    pub fn submit<T: Send + 'static>(&self, command: Command<T>) -> CommandHandle<T> {
        let (command, handle) = command.prepare();
        if let Err(e) = self.writer.write(command.clone()) {
            command.complete_exceptionally(e);
        }
        handle
    }

    pub fn set_auto_flush_commands(&self, auto_flush: bool) {
        self.writer.set_auto_flush_commands(auto_flush);
    }

    pub fn flush_commands(&self) {
        self.writer.flush_commands();
    }

    /// Abandons every outstanding command with [`CommandError::Reset`].
    pub fn reset(&self) {
        self.writer.reset();
    }

    pub fn close(&self) {
        self.writer.close();
        if let Some(watchdog) = &self.watchdog {
            watchdog.stop();
        }
        if let Some(connector) = &self.connector {
            connector.stop_all();
        }
    }

    pub fn stats(&self) -> &Arc<ConnectionStats> {
        &self.stats
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

/// Connects cluster node endpoints over TCP, with one watchdog per node
/// when reconnection is enabled.
pub struct TcpNodeConnector {
    runtime: Handle,
    options: Arc<ClientOptions>,
    stats: Arc<ConnectionStats>,
    watchdogs: Mutex<HashMap<NodeId, Arc<ConnectionWatchdog>>>,
}

impl TcpNodeConnector {
    pub fn new(runtime: Handle, options: Arc<ClientOptions>, stats: Arc<ConnectionStats>) -> Self {
        Self {
            runtime,
            options,
            stats,
            watchdogs: Mutex::new(HashMap::new()),
        }
    }

    /// Stops every watchdog started so far.
    pub fn stop_all(&self) {
        self.watchdogs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl NodeConnector for TcpNodeConnector {
    fn connect(&self, node: &NodeId, endpoint: &Arc<Endpoint>) {
        let watchdog = if self.options.auto_reconnect {
            let _runtime = self.runtime.enter();
            let watchdog = ConnectionWatchdog::start(
                endpoint,
                Arc::clone(&self.options),
                Arc::clone(&self.stats),
            );
            // Replacing a node's watchdog stops the previous one.
            self.watchdogs
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(node.clone(), Arc::clone(&watchdog));
            Some(Arc::downgrade(&watchdog))
        } else {
            None
        };

        let endpoint = Arc::clone(endpoint);
        let stats = Arc::clone(&self.stats);
        let node = node.clone();
        self.runtime.spawn(async move {
            let Err(e) = endpoint.establish(stats).await else {
                return;
            };
            warn!(node = %node, error = %e, "Node connect failed");
            match watchdog.and_then(|watchdog| watchdog.upgrade()) {
                Some(watchdog) => watchdog.connection_lost(),
                None => {
                    endpoint.fail_queued(CommandError::Disconnected);
                    endpoint.close();
                }
            }
        });
    }
}
