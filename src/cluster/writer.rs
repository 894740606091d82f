//! Cluster-Aware Writer
//!
//! Routes each command to the endpoint of the node owning its key's slot,
//! follows MOVED/ASK replies and takes back commands evacuated from closing
//! node endpoints.
//!
//! ```text
//!   write / requeue ──> resolve_node(key) ──> endpoint_for(node) ──> Endpoint::write
//!
//!   MOVED slot node ──> update_slot_owner ──> Endpoint(node)::write(cmd)
//!   ASK   slot node ──────────────────────> Endpoint(node)::write_all([ASKING, cmd])
//! ```
//!
//! A command keeps its identity through all of this: the caller's handle
//! stays pending until the command settles on whichever node finally
//! answers it.

use crate::cluster::redirect::{Redirect, RedirectKind};
use crate::cluster::slot::hash_slot;
use crate::cluster::topology::{NodeId, Topology};
use crate::command::{Command, CommandError, SharedCommand, StatusOutput};
use crate::endpoint::{ChannelWriter, CommandRouter, Endpoint};
use crate::options::ClientOptions;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tracing::{debug, info, info_span, trace, warn, Span};

const ASKING: &str = "ASKING";

/// Opens connections for endpoints the writer creates.
pub trait NodeConnector: Send + Sync {
    /// Starts connecting `endpoint` to `node`. Must not block; commands
    /// written meanwhile wait in the endpoint's queue.
    fn connect(&self, node: &NodeId, endpoint: &Arc<Endpoint>);
}

pub struct ClusterWriter {
    topology: Arc<dyn Topology>,
    endpoints: RwLock<HashMap<NodeId, Arc<Endpoint>>>,
    connector: Arc<dyn NodeConnector>,
    options: Arc<ClientOptions>,
    auto_flush: AtomicBool,
    closed: AtomicBool,
    this: Weak<ClusterWriter>,
    span: Span,
}

impl ClusterWriter {
    pub fn new(
        topology: Arc<dyn Topology>,
        connector: Arc<dyn NodeConnector>,
        options: Arc<ClientOptions>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            topology,
            endpoints: RwLock::new(HashMap::new()),
            connector,
            auto_flush: AtomicBool::new(options.auto_flush),
            options,
            closed: AtomicBool::new(false),
            this: this.clone(),
            span: info_span!("cluster"),
        })
    }

    pub fn topology(&self) -> &Arc<dyn Topology> {
        &self.topology
    }

    /// The endpoint currently serving `node`, if one exists.
    pub fn endpoint(&self, node: &NodeId) -> Option<Arc<Endpoint>> {
        self.endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(node)
            .cloned()
    }

    fn all_endpoints(&self) -> Vec<Arc<Endpoint>> {
        self.endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// The endpoint for `node`, creating (and connecting) one when there is
    /// none or the existing one is closing.
    pub fn endpoint_for(&self, node: &NodeId) -> Result<Arc<Endpoint>, CommandError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CommandError::Closed);
        }
        if let Some(endpoint) = self.endpoint(node) {
            if !endpoint.is_closed() {
                return Ok(endpoint);
            }
        }

        let endpoint = {
            let mut endpoints = self
                .endpoints
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(endpoint) = endpoints.get(node) {
                if !endpoint.is_closed() {
                    return Ok(Arc::clone(endpoint));
                }
            }
            let router: Weak<dyn CommandRouter> = self.this.clone();
            let endpoint =
                Endpoint::with_router(node.address(), Arc::clone(&self.options), router);
            endpoint.set_auto_flush_commands(self.auto_flush.load(Ordering::SeqCst));
            endpoints.insert(node.clone(), Arc::clone(&endpoint));
            endpoint
        };

        debug!(parent: &self.span, node = %node, "Node endpoint created");
        self.connector.connect(node, &endpoint);
        Ok(endpoint)
    }

    /// Removes the endpoint of `node` and closes it. Its pending commands
    /// are requeued through [`ClusterWriter::requeue`] when it was not
    /// connected.
    pub fn close_node(&self, node: &NodeId) {
        let removed = self
            .endpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(node);
        if let Some(endpoint) = removed {
            info!(parent: &self.span, node = %node, "Closing node endpoint");
            endpoint.close();
        }
    }

    fn route(&self, command: &SharedCommand) -> Result<NodeId, CommandError> {
        match command.key() {
            Some(key) => self
                .topology
                .resolve_node(key)
                .ok_or_else(|| CommandError::NoRoute(hash_slot(key))),
            None => self.topology.default_node().ok_or(CommandError::NoNode),
        }
    }

    /// Shared path of `write` and `requeue`.
    fn dispatch(&self, command: SharedCommand) -> Result<(), CommandError> {
        if command.is_done() {
            trace!(parent: &self.span, command_id = command.id(), "Dropping settled command");
            return Ok(());
        }
        let node = self.route(&command)?;
        trace!(parent: &self.span, command_id = command.id(), node = %node, "Routing command");
        self.endpoint_for(&node)?.write(command)
    }

    fn follow(&self, command: &SharedCommand, redirect: &Redirect) -> Result<(), CommandError> {
        let hops = command.record_redirect();
        if hops > self.options.max_redirects {
            return Err(CommandError::TooManyRedirects(self.options.max_redirects));
        }

        match redirect.kind {
            RedirectKind::Moved => {
                self.topology
                    .update_slot_owner(redirect.slot, redirect.node.clone());
                self.endpoint_for(&redirect.node)?.write(command.clone())
            }
            RedirectKind::Ask => {
                let (asking, _) = Command::new(ASKING, StatusOutput::new()).prepare();
                let asking: SharedCommand = asking;
                self.endpoint_for(&redirect.node)?
                    .write_all(vec![asking, command.clone()])
            }
        }
    }
}

impl CommandRouter for ClusterWriter {
    fn requeue(&self, command: SharedCommand) -> Result<(), CommandError> {
        if command.name() == ASKING {
            // Only valid directly before the command it was sent with, which
            // is requeued on its own and may be asked again.
            trace!(parent: &self.span, command_id = command.id(), "Dropping ASKING marker");
            command.cancel();
            return Ok(());
        }
        debug!(parent: &self.span, command_id = command.id(), "Requeueing command");
        self.dispatch(command)
    }

    fn redirect(&self, command: SharedCommand, redirect: Redirect) {
        let _enter = self.span.enter();
        if command.is_done() {
            debug!(command_id = command.id(), "Command settled while redirected, dropped");
            return;
        }
        debug!(command_id = command.id(), redirect = %redirect, "Following redirect");
        if let Err(e) = self.follow(&command, &redirect) {
            warn!(command_id = command.id(), error = %e, "Redirect failed");
            command.complete_exceptionally(e);
        }
    }
}

impl ChannelWriter for ClusterWriter {
    fn write(&self, command: SharedCommand) -> Result<(), CommandError> {
        self.dispatch(command)
    }

    fn set_auto_flush_commands(&self, auto_flush: bool) {
        self.auto_flush.store(auto_flush, Ordering::SeqCst);
        for endpoint in self.all_endpoints() {
            endpoint.set_auto_flush_commands(auto_flush);
        }
    }

    fn flush_commands(&self) {
        for endpoint in self.all_endpoints() {
            endpoint.flush_commands();
        }
    }

    fn reset(&self) {
        for endpoint in self.all_endpoints() {
            endpoint.reset_commands();
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let endpoints: Vec<_> = self
            .endpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, endpoint)| endpoint)
            .collect();
        info!(parent: &self.span, nodes = endpoints.len(), "Closing cluster writer");
        for endpoint in endpoints {
            endpoint.close();
        }
    }
}
