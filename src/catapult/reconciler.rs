//! The Catapult control loop
//!
//! Every interval the loop rediscovers services and pods, derives the
//! tunnels that should exist, and applies the difference:
//! - tunnels whose address disappeared are stopped and unmapped first
//! - tunnels with a new address are started and mapped afterwards
//! - tunnels whose address is still wanted are left running untouched
//!
//! A tunnel keeps its original ports and hostnames for as long as its
//! address stays wanted, even if the service changes underneath it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::derive::derive_tunnels;
use super::tunnel::Tunnel;
use crate::error::{Error, Errors, Result};
use crate::hosts::HostsSectionManager;
use crate::k8s::{ClusterApi, Discovery, NamespaceScope};
use crate::net::{Address, AddressAliaser};

/// Pause between two refreshes
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);

/// Reconciler options
#[derive(Debug, Clone)]
pub struct CatapultOptions {
    /// Namespace whose services also resolve by bare name
    pub scope: String,
    pub namespaces: NamespaceScope,
    /// Label selector applied when listing services and pods
    pub selector: String,
    pub interval: Duration,
}

impl Default for CatapultOptions {
    fn default() -> Self {
        Self {
            scope: "default".to_string(),
            namespaces: NamespaceScope::All,
            selector: String::new(),
            interval: DEFAULT_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatapultState {
    NotStarted,
    Running,
    Stopped,
}

/// Keeps local tunnels and the hosts section in line with the cluster
pub struct Catapult {
    cluster: Arc<dyn ClusterApi>,
    aliaser: Arc<dyn AddressAliaser>,
    hosts: Box<dyn HostsSectionManager>,
    discovery: Discovery,
    scope: String,
    interval: Duration,
    tunnels: BTreeMap<Address, Tunnel>,
    state: CatapultState,
}

impl Catapult {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        aliaser: Arc<dyn AddressAliaser>,
        hosts: impl HostsSectionManager + 'static,
        options: CatapultOptions,
    ) -> Self {
        let discovery = Discovery::new(Arc::clone(&cluster), options.namespaces, options.selector);
        Self {
            cluster,
            aliaser,
            hosts: Box::new(hosts),
            discovery,
            scope: options.scope,
            interval: options.interval,
            tunnels: BTreeMap::new(),
            state: CatapultState::NotStarted,
        }
    }

    pub fn state(&self) -> CatapultState {
        self.state
    }

    /// Tracked tunnels, ordered by address; those that failed to start are idle
    pub fn tunnels(&self) -> impl Iterator<Item = &Tunnel> {
        self.tunnels.values()
    }

    pub fn tunnel(&self, address: Address) -> Option<&Tunnel> {
        self.tunnels.get(&address)
    }

    /// Run the control loop until `ctx` is cancelled.
    ///
    /// Starts by wiping any section left behind by a previous run. Refresh
    /// failures are logged and retried on the next tick. On exit every
    /// tunnel is stopped and the section removed; errors from that cleanup
    /// are returned.
    pub async fn start(&mut self, ctx: CancellationToken) -> Result<()> {
        if self.state != CatapultState::NotStarted {
            return Err(Error::AlreadyStarted);
        }
        self.state = CatapultState::Running;
        info!(scope = %self.scope, interval = ?self.interval, "Starting Catapult");

        self.hosts.clear();
        if let Err(e) = self.hosts.flush() {
            self.state = CatapultState::Stopped;
            return Err(e);
        }

        loop {
            if let Err(e) = self.refresh(&ctx).await {
                error!(error = %e, "Refresh failed");
            }

            tokio::select! {
                _ = ctx.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        let result = self.shutdown().await;
        self.state = CatapultState::Stopped;
        info!("Catapult stopped");
        result
    }

    /// Converge tunnels and hosts entries on the current cluster state.
    ///
    /// Discovery failure aborts before anything changes. Otherwise every
    /// tunnel is processed and all start/stop/flush failures are returned
    /// together. A tunnel that failed to start is still tracked, idle and
    /// unmapped, until its address leaves the desired set.
    pub async fn refresh(&mut self, ctx: &CancellationToken) -> Result<()> {
        let services = self.discovery.list_services().await?;
        let pods = self.discovery.list_pods().await?;

        let mut desired: BTreeMap<Address, Tunnel> = BTreeMap::new();
        for tunnel in derive_tunnels(&services, &pods, &self.scope) {
            desired.insert(tunnel.address(), tunnel);
        }

        let mut errors = Errors::new();

        let stale: Vec<Address> = self
            .tunnels
            .keys()
            .filter(|address| !desired.contains_key(address))
            .copied()
            .collect();
        for address in stale {
            let Some(mut tunnel) = self.tunnels.remove(&address) else {
                continue;
            };
            self.hosts.remove(address);
            if let Err(e) = tunnel.stop(self.aliaser.as_ref()).await {
                warn!(
                    namespace = %tunnel.namespace(),
                    pod = %tunnel.pod(),
                    address = %address,
                    hosts = ?tunnel.hosts(),
                    error = %e,
                    "Failed to stop tunnel"
                );
                errors.push(e);
            }
        }

        for (address, mut tunnel) in desired {
            if self.tunnels.contains_key(&address) {
                continue;
            }
            match tunnel
                .start(ctx, &self.cluster, self.aliaser.as_ref(), None)
                .await
            {
                Ok(_) => {
                    self.hosts.add(address, tunnel.hosts());
                }
                Err(e) => {
                    warn!(
                        namespace = %tunnel.namespace(),
                        pod = %tunnel.pod(),
                        address = %address,
                        hosts = ?tunnel.hosts(),
                        ports = ?tunnel.ports(),
                        error = %e,
                        "Failed to start tunnel"
                    );
                    errors.push(e);
                }
            }
            // tracked either way; a failed tunnel stays idle with no hosts line
            self.tunnels.insert(address, tunnel);
        }

        errors.check(self.hosts.flush());
        errors.into_result()
    }

    async fn shutdown(&mut self) -> Result<()> {
        let mut errors = Errors::new();

        for (_, mut tunnel) in std::mem::take(&mut self.tunnels) {
            errors.check(tunnel.stop(self.aliaser.as_ref()).await);
        }

        self.hosts.clear();
        errors.check(self.hosts.flush());
        errors.into_result()
    }
}
