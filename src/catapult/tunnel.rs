//! A single bridged address: one loopback alias plus one port-forward session

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{Error, Errors, Result};
use crate::k8s::{ClusterApi, PortMap};
use crate::net::{Address, AddressAliaser};

/// How long `stop` waits for a cancelled session to wind down
const SESSION_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct Session {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Cancels the streaming session of a started tunnel.
///
/// Dropping the handle does not stop anything.
#[derive(Debug, Clone)]
pub struct SessionHandle(CancellationToken);

impl SessionHandle {
    pub fn cancel(&self) {
        self.0.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }
}

/// Bridges one local address to one pod.
///
/// The address is the tunnel's identity; it never changes after creation.
#[derive(Debug)]
pub struct Tunnel {
    namespace: String,
    pod: String,
    address: Address,
    ports: PortMap,
    hosts: Vec<String>,
    session: Option<Session>,
}

impl Tunnel {
    /// Duplicate hostnames are dropped, first occurrence wins
    pub fn new(
        namespace: impl Into<String>,
        pod: impl Into<String>,
        address: Address,
        ports: PortMap,
        hosts: Vec<String>,
    ) -> Self {
        let mut unique: Vec<String> = Vec::with_capacity(hosts.len());
        for host in hosts {
            if !unique.contains(&host) {
                unique.push(host);
            }
        }

        Self {
            namespace: namespace.into(),
            pod: pod.into(),
            address,
            ports,
            hosts: unique,
            session: None,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn pod(&self) -> &str {
        &self.pod
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn ports(&self) -> &PortMap {
        &self.ports
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    pub fn is_active(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| !s.cancel.is_cancelled())
    }

    /// Alias the address and launch the port-forward session in the background.
    ///
    /// Returns as soon as the alias is in place; session failures after that
    /// are only logged. Pass `ready` to learn when the local ports accept
    /// connections. Starting an active tunnel replaces its session.
    ///
    /// The session's child token is derived before aliasing but only stored
    /// once the alias succeeds; a failed start leaves the tunnel idle with no
    /// session to cancel.
    pub async fn start(
        &mut self,
        ctx: &CancellationToken,
        cluster: &Arc<dyn ClusterApi>,
        aliaser: &dyn AddressAliaser,
        ready: Option<oneshot::Sender<()>>,
    ) -> Result<SessionHandle> {
        if let Some(previous) = self.session.take() {
            previous.cancel.cancel();
        }

        let cancel = ctx.child_token();
        aliaser.alias(self.address.ip()).await?;

        let cluster = Arc::clone(cluster);
        let token = cancel.clone();
        let namespace = self.namespace.clone();
        let pod = self.pod.clone();
        let ports = self.ports.clone();
        let hosts = self.hosts.clone();
        let ip = self.address.ip();

        let task = tokio::spawn(async move {
            if let Err(e) = cluster
                .port_forward(token, &namespace, &pod, ip, &ports, ready)
                .await
            {
                error!(
                    namespace = %namespace,
                    pod = %pod,
                    address = %ip,
                    hosts = ?hosts,
                    ports = ?ports,
                    error = %e,
                    "Port-forward session failed"
                );
            }
        });

        info!(
            namespace = %self.namespace,
            pod = %self.pod,
            address = %self.address,
            hosts = ?self.hosts,
            ports = ?self.ports,
            "Started tunnel"
        );

        self.session = Some(Session {
            cancel: cancel.clone(),
            task,
        });
        Ok(SessionHandle(cancel))
    }

    /// Cancel the session and remove the alias.
    ///
    /// Both steps always run; their failures are returned together. Stopping
    /// an idle tunnel only repeats the alias removal.
    pub async fn stop(&mut self, aliaser: &dyn AddressAliaser) -> Result<()> {
        let mut errors = Errors::new();

        if let Some(session) = self.session.take() {
            session.cancel.cancel();
            match tokio::time::timeout(SESSION_SHUTDOWN_TIMEOUT, session.task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => errors.push(Error::PortForward {
                    namespace: self.namespace.clone(),
                    pod: self.pod.clone(),
                    message: format!("session task failed: {}", e),
                }),
                Err(_) => {
                    warn!(address = %self.address, "Port-forward session still shutting down");
                }
            }
        }

        errors.check(aliaser.unalias(self.address.ip()).await);

        info!(
            namespace = %self.namespace,
            pod = %self.pod,
            address = %self.address,
            hosts = ?self.hosts,
            "Stopped tunnel"
        );
        errors.into_result()
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        if let Some(session) = &self.session {
            session.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::{PodView, ServiceView};
    use crate::net::MockAddressAliaser;
    use async_trait::async_trait;
    use mockall::predicate::eq;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Port-forward that only waits for cancellation
    #[derive(Default)]
    struct IdleCluster {
        opened: AtomicUsize,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ClusterApi for IdleCluster {
        async fn list_services(&self, _: Option<&str>, _: &str) -> Result<Vec<ServiceView>> {
            Ok(Vec::new())
        }

        async fn list_pods(&self, _: Option<&str>, _: &str) -> Result<Vec<PodView>> {
            Ok(Vec::new())
        }

        async fn port_forward(
            &self,
            cancel: CancellationToken,
            _namespace: &str,
            _pod: &str,
            _bind: Ipv4Addr,
            _ports: &PortMap,
            ready: Option<oneshot::Sender<()>>,
        ) -> Result<()> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            if let Some(ready) = ready {
                let _ = ready.send(());
            }
            cancel.cancelled().await;
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn tunnel() -> Tunnel {
        Tunnel::new(
            "shop",
            "web-0",
            Address::allocate("10.0.0.5"),
            [(80, 8080)].into_iter().collect(),
            vec!["web.shop".to_string(), "web".to_string(), "web.shop".to_string()],
        )
    }

    #[test]
    fn test_new_dedups_hosts_in_order() {
        assert_eq!(tunnel().hosts(), ["web.shop", "web"]);
        assert!(!tunnel().is_active());
    }

    #[tokio::test]
    async fn test_start_then_stop() {
        let ip = Address::allocate("10.0.0.5").ip();
        let mut aliaser = MockAddressAliaser::new();
        aliaser.expect_alias().with(eq(ip)).times(1).returning(|_| Ok(()));
        aliaser.expect_unalias().with(eq(ip)).times(1).returning(|_| Ok(()));

        let idle = Arc::new(IdleCluster::default());
        let cluster: Arc<dyn ClusterApi> = idle.clone();
        let ctx = CancellationToken::new();
        let mut tunnel = tunnel();

        let (tx, rx) = oneshot::channel();
        let handle = tunnel.start(&ctx, &cluster, &aliaser, Some(tx)).await.unwrap();
        rx.await.unwrap();
        assert!(tunnel.is_active());
        assert!(!handle.is_cancelled());

        tunnel.stop(&aliaser).await.unwrap();
        assert!(handle.is_cancelled());
        assert!(!tunnel.is_active());
        assert_eq!(idle.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_alias_failure_aborts_start() {
        let mut aliaser = MockAddressAliaser::new();
        aliaser.expect_alias().times(1).returning(|ip| {
            Err(Error::Alias {
                action: "alias",
                address: ip,
                message: "Operation not permitted".to_string(),
            })
        });

        let idle = Arc::new(IdleCluster::default());
        let cluster: Arc<dyn ClusterApi> = idle.clone();
        let mut tunnel = tunnel();

        let result = tunnel
            .start(&CancellationToken::new(), &cluster, &aliaser, None)
            .await;
        assert!(result.is_err());
        assert!(!tunnel.is_active());
        assert_eq!(idle.opened.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_restart_replaces_session() {
        let mut aliaser = MockAddressAliaser::new();
        aliaser.expect_alias().times(2).returning(|_| Ok(()));

        let idle = Arc::new(IdleCluster::default());
        let cluster: Arc<dyn ClusterApi> = idle.clone();
        let ctx = CancellationToken::new();
        let mut tunnel = tunnel();

        let first = tunnel.start(&ctx, &cluster, &aliaser, None).await.unwrap();
        let second = tunnel.start(&ctx, &cluster, &aliaser, None).await.unwrap();
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert!(tunnel.is_active());
    }

    #[tokio::test]
    async fn test_parent_cancellation_reaches_session() {
        let mut aliaser = MockAddressAliaser::new();
        aliaser.expect_alias().returning(|_| Ok(()));

        let idle = Arc::new(IdleCluster::default());
        let cluster: Arc<dyn ClusterApi> = idle.clone();
        let ctx = CancellationToken::new();
        let mut tunnel = tunnel();

        let handle = tunnel.start(&ctx, &cluster, &aliaser, None).await.unwrap();
        ctx.cancel();
        assert!(handle.is_cancelled());
        assert!(!tunnel.is_active());
    }

    #[tokio::test]
    async fn test_stop_idle_tunnel_still_unaliases() {
        let mut aliaser = MockAddressAliaser::new();
        aliaser.expect_unalias().times(2).returning(|_| Ok(()));

        let mut tunnel = tunnel();
        tunnel.stop(&aliaser).await.unwrap();
        tunnel.stop(&aliaser).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_reports_unalias_failure() {
        let mut aliaser = MockAddressAliaser::new();
        aliaser.expect_alias().returning(|_| Ok(()));
        aliaser.expect_unalias().returning(|ip| {
            Err(Error::Alias {
                action: "unalias",
                address: ip,
                message: "Operation not permitted".to_string(),
            })
        });

        let idle = Arc::new(IdleCluster::default());
        let cluster: Arc<dyn ClusterApi> = idle.clone();
        let mut tunnel = tunnel();
        let handle = tunnel
            .start(&CancellationToken::new(), &cluster, &aliaser, None)
            .await
            .unwrap();

        let err = tunnel.stop(&aliaser).await.unwrap_err();
        assert!(err.to_string().contains("Operation not permitted"));
        // the session is torn down even though the alias removal failed
        assert!(handle.is_cancelled());
    }
}
