//! Service and pod discovery across a namespace scope

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;
use std::net::Ipv4Addr;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::resources::{PodView, PortMap, Selector, ServiceView};
use crate::error::Result;

/// The slice of the cluster API Catapult consumes
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// List services in `namespace`, or cluster-wide when `None`
    async fn list_services(&self, namespace: Option<&str>, selector: &str)
        -> Result<Vec<ServiceView>>;

    /// List pods in `namespace`, or cluster-wide when `None`
    async fn list_pods(&self, namespace: Option<&str>, selector: &str) -> Result<Vec<PodView>>;

    /// Forward every `(bind, local port)` pair in `ports` to the matching
    /// container port of `pod`.
    ///
    /// Blocks until `cancel` fires. `ready` is signalled once every local
    /// port accepts connections.
    #[allow(clippy::too_many_arguments)]
    async fn port_forward(
        &self,
        cancel: CancellationToken,
        namespace: &str,
        pod: &str,
        bind: Ipv4Addr,
        ports: &PortMap,
        ready: Option<oneshot::Sender<()>>,
    ) -> Result<()>;
}

/// Which namespaces discovery looks at
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum NamespaceScope {
    #[default]
    All,
    Only(Vec<String>),
}

impl From<Vec<String>> for NamespaceScope {
    /// An empty list means every namespace
    fn from(namespaces: Vec<String>) -> Self {
        let namespaces: Vec<String> = namespaces
            .into_iter()
            .map(|ns| ns.trim().to_string())
            .filter(|ns| !ns.is_empty())
            .collect();
        if namespaces.is_empty() {
            NamespaceScope::All
        } else {
            NamespaceScope::Only(namespaces)
        }
    }
}

/// Lists services and pods for one scope and label selector.
///
/// With an explicit namespace list each namespace is queried on its own and
/// the results concatenated in list order. One failing namespace fails the
/// whole call.
#[derive(Clone)]
pub struct Discovery {
    cluster: Arc<dyn ClusterApi>,
    scope: NamespaceScope,
    selector: String,
}

impl Discovery {
    pub fn new(cluster: Arc<dyn ClusterApi>, scope: NamespaceScope, selector: impl Into<String>) -> Self {
        Self {
            cluster,
            scope,
            selector: selector.into(),
        }
    }

    pub async fn list_services(&self) -> Result<Vec<ServiceView>> {
        match &self.scope {
            NamespaceScope::All => self.cluster.list_services(None, &self.selector).await,
            NamespaceScope::Only(namespaces) => {
                let lists = try_join_all(
                    namespaces
                        .iter()
                        .map(|ns| self.cluster.list_services(Some(ns), &self.selector)),
                )
                .await?;
                Ok(lists.into_iter().flatten().collect())
            }
        }
    }

    pub async fn list_pods(&self) -> Result<Vec<PodView>> {
        match &self.scope {
            NamespaceScope::All => self.cluster.list_pods(None, &self.selector).await,
            NamespaceScope::Only(namespaces) => {
                let lists = try_join_all(
                    namespaces
                        .iter()
                        .map(|ns| self.cluster.list_pods(Some(ns), &self.selector)),
                )
                .await?;
                Ok(lists.into_iter().flatten().collect())
            }
        }
    }
}

/// Pods that may receive traffic for `selector`: running and matching
pub fn select_pods<'a, I>(pods: I, selector: &Selector) -> Vec<&'a PodView>
where
    I: IntoIterator<Item = &'a PodView>,
{
    pods.into_iter()
        .filter(|pod| pod.running && selector.matches(&pod.labels))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// Records which namespaces were queried; fails for `broken`
    #[derive(Default)]
    struct RecordingCluster {
        queried: Mutex<Vec<Option<String>>>,
        broken: Option<String>,
    }

    fn pod(namespace: &str, name: &str, running: bool) -> PodView {
        PodView {
            namespace: namespace.to_string(),
            name: name.to_string(),
            running,
            labels: [("app".to_string(), "db".to_string())].into_iter().collect(),
            named_ports: BTreeMap::new(),
        }
    }

    #[async_trait]
    impl ClusterApi for RecordingCluster {
        async fn list_services(
            &self,
            _namespace: Option<&str>,
            _selector: &str,
        ) -> Result<Vec<ServiceView>> {
            Ok(Vec::new())
        }

        async fn list_pods(&self, namespace: Option<&str>, _selector: &str) -> Result<Vec<PodView>> {
            self.queried.lock().unwrap().push(namespace.map(str::to_string));
            if namespace.is_some() && namespace.map(str::to_string) == self.broken {
                return Err(Error::KubeConfig("unreachable".to_string()));
            }
            Ok(vec![pod(namespace.unwrap_or("any"), "db-0", true)])
        }

        async fn port_forward(
            &self,
            _cancel: CancellationToken,
            _namespace: &str,
            _pod: &str,
            _bind: Ipv4Addr,
            _ports: &PortMap,
            _ready: Option<oneshot::Sender<()>>,
        ) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_namespace_scope_from_list() {
        assert_eq!(NamespaceScope::from(vec![]), NamespaceScope::All);
        assert_eq!(NamespaceScope::from(vec![" ".to_string()]), NamespaceScope::All);
        assert_eq!(
            NamespaceScope::from(vec!["shop".to_string(), "".to_string()]),
            NamespaceScope::Only(vec!["shop".to_string()])
        );
    }

    #[tokio::test]
    async fn test_all_namespaces_query_cluster_wide() {
        let cluster = Arc::new(RecordingCluster::default());
        let discovery = Discovery::new(cluster.clone(), NamespaceScope::All, "");
        let pods = discovery.list_pods().await.unwrap();
        assert_eq!(pods.len(), 1);
        assert_eq!(*cluster.queried.lock().unwrap(), vec![None]);
    }

    #[tokio::test]
    async fn test_explicit_namespaces_are_concatenated_in_order() {
        let cluster = Arc::new(RecordingCluster::default());
        let discovery = Discovery::new(
            cluster.clone(),
            NamespaceScope::Only(vec!["a".to_string(), "b".to_string()]),
            "app=db",
        );
        let pods = discovery.list_pods().await.unwrap();
        let namespaces: Vec<&str> = pods.iter().map(|p| p.namespace.as_str()).collect();
        assert_eq!(namespaces, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_one_failing_namespace_fails_discovery() {
        let cluster = Arc::new(RecordingCluster {
            broken: Some("b".to_string()),
            ..Default::default()
        });
        let discovery = Discovery::new(
            cluster,
            NamespaceScope::Only(vec!["a".to_string(), "b".to_string()]),
            "",
        );
        assert!(discovery.list_pods().await.is_err());
    }

    #[test]
    fn test_select_pods_requires_running_and_labels() {
        let mut other = pod("shop", "web-0", true);
        other.labels = [("app".to_string(), "web".to_string())].into_iter().collect();
        let pods = vec![
            pod("shop", "db-0", true),
            pod("shop", "db-1", false),
            other,
        ];
        let selector: Selector = [("app", "db")].into_iter().collect();

        let selected = select_pods(&pods, &selector);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].name, "db-0");
    }
}
