//! Read-only snapshots of the cluster objects Catapult cares about
//!
//! Services and pods are flattened into small views as soon as they are
//! listed, so derivation and tests never deal with `k8s_openapi` options.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

/// Local/service port -> pod container port
pub type PortMap = BTreeMap<u16, u16>;

/// Phase of a pod that may receive traffic
pub const POD_RUNNING: &str = "Running";

/// Cluster IP value Kubernetes uses for headless services
pub const HEADLESS_CLUSTER_IP: &str = "None";

/// Equality-based label selector
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector(BTreeMap<String, String>);

impl Selector {
    pub fn new(labels: BTreeMap<String, String>) -> Self {
        Self(labels)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when every selector label is present in `labels` with the same value
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0
            .iter()
            .all(|(key, value)| labels.get(key) == Some(value))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Selector {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.0.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        f.write_str(&rendered.join(","))
    }
}

/// How a service is addressed inside the cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterIp {
    /// No virtual IP; pods are addressed individually
    Headless,
    /// Stable virtual IP load-balancing across pods
    Address(String),
}

/// Target of a service port
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetPort {
    Number(i32),
    Name(String),
}

impl From<&IntOrString> for TargetPort {
    fn from(value: &IntOrString) -> Self {
        match value {
            IntOrString::Int(n) => TargetPort::Number(*n),
            IntOrString::String(s) => match s.parse() {
                Ok(n) => TargetPort::Number(n),
                Err(_) => TargetPort::Name(s.clone()),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServicePortView {
    /// Empty when the service does not declare one
    pub protocol: String,
    pub port: i32,
    pub target_port: Option<TargetPort>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceView {
    pub namespace: String,
    pub name: String,
    /// `None` when the service has no cluster IP at all (e.g. `ExternalName`)
    pub cluster_ip: Option<ClusterIp>,
    pub selector: Selector,
    pub ports: Vec<ServicePortView>,
}

impl From<&Service> for ServiceView {
    fn from(service: &Service) -> Self {
        let spec = service.spec.as_ref();

        let cluster_ip = spec
            .and_then(|s| s.cluster_ip.as_deref())
            .filter(|ip| !ip.is_empty())
            .map(|ip| {
                if ip == HEADLESS_CLUSTER_IP {
                    ClusterIp::Headless
                } else {
                    ClusterIp::Address(ip.to_string())
                }
            });

        let ports = spec
            .and_then(|s| s.ports.as_ref())
            .map(|ports| {
                ports
                    .iter()
                    .map(|p| ServicePortView {
                        protocol: p.protocol.clone().unwrap_or_default(),
                        port: p.port,
                        target_port: p.target_port.as_ref().map(TargetPort::from),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            namespace: service.metadata.namespace.clone().unwrap_or_default(),
            name: service.metadata.name.clone().unwrap_or_default(),
            cluster_ip,
            selector: Selector::new(spec.and_then(|s| s.selector.clone()).unwrap_or_default()),
            ports,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodView {
    pub namespace: String,
    pub name: String,
    pub running: bool,
    pub labels: BTreeMap<String, String>,
    /// Named container ports across all containers of the pod
    pub named_ports: BTreeMap<String, i32>,
}

impl From<&Pod> for PodView {
    fn from(pod: &Pod) -> Self {
        let running = pod
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            == Some(POD_RUNNING);

        let named_ports = pod
            .spec
            .iter()
            .flat_map(|spec| spec.containers.iter())
            .flat_map(|c| c.ports.iter().flatten())
            .filter_map(|p| p.name.clone().map(|name| (name, p.container_port)))
            .collect();

        Self {
            namespace: pod.metadata.namespace.clone().unwrap_or_default(),
            name: pod.metadata.name.clone().unwrap_or_default(),
            running,
            labels: pod.metadata.labels.clone().unwrap_or_default(),
            named_ports,
        }
    }
}
