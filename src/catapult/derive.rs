//! Desired tunnel set from one discovery snapshot
//!
//! Pure functions: no cluster or OS access happens here.

use tracing::debug;

use super::tunnel::Tunnel;
use crate::k8s::{select_pods, ClusterIp, PodView, PortMap, ServiceView, TargetPort};
use crate::net::Address;

/// DNS suffix of in-cluster service names
pub const CLUSTER_DOMAIN: &str = "svc.cluster.local";

/// Protocol assumed when a service port declares none
const TCP: &str = "TCP";

/// Build one tunnel per headless-service pod and one per cluster-IP service.
///
/// Services without a pod selector are skipped, as are services with no
/// running matching pod in their own namespace. `scope` is the namespace
/// whose services also answer to their bare name.
pub fn derive_tunnels(services: &[ServiceView], pods: &[PodView], scope: &str) -> Vec<Tunnel> {
    let mut tunnels = Vec::new();

    for service in services {
        if service.selector.is_empty() {
            continue;
        }
        let Some(cluster_ip) = &service.cluster_ip else {
            debug!(namespace = %service.namespace, service = %service.name, "Service has no cluster IP, skipping");
            continue;
        };

        let eligible = select_pods(
            pods.iter().filter(|p| p.namespace == service.namespace),
            &service.selector,
        );

        match cluster_ip {
            ClusterIp::Headless => {
                for pod in eligible {
                    let fqdn = format!(
                        "{}.{}.{}.{}",
                        pod.name, service.name, service.namespace, CLUSTER_DOMAIN
                    );
                    tunnels.push(Tunnel::new(
                        &pod.namespace,
                        &pod.name,
                        Address::allocate(&fqdn),
                        select_ports(service, [pod]),
                        vec![fqdn],
                    ));
                }
            }
            ClusterIp::Address(ip) => {
                // first in list order; which pod wins is otherwise arbitrary
                let Some(pod) = eligible.first() else {
                    continue;
                };
                tunnels.push(Tunnel::new(
                    &pod.namespace,
                    &pod.name,
                    Address::allocate(ip),
                    select_ports(service, [*pod]),
                    service_hosts(service, scope),
                ));
            }
        }
    }

    tunnels
}

/// Hostnames of a cluster-IP service
fn service_hosts(service: &ServiceView, scope: &str) -> Vec<String> {
    let mut hosts = vec![
        format!("{}.{}", service.name, service.namespace),
        format!("{}.{}.{}", service.name, service.namespace, CLUSTER_DOMAIN),
    ];
    if service.namespace == scope {
        hosts.insert(0, service.name.clone());
    }
    hosts
}

/// Map each TCP service port to the container port it reaches on `pods`.
///
/// A named target port resolves through the pods' named container ports; a
/// positive numeric target port always wins. Ports that do not resolve to a
/// positive value on both sides are left out.
pub fn select_ports<'a, I>(service: &ServiceView, pods: I) -> PortMap
where
    I: IntoIterator<Item = &'a PodView>,
{
    let pods: Vec<&PodView> = pods.into_iter().collect();
    let mut ports = PortMap::new();

    for port in &service.ports {
        if !port.protocol.is_empty() && port.protocol != TCP {
            continue;
        }

        let mut target = 0;
        if let Some(TargetPort::Name(name)) = &port.target_port {
            if let Some(container_port) = pods.iter().find_map(|p| p.named_ports.get(name)) {
                target = *container_port;
            }
        }
        if let Some(TargetPort::Number(n)) = port.target_port {
            if n > 0 {
                target = n;
            }
        }

        if let (Ok(service_port), Ok(container_port)) = (u16::try_from(port.port), u16::try_from(target)) {
            if service_port > 0 && container_port > 0 {
                ports.insert(service_port, container_port);
            }
        }
    }

    ports
}
