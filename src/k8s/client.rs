//! Kubernetes client wrapper for Catapult

use std::net::{Ipv4Addr, SocketAddr};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::{
    api::{Api, ListParams},
    config::KubeConfigOptions,
    Client, Config,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::discovery::ClusterApi;
use super::resources::{PodView, PortMap, ServiceView};
use crate::error::{Error, Result};

/// Wrapper around kube::Client implementing the cluster operations Catapult needs
#[derive(Clone)]
pub struct K8sClient {
    client: Client,
}

impl K8sClient {
    /// Create a new K8sClient from the inferred kubeconfig / in-cluster config,
    /// or from a named kubeconfig context
    #[instrument(skip_all)]
    pub async fn new(context: Option<&str>) -> Result<Self> {
        let config = match context {
            Some(context) => {
                let options = KubeConfigOptions {
                    context: Some(context.to_string()),
                    ..Default::default()
                };
                Config::from_kubeconfig(&options)
                    .await
                    .map_err(|e| Error::KubeConfig(e.to_string()))?
            }
            None => Config::infer()
                .await
                .map_err(|e| Error::KubeConfig(e.to_string()))?,
        };
        let client = Client::try_from(config)?;

        info!(context, "Connected to Kubernetes cluster");

        Ok(Self { client })
    }

    /// Check if cluster is reachable
    pub async fn health_check(&self) -> Result<()> {
        let version = self.client.apiserver_version().await?;
        info!(version = %version.git_version, "Kubernetes cluster is healthy");
        Ok(())
    }

    fn services(&self, namespace: Option<&str>) -> Api<Service> {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    fn pods(&self, namespace: Option<&str>) -> Api<Pod> {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }
}

fn list_params(selector: &str) -> ListParams {
    if selector.is_empty() {
        ListParams::default()
    } else {
        ListParams::default().labels(selector)
    }
}

#[async_trait]
impl ClusterApi for K8sClient {
    #[instrument(skip(self))]
    async fn list_services(
        &self,
        namespace: Option<&str>,
        selector: &str,
    ) -> Result<Vec<ServiceView>> {
        let list = self.services(namespace).list(&list_params(selector)).await?;
        Ok(list.items.iter().map(ServiceView::from).collect())
    }

    #[instrument(skip(self))]
    async fn list_pods(&self, namespace: Option<&str>, selector: &str) -> Result<Vec<PodView>> {
        let list = self.pods(namespace).list(&list_params(selector)).await?;
        Ok(list.items.iter().map(PodView::from).collect())
    }

    #[instrument(skip(self, cancel, ready))]
    async fn port_forward(
        &self,
        cancel: CancellationToken,
        namespace: &str,
        pod: &str,
        bind: Ipv4Addr,
        ports: &PortMap,
        ready: Option<oneshot::Sender<()>>,
    ) -> Result<()> {
        let forward_error = |message: String| Error::PortForward {
            namespace: namespace.to_string(),
            pod: pod.to_string(),
            message,
        };

        // Bind everything first so readiness means every port accepts
        let mut listeners = Vec::with_capacity(ports.len());
        for (&local_port, &pod_port) in ports {
            let listener = TcpListener::bind((bind, local_port))
                .await
                .map_err(|e| forward_error(format!("bind {}:{}: {}", bind, local_port, e)))?;
            listeners.push((listener, pod_port));
        }

        if let Some(ready) = ready {
            let _ = ready.send(());
        }
        info!(namespace, pod, address = %bind, ports = ?ports, "Port-forward ready");

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let mut acceptors = JoinSet::new();
        for (listener, pod_port) in listeners {
            acceptors.spawn(accept_connections(
                pods.clone(),
                namespace.to_string(),
                pod.to_string(),
                pod_port,
                listener,
                cancel.clone(),
            ));
        }

        cancel.cancelled().await;
        acceptors.shutdown().await;

        info!(namespace, pod, address = %bind, "Port-forward closed");
        Ok(())
    }
}

/// Accept local connections on `listener` until cancelled, forwarding each to `pod_port`
async fn accept_connections(
    pods: Api<Pod>,
    namespace: String,
    pod: String,
    pod_port: u16,
    listener: TcpListener,
    cancel: CancellationToken,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let pods = pods.clone();
                    let namespace = namespace.clone();
                    let pod = pod.clone();
                    connections.spawn(async move {
                        if let Err(e) = forward_connection(&pods, &namespace, &pod, pod_port, stream).await {
                            warn!(pod = %pod, port = pod_port, peer = %peer, error = %e, "Forwarded connection failed");
                        }
                    });
                }
                Err(e) => {
                    warn!(pod = %pod, port = pod_port, error = %e, "Failed to accept connection");
                }
            }
        }
    }

    connections.shutdown().await;
}

/// Carry one local connection to the pod over a dedicated port-forward stream
async fn forward_connection(
    pods: &Api<Pod>,
    namespace: &str,
    pod: &str,
    pod_port: u16,
    mut client: TcpStream,
) -> Result<()> {
    let peer: Option<SocketAddr> = client.peer_addr().ok();
    let forward_error = |message: String| Error::PortForward {
        namespace: namespace.to_string(),
        pod: pod.to_string(),
        message,
    };

    let mut forwarder = pods.portforward(pod, &[pod_port]).await?;
    let mut upstream = forwarder
        .take_stream(pod_port)
        .ok_or_else(|| forward_error(format!("no stream for port {}", pod_port)))?;

    let (sent, received) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    drop(upstream);

    forwarder
        .join()
        .await
        .map_err(|e| forward_error(e.to_string()))?;

    debug!(namespace, pod, port = pod_port, peer = ?peer, sent, received, "Forwarded connection closed");
    Ok(())
}
