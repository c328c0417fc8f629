//! Kubernetes integration module for Catapult
//!
//! This module handles all interactions with the cluster:
//! - Listing services and pods across a namespace scope
//! - Deciding which pods may receive traffic
//! - Port-forwarding local addresses to pod container ports

mod client;
mod discovery;
mod resources;

pub use client::K8sClient;
pub use discovery::{select_pods, ClusterApi, Discovery, NamespaceScope};
pub use resources::{
    ClusterIp, PodView, PortMap, Selector, ServicePortView, ServiceView, TargetPort,
    HEADLESS_CLUSTER_IP, POD_RUNNING,
};
