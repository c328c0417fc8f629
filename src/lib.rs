//! Catapult
//!
//! Makes services running inside a Kubernetes cluster reachable from the
//! local machine. Each service (or headless-service pod) gets a stable
//! loopback address, a hosts file entry and a port-forward to a pod, kept in
//! sync with the cluster by a polling reconciler.

pub mod catapult;
pub mod config;
pub mod error;
pub mod hosts;
pub mod k8s;
pub mod net;

pub use crate::catapult::{Catapult, CatapultOptions, CatapultState, Tunnel};
pub use crate::error::{Error, Errors, Result};
