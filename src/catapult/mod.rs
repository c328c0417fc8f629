//! Catapult: the network bridge reconciler
//!
//! Turns cluster services into local tunnels:
//! - [`derive_tunnels`] decides which tunnels should exist
//! - [`Tunnel`] aliases one local address and port-forwards it to a pod
//! - [`Catapult`] diffs desired against running tunnels on a fixed interval
//!   and keeps the hosts section in sync

mod derive;
mod reconciler;
mod tunnel;

pub use derive::{derive_tunnels, select_ports, CLUSTER_DOMAIN};
pub use reconciler::{Catapult, CatapultOptions, CatapultState, DEFAULT_INTERVAL};
pub use tunnel::{SessionHandle, Tunnel};
