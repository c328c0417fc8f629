//! Error types for Catapult

use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for Catapult operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while bridging cluster services to the workstation
#[derive(Error, Debug)]
pub enum Error {
    /// Cluster API call failed
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// No usable kubeconfig / in-cluster configuration
    #[error("Kubernetes configuration error: {0}")]
    KubeConfig(String),

    /// Reading or writing the hosts file failed
    #[error("Hosts file {path}: {source}")]
    HostsFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Adding or removing a loopback alias failed
    #[error("Failed to {action} address {address}: {message}")]
    Alias {
        action: &'static str,
        address: Ipv4Addr,
        message: String,
    },

    /// Port-forward session could not be set up
    #[error("Port-forward to {namespace}/{pod} failed: {message}")]
    PortForward {
        namespace: String,
        pod: String,
        message: String,
    },

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// The reconciler was started twice
    #[error("Catapult has already been started")]
    AlreadyStarted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Several independent operations failed
    #[error("{}", join_messages(.0))]
    Multiple(Vec<Error>),
}

fn join_messages(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Collects failures from a batch of independent operations.
///
/// A failure never stops the batch; the caller decides at the end whether
/// anything went wrong via [`Errors::into_result`].
#[derive(Debug, Default)]
pub struct Errors(Vec<Error>);

impl Errors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: Error) {
        match err {
            Error::Multiple(inner) => self.0.extend(inner),
            other => self.0.push(other),
        }
    }

    /// Record the error of `result`, if any, and hand back its value
    pub fn check<T>(&mut self, result: Result<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                self.push(e);
                None
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// `Ok(())` when nothing failed, the sole error when one did,
    /// `Error::Multiple` otherwise
    pub fn into_result(mut self) -> Result<()> {
        match self.0.len() {
            0 => Ok(()),
            1 => Err(self.0.remove(0)),
            _ => Err(Error::Multiple(self.0)),
        }
    }
}

impl fmt::Display for Errors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&join_messages(&self.0))
    }
}
