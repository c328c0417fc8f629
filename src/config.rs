use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::catapult::CatapultOptions;
use crate::error::Result;
use crate::hosts::system_hosts_path;
use crate::k8s::NamespaceScope;

/// Prefix of every environment variable Catapult reads
pub const ENV_PREFIX: &str = "CATAPULT";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Namespace whose services also resolve by bare name
    #[serde(default = "default_scope")]
    pub scope: String,

    /// Namespaces to bridge; empty means all
    #[serde(default)]
    pub namespaces: Vec<String>,

    /// Label selector applied to services and pods
    #[serde(default)]
    pub selector: String,

    #[serde(default = "default_hosts_file")]
    pub hosts_file: PathBuf,

    /// Name of the hosts file section owned by this process
    #[serde(default = "default_section")]
    pub section: String,

    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// kubeconfig context; the current context when unset
    #[serde(default)]
    pub kube_context: Option<String>,
}

fn default_scope() -> String {
    "default".to_string()
}

fn default_hosts_file() -> PathBuf {
    system_hosts_path()
}

fn default_section() -> String {
    "catapult".to_string()
}

fn default_interval_secs() -> u64 {
    10
}

impl Config {
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        Self::from_environment(config::Environment::with_prefix(ENV_PREFIX))
    }

    /// Build from an environment source, e.g. one with an explicit variable map
    pub fn from_environment(environment: config::Environment) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(
                environment
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("namespaces"),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    pub fn namespace_scope(&self) -> NamespaceScope {
        NamespaceScope::from(self.namespaces.clone())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn catapult_options(&self) -> CatapultOptions {
        CatapultOptions {
            scope: self.scope.clone(),
            namespaces: self.namespace_scope(),
            selector: self.selector.clone(),
            interval: self.interval(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scope: default_scope(),
            namespaces: Vec::new(),
            selector: String::new(),
            hosts_file: default_hosts_file(),
            section: default_section(),
            interval_secs: default_interval_secs(),
            kube_context: None,
        }
    }
}
