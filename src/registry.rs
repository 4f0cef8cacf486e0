//! Node registry: the fleet listing and the deployment-key mapping.
//!
//! The listing comes from the registry node on the platform. The mapping file
//! (`{ "<key>": { "<network>": "<address>" } }`) is local and may be stale for
//! nodes created after its last refresh, so lookups report `NotFound` rather
//! than failing the whole run.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::DfxConfig;
use crate::domain::node::{parse_listing, Node};
use crate::remote::{Gateway, Operation};
use crate::retry::call_with_retry;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("no deployment key maps to {address} on {network}")]
    NotFound { address: String, network: String },
    #[error("{address} on {network} maps to several deployment keys: {}", .keys.join(", "))]
    Ambiguous {
        address: String,
        network: String,
        keys: Vec<String>,
    },
}

#[derive(Debug, Clone, Default)]
pub struct DeploymentMap {
    entries: BTreeMap<String, BTreeMap<String, String>>,
}

impl DeploymentMap {
    pub fn from_json(raw: &str) -> Result<Self> {
        let value: serde_json::Value =
            serde_json::from_str(raw).context("deployment mapping is not valid JSON")?;
        let mut entries = BTreeMap::new();
        if let Some(obj) = value.as_object() {
            for (key, networks) in obj {
                // non-object entries (comments, metadata) are not deployments
                let Some(networks) = networks.as_object() else {
                    continue;
                };
                let addrs = networks
                    .iter()
                    .filter_map(|(net, addr)| Some((net.clone(), addr.as_str()?.to_string())))
                    .collect();
                entries.insert(key.clone(), addrs);
            }
        }
        Ok(Self { entries })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading deployment mapping {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The single deployment key that owns `address` on `network`.
    pub fn resolve(&self, address: &str, network: &str) -> Result<String, ResolveError> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, nets)| nets.get(network).map(String::as_str) == Some(address))
            .map(|(key, _)| key.clone())
            .collect();
        match keys.len() {
            0 => Err(ResolveError::NotFound {
                address: address.to_string(),
                network: network.to_string(),
            }),
            1 => Ok(keys.remove(0)),
            _ => Err(ResolveError::Ambiguous {
                address: address.to_string(),
                network: network.to_string(),
                keys,
            }),
        }
    }
}

/// Ask the registry node for the full fleet listing.
pub async fn fetch_nodes(gw: &Gateway, dfx: &DfxConfig) -> Result<Vec<Node>> {
    let policy = gw.retry().status;
    let out = call_with_retry(&policy, "registry listing", || {
        gw.call(&dfx.registry_node, Operation::query_json(&dfx.registry_method))
    })
    .await
    .with_context(|| format!("listing nodes from {}", dfx.registry_node))?;
    let nodes = parse_listing(&out.stdout)
        .with_context(|| format!("reading node listing from {}", dfx.registry_node))?;
    info!(count = nodes.len(), "fetched fleet listing");
    Ok(nodes)
}

/// Run the configured mapping refresh before a run.
pub async fn refresh(gw: &Gateway, dfx: &DfxConfig) -> Result<()> {
    if dfx.prepare_command.is_empty() {
        warn!("no prepare_command configured; using the mapping file as is");
        return Ok(());
    }
    gw.call("", Operation::RefreshRegistry)
        .await
        .context("refreshing the deployment mapping")?;
    Ok(())
}
