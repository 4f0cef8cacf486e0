//! Read-only health survey across the fleet with bounded parallelism.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::domain::node::Node;
use crate::prober::{self, Health};
use crate::remote::Gateway;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurveyEntry {
    pub address: String,
    pub owner: String,
    pub healthy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurveyReport {
    pub network: String,
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: Vec<SurveyEntry>,
}

/// Check every node's health with at most `workers` checks in flight.
///
/// Results are collected by address; completion order does not matter.
pub async fn run(gw: Arc<Gateway>, nodes: Vec<Node>, workers: usize) -> SurveyReport {
    let limit = Arc::new(Semaphore::new(workers.max(1)));
    let results: Arc<Mutex<BTreeMap<String, SurveyEntry>>> = Arc::default();
    let mut tasks = JoinSet::new();

    for node in nodes {
        let gw = Arc::clone(&gw);
        let limit = Arc::clone(&limit);
        let results = Arc::clone(&results);
        tasks.spawn(async move {
            let Ok(_permit) = limit.acquire_owned().await else {
                return;
            };
            let health = prober::health(&gw, &node.address).await;
            debug!(address = %node.address, healthy = health.is_healthy(), "surveyed");
            let entry = SurveyEntry {
                healthy: health.is_healthy(),
                detail: match health {
                    Health::Healthy => None,
                    Health::Unhealthy(d) => Some(d),
                },
                address: node.address.clone(),
                owner: node.owner,
            };
            let mut guard = match results.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.insert(node.address, entry);
        });
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "survey worker failed");
        }
    }

    let results = match results.lock() {
        Ok(g) => g.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    };
    let unhealthy: Vec<SurveyEntry> = results.values().filter(|e| !e.healthy).cloned().collect();
    SurveyReport {
        network: gw.network().to_string(),
        total: results.len(),
        healthy: results.len() - unhealthy.len(),
        unhealthy,
    }
}
