#![allow(dead_code)]

use std::sync::Arc;

use logicon::consensus::{ConsensusExecutor, ConsensusTable};
use logicon::job::policy::{ManifestRoundBudget, TerminationPolicy};
use logicon::job::store::InMemoryJobStateStore;
use logicon::job::types::{ClusterConfig, JobManifest};
use logicon::job::Job;
use logicon::orchestration::OrchestrationHandlers;
use logicon::params::{InMemoryParamStore, ParamStore};
use logicon::registry::JobRegistry;
use serde_json::json;

pub const JOB: &str = "mnist";

pub fn cluster(upstream: Option<&str>, clients: &[&str], workers: &[&str]) -> ClusterConfig
{
    ClusterConfig {
        cluster_id: String::new(),
        upstream_cluster: upstream.map(str::to_owned),
        clients: clients.iter().map(|c| c.to_string()).collect(),
        workers: workers.iter().map(|w| w.to_string()).collect(),
        cluster_epochs: 1,
        global_rounds: None,
        consensus: "first".to_owned(),
    }
}

pub fn manifest(clusters: Vec<(&str, ClusterConfig)>) -> JobManifest
{
    let mut manifest = JobManifest::default();
    for (cluster_id, config) in clusters
    {
        for client_id in &config.clients
        {
            manifest
                .clients
                .insert(client_id.clone(), json!({ "batch_size": 32 }));
        }
        for worker_id in &config.workers
        {
            manifest
                .workers
                .insert(worker_id.clone(), json!({ "aggregation": "fedavg" }));
        }
        manifest.clusters.insert(cluster_id.to_owned(), config);
    }
    // sub-clusters are not leaf clients
    let cluster_ids: Vec<String> = manifest.clusters.keys().cloned().collect();
    for cluster_id in cluster_ids
    {
        manifest.clients.remove(&cluster_id);
    }
    manifest
}

/// hub -> {mid -> {leaf}}, every cluster with two clients and one worker.
pub fn three_level_manifest() -> JobManifest
{
    manifest(vec![
        ("hub", cluster(None, &["h-client-0", "mid"], &["h-worker"])),
        ("mid", cluster(Some("hub"), &["m-client-0", "leaf"], &["m-worker"])),
        ("leaf", cluster(Some("mid"), &["l-client-0", "l-client-1"], &["l-worker"])),
    ])
}

/// top -> {child}, each with two leaf clients and one worker.
pub fn two_level_manifest(global_rounds: Option<u64>) -> JobManifest
{
    let mut top = cluster(None, &["t-client-0", "t-client-1", "child"], &["t-worker"]);
    top.global_rounds = global_rounds;
    let mut child = cluster(Some("top"), &["c-client-0", "c-client-1"], &["c-worker"]);
    child.global_rounds = global_rounds;
    manifest(vec![("top", top), ("child", child)])
}

pub struct Harness
{
    pub registry: Arc<JobRegistry>,
    pub param_store: Arc<InMemoryParamStore>,
    pub handlers: OrchestrationHandlers,
}

impl Harness
{
    pub fn new() -> Self
    {
        Self::with_policy(Arc::new(ManifestRoundBudget))
    }

    pub fn with_policy(policy: Arc<dyn TerminationPolicy>) -> Self
    {
        let registry = Arc::new(JobRegistry::with_policy(
            Arc::new(InMemoryJobStateStore::new()),
            policy,
        ));
        let param_store = Arc::new(InMemoryParamStore::new());
        let store: Arc<dyn ParamStore> = param_store.clone();
        let consensus = ConsensusExecutor::new(store, Arc::new(ConsensusTable::with_defaults()));
        let handlers = OrchestrationHandlers::new(Arc::clone(&registry), consensus);
        Harness {
            registry,
            param_store,
            handlers,
        }
    }

    pub async fn job(&self, cluster_id: &str) -> Job
    {
        self.registry
            .lookup_cluster(JOB, cluster_id)
            .await
            .expect("cluster is registered")
    }
}
