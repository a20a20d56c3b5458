use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::types::{ClusterId, NodeId, NodeStatus, ParamRef, ProcessStage};

////////////////////////////////////////////////////
// Manifest

fn default_cluster_epochs() -> u32
{
    1
}

fn default_consensus() -> String
{
    "first".to_owned()
}

/// Static configuration of one cluster, as declared in the job manifest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig
{
    /// Filled in from the manifest key when omitted.
    #[serde(default)]
    pub cluster_id: ClusterId,

    /// `None` for the primary cluster.
    #[serde(default)]
    pub upstream_cluster: Option<ClusterId>,

    /// Leaf clients and sub-clusters, in declared order.
    pub clients: Vec<NodeId>,

    pub workers: Vec<NodeId>,

    /// Number of intra-cluster aggregation rounds before the result of a
    /// non-primary cluster is pushed upstream.
    #[serde(default = "default_cluster_epochs")]
    pub cluster_epochs: u32,

    /// Number of global rounds after which training is terminated.
    #[serde(default)]
    pub global_rounds: Option<u64>,

    /// Name of the consensus strategy run over the workers' results.
    #[serde(default = "default_consensus")]
    pub consensus: String,
}

/// The job manifest submitted on job creation.
///
/// Client and worker configs are opaque to the orchestration logic and
/// handed back to the nodes verbatim.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JobManifest
{
    pub clusters: BTreeMap<ClusterId, ClusterConfig>,

    #[serde(default)]
    pub clients: BTreeMap<NodeId, Value>,

    #[serde(default)]
    pub workers: BTreeMap<NodeId, Value>,
}

////////////////////////////////////////////////////
// Status

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo
{
    pub client_id: NodeId,
    pub status: NodeStatus,
    pub is_cluster: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo
{
    pub worker_id: NodeId,
    pub status: NodeStatus,
}

/// Mutable status of one cluster's job instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus
{
    /// Status shared by all clients, only written when all of them agree.
    pub client_stage: NodeStatus,

    /// Status shared by all workers, only written when all of them agree.
    pub worker_stage: NodeStatus,

    pub process_stage: ProcessStage,

    pub download_jobsheet: bool,
    pub download_dataset: bool,
    pub abort: bool,

    pub global_round: u64,

    /// Intra-cluster aggregation round, starting at 1.
    pub current_epoch: u32,

    pub client_info: Vec<ClientInfo>,
    pub worker_info: Vec<WorkerInfo>,

    /// Admission flag computed for the polling node.
    #[serde(default)]
    pub start_scheduled_execution: bool,
}

impl Default for JobStatus
{
    fn default() -> Self
    {
        JobStatus {
            client_stage: 0,
            worker_stage: 0,
            process_stage: ProcessStage::NotStarted,
            download_jobsheet: false,
            download_dataset: false,
            abort: false,
            global_round: 0,
            current_epoch: 1,
            client_info: vec![],
            worker_info: vec![],
            start_scheduled_execution: false,
        }
    }
}

/// Parameters exchanged during execution of one cluster's job instance.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecParams
{
    pub client_trained_params: BTreeMap<NodeId, ParamRef>,
    pub worker_aggregated_params: BTreeMap<NodeId, ParamRef>,
    pub global_model_param: Option<ParamRef>,

    /// Seed parameters submitted by nodes once their dataset is ready, in
    /// submission order.
    pub initial_params: Vec<InitialParam>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitialParam
{
    pub node_id: NodeId,
    pub param: String,
}

impl ExecParams
{
    /// The earliest submitted seed parameter.
    pub fn initial_param(&self) -> Option<&String>
    {
        self.initial_params.first().map(|initial| &initial.param)
    }

    /// Record a node's seed, replacing an earlier one of the same node in place.
    pub fn set_initial_param(&mut self, node_id: &str, param: &str)
    {
        match self.initial_params.iter_mut().find(|i| i.node_id == node_id)
        {
            Some(initial) => initial.param = param.to_owned(),
            None => self.initial_params.push(InitialParam {
                node_id: node_id.to_owned(),
                param: param.to_owned(),
            }),
        }
    }
}

////////////////////////////////////////////////////
// Persisted record

/// Everything persisted for one `(job_name, cluster_id)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobState
{
    pub is_primary: bool,
    pub cluster_config: ClusterConfig,
    pub client_configs: BTreeMap<NodeId, Value>,
    pub clients: Vec<NodeId>,
    pub sub_clusters: Vec<ClusterId>,
    pub worker_configs: BTreeMap<NodeId, Value>,
    pub workers: Vec<NodeId>,
    pub job_status: JobStatus,
    pub exec_params: ExecParams,
}

impl JobState
{
    /// Build the initial state of `cluster_id` from a validated manifest.
    ///
    /// Client and worker records are not populated here, see `Job::create`.
    pub fn from_manifest(cluster_id: &str, manifest: &JobManifest) -> Option<Self>
    {
        let mut cluster_config = manifest.clusters.get(cluster_id)?.clone();
        cluster_config.cluster_id = cluster_id.to_owned();

        let mut client_configs = BTreeMap::new();
        let mut clients = vec![];
        let mut sub_clusters = vec![];
        for client_id in &cluster_config.clients
        {
            if manifest.clusters.contains_key(client_id)
            {
                sub_clusters.push(client_id.clone());
            }
            else
            {
                let config = manifest.clients.get(client_id).cloned().unwrap_or(Value::Null);
                client_configs.insert(client_id.clone(), config);
                clients.push(client_id.clone());
            }
        }

        let mut worker_configs = BTreeMap::new();
        for worker_id in &cluster_config.workers
        {
            let config = manifest.workers.get(worker_id).cloned().unwrap_or(Value::Null);
            worker_configs.insert(worker_id.clone(), config);
        }

        Some(JobState {
            is_primary: cluster_config.upstream_cluster.is_none(),
            workers: cluster_config.workers.clone(),
            cluster_config,
            client_configs,
            clients,
            sub_clusters,
            worker_configs,
            job_status: JobStatus::default(),
            exec_params: ExecParams::default(),
        })
    }

    /// Number of parameter submissions that completes a local training round.
    pub fn expected_client_params(&self) -> usize
    {
        self.clients.len() + self.sub_clusters.len()
    }

    pub fn is_participant(&self, client_id: &str) -> bool
    {
        self.clients.iter().any(|c| c == client_id)
            || self.sub_clusters.iter().any(|c| c == client_id)
    }
}

////////////////////////////////////////////////////
// Side effects

/// Follow-up work signalled by a stage update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SideEffect
{
    None,
    /// Clients and workers acknowledged the jobsheet.
    JobsheetAcked,
    /// Clients and workers acknowledged the dataset.
    DatasetAcked,
    /// Clients entered local training.
    ClientsTraining,
    /// Workers finished aggregating, consensus is due.
    WorkersAggregated,
}

impl SideEffect
{
    /// Numeric signal code, 1xx client and worker, 2xx client, 3xx worker.
    pub fn code(&self) -> u16
    {
        match self
        {
            SideEffect::None => 0,
            SideEffect::JobsheetAcked => 101,
            SideEffect::DatasetAcked => 102,
            SideEffect::ClientsTraining => 201,
            SideEffect::WorkersAggregated => 301,
        }
    }
}

////////////////////////////////////////////////////
// Views

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigType
{
    Cluster,
    Client,
    Worker,
}

/// A slice of a job's configuration, selected by `ConfigType`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobConfig
{
    Cluster(ClusterConfig),
    Nodes(BTreeMap<NodeId, Value>),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participants
{
    pub clients: Vec<NodeId>,
    pub sub_clusters: Vec<ClusterId>,
    pub workers: Vec<NodeId>,
    pub upstream_cluster: Option<ClusterId>,
}
