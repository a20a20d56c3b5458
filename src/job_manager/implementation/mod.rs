use std::sync::Arc;

use tracing::{info, warn};

use crate::consensus::{ConsensusExecutor, ConsensusTable};
use crate::core::error::{LogiconError, Result};
use crate::job::store::JobStateStore;
use crate::job::types::{ExecParams, JobConfig, JobStatus, Participants};
use crate::job::Job;
use crate::job_manager::interface::types::{
    AppendClientParamsRequest, AppendWorkerParamsRequest, ClusterQuery, ConfigQuery,
    CreateJobRequest, JobNameRequest, JobStatusQuery, UpdateClientStatusRequest,
    UpdateWorkerStatusRequest,
};
use crate::orchestration::scheduler::schedule_job_status;
use crate::orchestration::{
    recursive_abort_job, recursive_allow_jobsheet_download, recursive_terminate_job,
    OrchestrationHandlers,
};
use crate::params::ParamStore;
use crate::registry::JobRegistry;

/// Status code of a node that is ready with its dataset.
const READY_WITH_DATASET: u32 = 2;

fn ensure(ok: bool) -> Result<()>
{
    if ok
    {
        Ok(())
    }
    else
    {
        Err(LogiconError::Precondition(
            "Failure in compliance with Job Logic.".to_owned(),
        ))
    }
}

//////////////////////////////////////////////////
// self:

/// Serves the job manager requests on top of a registry of jobs.
pub struct JobManager
{
    registry: Arc<JobRegistry>,
    handlers: OrchestrationHandlers,
}

impl JobManager
{
    pub fn new(
        store: Arc<dyn JobStateStore>,
        param_store: Arc<dyn ParamStore>,
        strategies: ConsensusTable,
    ) -> Self
    {
        let registry = Arc::new(JobRegistry::new(store));
        let consensus = ConsensusExecutor::new(param_store, Arc::new(strategies));
        Self::from_parts(registry, consensus)
    }

    pub fn from_parts(registry: Arc<JobRegistry>, consensus: ConsensusExecutor) -> Self
    {
        Self {
            handlers: OrchestrationHandlers::new(Arc::clone(&registry), consensus),
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry>
    {
        &self.registry
    }

    async fn cluster(&self, job_name: &str, cluster_id: &str) -> Result<Job>
    {
        self.registry
            .lookup_cluster(job_name, cluster_id)
            .await
            .ok_or_else(|| LogiconError::JobNotFound(format!("{job_name}#{cluster_id}")))
    }

    async fn root(&self, job_name: &str) -> Result<Job>
    {
        self.registry
            .root(job_name)
            .await
            .ok_or_else(|| LogiconError::JobNotFound(job_name.to_owned()))
    }

    ////////////////////////////////////////////////////
    // lifecycle

    pub async fn handle_create(&self, request: CreateJobRequest) -> Result<()>
    {
        let CreateJobRequest {
            job_name,
            manifest,
        } = request;

        let strategies = self.handlers.consensus().strategies();
        for (cluster_id, config) in &manifest.clusters
        {
            if !strategies.contains(&config.consensus)
            {
                return Err(LogiconError::InvalidManifest(format!(
                    "Cluster [{cluster_id}] uses unknown consensus strategy [{}].",
                    config.consensus
                )));
            }
        }

        self.registry.create(&job_name, manifest).await
    }

    pub async fn handle_start(&self, request: JobNameRequest) -> Result<()>
    {
        let root = self.root(&request.job_name).await?;
        info!(job_name = %request.job_name, "Starting job");
        ensure(recursive_allow_jobsheet_download(&self.registry, &root).await)
    }

    pub async fn handle_set_abort(&self, request: JobNameRequest) -> Result<()>
    {
        let root = self.root(&request.job_name).await?;
        ensure(recursive_abort_job(&self.registry, &root).await)
    }

    pub async fn handle_terminate_training(&self, request: JobNameRequest) -> Result<()>
    {
        let root = self.root(&request.job_name).await?;
        ensure(recursive_terminate_job(&self.registry, &root).await)
    }

    pub async fn handle_delete(&self, request: JobNameRequest) -> Result<()>
    {
        self.registry.delete(&request.job_name).await
    }

    pub async fn handle_list(&self) -> Vec<String>
    {
        self.registry.list_jobs().await
    }

    ////////////////////////////////////////////////////
    // getters

    pub async fn handle_get_config(&self, query: ConfigQuery) -> Result<JobConfig>
    {
        let job = self.cluster(&query.job_name, &query.cluster_id).await?;
        job.get_config(query.config_type)
    }

    pub async fn handle_get_participants(&self, query: ClusterQuery) -> Result<Participants>
    {
        let job = self.cluster(&query.job_name, &query.cluster_id).await?;
        job.get_participants()
    }

    /// The job status, with the admission flag computed for the polling node.
    pub async fn handle_get_job_status(&self, query: JobStatusQuery) -> Result<JobStatus>
    {
        let job = self.cluster(&query.job_name, &query.cluster_id).await?;
        let state = job.snapshot()?;
        let mut status = state.job_status;

        if let (Some(node_id), Some(node_kind)) = (&query.node_id, query.node_type)
        {
            let participants = job.get_participants()?;
            schedule_job_status(
                &participants,
                &mut status,
                &state.exec_params,
                node_id,
                node_kind,
            );
        }
        Ok(status)
    }

    pub async fn handle_get_exec_params(&self, query: ClusterQuery) -> Result<ExecParams>
    {
        let job = self.cluster(&query.job_name, &query.cluster_id).await?;
        job.get_exec_params()
    }

    ////////////////////////////////////////////////////
    // params

    pub async fn handle_append_client_params(&self, request: AppendClientParamsRequest)
        -> Result<()>
    {
        let job = self.cluster(&request.job_name, &request.cluster_id).await?;
        ensure(
            job.append_client_params(&request.client_id, request.param_ref())
                .await?,
        )
    }

    pub async fn handle_append_worker_params(&self, request: AppendWorkerParamsRequest)
        -> Result<()>
    {
        let job = self.cluster(&request.job_name, &request.cluster_id).await?;
        ensure(
            job.append_worker_params(&request.worker_id, request.param_ref())
                .await?,
        )
    }

    ////////////////////////////////////////////////////
    // status

    async fn record_initial_param(&self, job: &Job, node_id: &str, param: Option<&String>)
        -> Result<()>
    {
        if let Some(param) = param
        {
            if !job.append_initial_params(node_id, param).await?
            {
                warn!(job = %job.job_id(), node_id, "Initial params were not recorded");
            }
        }
        Ok(())
    }

    pub async fn handle_update_client_status(&self, request: UpdateClientStatusRequest)
        -> Result<()>
    {
        let job = self.cluster(&request.job_name, &request.cluster_id).await?;

        if request.status == READY_WITH_DATASET
        {
            let initial_param = request
                .extra_data
                .as_ref()
                .and_then(|extra| extra.initial_param.as_ref());
            self.record_initial_param(&job, &request.client_id, initial_param)
                .await?;
        }

        let (ok, _) = self
            .handlers
            .recursive_client_status_handler(job, &request.client_id, request.status)
            .await?;
        ensure(ok)
    }

    pub async fn handle_update_worker_status(&self, request: UpdateWorkerStatusRequest)
        -> Result<()>
    {
        let job = self.cluster(&request.job_name, &request.cluster_id).await?;

        if request.status == READY_WITH_DATASET
        {
            let initial_param = request
                .extra_data
                .as_ref()
                .and_then(|extra| extra.initial_param.as_ref());
            self.record_initial_param(&job, &request.worker_id, initial_param)
                .await?;
        }

        let (ok, _) = self
            .handlers
            .recursive_worker_status_handler(job, &request.worker_id, request.status)
            .await?;
        ensure(ok)
    }
}
