pub mod policy;
pub mod store;
pub mod types;

use std::sync::Arc;

use anyhow::anyhow;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::core::error::{LogiconError, Result};
use crate::core::helpers::job_id;
use crate::core::types::{ClusterId, NodeId, NodeKind, NodeStatus, ParamRef, ProcessStage};

use self::policy::TerminationPolicy;
use self::store::JobStateStore;
use self::types::{
    ClientInfo, ConfigType, ExecParams, JobConfig, JobManifest, JobState, JobStatus, Participants,
    SideEffect, WorkerInfo,
};

/////////////////////////////////////////////////////////////////////////
// Job
//
// A `Job` is a cheap handle onto the persisted state of one cluster's job
// instance. Every mutating method follows the same protocol:
//
//  - acquire the cluster's modification lock,
//  - reload the state from the store,
//  - check the preconditions of the transition,
//  - mutate and write the state back,
//  - release the lock.
//
// A failed precondition is not an error: the method logs a warning and
// returns `false`, meaning "not yet". Errors are reserved for a missing or
// unreadable state.
//

#[derive(Clone)]
pub struct Job
{
    job_name: String,
    cluster_id: ClusterId,

    /// Shared by every handle onto the same cluster.
    modification_lock: Arc<Mutex<()>>,

    store: Arc<dyn JobStateStore>,
    policy: Arc<dyn TerminationPolicy>,
}

impl std::fmt::Debug for Job
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("Job")
            .field("job_name", &self.job_name)
            .field("cluster_id", &self.cluster_id)
            .finish()
    }
}

/// Common value of all statuses, if there is at least one and they agree.
fn unified(mut statuses: impl Iterator<Item = NodeStatus>) -> Option<NodeStatus>
{
    let first = statuses.next()?;
    statuses.all(|s| s == first).then_some(first)
}

/// Side effect of a freshly unified client or worker stage.
///
/// The first matching row wins.
pub fn stage_side_effect(status: &JobStatus) -> SideEffect
{
    let client_stage = status.client_stage;
    let worker_stage = status.worker_stage;

    if client_stage == 1 && worker_stage == 1
    {
        // ack jobsheet upstream, allow dataset download
        return SideEffect::JobsheetAcked;
    }
    if client_stage == 2 && worker_stage == 2
    {
        // ack dataset upstream, seed global param, allow training
        return SideEffect::DatasetAcked;
    }
    if client_stage == 3
    {
        // report training clients upstream
        return SideEffect::ClientsTraining;
    }
    if worker_stage == 4
    {
        // run consensus, then continue, push upstream or redistribute
        return SideEffect::WorkersAggregated;
    }
    SideEffect::None
}

impl Job
{
    ////////////////////////////////////////////////////
    // Construction

    /// Create and persist the state of `cluster_id` from a validated manifest.
    ///
    /// The returned handle owns a fresh modification lock; further handles
    /// must be cloned from it so that the lock is shared.
    pub async fn create(
        job_name: &str,
        cluster_id: &str,
        manifest: &JobManifest,
        store: Arc<dyn JobStateStore>,
        policy: Arc<dyn TerminationPolicy>,
    ) -> Result<Job>
    {
        let state = JobState::from_manifest(cluster_id, manifest).ok_or_else(|| {
            LogiconError::InvalidManifest(format!("Cluster [{cluster_id}] is not declared."))
        })?;

        let job = Job::load(
            job_name,
            cluster_id,
            Arc::new(Mutex::new(())),
            store,
            policy,
        );
        job.store.store(&job.job_id(), &state)?;

        for client_id in &state.cluster_config.clients
        {
            let is_cluster = state.sub_clusters.contains(client_id);
            if !job.add_client(client_id, is_cluster).await?
            {
                return Err(anyhow!("Could not register client [{client_id}].").into());
            }
        }
        for worker_id in &state.workers
        {
            if !job.add_worker(worker_id).await?
            {
                return Err(anyhow!("Could not register worker [{worker_id}].").into());
            }
        }

        info!(
            job_name,
            cluster_id,
            is_primary = state.is_primary,
            "Created job instance"
        );
        Ok(job)
    }

    /// Bind a handle to already persisted state.
    pub fn load(
        job_name: impl Into<String>,
        cluster_id: impl Into<String>,
        modification_lock: Arc<Mutex<()>>,
        store: Arc<dyn JobStateStore>,
        policy: Arc<dyn TerminationPolicy>,
    ) -> Self
    {
        Job {
            job_name: job_name.into(),
            cluster_id: cluster_id.into(),
            modification_lock,
            store,
            policy,
        }
    }

    pub fn job_name(&self) -> &str
    {
        &self.job_name
    }

    pub fn cluster_id(&self) -> &str
    {
        &self.cluster_id
    }

    pub fn job_id(&self) -> String
    {
        job_id(&self.job_name, &self.cluster_id)
    }

    /// Whether two handles serialize on the same lock.
    pub fn shares_lock_with(&self, other: &Job) -> bool
    {
        Arc::ptr_eq(&self.modification_lock, &other.modification_lock)
    }

    ////////////////////////////////////////////////////
    // State access

    fn read_state(&self) -> Result<JobState>
    {
        self.store
            .load(&self.job_id())?
            .ok_or_else(|| LogiconError::JobNotFound(self.job_id()))
    }

    pub(crate) fn update_state(&self, state: &JobState) -> Result<()>
    {
        self.store.store(&self.job_id(), state)?;
        Ok(())
    }

    /// Locked read-modify-write.
    ///
    /// `f` returns its result and whether the state has to be written back.
    async fn modify<T>(&self, f: impl FnOnce(&mut JobState) -> (T, bool)) -> Result<T>
    {
        let _guard = self.modification_lock.lock().await;
        let mut state = self.read_state()?;
        let (result, dirty) = f(&mut state);
        if dirty
        {
            self.update_state(&state)?;
        }
        Ok(result)
    }

    /// A consistent copy of the persisted state.
    pub fn snapshot(&self) -> Result<JobState>
    {
        self.read_state()
    }

    ////////////////////////////////////////////////////
    // Getters

    pub fn get_config(&self, config_type: ConfigType) -> Result<JobConfig>
    {
        let state = self.read_state()?;
        let config = match config_type
        {
            ConfigType::Cluster => JobConfig::Cluster(state.cluster_config),
            ConfigType::Client => JobConfig::Nodes(state.client_configs),
            ConfigType::Worker => JobConfig::Nodes(state.worker_configs),
        };
        Ok(config)
    }

    pub fn get_participants(&self) -> Result<Participants>
    {
        let state = self.read_state()?;
        Ok(Participants {
            clients: state.clients,
            sub_clusters: state.sub_clusters,
            workers: state.workers,
            upstream_cluster: state.cluster_config.upstream_cluster,
        })
    }

    pub fn get_job_status(&self) -> Result<JobStatus>
    {
        Ok(self.read_state()?.job_status)
    }

    pub fn get_exec_params(&self) -> Result<ExecParams>
    {
        Ok(self.read_state()?.exec_params)
    }

    pub fn is_primary(&self) -> Result<bool>
    {
        Ok(self.read_state()?.is_primary)
    }

    pub fn sub_clusters(&self) -> Result<Vec<ClusterId>>
    {
        Ok(self.read_state()?.sub_clusters)
    }

    pub fn upstream_cluster(&self) -> Result<Option<ClusterId>>
    {
        Ok(self.read_state()?.cluster_config.upstream_cluster)
    }

    ////////////////////////////////////////////////////
    // Download gating

    /// Let the nodes fetch their jobsheet.
    ///
    /// Requires the job not to be started and both download latches unset.
    #[instrument(skip(self), fields(job = %self.job_id()))]
    pub async fn allow_jobsheet_download(&self) -> Result<bool>
    {
        self.modify(|state| {
            let status = &mut state.job_status;
            let stage_flag = status.process_stage == ProcessStage::NotStarted
                && status.client_stage == 0
                && status.worker_stage == 0;
            let download_flag = !status.download_jobsheet && !status.download_dataset;

            if stage_flag && download_flag
            {
                status.download_jobsheet = true;
                (true, true)
            }
            else
            {
                warn!(
                    process_stage = %status.process_stage,
                    client_stage = status.client_stage,
                    worker_stage = status.worker_stage,
                    download_jobsheet = status.download_jobsheet,
                    download_dataset = status.download_dataset,
                    "Cannot ALLOW jobsheet download"
                );
                (false, false)
            }
        })
        .await
    }

    /// Let the nodes fetch their dataset, once every node acked the jobsheet.
    #[instrument(skip(self), fields(job = %self.job_id()))]
    pub async fn allow_dataset_download(&self) -> Result<bool>
    {
        self.modify(|state| {
            let status = &mut state.job_status;
            let stage_flag = status.process_stage == ProcessStage::NotStarted
                && status.client_stage == 1
                && status.worker_stage == 1;
            let download_flag = status.download_jobsheet && !status.download_dataset;

            if stage_flag && download_flag
            {
                status.download_dataset = true;
                (true, true)
            }
            else
            {
                warn!(
                    process_stage = %status.process_stage,
                    client_stage = status.client_stage,
                    worker_stage = status.worker_stage,
                    download_jobsheet = status.download_jobsheet,
                    download_dataset = status.download_dataset,
                    "Cannot ALLOW dataset download"
                );
                (false, false)
            }
        })
        .await
    }

    /// Latch the abort flag and mark the job as completed.
    #[instrument(skip(self), fields(job = %self.job_id()))]
    pub async fn set_abort(&self) -> Result<bool>
    {
        self.modify(|state| {
            state.job_status.abort = true;
            state.job_status.process_stage = ProcessStage::TrainingCompleted;
            info!("Job aborted");
            (true, true)
        })
        .await
    }

    ////////////////////////////////////////////////////
    // Participants

    #[instrument(skip(self), fields(job = %self.job_id()))]
    pub async fn add_client(&self, client_id: &str, is_cluster: bool) -> Result<bool>
    {
        self.modify(|state| {
            let status = &mut state.job_status;
            if status.process_stage != ProcessStage::NotStarted
            {
                warn!(process_stage = %status.process_stage, "Cannot ADD client");
                return (false, false);
            }
            if status.client_info.iter().any(|c| c.client_id == client_id)
            {
                warn!("Cannot ADD client, it is already registered");
                return (false, false);
            }
            status.client_info.push(ClientInfo {
                client_id: client_id.to_owned(),
                status: 0,
                is_cluster,
            });
            (true, true)
        })
        .await
    }

    #[instrument(skip(self), fields(job = %self.job_id()))]
    pub async fn add_worker(&self, worker_id: &str) -> Result<bool>
    {
        self.modify(|state| {
            let status = &mut state.job_status;
            if status.process_stage != ProcessStage::NotStarted
            {
                warn!(process_stage = %status.process_stage, "Cannot ADD worker");
                return (false, false);
            }
            if status.worker_info.iter().any(|w| w.worker_id == worker_id)
            {
                warn!("Cannot ADD worker, it is already registered");
                return (false, false);
            }
            status.worker_info.push(WorkerInfo {
                worker_id: worker_id.to_owned(),
                status: 0,
            });
            (true, true)
        })
        .await
    }

    ////////////////////////////////////////////////////
    // Status rendezvous

    /// Record the status of one client.
    ///
    /// `client_stage` is only overwritten when the update makes all client
    /// statuses agree on a value they did not already agree on. Only then a
    /// side effect is computed.
    #[instrument(skip(self), fields(job = %self.job_id()))]
    pub async fn update_client_status(
        &self,
        client_id: &str,
        client_status: NodeStatus,
    ) -> Result<(bool, SideEffect)>
    {
        self.modify(|state| {
            let status = &mut state.job_status;
            let previous = unified(status.client_info.iter().map(|c| c.status));

            let Some(record) = status
                .client_info
                .iter_mut()
                .find(|c| c.client_id == client_id)
            else
            {
                warn!("Cannot UPDATE status of unknown client");
                return ((false, SideEffect::None), false);
            };
            record.status = client_status;
            info!(
                stage = client_status,
                name = NodeKind::Client.stage_name(client_status),
                "Client status updated"
            );

            let mut side_effect = SideEffect::None;
            if let Some(stage) = unified(status.client_info.iter().map(|c| c.status))
            {
                if previous != Some(stage)
                {
                    status.client_stage = stage;
                    info!(client_stage = stage, "All clients are at the same stage");
                    side_effect = stage_side_effect(status);
                }
            }
            ((true, side_effect), true)
        })
        .await
    }

    /// Record the status of one worker, see `update_client_status`.
    #[instrument(skip(self), fields(job = %self.job_id()))]
    pub async fn update_worker_status(
        &self,
        worker_id: &str,
        worker_status: NodeStatus,
    ) -> Result<(bool, SideEffect)>
    {
        self.modify(|state| {
            let status = &mut state.job_status;
            let previous = unified(status.worker_info.iter().map(|w| w.status));

            let Some(record) = status
                .worker_info
                .iter_mut()
                .find(|w| w.worker_id == worker_id)
            else
            {
                warn!("Cannot UPDATE status of unknown worker");
                return ((false, SideEffect::None), false);
            };
            record.status = worker_status;
            info!(
                stage = worker_status,
                name = NodeKind::Worker.stage_name(worker_status),
                "Worker status updated"
            );

            let mut side_effect = SideEffect::None;
            if let Some(stage) = unified(status.worker_info.iter().map(|w| w.status))
            {
                if previous != Some(stage)
                {
                    status.worker_stage = stage;
                    info!(worker_stage = stage, "All workers are at the same stage");
                    side_effect = stage_side_effect(status);
                }
            }
            ((true, side_effect), true)
        })
        .await
    }

    ////////////////////////////////////////////////////
    // Training

    /// Move to local training.
    ///
    /// Requires process stage 0 or 2 and clients and workers at 2 or 4.
    #[instrument(skip(self), fields(job = %self.job_id()))]
    pub async fn allow_start_training(&self) -> Result<bool>
    {
        self.modify(|state| {
            let status = &mut state.job_status;
            let process_flag = matches!(
                status.process_stage,
                ProcessStage::NotStarted | ProcessStage::InAggregation
            );
            let client_flag = matches!(status.client_stage, 2 | 4);
            let worker_flag = matches!(status.worker_stage, 2 | 4);

            if process_flag && client_flag && worker_flag
            {
                status.process_stage = ProcessStage::InLocalTraining;
                info!("Changed process stage to 1, start training");
                (true, true)
            }
            else
            {
                warn!(
                    process_stage = %status.process_stage,
                    client_stage = status.client_stage,
                    worker_stage = status.worker_stage,
                    "Cannot SET process stage to 1 (in local training)"
                );
                (false, false)
            }
        })
        .await
    }

    /// End training, once clients wait for params and workers are done.
    #[instrument(skip(self), fields(job = %self.job_id()))]
    pub async fn terminate_training(&self) -> Result<bool>
    {
        self.modify(|state| {
            let status = &mut state.job_status;
            if status.process_stage == ProcessStage::InAggregation
                && status.client_stage == 4
                && status.worker_stage == 4
            {
                status.process_stage = ProcessStage::TrainingCompleted;
                info!("Training completed");
                (true, true)
            }
            else
            {
                warn!(
                    process_stage = %status.process_stage,
                    client_stage = status.client_stage,
                    worker_stage = status.worker_stage,
                    "Cannot TERMINATE training"
                );
                (false, false)
            }
        })
        .await
    }

    /// Set the global model parameter and open a new round.
    ///
    /// Clears the trained and aggregated params and bumps `global_round`.
    /// The second value tells whether the termination policy considers this
    /// parameter final; the caller decides between terminating and starting
    /// the next round.
    #[instrument(skip(self), fields(job = %self.job_id()))]
    pub async fn set_global_model_param(&self, param: ParamRef) -> Result<(bool, bool)>
    {
        self.modify(|state| {
            let process_stage = state.job_status.process_stage;
            if !matches!(
                process_stage,
                ProcessStage::NotStarted | ProcessStage::InAggregation
            )
            {
                warn!(%process_stage, "Global model parameters NOT set");
                return ((false, false), false);
            }

            state.exec_params.global_model_param = Some(param);
            state.exec_params.client_trained_params.clear();
            state.exec_params.worker_aggregated_params.clear();
            state.job_status.global_round += 1;

            let terminate = self.policy.should_terminate(state);
            info!(
                global_round = state.job_status.global_round,
                terminate,
                "Global model parameters are set"
            );
            ((true, terminate), true)
        })
        .await
    }

    /// Record the seed parameter a node submitted with its dataset ack.
    #[instrument(skip(self), fields(job = %self.job_id()))]
    pub async fn append_initial_params(&self, node_id: &str, param: &str) -> Result<bool>
    {
        self.modify(|state| {
            if state.job_status.process_stage != ProcessStage::NotStarted
            {
                warn!(
                    process_stage = %state.job_status.process_stage,
                    "Cannot APPEND initial params"
                );
                return (false, false);
            }
            if !state.is_participant(node_id) && !state.workers.iter().any(|w| w == node_id)
            {
                warn!("Cannot APPEND initial params of unknown node");
                return (false, false);
            }
            state.exec_params.set_initial_param(node_id, param);
            (true, true)
        })
        .await
    }

    /// Record the trained params of a client or sub-cluster.
    ///
    /// Once every client and sub-cluster submitted, the job moves to
    /// aggregation. Workers may be idle at stage 2 (first round) or 4 (later
    /// rounds).
    #[instrument(skip(self, param), fields(job = %self.job_id()))]
    pub async fn append_client_params(&self, client_id: &str, param: ParamRef) -> Result<bool>
    {
        self.modify(|state| {
            let status = &state.job_status;
            if status.process_stage != ProcessStage::InLocalTraining
                || !matches!(status.worker_stage, 2 | 4)
            {
                warn!(
                    process_stage = %status.process_stage,
                    client_stage = status.client_stage,
                    worker_stage = status.worker_stage,
                    "Cannot APPEND client model params"
                );
                return (false, false);
            }
            if !state.is_participant(client_id)
            {
                warn!("Cannot APPEND client model params of unknown client");
                return (false, false);
            }

            state
                .exec_params
                .client_trained_params
                .insert(client_id.to_owned(), param);

            let submitted = state.exec_params.client_trained_params.len();
            let expected = state.expected_client_params();
            info!(submitted, expected, "Client submitted params");

            if submitted == expected
            {
                state.job_status.process_stage = ProcessStage::InAggregation;
                info!("All client params are submitted, signalling aggregation");
            }
            (true, true)
        })
        .await
    }

    /// Record the aggregated params of a worker.
    #[instrument(skip(self, param), fields(job = %self.job_id()))]
    pub async fn append_worker_params(&self, worker_id: &str, param: ParamRef) -> Result<bool>
    {
        self.modify(|state| {
            let status = &state.job_status;
            if status.process_stage != ProcessStage::InAggregation || status.client_stage != 4
            {
                warn!(
                    process_stage = %status.process_stage,
                    client_stage = status.client_stage,
                    worker_stage = status.worker_stage,
                    "Cannot APPEND worker model params"
                );
                return (false, false);
            }
            if !state.workers.iter().any(|w| w == worker_id)
            {
                warn!("Cannot APPEND worker model params of unknown worker");
                return (false, false);
            }

            state
                .exec_params
                .worker_aggregated_params
                .insert(worker_id.to_owned(), param);

            let submitted = state.exec_params.worker_aggregated_params.len();
            let expected = state.workers.len();
            info!(submitted, expected, "Worker submitted params");
            if submitted == expected
            {
                info!("All worker params are submitted, next is consensus");
            }
            (true, true)
        })
        .await
    }

    ////////////////////////////////////////////////////
    // Cluster epochs

    pub fn is_final_cluster_epoch(&self) -> Result<bool>
    {
        let state = self.read_state()?;
        Ok(state.job_status.current_epoch >= state.cluster_config.cluster_epochs)
    }

    /// Count one more intra-cluster round, returning the new epoch.
    #[instrument(skip(self), fields(job = %self.job_id()))]
    pub async fn increment_cluster_epoch(&self) -> Result<u32>
    {
        self.modify(|state| {
            state.job_status.current_epoch += 1;
            info!(
                current_epoch = state.job_status.current_epoch,
                "Repeating local round"
            );
            (state.job_status.current_epoch, true)
        })
        .await
    }

    #[instrument(skip(self), fields(job = %self.job_id()))]
    pub async fn reset_cluster_epoch(&self) -> Result<()>
    {
        self.modify(|state| {
            state.job_status.current_epoch = 1;
            ((), true)
        })
        .await
    }

    /// Ids of the nodes of `kind` in declared order.
    pub fn nodes(&self, kind: NodeKind) -> Result<Vec<NodeId>>
    {
        let state = self.read_state()?;
        Ok(match kind
        {
            NodeKind::Client => state.cluster_config.clients,
            NodeKind::Worker => state.workers,
        })
    }
}

#[cfg(test)]
mod tests
{
    use super::policy::{ManifestRoundBudget, NeverTerminate};
    use super::store::InMemoryJobStateStore;
    use super::types::ClusterConfig;
    use super::*;

    fn manifest(clients: &[&str], workers: &[&str], global_rounds: Option<u64>) -> JobManifest
    {
        let mut manifest = JobManifest::default();
        manifest.clusters.insert(
            "c0".to_owned(),
            ClusterConfig {
                cluster_id: "c0".to_owned(),
                upstream_cluster: None,
                clients: clients.iter().map(|c| c.to_string()).collect(),
                workers: workers.iter().map(|w| w.to_string()).collect(),
                cluster_epochs: 1,
                global_rounds,
                consensus: "first".to_owned(),
            },
        );
        manifest
    }

    async fn job_with(clients: &[&str], workers: &[&str]) -> Job
    {
        Job::create(
            "job",
            "c0",
            &manifest(clients, workers, None),
            Arc::new(InMemoryJobStateStore::new()),
            Arc::new(NeverTerminate),
        )
        .await
        .unwrap()
    }

    fn set_status(job: &Job, f: impl FnOnce(&mut JobStatus))
    {
        let mut state = job.snapshot().unwrap();
        f(&mut state.job_status);
        job.update_state(&state).unwrap();
    }

    fn param(key: &str) -> ParamRef
    {
        ParamRef::new(key, Some(format!("{key}-extra")))
    }

    #[tokio::test]
    async fn create_registers_clients_and_workers()
    {
        let job = job_with(&["client-0", "client-1"], &["worker-0"]).await;
        let status = job.get_job_status().unwrap();

        assert_eq!(status.client_info.len(), 2);
        assert_eq!(status.worker_info.len(), 1);
        assert!(status.client_info.iter().all(|c| c.status == 0 && !c.is_cluster));
        assert_eq!(status.current_epoch, 1);
        assert!(job.is_primary().unwrap());
    }

    #[tokio::test]
    async fn download_latches_are_one_way()
    {
        let job = job_with(&["client-0"], &["worker-0"]).await;

        // dataset before jobsheet is refused
        set_status(&job, |s| {
            s.client_stage = 1;
            s.worker_stage = 1;
        });
        assert!(!job.allow_dataset_download().await.unwrap());
        assert!(!job.get_job_status().unwrap().download_dataset);

        set_status(&job, |s| {
            s.client_stage = 0;
            s.worker_stage = 0;
        });
        assert!(job.allow_jobsheet_download().await.unwrap());
        assert!(!job.allow_jobsheet_download().await.unwrap());

        set_status(&job, |s| {
            s.client_stage = 1;
            s.worker_stage = 1;
        });
        assert!(job.allow_dataset_download().await.unwrap());
        assert!(!job.allow_dataset_download().await.unwrap());

        job.set_abort().await.unwrap();
        job.set_abort().await.unwrap();

        let status = job.get_job_status().unwrap();
        assert!(status.download_jobsheet);
        assert!(status.download_dataset);
        assert!(status.abort);
        assert_eq!(status.process_stage, ProcessStage::TrainingCompleted);
    }

    #[tokio::test]
    async fn start_training_is_gated_on_all_stages()
    {
        let job = job_with(&["client-0"], &["worker-0"]).await;
        let process_stages = [
            ProcessStage::NotStarted,
            ProcessStage::InLocalTraining,
            ProcessStage::InAggregation,
            ProcessStage::TrainingCompleted,
        ];

        for process_stage in process_stages
        {
            for client_stage in 0..=5
            {
                for worker_stage in 0..=5
                {
                    set_status(&job, |s| {
                        s.process_stage = process_stage;
                        s.client_stage = client_stage;
                        s.worker_stage = worker_stage;
                    });

                    let expected = matches!(
                        process_stage,
                        ProcessStage::NotStarted | ProcessStage::InAggregation
                    ) && matches!(client_stage, 2 | 4)
                        && matches!(worker_stage, 2 | 4);

                    let allowed = job.allow_start_training().await.unwrap();
                    assert_eq!(
                        allowed, expected,
                        "process {process_stage}, client {client_stage}, worker {worker_stage}"
                    );
                    if allowed
                    {
                        assert_eq!(
                            job.get_job_status().unwrap().process_stage,
                            ProcessStage::InLocalTraining
                        );
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn client_stage_only_changes_on_rendezvous()
    {
        let job = job_with(&["client-0", "client-1", "client-2"], &["worker-0"]).await;

        let (ok, effect) = job.update_client_status("client-0", 1).await.unwrap();
        assert!(ok);
        assert_eq!(effect, SideEffect::None);
        assert_eq!(job.get_job_status().unwrap().client_stage, 0);

        job.update_client_status("client-1", 1).await.unwrap();
        assert_eq!(job.get_job_status().unwrap().client_stage, 0);

        job.update_client_status("client-2", 1).await.unwrap();
        assert_eq!(job.get_job_status().unwrap().client_stage, 1);

        // mixed again, the rendezvous value stays
        job.update_client_status("client-0", 2).await.unwrap();
        assert_eq!(job.get_job_status().unwrap().client_stage, 1);

        let (ok, _) = job.update_client_status("stranger", 2).await.unwrap();
        assert!(!ok);
    }

    #[tokio::test]
    async fn repeated_status_report_does_not_refire()
    {
        let job = job_with(&["client-0"], &["worker-0"]).await;

        job.update_client_status("client-0", 1).await.unwrap();
        let (_, effect) = job.update_worker_status("worker-0", 1).await.unwrap();
        assert_eq!(effect, SideEffect::JobsheetAcked);

        let (_, effect) = job.update_worker_status("worker-0", 1).await.unwrap();
        assert_eq!(effect, SideEffect::None);
    }

    #[tokio::test]
    async fn unification_after_mixed_statuses_fires_again()
    {
        let job = job_with(&["client-0"], &["worker-0", "worker-1"]).await;
        set_status(&job, |s| {
            s.client_stage = 4;
            s.worker_stage = 4;
            for w in s.worker_info.iter_mut()
            {
                w.status = 4;
            }
        });

        // worker-0 races through the next round before worker-1 starts it
        job.update_worker_status("worker-0", 3).await.unwrap();
        job.update_worker_status("worker-0", 4).await.unwrap();
        job.update_worker_status("worker-1", 3).await.unwrap();
        let (_, effect) = job.update_worker_status("worker-1", 4).await.unwrap();
        assert_eq!(effect, SideEffect::WorkersAggregated);
    }

    #[test]
    fn side_effect_table_rows()
    {
        let status = |client_stage, worker_stage| JobStatus {
            client_stage,
            worker_stage,
            ..JobStatus::default()
        };

        assert_eq!(stage_side_effect(&status(1, 1)), SideEffect::JobsheetAcked);
        assert_eq!(stage_side_effect(&status(2, 2)), SideEffect::DatasetAcked);
        assert_eq!(stage_side_effect(&status(3, 2)), SideEffect::ClientsTraining);
        assert_eq!(stage_side_effect(&status(4, 4)), SideEffect::WorkersAggregated);
        // first match wins
        assert_eq!(stage_side_effect(&status(3, 4)), SideEffect::ClientsTraining);
        assert_eq!(stage_side_effect(&status(1, 0)), SideEffect::None);
        assert_eq!(stage_side_effect(&status(2, 1)), SideEffect::None);
        assert_eq!(SideEffect::DatasetAcked.code(), 102);
    }

    #[tokio::test]
    async fn dataset_ack_yields_dataset_acked_only()
    {
        let job = job_with(&["client-0"], &["worker-0"]).await;
        set_status(&job, |s| {
            s.client_stage = 1;
            s.worker_stage = 2;
            s.client_info[0].status = 1;
            s.worker_info[0].status = 2;
        });

        let (_, effect) = job.update_client_status("client-0", 2).await.unwrap();
        assert_eq!(effect, SideEffect::DatasetAcked);
    }

    #[tokio::test]
    async fn setting_global_param_resets_exec_params()
    {
        let job = job_with(&["client-0", "client-1"], &["worker-0"]).await;
        set_status(&job, |s| {
            s.process_stage = ProcessStage::InLocalTraining;
            s.worker_stage = 2;
        });
        assert!(job.append_client_params("client-0", param("a")).await.unwrap());

        set_status(&job, |s| {
            s.process_stage = ProcessStage::InAggregation;
            s.client_stage = 4;
        });
        assert!(job.append_worker_params("worker-0", param("w")).await.unwrap());

        let before = job.get_job_status().unwrap().global_round;
        let (ok, terminate) = job.set_global_model_param(param("g")).await.unwrap();
        assert!(ok);
        assert!(!terminate);

        let exec = job.get_exec_params().unwrap();
        assert!(exec.client_trained_params.is_empty());
        assert!(exec.worker_aggregated_params.is_empty());
        assert_eq!(exec.global_model_param, Some(param("g")));
        assert_eq!(job.get_job_status().unwrap().global_round, before + 1);

        set_status(&job, |s| s.process_stage = ProcessStage::InLocalTraining);
        let (ok, _) = job.set_global_model_param(param("h")).await.unwrap();
        assert!(!ok);
    }

    #[tokio::test]
    async fn round_budget_flags_termination()
    {
        let job = Job::create(
            "job",
            "c0",
            &manifest(&["client-0"], &["worker-0"], Some(1)),
            Arc::new(InMemoryJobStateStore::new()),
            Arc::new(ManifestRoundBudget),
        )
        .await
        .unwrap();

        let (_, terminate) = job.set_global_model_param(param("seed")).await.unwrap();
        assert!(!terminate);

        set_status(&job, |s| s.process_stage = ProcessStage::InAggregation);
        let (_, terminate) = job.set_global_model_param(param("round-1")).await.unwrap();
        assert!(terminate);
    }

    #[tokio::test]
    async fn client_params_complete_in_any_order()
    {
        let ids = ["client-0", "client-1", "client-2"];
        let orders = [[0, 1, 2], [2, 0, 1], [1, 2, 0]];

        for order in orders
        {
            let job = job_with(&ids, &["worker-0"]).await;
            set_status(&job, |s| {
                s.process_stage = ProcessStage::InLocalTraining;
                s.worker_stage = 2;
            });

            for (n, i) in order.iter().enumerate()
            {
                let stage = job.get_job_status().unwrap().process_stage;
                assert_eq!(stage, ProcessStage::InLocalTraining, "after {n} submissions");
                assert!(job.append_client_params(ids[*i], param(ids[*i])).await.unwrap());
            }

            assert_eq!(
                job.get_job_status().unwrap().process_stage,
                ProcessStage::InAggregation
            );
            assert_eq!(job.get_exec_params().unwrap().client_trained_params.len(), 3);
        }
    }

    #[tokio::test]
    async fn params_from_unknown_nodes_are_refused()
    {
        let job = job_with(&["client-0"], &["worker-0"]).await;
        set_status(&job, |s| {
            s.process_stage = ProcessStage::InLocalTraining;
            s.worker_stage = 2;
        });
        assert!(!job.append_client_params("stranger", param("x")).await.unwrap());

        set_status(&job, |s| {
            s.process_stage = ProcessStage::InAggregation;
            s.client_stage = 4;
        });
        assert!(!job.append_worker_params("stranger", param("x")).await.unwrap());
    }

    #[tokio::test]
    async fn initial_params_only_before_start()
    {
        let job = job_with(&["client-0"], &["worker-0"]).await;
        assert!(job.append_initial_params("worker-0", "seed").await.unwrap());
        assert_eq!(
            job.get_exec_params().unwrap().initial_param(),
            Some(&"seed".to_owned())
        );

        set_status(&job, |s| s.process_stage = ProcessStage::InLocalTraining);
        assert!(!job.append_initial_params("client-0", "late").await.unwrap());
    }

    #[tokio::test]
    async fn earliest_seed_wins_regardless_of_node_id()
    {
        let job = job_with(&["client-0"], &["worker-0"]).await;
        assert!(job.append_initial_params("worker-0", "from-worker").await.unwrap());
        assert!(job.append_initial_params("client-0", "from-client").await.unwrap());
        assert_eq!(
            job.get_exec_params().unwrap().initial_param(),
            Some(&"from-worker".to_owned())
        );

        // a resubmission keeps its place
        assert!(job.append_initial_params("worker-0", "again").await.unwrap());
        let exec = job.get_exec_params().unwrap();
        assert_eq!(exec.initial_param(), Some(&"again".to_owned()));
        assert_eq!(exec.initial_params.len(), 2);
    }

    #[tokio::test]
    async fn participants_cannot_join_a_started_job()
    {
        let job = job_with(&["client-0"], &["worker-0"]).await;
        assert!(!job.add_client("client-0", false).await.unwrap());
        assert!(job.add_worker("worker-1").await.unwrap());

        set_status(&job, |s| s.process_stage = ProcessStage::InLocalTraining);
        assert!(!job.add_client("client-1", false).await.unwrap());
        assert!(!job.add_worker("worker-2").await.unwrap());
    }

    #[tokio::test]
    async fn cluster_epochs_count_up_and_reset()
    {
        let mut m = manifest(&["client-0"], &["worker-0"], None);
        m.clusters.get_mut("c0").unwrap().cluster_epochs = 2;
        let job = Job::create(
            "job",
            "c0",
            &m,
            Arc::new(InMemoryJobStateStore::new()),
            Arc::new(NeverTerminate),
        )
        .await
        .unwrap();

        assert!(!job.is_final_cluster_epoch().unwrap());
        assert_eq!(job.increment_cluster_epoch().await.unwrap(), 2);
        assert!(job.is_final_cluster_epoch().unwrap());
        job.reset_cluster_epoch().await.unwrap();
        assert_eq!(job.get_job_status().unwrap().current_epoch, 1);
    }

    #[tokio::test]
    async fn config_slices_follow_the_manifest()
    {
        let job = job_with(&["client-0"], &["worker-0"]).await;

        match job.get_config(ConfigType::Cluster).unwrap()
        {
            JobConfig::Cluster(config) => assert_eq!(config.cluster_id, "c0"),
            other => panic!("unexpected config {other:?}"),
        }
        match job.get_config(ConfigType::Worker).unwrap()
        {
            JobConfig::Nodes(nodes) => assert!(nodes.contains_key("worker-0")),
            other => panic!("unexpected config {other:?}"),
        }

        let participants = job.get_participants().unwrap();
        assert_eq!(participants.clients, vec!["client-0".to_owned()]);
        assert!(participants.upstream_cluster.is_none());
    }

    #[tokio::test]
    async fn missing_state_is_not_found()
    {
        let job = Job::load(
            "job",
            "ghost",
            Arc::new(Mutex::new(())),
            Arc::new(InMemoryJobStateStore::new()),
            Arc::new(NeverTerminate),
        );
        assert!(matches!(
            job.allow_jobsheet_download().await,
            Err(LogiconError::JobNotFound(_))
        ));
    }
}
