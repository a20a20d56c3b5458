pub mod scheduler;

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use tracing::{error, info, warn};

use crate::consensus::ConsensusExecutor;
use crate::core::error::Result;
use crate::core::types::{ClusterId, NodeStatus, ParamRef, ProcessStage};
use crate::job::types::SideEffect;
use crate::job::Job;
use crate::registry::JobRegistry;

/////////////////////////////////////////////////////////////////////////
// Top-down folds
//
// Every fold visits the cluster tree in pre-order, children in declared
// order. A failing node never stops the walk; the result is the AND over
// all nodes. Each node operation takes and releases that cluster's lock on
// its own, no lock is held while moving between clusters.
//

/// Children of `job` that could be resolved, and whether all of them could.
async fn children(registry: &JobRegistry, job: &Job) -> (Vec<Job>, bool)
{
    let sub_clusters = match job.sub_clusters()
    {
        Ok(sub_clusters) => sub_clusters,
        Err(error) =>
        {
            error!(job = %job.job_id(), ?error, "Cannot read sub-clusters");
            return (vec![], false);
        }
    };

    let mut found = vec![];
    let mut complete = true;
    for cluster_id in sub_clusters
    {
        match registry.lookup_cluster(job.job_name(), &cluster_id).await
        {
            Some(child) => found.push(child),
            None =>
            {
                error!(job = %job.job_id(), %cluster_id, "Sub-cluster is not registered");
                complete = false;
            }
        }
    }
    (found, complete)
}

async fn fold_top_down<F, Fut>(registry: &JobRegistry, root: &Job, mut op: F) -> bool
where
    F: FnMut(Job) -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let mut status = true;
    let mut visited = HashSet::new();
    let mut pending = vec![root.clone()];

    while let Some(job) = pending.pop()
    {
        if !visited.insert(job.cluster_id().to_owned())
        {
            error!(job = %job.job_id(), "Cluster visited twice, skipping");
            status = false;
            continue;
        }

        match op(job.clone()).await
        {
            Ok(ok) => status &= ok,
            Err(error) =>
            {
                error!(job = %job.job_id(), ?error, "Operation failed");
                status = false;
            }
        }

        let (found, complete) = children(registry, &job).await;
        status &= complete;
        pending.extend(found.into_iter().rev());
    }
    status
}

pub async fn recursive_allow_jobsheet_download(registry: &JobRegistry, job: &Job) -> bool
{
    fold_top_down(registry, job, |job| async move {
        job.allow_jobsheet_download().await
    })
    .await
}

pub async fn recursive_allow_dataset_download(registry: &JobRegistry, job: &Job) -> bool
{
    fold_top_down(registry, job, |job| async move {
        job.allow_dataset_download().await
    })
    .await
}

pub async fn recursive_abort_job(registry: &JobRegistry, job: &Job) -> bool
{
    fold_top_down(registry, job, |job| async move { job.set_abort().await }).await
}

pub async fn recursive_terminate_job(registry: &JobRegistry, job: &Job) -> bool
{
    fold_top_down(registry, job, |job| async move {
        job.terminate_training().await
    })
    .await
}

/// Whether every cluster of the subtree completed training.
pub async fn recursive_check_delete_job(registry: &JobRegistry, job: &Job) -> bool
{
    fold_top_down(registry, job, |job| async move {
        Ok(job.get_job_status()?.process_stage == ProcessStage::TrainingCompleted)
    })
    .await
}

/// Set `param` as global model parameter across the subtree and move every
/// cluster on.
///
/// The termination decision is taken where the walk starts and handed down,
/// so a subtree never ends up half terminated. An intra-cluster epoch never
/// terminates. Each cluster then either terminates or starts the next round
/// of local training.
pub async fn recursive_set_global_params_and_start_training(
    registry: &JobRegistry,
    job: &Job,
    param: ParamRef,
    is_epoch: bool,
) -> bool
{
    info!(job = %job.job_id(), param = %param.param, is_epoch, "Distributing global params");

    let mut status = true;
    let mut visited = HashSet::new();
    let mut pending: Vec<(Job, Option<bool>)> = vec![(job.clone(), None)];

    while let Some((job, inherited)) = pending.pop()
    {
        if !visited.insert(job.cluster_id().to_owned())
        {
            error!(job = %job.job_id(), "Cluster visited twice, skipping");
            status = false;
            continue;
        }

        let terminate = match job.set_global_model_param(param.clone()).await
        {
            Ok((ok, flag)) =>
            {
                let terminate = inherited.unwrap_or(!is_epoch && flag);
                if ok
                {
                    let moved_on = if terminate
                    {
                        job.terminate_training().await
                    }
                    else
                    {
                        job.allow_start_training().await
                    };
                    match moved_on
                    {
                        Ok(ok) => status &= ok,
                        Err(error) =>
                        {
                            error!(job = %job.job_id(), ?error, "Cannot move on after setting params");
                            status = false;
                        }
                    }
                }
                else
                {
                    status = false;
                }
                terminate
            }
            Err(error) =>
            {
                error!(job = %job.job_id(), ?error, "Cannot set global params");
                status = false;
                inherited.unwrap_or(false)
            }
        };

        let (found, complete) = children(registry, &job).await;
        status &= complete;
        pending.extend(found.into_iter().rev().map(|child| (child, Some(terminate))));
    }
    status
}

/// First initial parameter submitted in the subtree, in pre-order.
async fn find_initial_param(registry: &JobRegistry, job: &Job) -> Option<String>
{
    let mut visited = HashSet::new();
    let mut pending = vec![job.clone()];
    while let Some(job) = pending.pop()
    {
        if !visited.insert(job.cluster_id().to_owned())
        {
            continue;
        }
        if let Some(param) = job
            .get_exec_params()
            .ok()
            .and_then(|exec| exec.initial_param().cloned())
        {
            return Some(param);
        }
        let (found, _) = children(registry, &job).await;
        pending.extend(found.into_iter().rev());
    }
    None
}

/// Seed the subtree with an initial parameter and start the first round.
pub async fn recursive_allow_training(registry: &JobRegistry, job: &Job) -> bool
{
    let Some(initial_param) = find_initial_param(registry, job).await
    else
    {
        warn!(job = %job.job_id(), "No initial params submitted, cannot start training");
        return false;
    };
    recursive_set_global_params_and_start_training(
        registry,
        job,
        ParamRef::new(initial_param, None),
        false,
    )
    .await
}

/////////////////////////////////////////////////////////////////////////
// Status handlers
//
// Status updates bubble from a cluster to its upstream cluster, where the
// cluster is one of the clients. Once a rendezvous completes at the primary
// cluster, a top-down fold pushes the next transition back down the tree.
//

pub struct OrchestrationHandlers
{
    registry: Arc<JobRegistry>,
    consensus: ConsensusExecutor,
}

impl OrchestrationHandlers
{
    pub fn new(registry: Arc<JobRegistry>, consensus: ConsensusExecutor) -> Self
    {
        OrchestrationHandlers {
            registry,
            consensus,
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry>
    {
        &self.registry
    }

    pub fn consensus(&self) -> &ConsensusExecutor
    {
        &self.consensus
    }

    /// Record a client's status and handle the resulting side effect.
    pub async fn recursive_client_status_handler(
        &self,
        job: Job,
        client_id: &str,
        client_status: NodeStatus,
    ) -> Result<(bool, SideEffect)>
    {
        let mut visited = HashSet::new();
        self.client_status_step(job, client_id.to_owned(), client_status, &mut visited)
            .await
    }

    /// Record a worker's status and handle the resulting side effect.
    pub async fn recursive_worker_status_handler(
        &self,
        job: Job,
        worker_id: &str,
        worker_status: NodeStatus,
    ) -> Result<(bool, SideEffect)>
    {
        let mut visited = HashSet::new();
        visited.insert(job.cluster_id().to_owned());

        let (mut status, side_effect) = job.update_worker_status(worker_id, worker_status).await?;

        match side_effect
        {
            SideEffect::JobsheetAcked =>
            {
                status &= self.ack_upstream(&job, &mut visited).await?;
                if job.is_primary()?
                {
                    status &= recursive_allow_dataset_download(&self.registry, &job).await;
                }
            }
            SideEffect::DatasetAcked =>
            {
                status &= self.ack_upstream(&job, &mut visited).await?;
                if job.is_primary()?
                {
                    status &= recursive_allow_training(&self.registry, &job).await;
                }
            }
            SideEffect::WorkersAggregated =>
            {
                status &= self.conclude_aggregation(&job, &mut visited).await?;
            }
            SideEffect::ClientsTraining | SideEffect::None =>
            {}
        }
        Ok((status, side_effect))
    }

    fn client_status_step<'a>(
        &'a self,
        job: Job,
        client_id: String,
        client_status: NodeStatus,
        visited: &'a mut HashSet<ClusterId>,
    ) -> BoxFuture<'a, Result<(bool, SideEffect)>>
    {
        async move {
            visited.insert(job.cluster_id().to_owned());

            let (mut status, side_effect) =
                job.update_client_status(&client_id, client_status).await?;

            match side_effect
            {
                SideEffect::JobsheetAcked =>
                {
                    status &= self.ack_upstream(&job, visited).await?;
                    if job.is_primary()?
                    {
                        status &= recursive_allow_dataset_download(&self.registry, &job).await;
                    }
                }
                SideEffect::DatasetAcked =>
                {
                    status &= self.ack_upstream(&job, visited).await?;
                    if job.is_primary()?
                    {
                        status &= recursive_allow_training(&self.registry, &job).await;
                    }
                }
                SideEffect::ClientsTraining =>
                {
                    status &= self.ack_upstream(&job, visited).await?;
                }
                SideEffect::WorkersAggregated | SideEffect::None =>
                {}
            }
            Ok((status, side_effect))
        }
        .boxed()
    }

    /// The upstream cluster of a non-primary `job`, if it can be resolved.
    async fn upstream_job(&self, job: &Job, visited: &HashSet<ClusterId>) -> Result<Option<Job>>
    {
        let Some(upstream_id) = job.upstream_cluster()?
        else
        {
            return Ok(None);
        };
        if visited.contains(&upstream_id)
        {
            error!(job = %job.job_id(), %upstream_id, "Upstream cluster already visited");
            return Ok(None);
        }
        let upstream = self
            .registry
            .lookup_cluster(job.job_name(), &upstream_id)
            .await;
        if upstream.is_none()
        {
            error!(job = %job.job_id(), %upstream_id, "Upstream cluster is not registered");
        }
        Ok(upstream)
    }

    /// Report this cluster's unified client stage to its upstream cluster.
    ///
    /// Nothing to do for the primary cluster.
    async fn ack_upstream(&self, job: &Job, visited: &mut HashSet<ClusterId>) -> Result<bool>
    {
        if job.is_primary()?
        {
            return Ok(true);
        }
        let Some(upstream) = self.upstream_job(job, visited).await?
        else
        {
            return Ok(false);
        };

        let client_stage = job.get_job_status()?.client_stage;
        info!(
            job = %job.job_id(),
            upstream = %upstream.job_id(),
            client_stage,
            "Reporting cluster status upstream"
        );
        let (ok, _) = self
            .client_status_step(upstream, job.cluster_id().to_owned(), client_stage, visited)
            .await?;
        Ok(ok)
    }

    /// Run consensus once all workers aggregated, then either open the next
    /// global round, push the result upstream, or repeat a local round.
    async fn conclude_aggregation(
        &self,
        job: &Job,
        visited: &mut HashSet<ClusterId>,
    ) -> Result<bool>
    {
        let (mut status, param) = self.consensus.execute(job).await;
        let Some(param) = param
        else
        {
            error!(job = %job.job_id(), "No consensus result and no initial params to fall back to");
            return Ok(false);
        };

        if job.is_primary()?
        {
            status &=
                recursive_set_global_params_and_start_training(&self.registry, job, param, false)
                    .await;
        }
        else if job.is_final_cluster_epoch()?
        {
            match self.upstream_job(job, visited).await?
            {
                Some(upstream) =>
                {
                    status &= upstream.append_client_params(job.cluster_id(), param).await?;

                    let client_stage = job.get_job_status()?.client_stage;
                    let (ok, _) = self
                        .client_status_step(
                            upstream,
                            job.cluster_id().to_owned(),
                            client_stage,
                            visited,
                        )
                        .await?;
                    status &= ok;
                }
                None => status = false,
            }
            job.reset_cluster_epoch().await?;
        }
        else
        {
            let epoch = job.increment_cluster_epoch().await?;
            info!(job = %job.job_id(), epoch, "Repeating local training in cluster");
            status &=
                recursive_set_global_params_and_start_training(&self.registry, job, param, true)
                    .await;
        }
        Ok(status)
    }
}
