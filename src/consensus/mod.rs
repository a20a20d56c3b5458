pub mod strategies;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tracing::{info, warn};

use crate::core::types::ParamRef;
use crate::job::Job;
use crate::params::ParamStore;

use self::strategies::{FirstSubmission, SuperMajority};

/// A consensus strategy, choosing one parameter among the workers' results.
///
/// `params` and `extras` are index aligned, in worker id order. A worker
/// that submitted no extra data has `None` in `extras`.
pub trait Consensus: Send + Sync
{
    fn run(
        &self,
        params: &[Vec<u8>],
        extras: &[Option<Vec<u8>>],
    ) -> Result<(Vec<u8>, Option<Vec<u8>>)>;
}

/// Strategies available to jobs, by the name used in the cluster config.
pub struct ConsensusTable
{
    strategies: HashMap<String, Arc<dyn Consensus>>,
}

impl ConsensusTable
{
    pub fn empty() -> Self
    {
        ConsensusTable {
            strategies: HashMap::new(),
        }
    }

    /// `first` and `majority_2_3`.
    pub fn with_defaults() -> Self
    {
        let mut table = Self::empty();
        table.register("first", Arc::new(FirstSubmission));
        table.register("majority_2_3", Arc::new(SuperMajority));
        table
    }

    pub fn register(&mut self, name: impl Into<String>, strategy: Arc<dyn Consensus>)
    {
        self.strategies.insert(name.into(), strategy);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Consensus>>
    {
        self.strategies.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool
    {
        self.strategies.contains_key(name)
    }
}

impl Default for ConsensusTable
{
    fn default() -> Self
    {
        Self::with_defaults()
    }
}

/// Runs a cluster's consensus strategy over its workers' aggregated params.
#[derive(Clone)]
pub struct ConsensusExecutor
{
    param_store: Arc<dyn ParamStore>,
    strategies: Arc<ConsensusTable>,
}

impl ConsensusExecutor
{
    pub fn new(param_store: Arc<dyn ParamStore>, strategies: Arc<ConsensusTable>) -> Self
    {
        ConsensusExecutor {
            param_store,
            strategies,
        }
    }

    pub fn param_store(&self) -> &Arc<dyn ParamStore>
    {
        &self.param_store
    }

    pub fn strategies(&self) -> &ConsensusTable
    {
        &self.strategies
    }

    /// Choose the cluster's new global parameter.
    ///
    /// Never fails: when the strategy cannot be run the job's current global
    /// parameter, or else its initial parameter, is returned with `false`.
    /// The returned param is `None` only if the job has neither.
    pub async fn execute(&self, job: &Job) -> (bool, Option<ParamRef>)
    {
        match self.try_execute(job).await
        {
            Ok(param) =>
            {
                info!(job = %job.job_id(), param = %param.param, "Consensus reached");
                (true, Some(param))
            }
            Err(error) =>
            {
                warn!(job = %job.job_id(), ?error, "Consensus failed, falling back to last known param");
                let fallback = job.get_exec_params().ok().and_then(|exec| {
                    let initial = exec
                        .initial_param()
                        .map(|param| ParamRef::new(param.clone(), None));
                    exec.global_model_param.or(initial)
                });
                (false, fallback)
            }
        }
    }

    async fn try_execute(&self, job: &Job) -> Result<ParamRef>
    {
        let state = job.snapshot()?;
        let name = &state.cluster_config.consensus;
        let strategy = self
            .strategies
            .get(name)
            .ok_or_else(|| anyhow!("Unknown consensus strategy [{name}]."))?;

        let mut params = vec![];
        let mut extras = vec![];
        for (worker_id, submitted) in &state.exec_params.worker_aggregated_params
        {
            let param = self
                .param_store
                .get(&submitted.param)
                .await
                .with_context(|| format!("fetching params of worker [{worker_id}]"))?;
            let extra = match &submitted.extra_data
            {
                Some(key) => Some(
                    self.param_store
                        .get(key)
                        .await
                        .with_context(|| format!("fetching extra data of worker [{worker_id}]"))?,
                ),
                None => None,
            };
            params.push(param);
            extras.push(extra);
        }

        let (param, extra) = strategy.run(&params, &extras)?;

        let param = self.param_store.set(param).await?;
        let extra_data = match extra
        {
            Some(extra) => Some(self.param_store.set(extra).await?),
            None => None,
        };
        Ok(ParamRef::new(param, extra_data))
    }
}
