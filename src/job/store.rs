use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{anyhow, Result};

use super::types::JobState;

/// Persistence substrate for job state, keyed by `"{job_name}#{cluster_id}"`.
///
/// Implementations only need to provide atomic single-key reads and writes;
/// read-modify-write sequences are serialized by the per-cluster lock held by
/// the caller.
pub trait JobStateStore: Send + Sync
{
    fn load(&self, job_id: &str) -> Result<Option<JobState>>;

    fn store(&self, job_id: &str, state: &JobState) -> Result<()>;

    fn remove(&self, job_id: &str) -> Result<Option<JobState>>;
}

/// Job state kept in the memory of this process.
#[derive(Default)]
pub struct InMemoryJobStateStore
{
    table: RwLock<HashMap<String, JobState>>,
}

impl InMemoryJobStateStore
{
    pub fn new() -> Self
    {
        Self::default()
    }
}

impl JobStateStore for InMemoryJobStateStore
{
    fn load(&self, job_id: &str) -> Result<Option<JobState>>
    {
        let table = self
            .table
            .read()
            .map_err(|_| anyhow!("job state table is poisoned"))?;
        Ok(table.get(job_id).cloned())
    }

    fn store(&self, job_id: &str, state: &JobState) -> Result<()>
    {
        let mut table = self
            .table
            .write()
            .map_err(|_| anyhow!("job state table is poisoned"))?;
        table.insert(job_id.to_owned(), state.clone());
        Ok(())
    }

    fn remove(&self, job_id: &str) -> Result<Option<JobState>>
    {
        let mut table = self
            .table
            .write()
            .map_err(|_| anyhow!("job state table is poisoned"))?;
        Ok(table.remove(job_id))
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::job::types::{ClusterConfig, JobManifest};

    fn some_state() -> JobState
    {
        let mut manifest = JobManifest::default();
        manifest.clusters.insert(
            "c0".to_owned(),
            ClusterConfig {
                cluster_id: String::new(),
                upstream_cluster: None,
                clients: vec!["client-0".to_owned()],
                workers: vec!["worker-0".to_owned()],
                cluster_epochs: 1,
                global_rounds: None,
                consensus: "first".to_owned(),
            },
        );
        JobState::from_manifest("c0", &manifest).unwrap()
    }

    #[test]
    fn stored_state_is_a_copy()
    {
        let store = InMemoryJobStateStore::new();
        let mut state = some_state();
        store.store("job#c0", &state).unwrap();

        state.job_status.abort = true;
        let loaded = store.load("job#c0").unwrap().unwrap();
        assert!(!loaded.job_status.abort);

        assert!(store.remove("job#c0").unwrap().is_some());
        assert!(store.load("job#c0").unwrap().is_none());
    }
}
