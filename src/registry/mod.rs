use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::core::error::{LogiconError, Result};
use crate::core::helpers::{is_root_alias, job_id, root_job_id, validate_identifier, JOB_ID_SEPARATOR};
use crate::core::types::ClusterId;
use crate::job::policy::{ManifestRoundBudget, TerminationPolicy};
use crate::job::store::JobStateStore;
use crate::job::types::{ClusterConfig, JobManifest};
use crate::job::Job;
use crate::orchestration::recursive_check_delete_job;

//////////////////////////////////////////////////
// self:

/// All job instances served by this process.
///
/// Maps `"{job_name}#{cluster_id}"` to the handle of that cluster's job, and
/// `"{job_name}#root"` to the handle of the primary cluster. Handles of the
/// same cluster share one modification lock.
pub struct JobRegistry
{
    jobs: Mutex<HashMap<String, Job>>,
    store: Arc<dyn JobStateStore>,
    policy: Arc<dyn TerminationPolicy>,
}

impl JobRegistry
{
    /// A registry whose jobs terminate after the manifest's round budget.
    pub fn new(store: Arc<dyn JobStateStore>) -> Self
    {
        Self::with_policy(store, Arc::new(ManifestRoundBudget))
    }

    pub fn with_policy(store: Arc<dyn JobStateStore>, policy: Arc<dyn TerminationPolicy>) -> Self
    {
        JobRegistry {
            jobs: Mutex::new(HashMap::new()),
            store,
            policy,
        }
    }

    /// Create the job instances of every cluster in `manifest`.
    ///
    /// Either all clusters are created or none is.
    pub async fn create(&self, job_name: &str, mut manifest: JobManifest) -> Result<()>
    {
        validate_identifier("job", job_name)
            .map_err(|error| LogiconError::InvalidRequest(error.to_string()))?;
        let root_cluster = validate_manifest(&mut manifest)?;

        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(&root_job_id(job_name))
        {
            return Err(LogiconError::JobExists(job_name.to_owned()));
        }

        let mut created: Vec<Job> = vec![];
        for cluster_id in manifest.clusters.keys()
        {
            let result = Job::create(
                job_name,
                cluster_id,
                &manifest,
                Arc::clone(&self.store),
                Arc::clone(&self.policy),
            )
            .await;

            match result
            {
                Ok(job) => created.push(job),
                Err(error) =>
                {
                    warn!(job_name, %cluster_id, ?error, "Job creation failed, rolling back");
                    for job in &created
                    {
                        self.store.remove(&job.job_id())?;
                    }
                    self.store.remove(&job_id(job_name, cluster_id))?;
                    return Err(error);
                }
            }
        }

        for job in created
        {
            if job.cluster_id() == root_cluster
            {
                jobs.insert(root_job_id(job_name), job.clone());
            }
            jobs.insert(job.job_id(), job);
        }

        info!(job_name, clusters = manifest.clusters.len(), "Job created");
        Ok(())
    }

    pub async fn lookup(&self, job_id: &str) -> Option<Job>
    {
        self.jobs.lock().await.get(job_id).cloned()
    }

    pub async fn lookup_cluster(&self, job_name: &str, cluster_id: &str) -> Option<Job>
    {
        self.lookup(&job_id(job_name, cluster_id)).await
    }

    /// The primary cluster of a job.
    pub async fn root(&self, job_name: &str) -> Option<Job>
    {
        self.lookup(&root_job_id(job_name)).await
    }

    /// Remove a job whose clusters all completed training.
    pub async fn delete(&self, job_name: &str) -> Result<()>
    {
        let root = self
            .root(job_name)
            .await
            .ok_or_else(|| LogiconError::JobNotFound(job_name.to_owned()))?;

        if !recursive_check_delete_job(self, &root).await
        {
            return Err(LogiconError::Precondition(format!(
                "Job [{job_name}] cannot be deleted before training completed in every cluster."
            )));
        }

        let prefix = format!("{job_name}{JOB_ID_SEPARATOR}");
        let mut jobs = self.jobs.lock().await;
        let ids: Vec<String> = jobs
            .keys()
            .filter(|id| id.starts_with(&prefix))
            .cloned()
            .collect();

        for id in ids
        {
            jobs.remove(&id);
            if !is_root_alias(&id)
            {
                self.store.remove(&id)?;
            }
        }

        info!(job_name, "Job deleted");
        Ok(())
    }

    /// Ids of all registered cluster jobs, without the root aliases.
    pub async fn list_jobs(&self) -> Vec<String>
    {
        let jobs = self.jobs.lock().await;
        let mut ids: Vec<String> = jobs
            .keys()
            .filter(|id| !is_root_alias(id))
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

//////////////////////////////////////////////////
// validation:

fn invalid(message: String) -> LogiconError
{
    LogiconError::InvalidManifest(message)
}

fn validate_cluster(cluster_id: &str, config: &mut ClusterConfig) -> Result<()>
{
    validate_identifier("cluster", cluster_id).map_err(|e| invalid(e.to_string()))?;

    if config.cluster_id.is_empty()
    {
        config.cluster_id = cluster_id.to_owned();
    }
    else if config.cluster_id != cluster_id
    {
        return Err(invalid(format!(
            "Cluster [{cluster_id}] declares a different id [{}].",
            config.cluster_id
        )));
    }

    if config.clients.is_empty() || config.workers.is_empty()
    {
        return Err(invalid(format!(
            "Cluster [{cluster_id}] needs at least one client and one worker."
        )));
    }

    let mut seen = HashSet::new();
    for node_id in config.clients.iter().chain(config.workers.iter())
    {
        validate_identifier("node", node_id).map_err(|e| invalid(e.to_string()))?;
        if !seen.insert(node_id)
        {
            return Err(invalid(format!(
                "Node [{node_id}] is listed twice in cluster [{cluster_id}]."
            )));
        }
    }

    if config.cluster_epochs == 0
    {
        return Err(invalid(format!(
            "Cluster [{cluster_id}] needs at least one cluster epoch."
        )));
    }
    if config.global_rounds == Some(0)
    {
        return Err(invalid(format!(
            "Cluster [{cluster_id}] needs at least one global round."
        )));
    }
    Ok(())
}

/// Check that the clusters form a single tree and return its root.
fn validate_tree(clusters: &BTreeMap<ClusterId, ClusterConfig>) -> Result<ClusterId>
{
    let roots: Vec<&ClusterId> = clusters
        .iter()
        .filter(|(_, config)| config.upstream_cluster.is_none())
        .map(|(id, _)| id)
        .collect();
    let root = match roots.as_slice()
    {
        [root] => (*root).clone(),
        [] => return Err(invalid("No primary cluster declared.".to_owned())),
        _ => return Err(invalid("More than one primary cluster declared.".to_owned())),
    };

    for (cluster_id, config) in clusters
    {
        if let Some(upstream_id) = &config.upstream_cluster
        {
            let upstream = clusters.get(upstream_id).ok_or_else(|| {
                invalid(format!(
                    "Upstream [{upstream_id}] of cluster [{cluster_id}] is not declared."
                ))
            })?;
            if !upstream.clients.contains(cluster_id)
            {
                return Err(invalid(format!(
                    "Upstream [{upstream_id}] does not list cluster [{cluster_id}] as client."
                )));
            }
        }

        for client_id in &config.clients
        {
            if let Some(sub_cluster) = clusters.get(client_id)
            {
                if sub_cluster.upstream_cluster.as_deref() != Some(cluster_id.as_str())
                {
                    return Err(invalid(format!(
                        "Sub-cluster [{client_id}] does not name [{cluster_id}] as upstream."
                    )));
                }
            }
        }

        // every chain of upstreams has to end at the root
        let mut current = cluster_id;
        let mut steps = 0;
        while let Some(upstream_id) = clusters
            .get(current)
            .and_then(|config| config.upstream_cluster.as_ref())
        {
            steps += 1;
            if steps > clusters.len()
            {
                return Err(invalid(format!(
                    "Cluster [{cluster_id}] is part of a cycle."
                )));
            }
            current = upstream_id;
        }
    }

    Ok(root)
}

fn validate_manifest(manifest: &mut JobManifest) -> Result<ClusterId>
{
    if manifest.clusters.is_empty()
    {
        return Err(invalid("No clusters declared.".to_owned()));
    }
    for (cluster_id, config) in manifest.clusters.iter_mut()
    {
        validate_cluster(cluster_id, config)?;
    }
    validate_tree(&manifest.clusters)
}

#[cfg(test)]
mod tests
{
    use super::*;

    fn cluster(upstream: Option<&str>, clients: &[&str]) -> ClusterConfig
    {
        ClusterConfig {
            cluster_id: String::new(),
            upstream_cluster: upstream.map(str::to_owned),
            clients: clients.iter().map(|c| c.to_string()).collect(),
            workers: vec!["worker".to_owned()],
            cluster_epochs: 1,
            global_rounds: None,
            consensus: "first".to_owned(),
        }
    }

    fn manifest(clusters: Vec<(&str, ClusterConfig)>) -> JobManifest
    {
        JobManifest {
            clusters: clusters
                .into_iter()
                .map(|(id, config)| (id.to_owned(), config))
                .collect(),
            ..JobManifest::default()
        }
    }

    #[test]
    fn tree_manifest_is_accepted()
    {
        let mut m = manifest(vec![
            ("root", cluster(None, &["a"])),
            ("top", cluster(None, &["client", "mid"])),
            ("mid", cluster(Some("top"), &["client"])),
        ]);
        // "root" is reserved
        assert!(validate_manifest(&mut m).is_err());

        let mut m = manifest(vec![
            ("top", cluster(None, &["client", "mid"])),
            ("mid", cluster(Some("top"), &["client"])),
        ]);
        assert_eq!(validate_manifest(&mut m).unwrap(), "top");
        assert_eq!(m.clusters["mid"].cluster_id, "mid");
    }

    #[test]
    fn broken_trees_are_rejected()
    {
        // two roots
        let mut m = manifest(vec![
            ("a", cluster(None, &["client"])),
            ("b", cluster(None, &["client"])),
        ]);
        assert!(validate_manifest(&mut m).is_err());

        // upstream does not list the child
        let mut m = manifest(vec![
            ("a", cluster(None, &["client"])),
            ("b", cluster(Some("a"), &["client"])),
        ]);
        assert!(validate_manifest(&mut m).is_err());

        // cycle hanging off the root
        let mut m = manifest(vec![
            ("a", cluster(None, &["client"])),
            ("b", cluster(Some("c"), &["c"])),
            ("c", cluster(Some("b"), &["b"])),
        ]);
        assert!(validate_manifest(&mut m).is_err());

        // unknown upstream
        let mut m = manifest(vec![
            ("a", cluster(None, &["client"])),
            ("b", cluster(Some("x"), &["client"])),
        ]);
        assert!(validate_manifest(&mut m).is_err());
    }

    #[test]
    fn empty_clusters_are_rejected()
    {
        let mut m = manifest(vec![("a", cluster(None, &[]))]);
        assert!(validate_manifest(&mut m).is_err());

        let mut config = cluster(None, &["client"]);
        config.cluster_epochs = 0;
        let mut m = manifest(vec![("a", config)]);
        assert!(validate_manifest(&mut m).is_err());

        let mut m = manifest(vec![("a", cluster(None, &["client", "client"]))]);
        assert!(validate_manifest(&mut m).is_err());
    }
}
