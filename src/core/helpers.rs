use anyhow::{anyhow, Result};

/// Separator between job name and cluster id in registry and store keys.
pub const JOB_ID_SEPARATOR: char = '#';

/// Suffix under which the primary cluster of a job is aliased.
pub const ROOT_ALIAS: &str = "root";

/// Encode the id of a cluster's job instance, `"{job_name}#{cluster_id}"`.
pub fn job_id(job_name: &str, cluster_id: &str) -> String
{
    format!("{job_name}{JOB_ID_SEPARATOR}{cluster_id}")
}

/// The id under which the primary cluster of a job is aliased.
pub fn root_job_id(job_name: &str) -> String
{
    job_id(job_name, ROOT_ALIAS)
}

/// Decode a job id into job name and cluster id.
pub fn split_job_id(job_id: &str) -> Result<(&str, &str)>
{
    job_id
        .split_once(JOB_ID_SEPARATOR)
        .ok_or(anyhow!("Job id [{job_id}] is missing the cluster part."))
}

/// Whether a job id refers to the root alias rather than to a cluster.
pub fn is_root_alias(job_id: &str) -> bool
{
    matches!(split_job_id(job_id), Ok((_, ROOT_ALIAS)))
}

/// Check that a job name or node id can be used as part of a job id.
pub fn validate_identifier(kind: &str, id: &str) -> Result<()>
{
    if id.is_empty()
    {
        return Err(anyhow!("{kind} id must not be empty."));
    }
    if id.contains(JOB_ID_SEPARATOR)
    {
        return Err(anyhow!(
            "{kind} id [{id}] must not contain '{JOB_ID_SEPARATOR}'."
        ));
    }
    if id == ROOT_ALIAS
    {
        return Err(anyhow!("{kind} id [{id}] is reserved."));
    }
    Ok(())
}
