use crate::core::types::{NodeKind, ProcessStage};
use crate::job::types::{ExecParams, JobStatus, Participants};

/// Number of nodes admitted to run at the same time in `global_round`.
fn max_parallel(global_round: u64) -> usize
{
    global_round.saturating_sub(1).max(1) as usize
}

/// Nodes admitted next, taken in declared order after the `submitted` ones.
fn admitted<'a>(nodes: &'a [String], submitted: usize, parallel: usize) -> Vec<&'a str>
{
    let Some(last) = nodes.len().checked_sub(1)
    else
    {
        return vec![];
    };
    (0..parallel.min(nodes.len()))
        .map(|i| nodes[(i + submitted).min(last)].as_str())
        .collect()
}

/// Compute `start_scheduled_execution` for the polling node.
///
/// Clients are admitted during local training and workers during
/// aggregation. Nodes that already submitted params count against their
/// position, so the window slides along the declared order as results come
/// in.
pub fn schedule_job_status(
    participants: &Participants,
    status: &mut JobStatus,
    exec_params: &ExecParams,
    node_id: &str,
    node_kind: NodeKind,
)
{
    let parallel = max_parallel(status.global_round);

    let allowed = match (status.process_stage, node_kind)
    {
        (ProcessStage::InLocalTraining, NodeKind::Client) => admitted(
            &participants.clients,
            exec_params.client_trained_params.len(),
            parallel,
        ),
        (ProcessStage::InAggregation, NodeKind::Worker) => admitted(
            &participants.workers,
            exec_params.worker_aggregated_params.len(),
            parallel,
        ),
        _ => vec![],
    };

    status.start_scheduled_execution = allowed.contains(&node_id);
}
