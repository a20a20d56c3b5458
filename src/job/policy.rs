use super::types::JobState;

/// Decides whether a freshly set global parameter ends training.
///
/// Consulted by `Job::set_global_model_param` after the round counter was
/// incremented.
pub trait TerminationPolicy: Send + Sync
{
    fn should_terminate(&self, state: &JobState) -> bool;
}

/// Never ends training; termination has to be requested explicitly.
pub struct NeverTerminate;

impl TerminationPolicy for NeverTerminate
{
    fn should_terminate(&self, _state: &JobState) -> bool
    {
        false
    }
}

/// Ends training once `global_round` exceeds the cluster's `global_rounds`.
///
/// The initial parameter opens round 1, so with a budget of `n` the parameter
/// produced by the `n`-th consensus is the final one.
pub struct ManifestRoundBudget;

impl TerminationPolicy for ManifestRoundBudget
{
    fn should_terminate(&self, state: &JobState) -> bool
    {
        match state.cluster_config.global_rounds
        {
            Some(budget) => state.job_status.global_round > budget,
            None => false,
        }
    }
}
