use anyhow::anyhow;
use serde::{Deserialize, Serialize};

////////////////////////////////////////////////////
// Identifiers

pub type JobName = String;
pub type ClusterId = String;
pub type NodeId = String;

/// Status code reported by a single client or worker.
pub type NodeStatus = u32;

////////////////////////////////////////////////////
// Stages

/// The stage a cluster's job is in.
///
/// Advances `NotStarted -> InLocalTraining -> InAggregation`, then either
/// loops back to `InLocalTraining` for the next round or ends in
/// `TrainingCompleted`. Serialized as its numeric code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ProcessStage
{
    NotStarted,
    InLocalTraining,
    InAggregation,
    TrainingCompleted,
}

impl Default for ProcessStage
{
    fn default() -> Self
    {
        ProcessStage::NotStarted
    }
}

impl From<ProcessStage> for u8
{
    fn from(stage: ProcessStage) -> u8
    {
        match stage
        {
            ProcessStage::NotStarted => 0,
            ProcessStage::InLocalTraining => 1,
            ProcessStage::InAggregation => 2,
            ProcessStage::TrainingCompleted => 3,
        }
    }
}

impl TryFrom<u8> for ProcessStage
{
    type Error = anyhow::Error;

    fn try_from(code: u8) -> Result<Self, Self::Error>
    {
        match code
        {
            0 => Ok(ProcessStage::NotStarted),
            1 => Ok(ProcessStage::InLocalTraining),
            2 => Ok(ProcessStage::InAggregation),
            3 => Ok(ProcessStage::TrainingCompleted),
            other => Err(anyhow!("{other} is not a valid process stage")),
        }
    }
}

impl std::fmt::Display for ProcessStage
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        let name = match self
        {
            ProcessStage::NotStarted => "Not Started",
            ProcessStage::InLocalTraining => "In Local Training",
            ProcessStage::InAggregation => "In Aggregation",
            ProcessStage::TrainingCompleted => "Training Completed",
        };
        write!(f, "{} ({name})", u8::from(*self))
    }
}

/// The kind of node reporting to a cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind
{
    Client,
    Worker,
}

impl NodeKind
{
    /// Human readable name of a status code reported by this kind of node.
    pub fn stage_name(&self, status: NodeStatus) -> &'static str
    {
        match (self, status)
        {
            (_, 0) => "Online",
            (_, 1) => "Ready With Jobsheet",
            (NodeKind::Client, 2) => "Ready With Dataset",
            (NodeKind::Client, 3) => "Busy In Training",
            (NodeKind::Client, 4) => "Waiting For Params",
            (NodeKind::Worker, 2) => "In Aggregation",
            (NodeKind::Worker, 3) => "Aggregated Params Uploaded",
            (NodeKind::Worker, 4) => "Busy In Consensus",
            (_, 5) => "Terminated",
            _ => "Unknown",
        }
    }
}

impl std::fmt::Display for NodeKind
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        match self
        {
            NodeKind::Client => write!(f, "client"),
            NodeKind::Worker => write!(f, "worker"),
        }
    }
}

////////////////////////////////////////////////////
// Parameters

/// Keys of a parameter and its extra data in the parameter store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamRef
{
    pub param: String,

    #[serde(default)]
    pub extra_data: Option<String>,
}

impl ParamRef
{
    pub fn new(param: impl Into<String>, extra_data: Option<String>) -> Self
    {
        ParamRef {
            param: param.into(),
            extra_data,
        }
    }
}
