use serde::{Deserialize, Serialize};

use crate::core::types::{ClusterId, JobName, NodeId, NodeKind, NodeStatus, ParamRef};
use crate::job::types::{ConfigType, JobManifest};

////////////////////////////////////////////////////
// Requests

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateJobRequest
{
    pub job_name: JobName,
    pub manifest: JobManifest,
}

/// Body of the requests that address a whole job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobNameRequest
{
    pub job_name: JobName,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterQuery
{
    pub job_name: JobName,
    pub cluster_id: ClusterId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfigQuery
{
    pub job_name: JobName,
    pub cluster_id: ClusterId,
    pub config_type: ConfigType,
}

/// Query of `get_job_status`. A polling node identifies itself to learn
/// whether it is admitted to run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobStatusQuery
{
    pub job_name: JobName,
    pub cluster_id: ClusterId,

    #[serde(default)]
    pub node_id: Option<NodeId>,

    #[serde(default)]
    pub node_type: Option<NodeKind>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendClientParamsRequest
{
    pub job_name: JobName,
    pub cluster_id: ClusterId,
    pub client_id: NodeId,
    pub param: String,

    #[serde(default)]
    pub extra_data: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendWorkerParamsRequest
{
    pub job_name: JobName,
    pub cluster_id: ClusterId,
    pub worker_id: NodeId,
    pub param: String,

    #[serde(default)]
    pub extra_data: Option<String>,
}

/// Optional payload of a status update.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StatusExtraData
{
    /// Seed parameter of the node, sent along with the dataset ack.
    #[serde(default)]
    pub initial_param: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpdateClientStatusRequest
{
    pub job_name: JobName,
    pub cluster_id: ClusterId,
    pub client_id: NodeId,
    pub status: NodeStatus,

    #[serde(default)]
    pub extra_data: Option<StatusExtraData>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpdateWorkerStatusRequest
{
    pub job_name: JobName,
    pub cluster_id: ClusterId,
    pub worker_id: NodeId,
    pub status: NodeStatus,

    #[serde(default)]
    pub extra_data: Option<StatusExtraData>,
}

impl AppendClientParamsRequest
{
    pub fn param_ref(&self) -> ParamRef
    {
        ParamRef::new(self.param.clone(), self.extra_data.clone())
    }
}

impl AppendWorkerParamsRequest
{
    pub fn param_ref(&self) -> ParamRef
    {
        ParamRef::new(self.param.clone(), self.extra_data.clone())
    }
}

////////////////////////////////////////////////////
// Responses

/// Body of every response, `payload` is only set by getters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiResponse<T>
{
    pub message: String,
    pub status: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<T>,
}

impl<T> ApiResponse<T>
{
    pub fn success(message: impl Into<String>, payload: Option<T>) -> Self
    {
        ApiResponse {
            message: message.into(),
            status: true,
            payload,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self
    {
        ApiResponse {
            message: message.into(),
            status: false,
            payload: None,
        }
    }
}
