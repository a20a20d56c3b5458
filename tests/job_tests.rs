mod common;

use std::sync::Arc;

use common::{cluster, manifest, JOB};
use logicon::core::types::{ParamRef, ProcessStage};
use logicon::job::store::InMemoryJobStateStore;
use logicon::job::types::SideEffect;
use logicon::registry::JobRegistry;

fn wide_manifest(clients: usize) -> logicon::job::types::JobManifest
{
    let ids: Vec<String> = (0..clients).map(|i| format!("client-{i}")).collect();
    let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
    manifest(vec![("c0", cluster(None, &refs, &["worker-0"]))])
}

#[tokio::test]
async fn concurrent_status_updates_rendezvous_once()
{
    let registry = JobRegistry::new(Arc::new(InMemoryJobStateStore::new()));
    registry.create(JOB, wide_manifest(32)).await.unwrap();

    let mut tasks = vec![];
    for i in 0..32
    {
        let job = registry.lookup_cluster(JOB, "c0").await.unwrap();
        tasks.push(tokio::spawn(async move {
            job.update_client_status(&format!("client-{i}"), 1)
                .await
                .unwrap()
        }));
    }

    for task in tasks
    {
        let (ok, side_effect) = task.await.unwrap();
        assert!(ok);
        assert_eq!(side_effect, SideEffect::None);
    }

    let job = registry.root(JOB).await.unwrap();
    let status = job.get_job_status().unwrap();
    assert!(status.client_info.iter().all(|c| c.status == 1));
    assert_eq!(status.client_stage, 1);

    // no update was lost, so the workers complete the rendezvous
    let (_, side_effect) = job.update_worker_status("worker-0", 1).await.unwrap();
    assert_eq!(side_effect, SideEffect::JobsheetAcked);
}

#[tokio::test]
async fn concurrent_submissions_complete_the_round_once()
{
    let registry = JobRegistry::new(Arc::new(InMemoryJobStateStore::new()));
    registry.create(JOB, wide_manifest(16)).await.unwrap();
    let job = registry.root(JOB).await.unwrap();

    // move to local training the regular way
    for i in 0..16
    {
        job.update_client_status(&format!("client-{i}"), 2)
            .await
            .unwrap();
    }
    job.update_worker_status("worker-0", 2).await.unwrap();
    job.set_global_model_param(ParamRef::new("seed", None))
        .await
        .unwrap();
    assert!(job.allow_start_training().await.unwrap());

    let mut tasks = vec![];
    for i in 0..16
    {
        let job = job.clone();
        tasks.push(tokio::spawn(async move {
            let client_id = format!("client-{i}");
            job.append_client_params(&client_id, ParamRef::new(format!("p{i}"), None))
                .await
                .unwrap()
        }));
    }
    for task in tasks
    {
        assert!(task.await.unwrap());
    }

    let status = job.get_job_status().unwrap();
    assert_eq!(status.process_stage, ProcessStage::InAggregation);
    assert_eq!(job.get_exec_params().unwrap().client_trained_params.len(), 16);
}
