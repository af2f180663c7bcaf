//! Whole task runs driven through the operator.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::{Echo, TestClient, eventually, quick_config};
use crowdrun_core::{
    AssignmentSource, MockProvider, Operator, OperatorConfig, ProviderRegistry, TaskRunArgs,
};
use crowdrun_db::models::{AgentStatus, UnitStatus};
use crowdrun_db::{Datastore, MemoryDatastore};

fn operator(ds: Arc<MemoryDatastore>, provider: Arc<MockProvider>) -> Operator {
    let mut providers = ProviderRegistry::new();
    providers.register_shared(provider);
    Operator::new(
        ds,
        providers,
        OperatorConfig {
            tracking_interval: Duration::from_millis(20),
            launcher_interval: Duration::from_millis(10),
            supervisor: quick_config(),
        },
    )
}

async fn live_units(ds: &MemoryDatastore, task_run_id: uuid::Uuid) -> usize {
    ds.list_units_for_task_run(task_run_id, None)
        .await
        .unwrap()
        .iter()
        .filter(|unit| unit.status.is_live())
        .count()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_units_launch_one_at_a_time_and_run_completes() {
    let ds = Arc::new(MemoryDatastore::new());
    let provider = Arc::new(MockProvider::new());
    let operator = operator(ds.clone(), provider.clone());
    let args = TaskRunArgs {
        max_num_concurrent_units: 1,
        ..TaskRunArgs::default()
    };

    let run_id = operator
        .launch_task_run(
            "echo-three",
            Arc::new(Echo::new()),
            args,
            AssignmentSource::Static(vec![json!({}); 3]),
        )
        .await
        .unwrap();
    assert_eq!(operator.get_running_task_runs(), vec![run_id]);
    let supervisor = operator.supervisor(run_id).unwrap();
    let mut client = TestClient::attach(&supervisor, "chan").await;

    for round in 0..3 {
        eventually("next unit launched", || async {
            provider.launched_units().len() == round + 1
        })
        .await;
        assert!(live_units(&ds, run_id).await <= 1);

        let worker = format!("worker-{round}");
        let request = format!("req-{round}");
        let agent_id = client.register(&request, &worker).await.expect("granted");
        assert!(live_units(&ds, run_id).await <= 1);
        assert!(client.submit(agent_id, json!({"round": round})));
        client.expect_status(agent_id, "completed").await;
    }

    assert!(operator.wait_for_runs_then_shutdown(Some(Duration::from_secs(5))).await);
    assert!(ds.get_task_run(run_id).await.unwrap().is_completed);

    let units = ds.list_units_for_task_run(run_id, None).await.unwrap();
    assert!(units.iter().all(|u| u.status == UnitStatus::Completed));
    let launch_order: Vec<_> = units.iter().map(|u| u.id).collect();
    assert_eq!(provider.launched_units(), launch_order);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overdue_agent_is_expired_by_the_sweep() {
    let ds = Arc::new(MemoryDatastore::new());
    let provider = Arc::new(MockProvider::new());
    let operator = operator(ds.clone(), provider.clone());
    let args = TaskRunArgs {
        assignment_duration_secs: 0,
        ..TaskRunArgs::default()
    };

    let run_id = operator
        .launch_task_run(
            "echo-expiry",
            Arc::new(Echo::new()),
            args,
            AssignmentSource::Static(vec![json!({})]),
        )
        .await
        .unwrap();
    let supervisor = operator.supervisor(run_id).unwrap();
    eventually("unit launched", || async { provider.launched_units().len() == 1 }).await;

    let mut client = TestClient::attach(&supervisor, "chan").await;
    let agent_id = client.register("req", "sleepy").await.expect("granted");
    client.expect_status(agent_id, "expired").await;

    assert_eq!(
        ds.get_agent(agent_id).await.unwrap().status,
        AgentStatus::Expired
    );
    assert_eq!(provider.expired_units().len(), 1);
    eventually("unit expired", || async {
        ds.list_units_for_task_run(run_id, None).await.unwrap()[0].status == UnitStatus::Expired
    })
    .await;

    // An expired assignment is settled, so the run completes.
    assert!(operator.wait_for_runs_then_shutdown(Some(Duration::from_secs(5))).await);
    let progress = crowdrun_core::operator::task_run_progress(ds.as_ref(), run_id)
        .await
        .unwrap();
    assert_eq!(progress.get("expired"), Some(&1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn progress_counts_assignments_by_status() {
    let ds = Arc::new(MemoryDatastore::new());
    let provider = Arc::new(MockProvider::new());
    let operator = operator(ds.clone(), provider.clone());

    let run_id = operator
        .launch_task_run(
            "echo-progress",
            Arc::new(Echo::new()),
            TaskRunArgs::default(),
            AssignmentSource::Static(vec![json!({}); 2]),
        )
        .await
        .unwrap();
    eventually("both launched", || async { provider.launched_units().len() == 2 }).await;

    let supervisor = operator.supervisor(run_id).unwrap();
    let mut client = TestClient::attach(&supervisor, "chan").await;
    let agent_id = client.register("req", "judy").await.expect("granted");
    client.expect_status(agent_id, "in_task").await;

    let progress = operator.task_run_progress(run_id).await.unwrap();
    assert_eq!(progress.get("assigned"), Some(&1));
    assert_eq!(progress.get("launched"), Some(&1));

    operator.shutdown().await;
    let units = ds.list_units_for_task_run(run_id, None).await.unwrap();
    assert!(units.iter().all(|u| u.status == UnitStatus::Expired));
    assert!(operator.get_running_task_runs().is_empty());
}

#[tokio::test]
async fn unknown_provider_is_rejected() {
    let ds = Arc::new(MemoryDatastore::new());
    let operator = operator(ds.clone(), Arc::new(MockProvider::new()));
    let args = TaskRunArgs {
        provider_type: "nowhere".into(),
        ..TaskRunArgs::default()
    };

    let err = operator
        .launch_task_run("echo", Arc::new(Echo::new()), args, AssignmentSource::Static(vec![]))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("nowhere"));
    assert!(ds.list_task_runs(false).await.unwrap().is_empty());
}

#[tokio::test]
async fn task_type_mismatch_is_rejected() {
    let ds = Arc::new(MemoryDatastore::new());
    ds.create_task("shared-name", "something-else").await.unwrap();
    let operator = operator(ds.clone(), Arc::new(MockProvider::new()));

    let err = operator
        .launch_task_run(
            "shared-name",
            Arc::new(Echo::new()),
            TaskRunArgs::default(),
            AssignmentSource::Static(vec![]),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("something-else"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn streamed_assignments_complete_when_stream_ends() {
    let ds = Arc::new(MemoryDatastore::new());
    let provider = Arc::new(MockProvider::new());
    let operator = operator(ds.clone(), provider.clone());
    let (tx, rx) = tokio::sync::mpsc::channel(4);

    let run_id = operator
        .launch_task_run(
            "echo-stream",
            Arc::new(Echo::new()),
            TaskRunArgs::default(),
            AssignmentSource::from_receiver(rx),
        )
        .await
        .unwrap();
    let supervisor = operator.supervisor(run_id).unwrap();
    let mut client = TestClient::attach(&supervisor, "chan").await;

    tx.send(json!({"n": 1})).await.unwrap();
    eventually("streamed unit launched", || async { provider.launched_units().len() == 1 }).await;
    let agent_id = client.register("req", "kim").await.expect("granted");
    assert!(client.submit(agent_id, json!({})));
    client.expect_status(agent_id, "completed").await;

    // Still running: the stream may produce more.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(operator.get_running_task_runs(), vec![run_id]);

    drop(tx);
    assert!(operator.wait_for_runs_then_shutdown(Some(Duration::from_secs(5))).await);
    assert!(ds.get_task_run(run_id).await.unwrap().is_completed);
}
