//! Registration, dispatch and status handling driven through local
//! channels against an in-memory datastore.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::{Echo, Harness, Pair, TestClient, agent_id_of, eventually, quick_config};
use crowdrun_core::packet::PacketType;
use crowdrun_core::qualifications;
use crowdrun_core::{SupervisorConfig, TaskRunArgs};
use crowdrun_db::Datastore;
use crowdrun_db::models::{AgentStatus, UnitStatus};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_unit_many_registrations_one_winner() {
    let h = Harness::start(Arc::new(Echo::new()), TaskRunArgs::default(), 1, quick_config()).await;

    let mut clients = Vec::new();
    for i in 0..8 {
        clients.push(TestClient::attach(&h.supervisor, &format!("chan-{i}")).await);
    }
    for (i, client) in clients.iter().enumerate() {
        assert!(client.send(
            PacketType::NewAgent,
            json!({"request_id": format!("req-{i}"), "provider_data": {"worker_name": format!("w{i}")}}),
        ));
    }

    let mut winners = Vec::new();
    for (i, client) in clients.iter_mut().enumerate() {
        let reply = client.details(&format!("req-{i}")).await;
        if let Some(agent_id) = agent_id_of(&reply) {
            winners.push(agent_id);
        } else {
            assert_eq!(reply["failure_reason"], "no unit available");
        }
    }
    assert_eq!(winners.len(), 1, "exactly one registration wins the unit");

    let unit = &h
        .ds
        .list_units_for_task_run(h.supervisor.task_run_id(), None)
        .await
        .unwrap()[0];
    assert_eq!(unit.status, UnitStatus::Assigned);
    assert_eq!(unit.agent_id, Some(winners[0]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shared_request_id_does_not_share_agents() {
    let h = Harness::start(Arc::new(Echo::new()), TaskRunArgs::default(), 2, quick_config()).await;
    let mut alice = TestClient::attach(&h.supervisor, "alice-chan").await;
    let mut bob = TestClient::attach(&h.supervisor, "bob-chan").await;

    let alices = alice.register("1", "alice").await.expect("alice granted");
    let bobs = bob.register("1", "bob").await.expect("bob granted");
    assert_ne!(alices, bobs);
    assert_eq!(h.supervisor.agent(alices).unwrap().channel_id(), "alice-chan");
    assert_eq!(h.supervisor.agent(bobs).unwrap().channel_id(), "bob-chan");

    // A duplicate delivery on the same channel is answered from record.
    assert_eq!(alice.register("1", "alice").await, Some(alices));
    assert_eq!(
        h.unit_statuses().await,
        vec![UnitStatus::Assigned, UnitStatus::Assigned]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reconnect_under_registration_id_returns_existing_agent() {
    let h = Harness::start(Arc::new(Echo::new()), TaskRunArgs::default(), 3, quick_config()).await;
    let mut first = TestClient::attach(&h.supervisor, "first").await;
    let agent_id = first
        .register_as("r1", "alice", "alice-asg-1")
        .await
        .expect("granted");

    // The client comes back on a new channel with a fresh request id.
    let mut second = TestClient::attach(&h.supervisor, "second").await;
    assert_eq!(
        second.register_as("r2", "alice", "alice-asg-1").await,
        Some(agent_id)
    );
    assert_eq!(h.supervisor.agent(agent_id).unwrap().channel_id(), "second");

    // Registration ids belong to one worker.
    let bobs = second
        .register_as("r3", "bob", "alice-asg-1")
        .await
        .expect("bob granted");
    assert_ne!(bobs, agent_id);

    let assigned = h
        .unit_statuses()
        .await
        .into_iter()
        .filter(|s| *s == UnitStatus::Assigned)
        .count();
    assert_eq!(assigned, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn echo_flow_completes_unit() {
    let h = Harness::start(Arc::new(Echo::new()), TaskRunArgs::default(), 1, quick_config()).await;
    let mut client = TestClient::attach(&h.supervisor, "chan").await;

    let agent_id = client.register("req", "alice").await.expect("granted");
    client.expect_status(agent_id, "in_task").await;

    assert!(client.send(
        PacketType::GetInitData,
        json!({"request_id": "init", "agent_id": agent_id.to_string()}),
    ));
    let init = client
        .expect("init data", |p| p.packet_type == PacketType::InitData)
        .await;
    assert_eq!(init.data["request_id"], "init");
    assert!(init.data["init_data"]["unit_id"].is_string());

    client
        .expect("action request", |p| p.packet_type == PacketType::RequestAction)
        .await;
    assert!(client.act(agent_id, json!({"text": "hello"})));
    let echo = client
        .expect("echo", |p| p.packet_type == PacketType::AgentAction)
        .await;
    assert_eq!(echo.data["action"]["echo"]["text"], "hello");

    assert!(client.submit(agent_id, json!({"text": "done"})));
    client.expect_status(agent_id, "completed").await;

    let agent = h.supervisor.agent(agent_id).unwrap();
    eventually("unit completed", || async {
        h.unit_statuses().await == vec![UnitStatus::Completed]
    })
    .await;
    let state = agent.state();
    assert_eq!(state.inputs().len(), 2);
    assert_eq!(state.submission().unwrap()["text"], "done");
    assert!(state.init_data().is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disconnect_before_acting_frees_unit_for_another_worker() {
    let blueprint = Arc::new(Echo::new());
    let h = Harness::start(blueprint.clone(), TaskRunArgs::default(), 1, quick_config()).await;
    let mut alice = TestClient::attach(&h.supervisor, "alice").await;

    let lost = alice.register("req-a", "alice").await.expect("granted");
    alice.expect_status(lost, "in_task").await;
    alice.remote().disconnect();

    let agent = h.supervisor.agent(lost).unwrap();
    agent.wait_for_status(|s| s == AgentStatus::Disconnect).await;
    eventually("unit back to launched", || async {
        h.unit_statuses().await == vec![UnitStatus::Launched]
    })
    .await;
    eventually("cleanup ran", || async { blueprint.cleanups() == 1 }).await;

    let mut bob = TestClient::attach(&h.supervisor, "bob").await;
    let taken = bob.register("req-b", "bob").await.expect("unit is free again");
    assert_ne!(taken, lost);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disconnect_after_progress_expires_unit() {
    let h = Harness::start(Arc::new(Echo::new()), TaskRunArgs::default(), 1, quick_config()).await;
    let mut alice = TestClient::attach(&h.supervisor, "alice").await;

    let agent_id = alice.register("req", "alice").await.expect("granted");
    assert!(alice.act(agent_id, json!({"draft": 1})));
    alice
        .expect("echo", |p| p.packet_type == PacketType::AgentAction)
        .await;
    alice.remote().disconnect();

    eventually("unit expired", || async {
        h.unit_statuses().await == vec![UnitStatus::Expired]
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn act_timeout_moves_agent_to_timeout() {
    let blueprint = Arc::new(Echo::with_act_timeout(Duration::from_millis(50)));
    let h = Harness::start(blueprint, TaskRunArgs::default(), 1, quick_config()).await;
    let mut client = TestClient::attach(&h.supervisor, "chan").await;

    let agent_id = client.register("req", "slow").await.expect("granted");
    client.expect_status(agent_id, "timeout").await;
    assert_eq!(
        h.ds.get_agent(agent_id).await.unwrap().status,
        AgentStatus::Timeout
    );
    eventually("unit released", || async {
        h.unit_statuses().await == vec![UnitStatus::Launched]
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_onboarding_denies_later_registrations() {
    let args = TaskRunArgs {
        onboarding_qualification: Some("echo-onboarded".into()),
        ..TaskRunArgs::default()
    };
    let h = Harness::start(Arc::new(Echo::with_onboarding()), args, 2, quick_config()).await;
    let mut client = TestClient::attach(&h.supervisor, "chan").await;

    let reply = client.new_agent("r1", "carol").await;
    assert!(reply["onboard_data"]["question"].is_string());
    let onboarding_id = reply["agent_id"].as_str().unwrap().to_owned();

    assert!(client.send(
        PacketType::SubmitOnboarding,
        json!({"request_id": "r2", "onboarding_agent_id": onboarding_id, "data": {"answer": 41}}),
    ));
    let judged = client.details("r2").await;
    assert!(judged["agent_id"].is_null());

    let retry = client.new_agent("r3", "carol").await;
    assert!(retry["agent_id"].is_null());
    assert!(retry.get("onboard_data").is_none());
    assert_eq!(retry["failure_reason"], "worker failed onboarding");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn passed_onboarding_grants_a_unit() {
    let args = TaskRunArgs {
        onboarding_qualification: Some("echo-onboarded".into()),
        ..TaskRunArgs::default()
    };
    let h = Harness::start(Arc::new(Echo::with_onboarding()), args, 2, quick_config()).await;
    let mut client = TestClient::attach(&h.supervisor, "chan").await;

    let reply = client.new_agent("r1", "dave").await;
    let onboarding_id = reply["agent_id"].as_str().unwrap().to_owned();
    assert!(client.send(
        PacketType::SubmitOnboarding,
        json!({"request_id": "r2", "onboarding_agent_id": onboarding_id, "data": {"answer": 42}}),
    ));
    let judged = client.details("r2").await;
    let agent_id = agent_id_of(&judged).expect("granted after onboarding");

    let worker = h.ds.get_agent(agent_id).await.unwrap().worker_id;
    let value = qualifications::worker_value(h.ds.as_ref(), worker, "echo-onboarded")
        .await
        .unwrap();
    assert_eq!(value, Some(1));

    // Onboarding is skipped from now on.
    let next = client.new_agent("r3", "dave").await;
    assert!(next.get("onboard_data").is_none());
    assert!(agent_id_of(&next).is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn blocked_worker_is_turned_away() {
    let args = TaskRunArgs {
        block_qualification: Some("banned".into()),
        ..TaskRunArgs::default()
    };
    let h = Harness::start(Arc::new(Echo::new()), args, 1, quick_config()).await;
    let worker = h.ds.find_or_create_worker("mallory", "mock").await.unwrap();
    qualifications::grant_qualification(h.ds.as_ref(), worker.id, "banned", 1)
        .await
        .unwrap();

    let mut client = TestClient::attach(&h.supervisor, "chan").await;
    assert!(client.send(
        PacketType::NewWorker,
        json!({"request_id": "w", "provider_data": {"worker_name": "mallory"}}),
    ));
    assert!(client.details("w").await["worker_id"].is_null());
    assert_eq!(client.register("a", "mallory").await, None);

    assert!(client.send(
        PacketType::NewWorker,
        json!({"request_id": "w2", "provider_data": {"worker_name": "trent"}}),
    ));
    assert!(client.details("w2").await["worker_id"].is_string());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lifetime_cap_limits_units_per_worker() {
    let args = TaskRunArgs {
        maximum_units_per_worker: 1,
        ..TaskRunArgs::default()
    };
    let h = Harness::start(Arc::new(Echo::new()), args, 3, quick_config()).await;
    let mut client = TestClient::attach(&h.supervisor, "chan").await;

    let first = client.register("a", "erin").await.expect("granted");
    assert!(client.submit(first, json!({})));
    client.expect_status(first, "completed").await;

    let reply = client.new_agent("b", "erin").await;
    assert!(reply["agent_id"].is_null());
    assert!(client.register("c", "frank").await.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_assignment_waits_for_every_partner() {
    let h = Harness::start(Arc::new(Pair), TaskRunArgs::default(), 1, quick_config()).await;
    let mut a = TestClient::attach(&h.supervisor, "a").await;
    let mut b = TestClient::attach(&h.supervisor, "b").await;

    let first = a.register("ra", "alice").await.expect("granted");
    a.expect_status(first, "waiting").await;

    let second = b.register("rb", "bob").await.expect("granted");
    a.expect_status(first, "in_task").await;
    b.expect_status(second, "in_task").await;

    // The same worker never takes two slots of one assignment.
    let mut again = TestClient::attach(&h.supervisor, "again").await;
    assert_eq!(again.register("rc", "alice").await, None);

    assert!(a.submit(first, json!({"move": 1})));
    assert!(b.submit(second, json!({"move": 2})));
    a.expect_status(first, "completed").await;
    b.expect_status(second, "completed").await;
    eventually("both units completed", || async {
        h.unit_statuses().await == vec![UnitStatus::Completed, UnitStatus::Completed]
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn partner_disconnect_reaches_the_other_agent() {
    let h = Harness::start(Arc::new(Pair), TaskRunArgs::default(), 1, quick_config()).await;
    let mut a = TestClient::attach(&h.supervisor, "a").await;
    let mut b = TestClient::attach(&h.supervisor, "b").await;

    let first = a.register("ra", "alice").await.expect("granted");
    let second = b.register("rb", "bob").await.expect("granted");
    b.expect_status(second, "in_task").await;

    a.remote().disconnect();
    b.expect_status(second, "partner_disconnect").await;
    assert_eq!(
        h.supervisor.agent(first).unwrap().status(),
        AgentStatus::Disconnect
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn refused_sends_are_retried_in_order() {
    let h = Harness::start(Arc::new(Echo::new()), TaskRunArgs::default(), 1, quick_config()).await;
    let mut client = TestClient::attach(&h.supervisor, "chan").await;

    let agent_id = client.register("req", "grace").await.expect("granted");
    client
        .expect("action request", |p| p.packet_type == PacketType::RequestAction)
        .await;

    client.remote().set_accepting(false);
    assert!(client.act(agent_id, json!({"n": 1})));
    assert!(client.act(agent_id, json!({"n": 2})));
    tokio::time::sleep(Duration::from_millis(100)).await;
    while let Some(packet) = client.remote_mut().try_recv() {
        assert_ne!(packet.packet_type, PacketType::AgentAction, "nothing echoed while refused");
    }

    client.remote().set_accepting(true);
    let mut echoed = Vec::new();
    while echoed.len() < 2 {
        let packet = client
            .expect("echo", |p| p.packet_type == PacketType::AgentAction)
            .await;
        echoed.push(packet.data["action"]["echo"]["n"].as_i64().unwrap());
    }
    assert_eq!(echoed, vec![1, 2]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn returned_status_report_is_merged() {
    let config = SupervisorConfig {
        status_poll_interval: Duration::from_millis(300),
        ..quick_config()
    };
    let h = Harness::start(Arc::new(Echo::new()), TaskRunArgs::default(), 1, config).await;
    let mut client = TestClient::attach(&h.supervisor, "chan").await;
    let agent_id = client.register("req", "heidi").await.expect("granted");

    let poll = client
        .expect("status poll", |p| p.packet_type == PacketType::RequestAgentStatus)
        .await;
    let request_id = poll.request_id().unwrap().to_owned();

    // An unknown request id is ignored.
    assert!(client.send(
        PacketType::ReturnAgentStatus,
        json!({"request_id": "bogus", "statuses": {(agent_id.to_string()): "returned"}}),
    ));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        h.supervisor.agent(agent_id).unwrap().status(),
        AgentStatus::InTask
    );

    assert!(client.send(
        PacketType::ReturnAgentStatus,
        json!({"request_id": request_id, "statuses": {(agent_id.to_string()): "returned"}}),
    ));
    client.expect_status(agent_id, "returned").await;
    eventually("unit released", || async {
        h.unit_statuses().await == vec![UnitStatus::Launched]
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_interrupts_running_units() {
    let h = Harness::start(Arc::new(Echo::new()), TaskRunArgs::default(), 1, quick_config()).await;
    let mut client = TestClient::attach(&h.supervisor, "chan").await;
    let agent_id = client.register("req", "ivan").await.expect("granted");
    client.expect_status(agent_id, "in_task").await;

    h.supervisor.shutdown().await;
    assert!(h.supervisor.is_shut_down());
    assert!(h.cancel.is_cancelled());
    assert_eq!(
        h.ds.get_agent(agent_id).await.unwrap().status,
        AgentStatus::Expired
    );
    assert_eq!(h.unit_statuses().await, vec![UnitStatus::Expired]);

    let distinct: HashSet<_> = h.provider.launched_units().into_iter().collect();
    assert_eq!(distinct.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_sends_queued_packets_in_order() {
    let h = Harness::start(Arc::new(Echo::new()), TaskRunArgs::default(), 1, quick_config()).await;
    let mut client = TestClient::attach(&h.supervisor, "chan").await;
    let agent_id = client.register("req", "judy").await.expect("granted");
    client
        .expect("action request", |p| p.packet_type == PacketType::RequestAction)
        .await;

    client.remote().set_accepting(false);
    for n in 0..20 {
        assert!(client.act(agent_id, json!({"n": n})));
    }
    let agent = h.supervisor.agent(agent_id).unwrap();
    eventually("every action echoed", || async {
        agent.state().outputs().len() == 20
    })
    .await;

    client.remote().set_accepting(true);
    h.supervisor.shutdown().await;

    let mut echoed = Vec::new();
    while let Some(packet) = client.remote_mut().try_recv() {
        if packet.packet_type == PacketType::AgentAction {
            echoed.push(packet.data["action"]["echo"]["n"].as_i64().unwrap());
        }
    }
    assert_eq!(echoed, (0..20).collect::<Vec<i64>>());
}
