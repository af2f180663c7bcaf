//! PostgreSQL fixtures for crowdrun's datastore and supervisor tests.
//!
//! `CROWDRUN_TEST_PG_URL` points the tests at an existing server; without
//! it one postgres container is started per test binary. Each test gets a
//! database of its own, created and migrated with the same code
//! `crowdrun db-init` uses.

use serde_json::json;
use sqlx::Executor;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

use crowdrun_db::config::DbConfig;
use crowdrun_db::models::UnitStatus;
use crowdrun_db::{Datastore, NewTaskRun, NewUnit, PgDatastore, pool};

struct TestServer {
    /// Server root, without a database name.
    url: String,
    _container: Option<ContainerAsync<Postgres>>,
}

static SERVER: OnceCell<TestServer> = OnceCell::const_new();

async fn server() -> &'static TestServer {
    SERVER
        .get_or_init(|| async {
            if let Ok(url) = std::env::var("CROWDRUN_TEST_PG_URL") {
                return TestServer {
                    url: url.trim_end_matches('/').to_owned(),
                    _container: None,
                };
            }
            let container = Postgres::default()
                .with_tag("16")
                .start()
                .await
                .expect("failed to start PostgreSQL container");
            let host = container.get_host().await.expect("container host");
            let port = container
                .get_host_port_ipv4(5432)
                .await
                .expect("container port");
            TestServer {
                url: format!("postgresql://postgres:postgres@{host}:{port}"),
                _container: Some(container),
            }
        })
        .await
}

/// A migrated datastore over a fresh database. Pass the returned name to
/// [`drop_test_db`] when done.
pub async fn create_test_datastore() -> (PgDatastore, String) {
    let db_name = format!("crowdrun_test_{}", Uuid::new_v4().simple());
    let config = DbConfig::new(format!("{}/{db_name}", server().await.url));
    let datastore = pool::prepare_datastore(&config)
        .await
        .unwrap_or_else(|e| panic!("failed to prepare {db_name}: {e:#}"));
    (datastore, db_name)
}

/// Drop a test database, terminating its connections first. Idempotent.
pub async fn drop_test_db(db_name: &str) {
    let config = DbConfig::new(format!("{}/{db_name}", server().await.url));
    let maint = pool::create_pool(&DbConfig::new(config.maintenance_url()).with_max_connections(1))
        .await
        .expect("maintenance database reachable");
    let _ = maint
        .execute(
            format!(
                "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
                 WHERE datname = '{db_name}' AND pid <> pg_backend_pid()"
            )
            .as_str(),
        )
        .await;
    let _ = maint
        .execute(format!("DROP DATABASE IF EXISTS {db_name}").as_str())
        .await;
    maint.close().await;
}

/// One task run with one assignment holding `units` launched units.
/// Returns the run id and the unit ids in index order.
pub async fn seed_launched_units(ds: &dyn Datastore, units: i32) -> (Uuid, Vec<Uuid>) {
    let task = ds.create_task("labeling", "mock").await.unwrap();
    let args = json!({});
    let run = ds
        .create_task_run(&NewTaskRun {
            task_id: task.id,
            task_type: "mock",
            provider_type: "mock",
            args: &args,
        })
        .await
        .unwrap();
    let assignment = ds
        .create_assignment(run.id, &json!({"text": "hello"}))
        .await
        .unwrap();

    let mut ids = Vec::new();
    for unit_index in 0..units {
        let unit = ds
            .create_unit(&NewUnit {
                assignment_id: assignment.id,
                task_run_id: run.id,
                unit_index,
                provider_type: "mock",
            })
            .await
            .unwrap();
        assert!(
            ds.transition_unit_status(unit.id, UnitStatus::Created, UnitStatus::Launched)
                .await
                .unwrap()
        );
        ids.push(unit.id);
    }
    (run.id, ids)
}
