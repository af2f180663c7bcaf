//! Per-table PostgreSQL query functions backing [`crate::postgres::PgDatastore`].

pub mod agent_exchanges;
pub mod agents;
pub mod assignments;
pub mod onboarding_agents;
pub mod qualifications;
pub mod reservations;
pub mod task_runs;
pub mod tasks;
pub mod units;
pub mod workers;

use crate::datastore::DatastoreError;

/// Map a unique-constraint violation to [`DatastoreError::AlreadyExists`],
/// passing every other error through as a backend error.
pub(crate) fn on_unique_violation(
    err: sqlx::Error,
    entity: &'static str,
    key: impl ToString,
) -> DatastoreError {
    let is_unique = err
        .as_database_error()
        .is_some_and(|db_err| db_err.is_unique_violation());
    if is_unique {
        DatastoreError::duplicate(entity, key)
    } else {
        DatastoreError::Backend(err)
    }
}
