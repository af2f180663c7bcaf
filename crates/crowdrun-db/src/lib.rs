//! Persistence for the crowdrun coordination layer.
//!
//! [`Datastore`] is the storage interface; [`MemoryDatastore`] backs tests
//! and single-process runs, [`PgDatastore`] backs everything else.

pub mod config;
pub mod datastore;
pub mod memory;
pub mod models;
pub mod pool;
pub mod postgres;
pub mod queries;

pub use datastore::{AgentFilter, Datastore, DatastoreError, DatastoreResult, NewTaskRun, NewUnit};
pub use memory::MemoryDatastore;
pub use postgres::PgDatastore;
