//! Qualification checks and grants.
//!
//! A qualification is a named integer capability on a worker. Task runs
//! gate registration on requirements over those values, and use a block
//! qualification to soft-block workers.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crowdrun_db::models::GrantedQualification;
use crowdrun_db::{Datastore, DatastoreError, DatastoreResult};

/// How a requirement compares the worker's value against the wanted one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    Exists,
    NotExists,
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl Comparator {
    /// Compare a granted value (`None` when not granted) with `wanted`.
    ///
    /// Value comparisons fail when either side is missing.
    pub fn evaluate(self, granted: Option<i32>, wanted: Option<i32>) -> bool {
        match (self, granted, wanted) {
            (Self::Exists, granted, _) => granted.is_some(),
            (Self::NotExists, granted, _) => granted.is_none(),
            (_, None, _) | (_, _, None) => false,
            (Self::Eq, Some(g), Some(w)) => g == w,
            (Self::Ne, Some(g), Some(w)) => g != w,
            (Self::Gt, Some(g), Some(w)) => g > w,
            (Self::Ge, Some(g), Some(w)) => g >= w,
            (Self::Lt, Some(g), Some(w)) => g < w,
            (Self::Le, Some(g), Some(w)) => g <= w,
        }
    }
}

/// One registration requirement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualificationRequirement {
    pub qualification_name: String,
    pub comparator: Comparator,
    #[serde(default)]
    pub value: Option<i32>,
}

/// The worker's value for a qualification, or `None` if the qualification
/// does not exist or was never granted.
pub async fn worker_value(
    datastore: &dyn Datastore,
    worker_id: Uuid,
    qualification_name: &str,
) -> DatastoreResult<Option<i32>> {
    let Some(qualification) = datastore.find_qualification(qualification_name).await? else {
        return Ok(None);
    };
    let granted = datastore
        .get_granted_qualification(worker_id, qualification.id)
        .await?;
    Ok(granted.map(|g| g.value))
}

/// True if the worker meets every requirement.
pub async fn worker_is_qualified(
    datastore: &dyn Datastore,
    worker_id: Uuid,
    requirements: &[QualificationRequirement],
) -> DatastoreResult<bool> {
    for requirement in requirements {
        let granted = worker_value(datastore, worker_id, &requirement.qualification_name).await?;
        if !requirement.comparator.evaluate(granted, requirement.value) {
            return Ok(false);
        }
    }
    Ok(true)
}

/// True if the worker holds the block qualification (any value).
pub async fn worker_is_blocked(
    datastore: &dyn Datastore,
    worker_id: Uuid,
    block_qualification: Option<&str>,
) -> DatastoreResult<bool> {
    match block_qualification {
        Some(name) => Ok(worker_value(datastore, worker_id, name).await?.is_some()),
        None => Ok(false),
    }
}

/// Grant `value` to the worker, creating the qualification on first use.
pub async fn grant_qualification(
    datastore: &dyn Datastore,
    worker_id: Uuid,
    qualification_name: &str,
    value: i32,
) -> DatastoreResult<GrantedQualification> {
    let qualification = match datastore.find_qualification(qualification_name).await? {
        Some(existing) => existing,
        None => match datastore.create_qualification(qualification_name).await {
            Ok(created) => created,
            // Lost a creation race; the row is there now.
            Err(DatastoreError::AlreadyExists { .. }) => datastore
                .find_qualification(qualification_name)
                .await?
                .ok_or_else(|| DatastoreError::DoesNotExist {
                    entity: "qualification",
                    id: qualification_name.to_owned(),
                })?,
            Err(e) => return Err(e),
        },
    };
    datastore
        .grant_qualification(worker_id, qualification.id, value)
        .await
}

/// Remove the worker's grant. A no-op if the qualification does not exist.
pub async fn revoke_qualification(
    datastore: &dyn Datastore,
    worker_id: Uuid,
    qualification_name: &str,
) -> DatastoreResult<()> {
    match datastore.find_qualification(qualification_name).await? {
        Some(qualification) => {
            datastore
                .revoke_qualification(worker_id, qualification.id)
                .await
        }
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crowdrun_db::MemoryDatastore;

    #[test]
    fn comparators() {
        use Comparator::*;
        assert!(Exists.evaluate(Some(0), None));
        assert!(!Exists.evaluate(None, Some(1)));
        assert!(NotExists.evaluate(None, None));
        assert!(Eq.evaluate(Some(3), Some(3)));
        assert!(Ne.evaluate(Some(3), Some(4)));
        assert!(Gt.evaluate(Some(5), Some(4)));
        assert!(!Gt.evaluate(Some(4), Some(4)));
        assert!(Ge.evaluate(Some(4), Some(4)));
        assert!(Lt.evaluate(Some(1), Some(2)));
        assert!(Le.evaluate(Some(2), Some(2)));
    }

    #[test]
    fn value_comparisons_need_both_sides() {
        assert!(!Comparator::Eq.evaluate(None, Some(1)));
        assert!(!Comparator::Ne.evaluate(Some(1), None));
        assert!(!Comparator::Lt.evaluate(None, None));
    }

    #[tokio::test]
    async fn requirements_against_grants() {
        let ds = MemoryDatastore::new();
        let worker = ds.find_or_create_worker("w", "mock").await.unwrap();

        let requirements = vec![
            QualificationRequirement {
                qualification_name: "english".into(),
                comparator: Comparator::Ge,
                value: Some(2),
            },
            QualificationRequirement {
                qualification_name: "banned".into(),
                comparator: Comparator::NotExists,
                value: None,
            },
        ];
        assert!(!worker_is_qualified(&ds, worker.id, &requirements).await.unwrap());

        grant_qualification(&ds, worker.id, "english", 3).await.unwrap();
        assert!(worker_is_qualified(&ds, worker.id, &requirements).await.unwrap());

        grant_qualification(&ds, worker.id, "banned", 1).await.unwrap();
        assert!(!worker_is_qualified(&ds, worker.id, &requirements).await.unwrap());

        revoke_qualification(&ds, worker.id, "banned").await.unwrap();
        assert!(worker_is_qualified(&ds, worker.id, &requirements).await.unwrap());
    }

    #[tokio::test]
    async fn block_qualification() {
        let ds = MemoryDatastore::new();
        let worker = ds.find_or_create_worker("w", "mock").await.unwrap();

        assert!(!worker_is_blocked(&ds, worker.id, None).await.unwrap());
        assert!(!worker_is_blocked(&ds, worker.id, Some("blocked")).await.unwrap());
        grant_qualification(&ds, worker.id, "blocked", 0).await.unwrap();
        assert!(worker_is_blocked(&ds, worker.id, Some("blocked")).await.unwrap());
    }

    #[tokio::test]
    async fn grant_overwrites_value() {
        let ds = MemoryDatastore::new();
        let worker = ds.find_or_create_worker("w", "mock").await.unwrap();

        grant_qualification(&ds, worker.id, "onboarded", 0).await.unwrap();
        grant_qualification(&ds, worker.id, "onboarded", 1).await.unwrap();
        assert_eq!(worker_value(&ds, worker.id, "onboarded").await.unwrap(), Some(1));
        revoke_qualification(&ds, worker.id, "never-created").await.unwrap();
    }
}
