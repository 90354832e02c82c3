use crate::errors::*;
use crate::retry::{read_modify_write, Backoff};
use crate::store::ObjectStore;
use crate::unitset::{UnitSet, UnitSetStatus};
use kube::ResourceExt;
use log::debug;
use std::sync::Arc;

/// Commits a computed status to the UnitSet's status subresource.
pub struct StatusUpdater {
    sets: Arc<dyn ObjectStore<UnitSet>>,
    retry: Backoff,
}

impl StatusUpdater {
    pub fn new(sets: Arc<dyn ObjectStore<UnitSet>>, retry: Backoff) -> Self {
        StatusUpdater { sets, retry }
    }

    /// Writes `status` over whatever the stored copy holds. On conflict the
    /// set is read again and the same status written to the fresh copy.
    pub async fn update_status(&self, set: &UnitSet, status: &UnitSetStatus) -> Result<()> {
        let sets = self.sets.as_ref();
        read_modify_write(
            sets,
            &self.retry,
            set.clone(),
            |current| {
                let mut next = current.clone();
                next.status = Some(status.clone());
                Ok(Some(next))
            },
            move |next| async move { sets.replace_status(&next).await },
        )
        .await?;
        debug!(
            "UnitSet {} status: replicas={} ready={} current={} updated={}",
            set.name_any(),
            status.replicas,
            status.ready_replicas,
            status.current_replicas,
            status.updated_replicas
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::DEFAULT_RETRY;
    use crate::testing::{unit_set, MemoryStore};

    fn status(replicas: i32) -> UnitSetStatus {
        UnitSetStatus {
            observed_generation: 1,
            replicas,
            ..UnitSetStatus::default()
        }
    }

    #[tokio::test]
    async fn stale_sets_are_refetched_and_spec_is_untouched() {
        let sets = Arc::new(MemoryStore::<UnitSet>::default());
        let stale = sets.insert(unit_set("web", 3));
        let mut scaled = stale.clone();
        scaled.spec.replicas = 5;
        sets.replace(&scaled).await.unwrap();

        let updater = StatusUpdater::new(sets.clone(), DEFAULT_RETRY);
        updater.update_status(&stale, &status(3)).await.unwrap();

        let all = sets.all();
        let stored = &all[0];
        assert_eq!(stored.status, Some(status(3)));
        assert_eq!(stored.spec.replicas, 5);
        assert_eq!(
            sets.calls(),
            vec!["replace web", "replace_status web", "get web", "replace_status web"]
        );
    }

    #[tokio::test]
    async fn vanished_sets_surface_not_found() {
        let sets = Arc::new(MemoryStore::<UnitSet>::default());
        let updater = StatusUpdater::new(sets.clone(), DEFAULT_RETRY);
        let err = updater.update_status(&unit_set("web", 1), &status(1)).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
