//! One reconciliation pass of a UnitSet: resolve revisions, bring every
//! ordinal in the window to a running Unit, remove condemned Units, roll
//! stale Units forward and commit the resulting status.

use crate::batch::run_for_all;
use crate::errors::*;
use crate::events::{EventRecorder, EventType};
use crate::history::{
    apply_revision, equal_revision, find_equal_revisions, new_revision, next_revision,
    sort_revisions, History,
};
use crate::materialize::{identity_matches, new_versioned_unit, storage_matches};
use crate::ordinal::{partition_units, start_ordinal, Partitioned};
use crate::retry::Backoff;
use crate::status::StatusUpdater;
use crate::store::ObjectStore;
use crate::unit::{
    is_available, is_created, is_failed, is_healthy, is_pending, is_running_and_available,
    is_running_and_ready, is_terminating, revision_of, Unit,
};
use crate::unit_control::UnitControl;
use crate::unitset::{complete_rolling_update, inconsistent_status, UnitSet, UnitSetStatus};
use chrono::Utc;
use futures::FutureExt;
use k8s_openapi::api::apps::v1::ControllerRevision;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::ResourceExt;
use log::{debug, info};
use std::collections::BTreeSet;
use std::sync::Arc;

/// The revisions a pass works against.
#[derive(Clone, Debug)]
pub struct Revisions {
    pub current: ControllerRevision,
    pub update: ControllerRevision,
    pub collision_count: i32,
}

/// What stays fixed while the slots of one pass are processed.
struct Pass<'a> {
    set: &'a UnitSet,
    current_set: UnitSet,
    update_set: UnitSet,
    current_revision: String,
    update_revision: String,
    monotonic: bool,
    first_unhealthy: Option<String>,
}

pub struct UnitSetControl {
    history: History,
    units: UnitControl,
    status: StatusUpdater,
    recorder: Arc<dyn EventRecorder>,
}

/// Recounts the replica fields of `status` from the given Units.
fn count_replicas<'u>(
    status: &mut UnitSetStatus,
    min_ready_seconds: i32,
    units: impl Iterator<Item = &'u Unit>,
) {
    let now = Utc::now();
    status.replicas = 0;
    status.ready_replicas = 0;
    status.available_replicas = 0;
    status.current_replicas = 0;
    status.updated_replicas = 0;
    for unit in units {
        if is_created(unit) {
            status.replicas += 1;
        }
        if is_running_and_ready(unit) {
            status.ready_replicas += 1;
            if is_available(unit, min_ready_seconds, now) {
                status.available_replicas += 1;
            }
        }
        if is_created(unit) && !is_terminating(unit) {
            if revision_of(unit) == status.current_revision {
                status.current_replicas += 1;
            }
            if revision_of(unit) == status.update_revision {
                status.updated_replicas += 1;
            }
        }
    }
}

impl UnitSetControl {
    pub fn new(
        sets: Arc<dyn ObjectStore<UnitSet>>,
        units: Arc<dyn ObjectStore<Unit>>,
        revisions: Arc<dyn ObjectStore<ControllerRevision>>,
        claims: Arc<dyn ObjectStore<PersistentVolumeClaim>>,
        recorder: Arc<dyn EventRecorder>,
        retry: Backoff,
    ) -> Self {
        UnitSetControl {
            history: History::new(revisions, retry.clone()),
            units: UnitControl::new(units, claims, recorder.clone(), retry.clone()),
            status: StatusUpdater::new(sets, retry),
            recorder,
        }
    }

    /// Reconciles `set` against the Units it owns and returns the status the
    /// pass computed. History is truncated even when the pass fails.
    pub async fn update_unit_set(&self, set: &UnitSet, units: Vec<Unit>) -> Result<UnitSetStatus> {
        let mut revisions = self.history.list(set).await?;
        sort_revisions(&mut revisions);

        let stored = set.status_or_default();
        let mut live: BTreeSet<String> = units
            .iter()
            .map(|u| revision_of(u).to_string())
            .chain([stored.current_revision, stored.update_revision])
            .filter(|name| !name.is_empty())
            .collect();

        let result = match self.resolve_revisions(set, &revisions).await {
            Ok(resolved) => {
                live.insert(resolved.current.name_any());
                live.insert(resolved.update.name_any());
                self.perform_update(set, &resolved, units).await
            }
            Err(e) => Err(e),
        };
        let truncated = self.truncate_history(set, &revisions, &live).await;

        match (result, truncated) {
            (Ok(status), Ok(())) => Ok(status),
            (Ok(_), Err(e)) | (Err(e), Ok(())) => Err(e),
            (Err(e), Err(t)) => {
                Err(ErrorKind::Aggregate(vec![e.to_string(), t.to_string()]).into())
            }
        }
    }

    /// Finds or records the revision for the set's template. The current
    /// revision is the one named in the stored status, falling back to the
    /// update revision on the first pass.
    pub async fn resolve_revisions(
        &self,
        set: &UnitSet,
        revisions: &[ControllerRevision],
    ) -> Result<Revisions> {
        let mut collision_count = set.status.as_ref().and_then(|s| s.collision_count).unwrap_or(0);
        let candidate = new_revision(set, next_revision(revisions))?;
        let equal = find_equal_revisions(revisions, &candidate);

        let update = match (equal.last(), revisions.last()) {
            (Some(_), Some(latest)) if equal_revision(latest, &candidate) => latest.clone(),
            (Some(previous), _) => {
                info!(
                    "UnitSet {} returns to revision {}",
                    set.name_any(),
                    previous.name_any()
                );
                self.history
                    .update_revision_number(previous, candidate.revision)
                    .await?
            }
            (None, _) => self.history.create(set, &candidate, &mut collision_count).await?,
        };

        let current_name = set.status.as_ref().map_or("", |s| s.current_revision.as_str());
        let current = revisions
            .iter()
            .find(|r| r.name_any() == current_name)
            .cloned()
            .unwrap_or_else(|| update.clone());

        Ok(Revisions {
            current,
            update,
            collision_count,
        })
    }

    async fn perform_update(
        &self,
        set: &UnitSet,
        revisions: &Revisions,
        units: Vec<Unit>,
    ) -> Result<UnitSetStatus> {
        let (mut status, pass) = self.update_units(set, revisions, units).await?;
        complete_rolling_update(set, &mut status);

        let unchanged = !inconsistent_status(set, &status);
        let written = if set.metadata.deletion_timestamp.is_some() || unchanged {
            Ok(())
        } else {
            self.status.update_status(set, &status).await
        };
        debug!(
            "UnitSet {} revisions current={} update={}",
            set.name_any(),
            status.current_revision,
            status.update_revision
        );

        match (pass, written) {
            (Ok(()), Ok(())) => Ok(status),
            (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
            (Err(e), Err(w)) => {
                Err(ErrorKind::Aggregate(vec![e.to_string(), w.to_string()]).into())
            }
        }
    }

    /// Runs the slot, condemned and rolling phases. The outer error means no
    /// status could be computed; the inner one is the outcome of the pass.
    async fn update_units(
        &self,
        set: &UnitSet,
        revisions: &Revisions,
        units: Vec<Unit>,
    ) -> Result<(UnitSetStatus, Result<()>)> {
        let current_set = apply_revision(set, &revisions.current)?;
        let update_set = apply_revision(set, &revisions.update)?;
        let min_ready = set.spec.min_ready_seconds;

        let mut status = UnitSetStatus {
            observed_generation: set.metadata.generation.unwrap_or(0),
            current_revision: revisions.current.name_any(),
            update_revision: revisions.update.name_any(),
            collision_count: Some(revisions.collision_count),
            ..UnitSetStatus::default()
        };

        let Partitioned { slots, mut condemned } = partition_units(set, units);
        let start = start_ordinal(set);
        let mut replicas: Vec<Unit> = slots
            .into_iter()
            .enumerate()
            .map(|(i, slot)| {
                slot.unwrap_or_else(|| {
                    new_versioned_unit(
                        &current_set,
                        &update_set,
                        &status.current_revision,
                        &status.update_revision,
                        start + i as i32,
                    )
                })
            })
            .collect();

        let unhealthy = replicas.iter().chain(condemned.iter()).filter(|u| !is_healthy(u)).count();
        let first_unhealthy = replicas
            .iter()
            .chain(condemned.iter().rev())
            .find(|u| !is_healthy(u))
            .map(|u| u.name_any());
        if let Some(first) = &first_unhealthy {
            debug!(
                "UnitSet {} has {} unhealthy Units, first is {}",
                set.name_any(),
                unhealthy,
                first
            );
        }

        if set.metadata.deletion_timestamp.is_some() {
            count_replicas(&mut status, min_ready, replicas.iter().chain(condemned.iter()));
            return Ok((status, Ok(())));
        }

        let pass = Pass {
            set,
            current_revision: status.current_revision.clone(),
            update_revision: status.update_revision.clone(),
            current_set,
            update_set,
            monotonic: set.spec.is_monotonic(),
            first_unhealthy,
        };

        let replica_pass = run_for_all(
            &mut replicas,
            |i, unit| self.process_replica(&pass, i, unit).boxed(),
            pass.monotonic,
        )
        .await;
        if !matches!(replica_pass, Ok(false)) {
            count_replicas(&mut status, min_ready, replicas.iter().chain(condemned.iter()));
            return Ok((status, replica_pass.map(|_| ())));
        }

        let condemned_pass = run_for_all(
            &mut condemned,
            |_, unit| self.process_condemned(&pass, unit).boxed(),
            pass.monotonic,
        )
        .await;
        count_replicas(&mut status, min_ready, replicas.iter().chain(condemned.iter()));
        if !matches!(condemned_pass, Ok(false)) {
            return Ok((status, condemned_pass.map(|_| ())));
        }

        if !set.spec.is_rolling_update() {
            return Ok((status, Ok(())));
        }

        let partition = set.spec.partition().max(0) as usize;
        for target in (partition..replicas.len()).rev() {
            let unit = &replicas[target];
            if revision_of(unit) != pass.update_revision && !is_terminating(unit) {
                info!(
                    "UnitSet {} terminating Unit {} for update",
                    set.name_any(),
                    unit.name_any()
                );
                status.current_replicas -= 1;
                let deleted = self.units.delete_unit(set, unit).await;
                return Ok((status, deleted));
            }
            if !is_healthy(unit) {
                info!(
                    "UnitSet {} waiting for Unit {} to update",
                    set.name_any(),
                    unit.name_any()
                );
                return Ok((status, Ok(())));
            }
        }
        Ok((status, Ok(())))
    }

    /// Handles one slot. Returns true when the pass must stop here.
    async fn process_replica(
        &self,
        pass: &Pass<'_>,
        index: usize,
        slot: &mut Unit,
    ) -> Result<bool> {
        let set = pass.set;
        if is_failed(slot) {
            self.recorder
                .record(
                    set,
                    EventType::Warning,
                    "RecreatingFailedUnit",
                    format!(
                        "UnitSet {}/{} is recreating failed Unit {}",
                        set.namespace().unwrap_or_default(),
                        set.name_any(),
                        slot.name_any()
                    ),
                )
                .await;
            self.units.delete_unit(set, slot).await?;
            *slot = new_versioned_unit(
                &pass.current_set,
                &pass.update_set,
                &pass.current_revision,
                &pass.update_revision,
                start_ordinal(set) + index as i32,
            );
        }

        if !is_created(slot) {
            let created = self.units.create_unit(set, slot).await?;
            *slot = created;
            return Ok(pass.monotonic);
        }

        if is_pending(slot) {
            debug!(
                "UnitSet {} creating missing claims for pending Unit {}",
                set.name_any(),
                slot.name_any()
            );
            self.units.create_missing_claims(set, slot).await?;
        }

        if is_terminating(slot) {
            debug!(
                "UnitSet {} waiting for Unit {} to terminate",
                set.name_any(),
                slot.name_any()
            );
            return Ok(pass.monotonic);
        }

        if pass.monotonic && !is_running_and_ready(slot) {
            info!(
                "UnitSet {} waiting for Unit {} to be Running and Ready",
                set.name_any(),
                slot.name_any()
            );
            return Ok(true);
        }

        if pass.monotonic && !is_running_and_available(slot, set.spec.min_ready_seconds) {
            info!(
                "UnitSet {} waiting for Unit {} to be Available",
                set.name_any(),
                slot.name_any()
            );
            return Ok(true);
        }

        if identity_matches(set, slot) && storage_matches(set, slot) {
            return Ok(false);
        }

        self.units.update_unit(&pass.update_set, slot).await?;
        Ok(false)
    }

    /// Handles one Unit above or below the window. Always stops after a
    /// deletion; parallel runs ignore the stop.
    async fn process_condemned(&self, pass: &Pass<'_>, unit: &mut Unit) -> Result<bool> {
        let set = pass.set;
        if is_terminating(unit) {
            debug!(
                "UnitSet {} waiting for Unit {} to terminate before scaling down",
                set.name_any(),
                unit.name_any()
            );
            return Ok(pass.monotonic);
        }

        let first_unhealthy = pass.first_unhealthy.as_deref() == Some(unit.name_any().as_str());
        let settled = is_running_and_ready(unit)
            && is_running_and_available(unit, set.spec.min_ready_seconds);
        if pass.monotonic && !settled && !first_unhealthy {
            info!(
                "UnitSet {} waiting for Unit {} to settle before scaling down",
                set.name_any(),
                unit.name_any()
            );
            return Ok(true);
        }

        info!(
            "UnitSet {} terminating Unit {} for scale down",
            set.name_any(),
            unit.name_any()
        );
        self.units.delete_unit(set, unit).await?;
        Ok(true)
    }

    /// Deletes the oldest revisions no Unit or status refers to, keeping
    /// at most revisionHistoryLimit of them.
    async fn truncate_history(
        &self,
        set: &UnitSet,
        revisions: &[ControllerRevision],
        live: &BTreeSet<String>,
    ) -> Result<()> {
        let history: Vec<&ControllerRevision> = revisions
            .iter()
            .filter(|r| !live.contains(&r.name_any()))
            .collect();
        let limit = set.spec.history_limit();
        if history.len() <= limit {
            return Ok(());
        }
        let excess = history.len() - limit;
        for revision in history.into_iter().take(excess) {
            debug!(
                "UnitSet {} dropping revision {}",
                set.name_any(),
                revision.name_any()
            );
            self.history.delete(revision).await?;
        }
        Ok(())
    }
}
