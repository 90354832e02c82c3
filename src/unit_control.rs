//! Writes against Units and their claims on behalf of a UnitSet. Every
//! attempt is reported as an event on the set.

use crate::errors::*;
use crate::events::{EventRecorder, EventType};
use crate::materialize::{
    claims_for, identity_matches, storage_matches, update_identity, update_storage,
};
use crate::retry::{read_modify_write, Backoff};
use crate::store::ObjectStore;
use crate::unit::Unit;
use crate::unitset::UnitSet;
use crate::UNIT_NAME_LABEL;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::ResourceExt;
use log::{debug, info};
use serde_json::json;
use std::sync::Arc;

pub struct UnitControl {
    units: Arc<dyn ObjectStore<Unit>>,
    claims: Arc<dyn ObjectStore<PersistentVolumeClaim>>,
    recorder: Arc<dyn EventRecorder>,
    retry: Backoff,
}

/// What an event reports: success, or the failure's message.
type Outcome = std::result::Result<(), String>;

fn outcome<T>(result: &Result<T>) -> Outcome {
    result.as_ref().map(|_| ()).map_err(|e| e.to_string())
}

fn capitalize(verb: &str) -> String {
    let mut chars = verb.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Merge patch for the fields identity and storage repairs touch. Carrying
/// the resourceVersion makes the patch fail on a stale copy.
fn identity_patch(unit: &Unit) -> serde_json::Value {
    let mut labels = serde_json::Map::new();
    labels.insert(UNIT_NAME_LABEL.to_string(), json!(unit.labels().get(UNIT_NAME_LABEL)));
    json!({
        "metadata": {
            "resourceVersion": unit.metadata.resource_version,
            "labels": labels,
        },
        "spec": {
            "hostname": unit.spec.hostname,
            "subdomain": unit.spec.subdomain,
            "volumes": unit.spec.volumes,
        }
    })
}

impl UnitControl {
    pub fn new(
        units: Arc<dyn ObjectStore<Unit>>,
        claims: Arc<dyn ObjectStore<PersistentVolumeClaim>>,
        recorder: Arc<dyn EventRecorder>,
        retry: Backoff,
    ) -> Self {
        UnitControl {
            units,
            claims,
            recorder,
            retry,
        }
    }

    async fn record_unit_event(&self, verb: &str, set: &UnitSet, unit: &Unit, outcome: Outcome) {
        let (type_, reason, note) = match outcome {
            Ok(()) => (
                EventType::Normal,
                format!("Successful{}", capitalize(verb)),
                format!(
                    "{} Unit {} in UnitSet {} successful",
                    verb,
                    unit.name_any(),
                    set.name_any()
                ),
            ),
            Err(e) => (
                EventType::Warning,
                format!("Failed{}", capitalize(verb)),
                format!(
                    "{} Unit {} in UnitSet {} failed error: {}",
                    verb,
                    unit.name_any(),
                    set.name_any(),
                    e
                ),
            ),
        };
        self.recorder.record(set, type_, &reason, note).await;
    }

    async fn record_claim_event(
        &self,
        verb: &str,
        set: &UnitSet,
        unit: &Unit,
        claim: &PersistentVolumeClaim,
        outcome: Outcome,
    ) {
        let (type_, reason, note) = match outcome {
            Ok(()) => (
                EventType::Normal,
                format!("Successful{}", capitalize(verb)),
                format!(
                    "{} Claim {} Unit {} in UnitSet {} success",
                    verb,
                    claim.name_any(),
                    unit.name_any(),
                    set.name_any()
                ),
            ),
            Err(e) => (
                EventType::Warning,
                format!("Failed{}", capitalize(verb)),
                format!(
                    "{} Claim {} for Unit {} in UnitSet {} failed error: {}",
                    verb,
                    claim.name_any(),
                    unit.name_any(),
                    set.name_any(),
                    e
                ),
            ),
        };
        self.recorder.record(set, type_, &reason, note).await;
    }

    /// Creates the claims `unit` mounts that do not exist yet. A claim that
    /// exists but is being deleted is an error: the Unit must not bind to it.
    pub async fn create_missing_claims(&self, set: &UnitSet, unit: &Unit) -> Result<()> {
        let namespace = set.namespace().unwrap_or_default();
        let mut errors = Vec::new();
        for (_, claim) in claims_for(set, unit) {
            match self.claims.get(&namespace, &claim.name_any()).await {
                Ok(existing) if existing.metadata.deletion_timestamp.is_some() => {
                    errors.push(ErrorKind::ClaimTerminating(claim.name_any()).into());
                }
                Ok(_) => {}
                Err(e) if e.is_not_found() => {
                    let result = match self.claims.create(&claim).await {
                        Ok(_) => Ok(()),
                        Err(e) if e.is_already_exists() => Ok(()),
                        Err(e) => Err(e),
                    };
                    let reported = outcome(&result);
                    self.record_claim_event("create", set, unit, &claim, reported).await;
                    if let Err(e) = result {
                        errors.push(e);
                    }
                }
                Err(e) => errors.push(e),
            }
        }
        aggregate(errors)
    }

    /// Creates the claims and then the Unit. A Unit that already exists is
    /// returned as an error without an event; the next pass will observe it.
    pub async fn create_unit(&self, set: &UnitSet, unit: &Unit) -> Result<Unit> {
        if let Err(e) = self.create_missing_claims(set, unit).await {
            let message = e.to_string();
            self.record_unit_event("create", set, unit, Err(message)).await;
            return Err(e);
        }
        match self.units.create(unit).await {
            Err(e) if e.is_already_exists() => Err(e),
            Ok(created) => {
                info!("created Unit {} for UnitSet {}", created.name_any(), set.name_any());
                self.record_unit_event("create", set, unit, Ok(())).await;
                Ok(created)
            }
            Err(e) => {
                let message = e.to_string();
                self.record_unit_event("create", set, unit, Err(message)).await;
                Err(e)
            }
        }
    }

    /// Repairs identity and storage of a stored Unit. Missing claims are
    /// created first; conflicting writes are retried against a fresh copy.
    /// A Unit that vanished meanwhile needs no repair.
    pub async fn update_unit(&self, set: &UnitSet, unit: &Unit) -> Result<()> {
        let result = match self.repair(set, unit).await {
            Ok(false) => return Ok(()),
            Err(e) if e.is_not_found() => {
                debug!("Unit {} is gone, nothing to repair", unit.name_any());
                return Ok(());
            }
            other => other.map(|_| ()),
        };
        let reported = outcome(&result);
        self.record_unit_event("update", set, unit, reported).await;
        result
    }

    async fn repair(&self, set: &UnitSet, unit: &Unit) -> Result<bool> {
        if !storage_matches(set, unit) {
            self.create_missing_claims(set, unit).await?;
        }
        let units = self.units.as_ref();
        let written = read_modify_write(
            units,
            &self.retry,
            unit.clone(),
            |current| {
                if identity_matches(set, current) && storage_matches(set, current) {
                    return Ok(None);
                }
                let mut repaired = current.clone();
                update_identity(set, &mut repaired);
                update_storage(set, &mut repaired);
                Ok(Some(repaired))
            },
            move |repaired| async move {
                units
                    .patch(
                        &repaired.namespace().unwrap_or_default(),
                        &repaired.name_any(),
                        &identity_patch(&repaired),
                    )
                    .await
            },
        )
        .await?;
        if written.is_some() {
            debug!("repaired identity of Unit {}", unit.name_any());
        }
        Ok(written.is_some())
    }

    /// Deletes a Unit. One that is already gone counts as deleted.
    pub async fn delete_unit(&self, set: &UnitSet, unit: &Unit) -> Result<()> {
        let result = match self
            .units
            .delete(&unit.namespace().unwrap_or_default(), &unit.name_any())
            .await
        {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        };
        if result.is_ok() {
            info!("deleted Unit {} of UnitSet {}", unit.name_any(), set.name_any());
        }
        let reported = outcome(&result);
        self.record_unit_event("delete", set, unit, reported).await;
        result
    }
}
