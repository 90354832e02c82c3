//! Building Units and their claims from a UnitSet, and checking that a stored
//! Unit still carries the identity and storage its ordinal implies.

use crate::ordinal::{parent_and_ordinal, unit_name};
use crate::unit::{set_revision, Unit};
use crate::unitset::UnitSet;
use crate::UNIT_NAME_LABEL;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, PersistentVolumeClaimVolumeSource, Volume};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};

/// Owner reference making `set` the controller of a dependent object.
pub fn controller_ref(set: &UnitSet) -> OwnerReference {
    OwnerReference {
        api_version: UnitSet::api_version(&()).into_owned(),
        kind: UnitSet::kind(&()).into_owned(),
        name: set.name_any(),
        uid: set.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

pub fn controller_of(meta: &ObjectMeta) -> Option<&OwnerReference> {
    meta.owner_references
        .iter()
        .flatten()
        .find(|r| r.controller == Some(true))
}

pub fn is_controlled_by<K: Resource>(obj: &K, set: &UnitSet) -> bool {
    match (controller_of(obj.meta()), set.uid()) {
        (Some(owner), Some(uid)) => owner.uid == uid,
        _ => false,
    }
}

fn claim_template_name(template: &PersistentVolumeClaim) -> String {
    template.metadata.name.clone().unwrap_or_default()
}

/// `<template>-<set>-<ordinal>`
pub fn claim_name(template: &PersistentVolumeClaim, unit_name: &str) -> String {
    format!("{}-{}", claim_template_name(template), unit_name)
}

/// The claims a Unit needs, in template order, paired with the volume name
/// that mounts each of them.
pub fn claims_for(set: &UnitSet, unit: &Unit) -> Vec<(String, PersistentVolumeClaim)> {
    let unit_name = unit.name_any();
    let selector_labels = set.spec.selector.match_labels.clone().unwrap_or_default();
    set.spec
        .volume_claim_templates
        .iter()
        .map(|template| {
            let mut claim = template.clone();
            claim.metadata = ObjectMeta {
                name: Some(claim_name(template, &unit_name)),
                namespace: set.namespace(),
                labels: template.metadata.labels.clone(),
                annotations: template.metadata.annotations.clone(),
                ..ObjectMeta::default()
            };
            claim.status = None;
            if !selector_labels.is_empty() {
                claim
                    .labels_mut()
                    .extend(selector_labels.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            (claim_template_name(template), claim)
        })
        .collect()
}

fn expected_subdomain(set: &UnitSet) -> Option<String> {
    Some(set.spec.service_name.clone()).filter(|s| !s.is_empty())
}

/// Name, namespace, hostname, subdomain and the unit-name label all agree
/// with the Unit's place in `set`.
pub fn identity_matches(set: &UnitSet, unit: &Unit) -> bool {
    let name = unit.name_any();
    let (parent, ordinal) = parent_and_ordinal(&name);
    ordinal >= 0
        && parent == set.name_any()
        && unit.namespace() == set.namespace()
        && unit.labels().get(UNIT_NAME_LABEL) == Some(&name)
        && unit.spec.hostname.as_deref() == Some(name.as_str())
        && unit.spec.subdomain == expected_subdomain(set)
}

pub fn update_identity(set: &UnitSet, unit: &mut Unit) {
    let name = unit.name_any();
    unit.metadata.namespace = set.namespace();
    unit.labels_mut().insert(UNIT_NAME_LABEL.to_string(), name.clone());
    unit.spec.hostname = Some(name);
    unit.spec.subdomain = expected_subdomain(set);
}

fn claim_volume(volume_name: &str, claim: &PersistentVolumeClaim) -> Volume {
    Volume {
        name: volume_name.to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: claim.name_any(),
            read_only: None,
        }),
        ..Volume::default()
    }
}

/// Every claim template is mounted from the claim belonging to this Unit.
pub fn storage_matches(set: &UnitSet, unit: &Unit) -> bool {
    claims_for(set, unit).iter().all(|(volume_name, claim)| {
        unit.spec.volumes.iter().any(|v| {
            &v.name == volume_name
                && v.persistent_volume_claim.as_ref().map(|c| c.claim_name.as_str())
                    == Some(claim.name_any().as_str())
        })
    })
}

/// Claim volumes first, in template order, followed by any other volumes the
/// Unit already had.
pub fn update_storage(set: &UnitSet, unit: &mut Unit) {
    let claims = claims_for(set, unit);
    if claims.is_empty() {
        return;
    }
    let mut volumes: Vec<Volume> = claims
        .iter()
        .map(|(volume_name, claim)| claim_volume(volume_name, claim))
        .collect();
    volumes.extend(
        unit.spec
            .volumes
            .drain(..)
            .filter(|v| !claims.iter().any(|(name, _)| name == &v.name)),
    );
    unit.spec.volumes = volumes;
}

/// A Unit for `ordinal` stamped from `set`'s template.
pub fn new_unit_for(set: &UnitSet, ordinal: i32) -> Unit {
    let template = &set.spec.template;
    let mut unit = Unit::new(&unit_name(set, ordinal), template.spec.clone());
    unit.metadata.namespace = set.namespace();
    unit.metadata.owner_references = Some(vec![controller_ref(set)]);
    if !template.metadata.labels.is_empty() {
        unit.metadata.labels = Some(template.metadata.labels.clone());
    }
    if !template.metadata.annotations.is_empty() {
        unit.metadata.annotations = Some(template.metadata.annotations.clone());
    }
    if !template.metadata.finalizers.is_empty() {
        unit.metadata.finalizers = Some(template.metadata.finalizers.clone());
    }
    update_identity(set, &mut unit);
    update_storage(set, &mut unit);
    unit
}

/// Picks the template for a fresh Unit. Under a rolling update, ordinals
/// below max(partition, currentReplicas) stay at the current revision.
pub fn new_versioned_unit(
    current_set: &UnitSet,
    update_set: &UnitSet,
    current_revision: &str,
    update_revision: &str,
    ordinal: i32,
) -> Unit {
    let spec = &update_set.spec;
    let keep_current = spec.is_rolling_update() && {
        let current_replicas = update_set.status.as_ref().map_or(0, |s| s.current_replicas);
        ordinal
            < crate::ordinal::start_ordinal(update_set)
                .saturating_add(spec.partition().max(current_replicas))
    };
    let (set, revision) = if keep_current {
        (current_set, current_revision)
    } else {
        (update_set, update_revision)
    };
    let mut unit = new_unit_for(set, ordinal);
    set_revision(&mut unit, revision);
    unit
}
