use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::core::v1::{Container, Volume};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use kube_derive::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::REVISION_LABEL;

/// A single ordinal-addressed compute unit. The per-unit controller turns the
/// spec into a running container group and mirrors its lifecycle back into
/// the status; this crate only reads that status.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, PartialEq, Default, JsonSchema)]
#[kube(
    group = "pikach.us",
    version = "v1alpha1",
    kind = "Unit",
    status = "UnitStatus",
    shortname = "un",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct UnitSpec {
    #[serde(default)]
    pub containers: Vec<Container>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub init_containers: Vec<Container>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subdomain: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub termination_grace_period_seconds: Option<i64>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum UnitPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UnitStatus {
    /// Unset until the per-unit controller has observed the Unit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<UnitPhase>,
    #[serde(default)]
    pub conditions: Vec<UnitCondition>,
    #[serde(rename = "unitIP", skip_serializing_if = "Option::is_none")]
    pub unit_ip: Option<String>,
    #[serde(rename = "hostIP", skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UnitCondition {
    #[serde(rename = "type")]
    pub type_: String,
    /// "True", "False" or "Unknown".
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

pub const READY_CONDITION: &str = "Ready";

fn phase(unit: &Unit) -> Option<UnitPhase> {
    unit.status.as_ref().and_then(|s| s.phase)
}

/// Returns the Ready condition, if the per-unit controller has reported one.
pub fn ready_condition(unit: &Unit) -> Option<&UnitCondition> {
    unit.status
        .as_ref()?
        .conditions
        .iter()
        .find(|c| c.type_ == READY_CONDITION)
}

/// A Unit has been created once the store knows about it. Units materialized
/// locally carry neither a creation timestamp nor a phase.
pub fn is_created(unit: &Unit) -> bool {
    unit.metadata.creation_timestamp.is_some() || phase(unit).is_some()
}

pub fn is_pending(unit: &Unit) -> bool {
    phase(unit) == Some(UnitPhase::Pending)
}

pub fn is_failed(unit: &Unit) -> bool {
    phase(unit) == Some(UnitPhase::Failed)
}

pub fn is_terminating(unit: &Unit) -> bool {
    unit.metadata.deletion_timestamp.is_some()
}

pub fn is_ready(unit: &Unit) -> bool {
    ready_condition(unit).map_or(false, |c| c.status == "True")
}

pub fn is_running_and_ready(unit: &Unit) -> bool {
    phase(unit) == Some(UnitPhase::Running) && is_ready(unit)
}

/// Running, ready and not on its way out.
pub fn is_healthy(unit: &Unit) -> bool {
    is_running_and_ready(unit) && !is_terminating(unit)
}

/// Ready for strictly longer than `min_ready_seconds` as of `now`.
pub fn is_available(unit: &Unit, min_ready_seconds: i32, now: DateTime<Utc>) -> bool {
    if !is_ready(unit) {
        return false;
    }
    if min_ready_seconds <= 0 {
        return true;
    }
    match ready_condition(unit).and_then(|c| c.last_transition_time.as_ref()) {
        Some(Time(since)) => *since + Duration::seconds(i64::from(min_ready_seconds)) < now,
        None => false,
    }
}

pub fn is_running_and_available(unit: &Unit, min_ready_seconds: i32) -> bool {
    is_running_and_ready(unit) && is_available(unit, min_ready_seconds, Utc::now())
}

/// Name of the revision the Unit was built from, empty when unlabelled.
pub fn revision_of(unit: &Unit) -> &str {
    unit.labels().get(REVISION_LABEL).map(String::as_str).unwrap_or("")
}

pub fn set_revision(unit: &mut Unit, revision: &str) {
    unit.labels_mut()
        .insert(REVISION_LABEL.to_string(), revision.to_string());
}
