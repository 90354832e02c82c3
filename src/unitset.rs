use crate::errors::*;
use crate::ordinal::start_ordinal;
use crate::selector;
use crate::unit::UnitSpec;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::ResourceExt;
use kube_derive::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Revisions kept around for rollback when revisionHistoryLimit is unset.
pub const DEFAULT_REVISION_HISTORY_LIMIT: i32 = 10;

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, PartialEq, Default, JsonSchema)]
#[kube(
    group = "pikach.us",
    version = "v1alpha1",
    kind = "UnitSet",
    status = "UnitSetStatus",
    shortname = "us",
    scale = r#"{"specReplicasPath":".spec.replicas", "statusReplicasPath":".status.replicas"}"#,
    printcolumn = r#"{"name":"Ready", "type":"integer", "jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Updated", "type":"integer", "jsonPath":".status.updatedReplicas"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct UnitSetSpec {
    /// Desired number of Units.
    #[serde(default = "default_replicas")]
    pub replicas: i32,
    /// Label query over Units and revisions owned by this set.
    pub selector: LabelSelector,
    /// Template every Unit is stamped from.
    pub template: UnitTemplate,
    /// Claims every Unit gets, named <template>-<set>-<ordinal>.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_claim_templates: Vec<PersistentVolumeClaim>,
    /// Headless service governing the Units' subdomain.
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub unit_management_policy: ManagementPolicy,
    #[serde(default)]
    pub update_strategy: UpdateStrategy,
    /// Seconds a Unit must stay ready before it counts as available.
    #[serde(default)]
    pub min_ready_seconds: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision_history_limit: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ordinals: Option<Ordinals>,
}

fn default_replicas() -> i32 {
    1
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UnitTemplate {
    #[serde(default)]
    pub metadata: TemplateMeta,
    pub spec: UnitSpec,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TemplateMeta {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub enum ManagementPolicy {
    /// Units are created in ascending and removed in descending ordinal
    /// order, each waiting on its predecessors.
    OrderedReady,
    /// Units are created and removed without waiting on each other.
    Parallel,
}

impl Default for ManagementPolicy {
    fn default() -> Self {
        ManagementPolicy::OrderedReady
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStrategy {
    #[serde(rename = "type", default)]
    pub type_: UpdateStrategyType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rolling_update: Option<RollingUpdate>,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub enum UpdateStrategyType {
    RollingUpdate,
    OnDelete,
}

impl Default for UpdateStrategyType {
    fn default() -> Self {
        UpdateStrategyType::RollingUpdate
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RollingUpdate {
    /// Ordinals below the partition keep the current revision.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition: Option<i32>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Ordinals {
    #[serde(default)]
    pub start: i32,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UnitSetStatus {
    #[serde(default)]
    pub observed_generation: i64,

    /// replicas is the number of Units created by the controller.
    #[serde(default)]
    pub replicas: i32,

    /// readyReplicas is the number of Units that are Running with a Ready condition.
    #[serde(default)]
    pub ready_replicas: i32,

    /// availableReplicas is the number of ready Units that have been ready for minReadySeconds.
    #[serde(default)]
    pub available_replicas: i32,

    /// currentReplicas is the number of Units built from currentRevision.
    #[serde(default)]
    pub current_replicas: i32,

    /// updatedReplicas is the number of Units built from updateRevision.
    #[serde(default)]
    pub updated_replicas: i32,

    #[serde(default)]
    pub current_revision: String,

    #[serde(default)]
    pub update_revision: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub collision_count: Option<i32>,
}

impl UnitSetStatus {
    // stabilized indicates whether every replica is ready and at the update revision.
    pub fn stabilized(&self) -> bool {
        self.current_revision == self.update_revision
            && [
                self.ready_replicas,
                self.current_replicas,
                self.updated_replicas,
            ]
            .iter()
            .all(|x| *x == self.replicas)
    }
}

impl UnitSetSpec {
    pub fn is_monotonic(&self) -> bool {
        self.unit_management_policy != ManagementPolicy::Parallel
    }

    pub fn is_rolling_update(&self) -> bool {
        self.update_strategy.type_ == UpdateStrategyType::RollingUpdate
    }

    /// The rolling update partition, 0 when unset.
    pub fn partition(&self) -> i32 {
        self.update_strategy
            .rolling_update
            .as_ref()
            .and_then(|r| r.partition)
            .unwrap_or(0)
    }

    pub fn history_limit(&self) -> usize {
        self.revision_history_limit
            .unwrap_or(DEFAULT_REVISION_HISTORY_LIMIT)
            .max(0) as usize
    }
}

impl UnitSet {
    pub fn status_or_default(&self) -> UnitSetStatus {
        self.status.clone().unwrap_or_default()
    }
}

/// Rejects specs no amount of retrying can reconcile.
pub fn validate(set: &UnitSet) -> Result<()> {
    let invalid = |reason: String| -> Result<()> {
        bail!(ErrorKind::InvalidSpec(set.name_any(), reason))
    };
    if set.spec.replicas < 0 {
        return invalid(format!("replicas must not be negative, got {}", set.spec.replicas));
    }
    if set.spec.partition() < 0 {
        return invalid(format!("partition must not be negative, got {}", set.spec.partition()));
    }
    if let Some(ordinals) = &set.spec.ordinals {
        if ordinals.start < 0 {
            return invalid(format!("ordinals.start must not be negative, got {}", ordinals.start));
        }
    }
    if start_ordinal(set).checked_add(set.spec.replicas).is_none() {
        return invalid(format!(
            "ordinals.start {} plus replicas {} overflows",
            start_ordinal(set),
            set.spec.replicas
        ));
    }
    if set.spec.min_ready_seconds < 0 {
        return invalid("minReadySeconds must not be negative".to_string());
    }
    if !selector::matches(&set.spec.selector, &set.spec.template.metadata.labels)? {
        bail!(ErrorKind::InvalidSelector(format!(
            "selector of UnitSet {} does not match its template labels",
            set.name_any()
        )));
    }
    Ok(())
}

/// Once every replica is ready at the update revision a rolling update is
/// done: the update revision becomes the current one.
pub fn complete_rolling_update(set: &UnitSet, status: &mut UnitSetStatus) {
    if set.spec.is_rolling_update()
        && status.updated_replicas == status.replicas
        && status.ready_replicas == status.replicas
    {
        status.current_replicas = status.updated_replicas;
        status.current_revision = status.update_revision.clone();
    }
}

/// True when `status` carries anything the stored status does not.
pub fn inconsistent_status(set: &UnitSet, status: &UnitSetStatus) -> bool {
    let stored = set.status_or_default();
    status.observed_generation > stored.observed_generation
        || status.replicas != stored.replicas
        || status.ready_replicas != stored.ready_replicas
        || status.available_replicas != stored.available_replicas
        || status.current_replicas != stored.current_replicas
        || status.updated_replicas != stored.updated_replicas
        || status.current_revision != stored.current_revision
        || status.update_revision != stored.update_revision
        || status.collision_count != stored.collision_count
}
