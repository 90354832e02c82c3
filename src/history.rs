//! Revision history. Each distinct UnitSet template is recorded once as a
//! ControllerRevision whose data is a patch that restores the template.

use crate::errors::*;
use crate::materialize::{controller_of, controller_ref, is_controlled_by};
use crate::retry::{read_modify_write, Backoff};
use crate::selector;
use crate::store::ObjectStore;
use crate::unitset::{UnitSet, UnitTemplate};
use k8s_openapi::api::apps::v1::ControllerRevision;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::runtime::RawExtension;
use kube::ResourceExt;
use log::{debug, info};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// The patch stored in a revision: `spec.template` with replace semantics.
pub fn patch_for(set: &UnitSet) -> Result<Value> {
    let mut template = serde_json::to_value(&set.spec.template)?;
    if let Value::Object(fields) = &mut template {
        fields.insert("$patch".to_string(), Value::String("replace".to_string()));
    }
    Ok(json!({ "spec": { "template": template } }))
}

fn payload(revision: &ControllerRevision) -> Option<&Value> {
    revision.data.as_ref().map(|RawExtension(v)| v)
}

/// First ten hex digits of SHA-256 over the payload followed by the
/// collision count. Object keys serialize sorted, so equal payloads hash
/// equally across restarts.
pub fn hash_revision(revision: &ControllerRevision, collision_count: i32) -> Result<String> {
    let mut hasher = Sha256::new();
    if let Some(data) = payload(revision) {
        hasher.update(serde_json::to_vec(data)?);
    }
    hasher.update((collision_count as u32).to_le_bytes());
    let digest = hex::encode(hasher.finalize());
    Ok(digest[..10].to_string())
}

/// An unnamed candidate revision of `set`'s template.
pub fn new_revision(set: &UnitSet, revision: i64) -> Result<ControllerRevision> {
    let labels = &set.spec.template.metadata.labels;
    Ok(ControllerRevision {
        metadata: ObjectMeta {
            namespace: set.namespace(),
            labels: Some(labels.clone()).filter(|l| !l.is_empty()),
            annotations: set.metadata.annotations.clone(),
            owner_references: Some(vec![controller_ref(set)]),
            ..ObjectMeta::default()
        },
        data: Some(RawExtension(patch_for(set)?)),
        revision,
    })
}

/// Restores `set` to the template recorded in `revision`.
pub fn apply_revision(set: &UnitSet, revision: &ControllerRevision) -> Result<UnitSet> {
    let invalid =
        |reason: &str| ErrorKind::InvalidRevision(revision.name_any(), reason.to_string());
    let mut template = payload(revision)
        .and_then(|data| data.pointer("/spec/template"))
        .cloned()
        .ok_or_else(|| invalid("no spec.template in data"))?;
    if let Value::Object(fields) = &mut template {
        fields.remove("$patch");
    }
    let template: UnitTemplate =
        serde_json::from_value(template).map_err(|e| invalid(&e.to_string()))?;
    let mut restored = set.clone();
    restored.spec.template = template;
    Ok(restored)
}

pub fn equal_revision(a: &ControllerRevision, b: &ControllerRevision) -> bool {
    match (payload(a), payload(b)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Revisions whose payload equals `needle`, in the order given.
pub fn find_equal_revisions<'a>(
    revisions: &'a [ControllerRevision],
    needle: &ControllerRevision,
) -> Vec<&'a ControllerRevision> {
    revisions.iter().filter(|r| equal_revision(r, needle)).collect()
}

/// Oldest first: by revision number, then creation time, then name.
pub fn sort_revisions(revisions: &mut [ControllerRevision]) {
    revisions.sort_by(|a, b| {
        a.revision
            .cmp(&b.revision)
            .then_with(|| {
                let ts =
                    |r: &ControllerRevision| r.metadata.creation_timestamp.as_ref().map(|t| t.0);
                ts(a).cmp(&ts(b))
            })
            .then_with(|| a.name_any().cmp(&b.name_any()))
    });
}

/// The number the next revision gets given a sorted history.
pub fn next_revision(sorted: &[ControllerRevision]) -> i64 {
    sorted.last().map_or(1, |r| r.revision + 1)
}

pub struct History {
    store: Arc<dyn ObjectStore<ControllerRevision>>,
    retry: Backoff,
}

impl History {
    pub fn new(store: Arc<dyn ObjectStore<ControllerRevision>>, retry: Backoff) -> Self {
        History { store, retry }
    }

    /// Revisions owned by `set`. Matching revisions without a controller are
    /// adopted on the way.
    pub async fn list(&self, set: &UnitSet) -> Result<Vec<ControllerRevision>> {
        let namespace = set.namespace().unwrap_or_default();
        let mut owned = Vec::new();
        for revision in self.store.list(&namespace, &set.spec.selector).await? {
            if is_controlled_by(&revision, set) {
                owned.push(revision);
            } else if controller_of(&revision.metadata).is_none()
                && set.metadata.deletion_timestamp.is_none()
            {
                owned.push(self.adopt(set, revision).await?);
            }
        }
        Ok(owned)
    }

    async fn adopt(
        &self,
        set: &UnitSet,
        revision: ControllerRevision,
    ) -> Result<ControllerRevision> {
        let name = revision.name_any();
        let labels = revision.metadata.labels.clone().unwrap_or_default();
        if !selector::matches(&set.spec.selector, &labels)? {
            bail!(ErrorKind::InvalidSelector(format!("revision {} no longer matches", name)));
        }
        info!("UnitSet {} adopting orphaned revision {}", set.name_any(), name);
        let mut owners = revision.metadata.owner_references.clone().unwrap_or_default();
        owners.push(controller_ref(set));
        let patch = json!({
            "metadata": {
                "ownerReferences": owners,
                "resourceVersion": revision.metadata.resource_version,
            }
        });
        self.store
            .patch(&set.namespace().unwrap_or_default(), &name, &patch)
            .await
    }

    /// Persists `revision` under its hashed name. A different revision
    /// already holding that name bumps `collision_count` and the name is
    /// hashed again; an equal one is returned as is.
    pub async fn create(
        &self,
        set: &UnitSet,
        revision: &ControllerRevision,
        collision_count: &mut i32,
    ) -> Result<ControllerRevision> {
        let namespace = set.namespace().unwrap_or_default();
        loop {
            let mut candidate = revision.clone();
            candidate.metadata.name = Some(format!(
                "{}-{}",
                set.name_any(),
                hash_revision(revision, *collision_count)?
            ));
            match self.store.create(&candidate).await {
                Ok(created) => return Ok(created),
                Err(e) if e.is_already_exists() => {
                    let existing = self.store.get(&namespace, &candidate.name_any()).await?;
                    if equal_revision(&existing, revision) {
                        return Ok(existing);
                    }
                    *collision_count += 1;
                    debug!(
                        "revision name {} taken, collision count now {}",
                        candidate.name_any(),
                        collision_count
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Moves an existing revision to the front of the history.
    pub async fn update_revision_number(
        &self,
        revision: &ControllerRevision,
        number: i64,
    ) -> Result<ControllerRevision> {
        let store = self.store.as_ref();
        let written = read_modify_write(
            store,
            &self.retry,
            revision.clone(),
            |current| {
                if current.revision == number {
                    return Ok(None);
                }
                let mut next = current.clone();
                next.revision = number;
                Ok(Some(next))
            },
            move |next| async move { store.replace(&next).await },
        )
        .await?;
        match written {
            Some(written) => Ok(written),
            None => {
                let mut unchanged = revision.clone();
                unchanged.revision = number;
                Ok(unchanged)
            }
        }
    }

    pub async fn delete(&self, revision: &ControllerRevision) -> Result<()> {
        let namespace = revision.namespace().unwrap_or_default();
        match self.store.delete(&namespace, &revision.name_any()).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }
}
