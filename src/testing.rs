//! In-memory stand-ins for the API server and the event sink, plus fixtures.

use crate::control::UnitSetControl;
use crate::errors::*;
use crate::events::{EventRecorder, EventType};
use crate::materialize::is_controlled_by;
use crate::retry::DEFAULT_RETRY;
use crate::selector;
use crate::store::ObjectStore;
use crate::unit::{
    is_running_and_ready, Unit, UnitCondition, UnitPhase, UnitSpec, UnitStatus, READY_CONDITION,
};
use crate::unitset::{TemplateMeta, UnitSet, UnitSetSpec, UnitSetStatus, UnitTemplate};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::apps::v1::ControllerRevision;
use k8s_openapi::api::core::v1::{Container, PersistentVolumeClaim, PersistentVolumeClaimSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, Time};
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

enum Fault {
    Fail,
    Conflict(usize),
    Missing,
}

/// Namespaced objects keyed by (namespace, name), with resource versions,
/// a log of every call and injectable faults.
pub struct MemoryStore<K> {
    objects: Mutex<BTreeMap<(String, String), K>>,
    version: Mutex<u64>,
    calls: Mutex<Vec<String>>,
    faults: Mutex<HashMap<(String, String), Fault>>,
}

impl<K> Default for MemoryStore<K> {
    fn default() -> Self {
        MemoryStore {
            objects: Mutex::new(BTreeMap::new()),
            version: Mutex::new(0),
            calls: Mutex::new(Vec::new()),
            faults: Mutex::new(HashMap::new()),
        }
    }
}

fn key<K: Resource>(obj: &K) -> (String, String) {
    (obj.namespace().unwrap_or_default(), obj.name_any())
}

/// JSON merge patch: objects merge key by key, null removes, anything else
/// replaces.
fn merge(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(fields) => {
            if !target.is_object() {
                *target = Value::Object(Map::new());
            }
            if let Value::Object(target) = target {
                for (k, v) in fields {
                    if v.is_null() {
                        target.remove(k);
                    } else {
                        merge(target.entry(k.clone()).or_insert(Value::Null), v);
                    }
                }
            }
        }
        _ => *target = patch.clone(),
    }
}

impl<K> MemoryStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned,
{
    fn kind() -> String {
        K::kind(&()).into_owned()
    }

    fn next_version(&self) -> String {
        let mut version = self.version.lock().unwrap();
        *version += 1;
        version.to_string()
    }

    fn log(&self, verb: &str, name: &str) {
        self.calls.lock().unwrap().push(format!("{} {}", verb, name));
    }

    fn fault(&self, verb: &str, name: &str) -> Result<()> {
        let mut faults = self.faults.lock().unwrap();
        match faults.get_mut(&(verb.to_string(), name.to_string())) {
            Some(Fault::Fail) => bail!("injected {} failure for {}", verb, name),
            Some(Fault::Conflict(n)) if *n > 0 => {
                *n -= 1;
                bail!(ErrorKind::Conflict(Self::kind(), name.to_string()))
            }
            Some(Fault::Missing) => bail!(ErrorKind::NotFound(Self::kind(), name.to_string())),
            _ => Ok(()),
        }
    }

    fn stamp(&self, mut obj: K) -> K {
        let name = obj.name_any();
        let meta = obj.meta_mut();
        meta.resource_version = Some(self.next_version());
        meta.uid.get_or_insert_with(|| format!("uid-{}", name));
        meta.creation_timestamp.get_or_insert_with(|| Time(Utc::now()));
        obj
    }

    /// Seeds an object as if it had been created, without logging a call.
    pub fn insert(&self, obj: K) -> K {
        let obj = self.stamp(obj);
        self.objects.lock().unwrap().insert(key(&obj), obj.clone());
        obj
    }

    pub fn all(&self) -> Vec<K> {
        self.objects.lock().unwrap().values().cloned().collect()
    }

    /// Changes a stored object behind the controller's back.
    pub fn modify(&self, name: &str, f: impl FnOnce(&mut K)) {
        let version = self.next_version();
        let mut objects = self.objects.lock().unwrap();
        if let Some(obj) = objects.values_mut().find(|o| o.name_any() == name) {
            f(obj);
            obj.meta_mut().resource_version = Some(version);
        }
    }

    /// Removes an object without logging a call.
    pub fn delete_now(&self, name: &str) {
        self.objects.lock().unwrap().retain(|_, o| o.name_any() != name);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_matching(&self, verb: &str) -> Vec<String> {
        let prefix = format!("{} ", verb);
        self.calls().into_iter().filter(|c| c.starts_with(&prefix)).collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// Every `verb` on `name` fails from now on.
    pub fn fail(&self, verb: &str, name: &str) {
        self.faults
            .lock()
            .unwrap()
            .insert((verb.to_string(), name.to_string()), Fault::Fail);
    }

    /// Every `verb` on `name` reports the object as gone, as if it were
    /// deleted just before the call.
    pub fn missing(&self, verb: &str, name: &str) {
        self.faults
            .lock()
            .unwrap()
            .insert((verb.to_string(), name.to_string()), Fault::Missing);
    }

    /// The next `times` calls of `verb` on `name` conflict.
    pub fn conflict(&self, verb: &str, name: &str, times: usize) {
        self.faults
            .lock()
            .unwrap()
            .insert((verb.to_string(), name.to_string()), Fault::Conflict(times));
    }

    fn stored(&self, namespace: &str, name: &str) -> Result<K> {
        self.objects
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| ErrorKind::NotFound(Self::kind(), name.to_string()).into())
    }

    fn check_version(&self, stored: &K, expected: Option<&str>) -> Result<()> {
        match expected {
            Some(rv) if Some(rv) != stored.meta().resource_version.as_deref() => {
                bail!(ErrorKind::Conflict(Self::kind(), stored.name_any()))
            }
            _ => Ok(()),
        }
    }

    fn save(&self, mut obj: K) -> K {
        obj.meta_mut().resource_version = Some(self.next_version());
        self.objects.lock().unwrap().insert(key(&obj), obj.clone());
        obj
    }
}

#[async_trait]
impl<K> ObjectStore<K> for MemoryStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<K> {
        self.log("get", name);
        self.fault("get", name)?;
        self.stored(namespace, name)
    }

    async fn list(&self, namespace: &str, selector: &LabelSelector) -> Result<Vec<K>> {
        self.log("list", namespace);
        let mut matching = Vec::new();
        for obj in self.all() {
            if obj.namespace().as_deref() == Some(namespace)
                && selector::matches(selector, obj.labels())?
            {
                matching.push(obj);
            }
        }
        Ok(matching)
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        self.log("create", &name);
        self.fault("create", &name)?;
        if self.objects.lock().unwrap().contains_key(&key(obj)) {
            bail!(ErrorKind::AlreadyExists(Self::kind(), name));
        }
        Ok(self.insert(obj.clone()))
    }

    async fn replace(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        self.log("replace", &name);
        self.fault("replace", &name)?;
        let stored = self.stored(&obj.namespace().unwrap_or_default(), &name)?;
        self.check_version(&stored, obj.meta().resource_version.as_deref())?;
        let mut next = obj.clone();
        next.meta_mut().uid = stored.meta().uid.clone();
        next.meta_mut().creation_timestamp = stored.meta().creation_timestamp.clone();
        Ok(self.save(next))
    }

    async fn replace_status(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        self.log("replace_status", &name);
        self.fault("replace_status", &name)?;
        let stored = self.stored(&obj.namespace().unwrap_or_default(), &name)?;
        self.check_version(&stored, obj.meta().resource_version.as_deref())?;
        let mut value = serde_json::to_value(&stored)?;
        let status = serde_json::to_value(obj)?.get("status").cloned().unwrap_or(Value::Null);
        value["status"] = status;
        Ok(self.save(serde_json::from_value(value)?))
    }

    async fn patch(&self, namespace: &str, name: &str, patch: &Value) -> Result<K> {
        self.log("patch", name);
        self.fault("patch", name)?;
        let stored = self.stored(namespace, name)?;
        let expected = patch.pointer("/metadata/resourceVersion").and_then(Value::as_str);
        self.check_version(&stored, expected)?;
        let mut value = serde_json::to_value(&stored)?;
        merge(&mut value, patch);
        Ok(self.save(serde_json::from_value(value)?))
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        self.log("delete", name);
        self.fault("delete", name)?;
        self.objects
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| ErrorKind::NotFound(Self::kind(), name.to_string()).into())
    }
}

#[derive(Default)]
pub struct FakeRecorder {
    events: Mutex<Vec<(EventType, String, String)>>,
}

impl FakeRecorder {
    pub fn reasons(&self) -> Vec<String> {
        self.events.lock().unwrap().iter().map(|(_, r, _)| r.clone()).collect()
    }
}

#[async_trait]
impl EventRecorder for FakeRecorder {
    async fn record(&self, _set: &UnitSet, type_: EventType, reason: &str, note: String) {
        self.events.lock().unwrap().push((type_, reason.to_string(), note));
    }
}

pub fn unit_named(name: &str) -> Unit {
    let mut unit = Unit::new(name, UnitSpec::default());
    unit.metadata.namespace = Some("default".into());
    unit
}

/// `unit` Running with a Ready condition that turned true at `ready_since`.
pub fn running_ready(mut unit: Unit, ready_since: DateTime<Utc>) -> Unit {
    unit.status = Some(UnitStatus {
        phase: Some(UnitPhase::Running),
        conditions: vec![UnitCondition {
            type_: READY_CONDITION.into(),
            status: "True".into(),
            last_transition_time: Some(Time(ready_since)),
            reason: None,
            message: None,
        }],
        ..UnitStatus::default()
    });
    unit
}

/// A set selecting `app=<name>` with a single container running `web:1`.
pub fn unit_set(name: &str, replicas: i32) -> UnitSet {
    let labels: BTreeMap<String, String> = [("app".to_string(), name.to_string())].into();
    let mut set = UnitSet::new(
        name,
        UnitSetSpec {
            replicas,
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                match_expressions: None,
            },
            template: UnitTemplate {
                metadata: TemplateMeta {
                    labels,
                    ..TemplateMeta::default()
                },
                spec: UnitSpec {
                    containers: vec![Container {
                        name: "main".into(),
                        image: Some("web:1".into()),
                        ..Container::default()
                    }],
                    ..UnitSpec::default()
                },
            },
            service_name: name.into(),
            ..UnitSetSpec::default()
        },
    );
    set.metadata = ObjectMeta {
        name: Some(name.into()),
        namespace: Some("default".into()),
        uid: Some(format!("uid-{}", name)),
        generation: Some(1),
        ..ObjectMeta::default()
    };
    set
}

pub fn claim_template(name: &str) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.into()),
            ..ObjectMeta::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".into()]),
            ..PersistentVolumeClaimSpec::default()
        }),
        ..PersistentVolumeClaim::default()
    }
}

/// A controller wired to in-memory stores.
pub struct Harness {
    pub sets: Arc<MemoryStore<UnitSet>>,
    pub units: Arc<MemoryStore<Unit>>,
    pub revisions: Arc<MemoryStore<ControllerRevision>>,
    pub claims: Arc<MemoryStore<PersistentVolumeClaim>>,
    pub recorder: Arc<FakeRecorder>,
    pub control: UnitSetControl,
}

impl Harness {
    pub fn new() -> Self {
        let sets = Arc::new(MemoryStore::default());
        let units = Arc::new(MemoryStore::default());
        let revisions = Arc::new(MemoryStore::default());
        let claims = Arc::new(MemoryStore::default());
        let recorder = Arc::new(FakeRecorder::default());
        let control = UnitSetControl::new(
            sets.clone(),
            units.clone(),
            revisions.clone(),
            claims.clone(),
            recorder.clone(),
            DEFAULT_RETRY,
        );
        Harness {
            sets,
            units,
            revisions,
            claims,
            recorder,
            control,
        }
    }

    pub fn add_set(&self, set: UnitSet) -> UnitSet {
        self.sets.insert(set)
    }

    pub fn set(&self, name: &str) -> UnitSet {
        self.sets
            .all()
            .into_iter()
            .find(|s| s.name_any() == name)
            .expect("set exists")
    }

    /// One pass over the stored set and the Units it controls.
    pub async fn pass(&self, name: &str) -> Result<UnitSetStatus> {
        let set = self.set(name);
        let units = self
            .units
            .all()
            .into_iter()
            .filter(|u| is_controlled_by(u, &set))
            .collect();
        self.control.update_unit_set(&set, units).await
    }

    /// Plays the per-unit controller: every Unit becomes Running and has been
    /// Ready for a minute.
    pub fn ready_all(&self) {
        for unit in self.units.all() {
            if !is_running_and_ready(&unit) {
                self.units.modify(&unit.name_any(), |u| {
                    *u = running_ready(u.clone(), Utc::now() - Duration::seconds(60));
                });
            }
        }
    }

    /// Alternates passes with `ready_all` until well past convergence.
    pub async fn converge(&self, name: &str) {
        for _ in 0..20 {
            let _ = self.pass(name).await;
            self.ready_all();
        }
    }

    pub fn unit_names(&self) -> Vec<String> {
        self.units.all().iter().map(|u| u.name_any()).collect()
    }
}
