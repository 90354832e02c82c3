use crate::config::Config;
use crate::control::UnitSetControl;
use crate::errors::*;
use crate::events::KubeRecorder;
use crate::materialize::{controller_of, is_controlled_by};
use crate::retry::DEFAULT_RETRY;
use crate::store::{KubeStore, ObjectStore};
use crate::unit::Unit;
use crate::unitset::{validate, UnitSet};
use futures::{future::BoxFuture, FutureExt, StreamExt};
use k8s_openapi::api::apps::v1::ControllerRevision;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{
    api::Api,
    client::Client,
    CustomResourceExt, Resource, ResourceExt,
};
use kube_runtime::controller::{self, Action, Controller};
use kube_runtime::reflector::ObjectRef;
use kube_runtime::watcher;
use log::{debug, error, info, trace, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

// Context for our reconciler
pub struct Data {
    sets: Arc<dyn ObjectStore<UnitSet>>,
    units: Arc<dyn ObjectStore<Unit>>,
    control: UnitSetControl,
    config: Config,
    /// Consecutive failed reconciles per set, reset on success.
    failures: Mutex<HashMap<String, u32>>,
}

impl Data {
    pub fn new(
        sets: Arc<dyn ObjectStore<UnitSet>>,
        units: Arc<dyn ObjectStore<Unit>>,
        control: UnitSetControl,
        config: Config,
    ) -> Self {
        Data {
            sets,
            units,
            control,
            config,
            failures: Mutex::new(HashMap::new()),
        }
    }

    fn failures(&self) -> std::sync::MutexGuard<'_, HashMap<String, u32>> {
        self.failures.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn forget(&self, key: &str) {
        self.failures().remove(key);
    }

    /// Records a failure and returns how many came before it.
    fn fail(&self, key: &str) -> u32 {
        let mut failures = self.failures();
        let count = failures.entry(key.to_string()).or_insert(0);
        let previous = *count;
        *count = count.saturating_add(1);
        previous
    }
}

/// The set itself vanished, e.g. between the read and the status write.
fn is_set_gone(err: &Error) -> bool {
    matches!(err.kind(), ErrorKind::NotFound(kind, _) if kind.as_str() == UnitSet::kind(&()))
}

fn key_of(set: &UnitSet) -> String {
    format!("{}/{}", set.namespace().unwrap_or_default(), set.name_any())
}

/// One sync of a UnitSet against the latest stored copy and the Units it
/// controls.
pub async fn reconcile(set: Arc<UnitSet>, ctx: Arc<Data>) -> Result<Action> {
    let key = key_of(&set);
    let namespace = set.namespace().unwrap_or_default();
    let set = match ctx.sets.get(&namespace, &set.name_any()).await {
        Ok(set) => set,
        Err(e) if e.is_not_found() => {
            debug!("UnitSet {} has been deleted", key);
            ctx.forget(&key);
            return Ok(Action::await_change());
        }
        Err(e) => return Err(e),
    };

    if let Err(e) = validate(&set) {
        if e.is_permanent() {
            warn!("not syncing UnitSet {}: {}", key, e);
            ctx.forget(&key);
            return Ok(Action::await_change());
        }
        return Err(e);
    }

    let units: Vec<Unit> = ctx
        .units
        .list(&namespace, &set.spec.selector)
        .await?
        .into_iter()
        .filter(|unit| is_controlled_by(unit, &set))
        .collect();
    trace!("UnitSet {} controls {} Units", key, units.len());

    let status = match ctx.control.update_unit_set(&set, units).await {
        Err(e) if is_set_gone(&e) => {
            debug!("UnitSet {} was deleted during sync", key);
            ctx.forget(&key);
            return Ok(Action::await_change());
        }
        Err(e) if e.is_permanent() => {
            warn!("not syncing UnitSet {}: {}", key, e);
            ctx.forget(&key);
            return Ok(Action::await_change());
        }
        other => other?,
    };
    ctx.forget(&key);
    debug!(
        "synced UnitSet {}: {}/{} ready, {} available",
        key, status.ready_replicas, status.replicas, status.available_replicas
    );

    let min_ready = set.spec.min_ready_seconds;
    if min_ready > 0 && status.available_replicas != set.spec.replicas {
        return Ok(Action::requeue(Duration::from_secs(min_ready as u64 + 1)));
    }
    Ok(Action::requeue(ctx.config.resync()))
}

pub fn error_policy(set: Arc<UnitSet>, error: &Error, ctx: Arc<Data>) -> Action {
    let key = key_of(&set);
    let delay = ctx.config.requeue_backoff().delay(ctx.fail(&key));
    warn!("reconcile of UnitSet {} failed, retrying in {:?}: {}", key, delay, error);
    Action::requeue(delay)
}

/// The UnitSet a Unit's events belong to: its controller, when that is a
/// UnitSet.
pub fn owning_set(unit: &Unit) -> Option<ObjectRef<UnitSet>> {
    let owner = controller_of(&unit.metadata)?;
    if owner.kind != UnitSet::kind(&()) || owner.api_version != UnitSet::api_version(&()) {
        return None;
    }
    let set = ObjectRef::new(&owner.name);
    Some(match unit.namespace() {
        Some(ns) => set.within(&ns),
        None => set,
    })
}

async fn require_crd(crds: &Api<CustomResourceDefinition>, name: &str) -> Result<()> {
    crds.get(name)
        .await
        .chain_err(|| format!("install the {} crd first", name))?;
    Ok(())
}

fn scoped<K>(client: &Client, namespace: &Option<String>) -> Api<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

pub struct Manager {}

/// Manager that owns a Controller for UnitSet
impl Manager {
    /// Lifecycle initialization interface for app
    ///
    /// This returns a `Manager` that drives a `Controller` + a future to be awaited
    /// It is up to `main` to wait for the controller stream.
    pub async fn new(client: Client, config: Config) -> Result<(Self, BoxFuture<'static, ()>)> {
        let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
        require_crd(&crds, UnitSet::crd_name()).await?;
        require_crd(&crds, Unit::crd_name()).await?;

        let recorder = Arc::new(KubeRecorder::new(client.clone(), &config.controller_name));
        let sets: Arc<KubeStore<UnitSet>> = Arc::new(KubeStore::new(client.clone()));
        let units: Arc<KubeStore<Unit>> = Arc::new(KubeStore::new(client.clone()));
        let control = UnitSetControl::new(
            sets.clone(),
            units.clone(),
            Arc::new(KubeStore::<ControllerRevision>::new(client.clone())),
            Arc::new(KubeStore::<PersistentVolumeClaim>::new(client.clone())),
            recorder,
            DEFAULT_RETRY.with_steps(config.status_retry_steps),
        );
        let context = Arc::new(Data::new(sets, units, control, config.clone()));

        info!(
            "watching UnitSets in {} with {} workers",
            config.namespace.as_deref().unwrap_or("all namespaces"),
            config.workers
        );
        let sets = scoped::<UnitSet>(&client, &config.namespace);
        let drainer = Controller::new(sets, watcher::Config::default())
            .watches(
                scoped::<Unit>(&client, &config.namespace),
                watcher::Config::default(),
                |unit| owning_set(&unit),
            )
            .with_config(controller::Config::default().concurrency(config.workers))
            .shutdown_on_signal()
            .run(reconcile, error_policy, context)
            .for_each(|o| {
                match o {
                    Ok((set, action)) => debug!("reconciled {}: {:?}", set, action),
                    Err(e) => error!("controller error: {}", e),
                }
                futures::future::ready(())
            })
            .boxed();
        // what we do with the controller stream from .run() ^^ does not matter
        // but we do need to consume it, hence general printing + return future

        Ok((Self {}, drainer))
    }
}
