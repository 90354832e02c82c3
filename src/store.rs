//! The resource store as the reconciler sees it: namespaced CRUD, label
//! queries, status writes and merge patches, with API errors sorted into the
//! kinds the reconciler reacts to.

use crate::errors::*;
use crate::selector;
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::marker::PhantomData;

#[async_trait]
pub trait ObjectStore<K>: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<K>;

    async fn list(&self, namespace: &str, selector: &LabelSelector) -> Result<Vec<K>>;

    async fn create(&self, obj: &K) -> Result<K>;

    /// Full update, guarded by the object's resourceVersion.
    async fn replace(&self, obj: &K) -> Result<K>;

    /// Writes only the status subresource, guarded by resourceVersion.
    async fn replace_status(&self, obj: &K) -> Result<K>;

    /// JSON merge patch: lists and scalars named in `patch` are replaced,
    /// everything else is left alone.
    async fn patch(&self, namespace: &str, name: &str, patch: &serde_json::Value) -> Result<K>;

    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Maps API failures onto NotFound / AlreadyExists / Conflict.
pub fn classify(err: kube::Error, kind: &str, name: &str) -> Error {
    let (kind, name) = (kind.to_string(), name.to_string());
    match &err {
        kube::Error::Api(resp) if resp.code == 404 => ErrorKind::NotFound(kind, name).into(),
        kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
            ErrorKind::AlreadyExists(kind, name).into()
        }
        kube::Error::Api(resp) if resp.code == 409 => ErrorKind::Conflict(kind, name).into(),
        _ => err.into(),
    }
}

/// `ObjectStore` backed by the Kubernetes API.
pub struct KubeStore<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeStore<K> {
    pub fn new(client: Client) -> Self {
        KubeStore {
            client,
            _kind: PhantomData,
        }
    }
}

impl<K> KubeStore<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    K::DynamicType: Default,
{
    fn api(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn kind() -> String {
        K::kind(&K::DynamicType::default()).into_owned()
    }
}

fn namespace_of<K: Resource>(obj: &K) -> String {
    obj.namespace().unwrap_or_default()
}

#[async_trait]
impl<K> ObjectStore<K> for KubeStore<K>
where
    K: Resource<Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
    K::DynamicType: Default,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<K> {
        self.api(namespace)
            .get(name)
            .await
            .map_err(|e| classify(e, &Self::kind(), name))
    }

    async fn list(&self, namespace: &str, selector: &LabelSelector) -> Result<Vec<K>> {
        let lp = ListParams::default().labels(&selector::to_query(selector)?);
        let list = self
            .api(namespace)
            .list(&lp)
            .await
            .map_err(|e| classify(e, &Self::kind(), namespace))?;
        Ok(list.items)
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        self.api(&namespace_of(obj))
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| classify(e, &Self::kind(), &name))
    }

    async fn replace(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        self.api(&namespace_of(obj))
            .replace(&name, &PostParams::default(), obj)
            .await
            .map_err(|e| classify(e, &Self::kind(), &name))
    }

    async fn replace_status(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        let data = serde_json::to_vec(obj)?;
        self.api(&namespace_of(obj))
            .replace_status(&name, &PostParams::default(), data)
            .await
            .map_err(|e| classify(e, &Self::kind(), &name))
    }

    async fn patch(&self, namespace: &str, name: &str, patch: &serde_json::Value) -> Result<K> {
        self.api(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| classify(e, &Self::kind(), name))
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        self.api(namespace)
            .delete(name, &DeleteParams::background())
            .await
            .map(|_| ())
            .map_err(|e| classify(e, &Self::kind(), name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::error::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: "boom".into(),
            reason: reason.into(),
            code,
        })
    }

    #[test]
    fn api_errors_are_classified() {
        assert!(classify(api_error(404, "NotFound"), "Unit", "web-0").is_not_found());
        assert!(classify(api_error(409, "AlreadyExists"), "Unit", "web-0").is_already_exists());
        assert!(classify(api_error(409, "Conflict"), "Unit", "web-0").is_conflict());
        let other = classify(api_error(500, "InternalError"), "Unit", "web-0");
        assert!(!other.is_not_found() && !other.is_conflict());
    }
}
