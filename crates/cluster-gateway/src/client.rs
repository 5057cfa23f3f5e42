//! Kubernetes-backed gateway implementation.
//!
//! All access is scoped to the build namespace and filtered by the
//! `runboat/build` label. Watches are built on `kube_runtime::watcher`,
//! which resumes from its cursor and re-lists from scratch when the
//! cursor goes stale; re-lists surface as one atomic
//! [`WatchEvent::Restarted`].

use futures::{stream, Stream, StreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, DeleteParams, ListParams, LogParams, Patch, PatchParams};
use kube::core::{DynamicObject, GroupVersionKind};
use kube::discovery::{Discovery, Scope};
use kube::{Client, Resource};
use kube_runtime::watcher;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt::Debug;
use tracing::debug;

use build_model::labels::{LABEL_BUILD, LABEL_JOB_KIND};
use build_model::JobKind;

use crate::bundle::BundleRequest;
use crate::error::GatewayError;
use crate::gateway_trait::{ClusterGateway, WatchEvent, WatchStream};
use crate::kubefiles;
use crate::retry::with_retries;

/// Field manager for server-side apply.
const FIELD_MANAGER: &str = "runboat";
/// Attempts per cluster call before giving up on transient errors.
const RETRY_ATTEMPTS: u32 = 5;

/// Cluster gateway backed by the Kubernetes API.
pub struct KubeGateway {
    client: Client,
    namespace: String,
    workloads: Api<Deployment>,
    jobs: Api<Job>,
    pods: Api<Pod>,
}

impl KubeGateway {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            workloads: Api::namespaced(client.clone(), namespace),
            jobs: Api::namespaced(client.clone(), namespace),
            pods: Api::namespaced(client.clone(), namespace),
            client,
            namespace: namespace.to_string(),
        }
    }

    fn build_selector(name: &str) -> String {
        format!("{LABEL_BUILD}={name}")
    }

    /// Resolves a build name to its workload via the build label. The
    /// workload's own name is owned by the template, so it is never
    /// assumed to equal the build name.
    async fn workload_by_name(&self, name: &str) -> Result<Deployment, GatewayError> {
        self.get_workload(name)
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("no workload for build {name}")))
    }

    async fn patch_workload(&self, name: &str, patch: Value) -> Result<(), GatewayError> {
        let workload = self.workload_by_name(name).await?;
        let workload_name = workload
            .metadata
            .name
            .ok_or_else(|| GatewayError::Manifest("workload without a name".to_string()))?;
        with_retries("patch workload", RETRY_ATTEMPTS, || async {
            self.workloads
                .patch(&workload_name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
                .map(|_| ())
                .map_err(Into::into)
        })
        .await
    }

    async fn apply_docs(
        &self,
        discovery: &Discovery,
        docs: &[Value],
        dry_run: bool,
    ) -> Result<(), GatewayError> {
        for doc in docs {
            let obj: DynamicObject = serde_json::from_value(doc.clone())
                .map_err(|e| GatewayError::Manifest(format!("not a resource: {e}")))?;
            let types = obj.types.ok_or_else(|| {
                GatewayError::Manifest("document without apiVersion/kind".to_string())
            })?;
            let (group, version) = match types.api_version.split_once('/') {
                Some((group, version)) => (group, version),
                None => ("", types.api_version.as_str()),
            };
            let gvk = GroupVersionKind::gvk(group, version, &types.kind);
            let (ar, caps) = discovery.resolve_gvk(&gvk).ok_or_else(|| {
                GatewayError::Manifest(format!("unknown kind {}/{}", types.api_version, types.kind))
            })?;
            let api: Api<DynamicObject> = if caps.scope == Scope::Namespaced {
                Api::namespaced_with(self.client.clone(), &self.namespace, &ar)
            } else {
                Api::all_with(self.client.clone(), &ar)
            };
            let obj_name = obj
                .metadata
                .name
                .ok_or_else(|| GatewayError::Manifest("document without name".to_string()))?;
            let mut params = PatchParams::apply(FIELD_MANAGER).force();
            params.dry_run = dry_run;
            debug!(kind = %types.kind, name = %obj_name, dry_run, "applying resource");
            with_retries("apply resource", RETRY_ATTEMPTS, || async {
                api.patch(&obj_name, &params, &Patch::Apply(doc))
                    .await
                    .map(|_| ())
                    .map_err(Into::into)
            })
            .await?;
        }
        Ok(())
    }

    async fn delete_collection_of<K>(
        &self,
        api: &Api<K>,
        selector: &str,
        params: &DeleteParams,
    ) -> Result<(), GatewayError>
    where
        K: Resource + Clone + serde::de::DeserializeOwned + Debug,
    {
        let lp = ListParams::default().labels(selector);
        api.delete_collection(params, &lp)
            .await
            .map(|_| ())
            .map_err(Into::into)
    }
}

#[async_trait::async_trait]
impl ClusterGateway for KubeGateway {
    fn watch_workloads(&self) -> WatchStream<Deployment> {
        watch_stream(self.workloads.clone())
    }

    fn watch_jobs(&self) -> WatchStream<Job> {
        watch_stream(self.jobs.clone())
    }

    async fn get_workload(&self, name: &str) -> Result<Option<Deployment>, GatewayError> {
        let lp = ListParams::default().labels(&Self::build_selector(name));
        let list = with_retries("list workloads", RETRY_ATTEMPTS, || async {
            self.workloads.list(&lp).await.map_err(Into::into)
        })
        .await?;
        Ok(list.items.into_iter().next())
    }

    async fn patch_workload_annotations(
        &self,
        name: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<(), GatewayError> {
        self.patch_workload(name, json!({ "metadata": { "annotations": annotations } }))
            .await
    }

    async fn scale_workload(&self, name: &str, replicas: i32) -> Result<(), GatewayError> {
        self.patch_workload(name, json!({ "spec": { "replicas": replicas } }))
            .await
    }

    async fn apply_bundle(&self, request: &BundleRequest) -> Result<(), GatewayError> {
        let docs = kubefiles::render(request)?;
        let discovery = Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(GatewayError::Kube)?;
        // Dry-run pass first: a failure mid-bundle would otherwise leak
        // resources the controller does not know it has to manage.
        self.apply_docs(&discovery, &docs, true).await?;
        self.apply_docs(&discovery, &docs, false).await
    }

    async fn delete_workload(&self, name: &str) -> Result<(), GatewayError> {
        let workload = match self.get_workload(name).await? {
            Some(workload) => workload,
            None => return Ok(()),
        };
        let workload_name = workload
            .metadata
            .name
            .ok_or_else(|| GatewayError::Manifest("workload without a name".to_string()))?;
        match self
            .workloads
            .delete(&workload_name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_gone(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_by_label(&self, name: &str) -> Result<(), GatewayError> {
        let selector = Self::build_selector(name);
        let dp = DeleteParams::default();
        let client = &self.client;
        let ns = &self.namespace;
        self.delete_collection_of(&Api::<ConfigMap>::namespaced(client.clone(), ns), &selector, &dp)
            .await?;
        self.delete_collection_of(&self.workloads, &selector, &dp)
            .await?;
        self.delete_collection_of(&Api::<Ingress>::namespaced(client.clone(), ns), &selector, &dp)
            .await?;
        self.delete_collection_of(&self.jobs, &selector, &dp).await?;
        self.delete_collection_of(&Api::<Secret>::namespaced(client.clone(), ns), &selector, &dp)
            .await?;
        self.delete_collection_of(&Api::<Service>::namespaced(client.clone(), ns), &selector, &dp)
            .await?;
        self.delete_collection_of(
            &Api::<PersistentVolumeClaim>::namespaced(client.clone(), ns),
            &selector,
            &dp,
        )
        .await?;
        self.delete_collection_of(&self.pods, &selector, &dp).await
    }

    async fn delete_job(&self, name: &str, kind: JobKind) -> Result<(), GatewayError> {
        let selector = format!("{LABEL_BUILD}={name},{LABEL_JOB_KIND}={kind}");
        let dp = DeleteParams::default().grace_period(0);
        self.delete_collection_of(&self.jobs, &selector, &dp).await?;
        self.delete_collection_of(&self.pods, &selector, &dp).await
    }

    async fn remove_finalizer(&self, name: &str, finalizer: &str) -> Result<(), GatewayError> {
        let workload = match self.get_workload(name).await? {
            Some(workload) => workload,
            None => return Ok(()),
        };
        let workload_name = workload
            .metadata
            .name
            .ok_or_else(|| GatewayError::Manifest("workload without a name".to_string()))?;
        let finalizers: Vec<String> = workload
            .metadata
            .finalizers
            .unwrap_or_default()
            .into_iter()
            .filter(|f| f != finalizer)
            .collect();
        let patch = json!({ "metadata": { "finalizers": finalizers } });
        match self
            .workloads
            .patch(&workload_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_gone(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_log(
        &self,
        name: &str,
        kind: Option<JobKind>,
        tail_lines: Option<i64>,
    ) -> Result<Option<String>, GatewayError> {
        let lp = ListParams::default().labels(&Self::build_selector(name));
        let pods = with_retries("list pods", RETRY_ATTEMPTS, || async {
            self.pods.list(&lp).await.map_err(Into::into)
        })
        .await?;
        let wanted = kind.map(|k| k.as_str().to_string());
        let pod = pods
            .items
            .into_iter()
            .filter(|p| {
                p.metadata
                    .labels
                    .as_ref()
                    .and_then(|l| l.get(LABEL_JOB_KIND))
                    .cloned()
                    == wanted
            })
            .max_by_key(|p| p.metadata.creation_timestamp.as_ref().map(|t| t.0));
        let Some(pod) = pod else {
            return Ok(None);
        };
        let pod_name = pod
            .metadata
            .name
            .ok_or_else(|| GatewayError::Manifest("pod without a name".to_string()))?;
        let params = LogParams {
            tail_lines,
            ..Default::default()
        };
        let text = self.pods.logs(&pod_name, &params).await?;
        Ok(Some(text))
    }
}

fn is_gone(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(resp) if resp.code == 404)
}

/// Builds a resumable watch stream with re-lists folded into one
/// `Restarted` event, so consumers can swap their state atomically.
fn watch_stream<K>(api: Api<K>) -> WatchStream<K>
where
    K: Resource + Clone + serde::de::DeserializeOwned + Debug + Send + 'static,
{
    let config = watcher::Config::default().labels(LABEL_BUILD);
    Box::pin(fold_relists(watcher(api, config)))
}

fn fold_relists<K, S>(events: S) -> impl Stream<Item = Result<WatchEvent<K>, GatewayError>> + Send
where
    S: Stream<Item = Result<watcher::Event<K>, watcher::Error>> + Send + 'static,
    K: Send + 'static,
{
    let state = (Box::pin(events), Vec::new());
    stream::unfold(state, |(mut inner, mut buffer)| async move {
        loop {
            match inner.next().await {
                None => return None,
                Some(Err(e)) => {
                    return Some((Err(GatewayError::Watch(e.to_string())), (inner, buffer)))
                }
                Some(Ok(watcher::Event::Init)) => buffer.clear(),
                Some(Ok(watcher::Event::InitApply(obj))) => buffer.push(obj),
                Some(Ok(watcher::Event::InitDone)) => {
                    let items = std::mem::take(&mut buffer);
                    return Some((Ok(WatchEvent::Restarted(items)), (inner, buffer)));
                }
                Some(Ok(watcher::Event::Apply(obj))) => {
                    return Some((Ok(WatchEvent::Applied(obj)), (inner, buffer)))
                }
                Some(Ok(watcher::Event::Delete(obj))) => {
                    return Some((Ok(WatchEvent::Deleted(obj)), (inner, buffer)))
                }
            }
        }
    })
}
