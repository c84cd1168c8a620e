use futures::FutureExt;
use futures::future::BoxFuture;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::Api;
use kube::api::ListParams;

use kubetap_types::{
    ContainerInfo, EndpointIdentity, EndpointKind, Error, PodInfo, PodStatus, namespace_scope,
};

use crate::selection::SelectionPattern;

/// A live view of the cluster the resolver can list from
pub trait ClusterSource: Send + Sync + 'static {
    /// List pods, optionally within one namespace and restricted by labels
    fn list_pods<'a>(
        &'a self,
        namespace: Option<&'a str>,
        labels: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Vec<PodInfo>, Error>>;

    /// List services, optionally within one namespace
    fn list_services<'a>(
        &'a self,
        namespace: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Vec<EndpointIdentity>, Error>>;
}

impl<T: ClusterSource> ClusterSource for std::sync::Arc<T> {
    fn list_pods<'a>(
        &'a self,
        namespace: Option<&'a str>,
        labels: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Vec<PodInfo>, Error>> {
        (**self).list_pods(namespace, labels)
    }

    fn list_services<'a>(
        &'a self,
        namespace: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Vec<EndpointIdentity>, Error>> {
        (**self).list_services(namespace)
    }
}

/// Cluster source backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeSource {
    client: kube::Client,
}

impl KubeSource {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn pods(&self, namespace: Option<&str>) -> Api<Pod> {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    fn services(&self, namespace: Option<&str>) -> Api<Service> {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }
}

impl ClusterSource for KubeSource {
    fn list_pods<'a>(
        &'a self,
        namespace: Option<&'a str>,
        labels: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Vec<PodInfo>, Error>> {
        async move {
            let mut params = ListParams::default();
            if let Some(labels) = labels {
                params = params.labels(labels);
            }

            let list = self
                .pods(namespace)
                .list(&params)
                .await
                .map_err(|e| Error::Resolution {
                    kind: EndpointKind::Pod,
                    scope: namespace_scope(namespace),
                    message: e.to_string(),
                })?;

            Ok(list.items.into_iter().map(pod_to_info).collect())
        }
        .boxed()
    }

    fn list_services<'a>(
        &'a self,
        namespace: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Vec<EndpointIdentity>, Error>> {
        async move {
            let list = self
                .services(namespace)
                .list(&ListParams::default())
                .await
                .map_err(|e| Error::Resolution {
                    kind: EndpointKind::Service,
                    scope: namespace_scope(namespace),
                    message: e.to_string(),
                })?;

            Ok(list
                .items
                .into_iter()
                .map(|svc| {
                    EndpointIdentity::service(
                        svc.metadata.namespace.unwrap_or_default(),
                        svc.metadata.name.unwrap_or_default(),
                    )
                })
                .collect())
        }
        .boxed()
    }
}

/// Convert a k8s Pod to PodInfo
pub(crate) fn pod_to_info(pod: Pod) -> PodInfo {
    let name = pod.metadata.name.unwrap_or_default();
    let namespace = pod.metadata.namespace.unwrap_or_default();
    let mut info = PodInfo::new(name, namespace);

    if let Some(labels) = pod.metadata.labels {
        info.labels = labels.into_iter().collect();
    }

    if let Some(spec) = pod.spec {
        info.containers = spec
            .containers
            .into_iter()
            .map(|c| {
                let mut container = ContainerInfo::new(c.name);
                container.ports = c
                    .ports
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|p| u16::try_from(p.container_port).ok().map(|n| (p.name, n)))
                    .collect();
                container
            })
            .collect();
    }

    let status = pod.status.unwrap_or_default();
    for cs in status.container_statuses.unwrap_or_default() {
        if let Some(container) = info.containers.iter_mut().find(|c| c.name == cs.name) {
            container.restart_count = cs.restart_count;
        }
    }

    info.status = status
        .phase
        .as_deref()
        .map(PodStatus::from)
        .unwrap_or(PodStatus::Unknown);

    info
}

/// Resolves selection patterns to concrete cluster identities
pub struct Resolver<S> {
    source: S,
}

impl<S: ClusterSource> Resolver<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Identities of the given kind matching `pattern`, in listing order
    pub async fn resolve(
        &self,
        pattern: &SelectionPattern,
        kind: EndpointKind,
    ) -> Result<Vec<EndpointIdentity>, Error> {
        match kind {
            EndpointKind::Pod => Ok(self
                .resolve_pods(pattern)
                .await?
                .iter()
                .map(PodInfo::identity)
                .collect()),
            EndpointKind::Service => {
                let services = self.source.list_services(pattern.namespace()).await?;
                let matched: Vec<_> = services
                    .into_iter()
                    .filter(|svc| pattern.matches_identity(svc))
                    .collect();
                tracing::debug!(
                    pattern = pattern.as_str(),
                    matched = matched.len(),
                    "Resolved services"
                );
                Ok(matched)
            }
        }
    }

    /// Pods matching `pattern`, in listing order
    pub async fn resolve_pods(&self, pattern: &SelectionPattern) -> Result<Vec<PodInfo>, Error> {
        let pods = self
            .source
            .list_pods(pattern.namespace(), pattern.labels())
            .await?;

        let matched: Vec<_> = pods
            .into_iter()
            .filter(|pod| pattern.matches_identity(&pod.identity()))
            .collect();

        tracing::debug!(
            pattern = pattern.as_str(),
            matched = matched.len(),
            "Resolved pods"
        );

        Ok(matched)
    }

    /// Like `resolve`, but an empty result is a `NoMatch` error
    pub async fn resolve_one_or_more(
        &self,
        pattern: &SelectionPattern,
        kind: EndpointKind,
    ) -> Result<Vec<EndpointIdentity>, Error> {
        let found = self.resolve(pattern, kind).await?;
        if found.is_empty() {
            return Err(Error::NoMatch {
                kind,
                pattern: pattern.as_str().to_string(),
                scope: namespace_scope(pattern.namespace()),
            });
        }
        Ok(found)
    }
}
