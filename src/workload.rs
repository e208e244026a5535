use std::fmt;

use async_trait::async_trait;
use futures_util::future::try_join3;
use k8s_openapi::{
    NamespaceResourceScope,
    api::{
        apps::v1::{DaemonSet, Deployment, StatefulSet},
        core::v1::PodTemplateSpec,
    },
};
use kube::{
    Api, Client, Config, Resource, ResourceExt,
    api::ListParams,
    config::{KubeConfigOptions, KubeconfigError},
};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

use crate::config::NamespaceScope;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Can't load the kubeconfig for context {context}: {source}")]
    Kubeconfig {
        context: String,
        #[source]
        source: KubeconfigError,
    },
    #[error("Kubernetes API error for context {context}: {source}")]
    Kube {
        context: String,
        #[source]
        source: kube::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
    DaemonSet,
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            WorkloadKind::Deployment => "deployment",
            WorkloadKind::StatefulSet => "statefulset",
            WorkloadKind::DaemonSet => "daemonset",
        };
        f.write_str(kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadDescriptor {
    pub kind: WorkloadKind,
    pub namespace: String,
    pub name: String,
    /// Image of the first container of the pod template.
    pub image: Option<String>,
}

#[async_trait]
pub trait WorkloadSource: Send + Sync {
    async fn list_workloads(&self, context: &str) -> Result<Vec<WorkloadDescriptor>, SourceError>;
}

/// Workloads that carry a pod template.
trait Workload:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + DeserializeOwned
    + fmt::Debug
{
    const KIND: WorkloadKind;

    fn pod_template(&self) -> Option<&PodTemplateSpec>;
}

impl Workload for Deployment {
    const KIND: WorkloadKind = WorkloadKind::Deployment;

    fn pod_template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().map(|s| &s.template)
    }
}

impl Workload for StatefulSet {
    const KIND: WorkloadKind = WorkloadKind::StatefulSet;

    fn pod_template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().map(|s| &s.template)
    }
}

impl Workload for DaemonSet {
    const KIND: WorkloadKind = WorkloadKind::DaemonSet;

    fn pod_template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().map(|s| &s.template)
    }
}

fn describe<W: Workload>(workload: &W) -> WorkloadDescriptor {
    let image = workload
        .pod_template()
        .and_then(|t| t.spec.as_ref())
        .and_then(|s| s.containers.first())
        .and_then(|c| c.image.clone());

    WorkloadDescriptor {
        kind: W::KIND,
        namespace: workload.namespace().unwrap_or_default(),
        name: workload.name_any(),
        image,
    }
}

pub struct KubeWorkloadSource {
    namespace: NamespaceScope,
}

impl KubeWorkloadSource {
    pub fn new(namespace: NamespaceScope) -> Self {
        Self { namespace }
    }

    async fn client(&self, context: &str) -> Result<Client, SourceError> {
        let options = KubeConfigOptions {
            context: Some(context.to_string()),
            ..Default::default()
        };

        let config = Config::from_kubeconfig(&options)
            .await
            .map_err(|source| SourceError::Kubeconfig {
                context: context.to_string(),
                source,
            })?;

        Client::try_from(config).map_err(|source| SourceError::Kube {
            context: context.to_string(),
            source,
        })
    }

    async fn list<W: Workload>(
        &self,
        client: Client,
        context: &str,
    ) -> Result<Vec<WorkloadDescriptor>, SourceError> {
        let api: Api<W> = match &self.namespace {
            NamespaceScope::Namespace(ns) => Api::namespaced(client, ns),
            NamespaceScope::All => Api::all(client),
        };

        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|source| SourceError::Kube {
                context: context.to_string(),
                source,
            })?;

        debug!(context, kind = %W::KIND, count = list.items.len(), "Listed workloads");

        Ok(list.items.iter().map(describe).collect())
    }
}

#[async_trait]
impl WorkloadSource for KubeWorkloadSource {
    #[tracing::instrument(skip(self))]
    async fn list_workloads(&self, context: &str) -> Result<Vec<WorkloadDescriptor>, SourceError> {
        let client = self.client(context).await?;

        let (deployments, stateful_sets, daemon_sets) = try_join3(
            self.list::<Deployment>(client.clone(), context),
            self.list::<StatefulSet>(client.clone(), context),
            self.list::<DaemonSet>(client, context),
        )
        .await?;

        Ok(deployments
            .into_iter()
            .chain(stateful_sets)
            .chain(daemon_sets)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::{
        apps::v1::{DaemonSetSpec, DeploymentSpec, StatefulSetSpec},
        core::v1::{Container, PodSpec},
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;

    fn template(images: &[Option<&str>]) -> PodTemplateSpec {
        PodTemplateSpec {
            spec: Some(PodSpec {
                containers: images
                    .iter()
                    .enumerate()
                    .map(|(i, image)| Container {
                        name: format!("c{i}"),
                        image: image.map(str::to_string),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn meta(name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn first_container_image_is_used() {
        let deployment = Deployment {
            metadata: meta("web"),
            spec: Some(DeploymentSpec {
                template: template(&[Some("registry.io/team/web:1.4.0"), Some("envoy:1.30")]),
                ..Default::default()
            }),
            ..Default::default()
        };

        assert_eq!(
            describe(&deployment),
            WorkloadDescriptor {
                kind: WorkloadKind::Deployment,
                namespace: "default".to_string(),
                name: "web".to_string(),
                image: Some("registry.io/team/web:1.4.0".to_string()),
            }
        );
    }

    #[test]
    fn missing_spec_container_or_image_gives_no_image() {
        let no_spec = StatefulSet {
            metadata: meta("db"),
            ..Default::default()
        };
        assert_eq!(describe(&no_spec).image, None);
        assert_eq!(describe(&no_spec).kind, WorkloadKind::StatefulSet);

        let no_containers = DaemonSet {
            metadata: meta("agent"),
            spec: Some(DaemonSetSpec {
                template: template(&[]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(describe(&no_containers).image, None);

        let no_image = StatefulSet {
            metadata: meta("cache"),
            spec: Some(StatefulSetSpec {
                template: template(&[None]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(describe(&no_image).image, None);
    }

    #[test]
    fn kinds_display_lowercase() {
        assert_eq!(WorkloadKind::DaemonSet.to_string(), "daemonset");
        assert_eq!(WorkloadKind::StatefulSet.to_string(), "statefulset");
    }
}
