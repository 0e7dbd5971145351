//! Pod-creating workload backend.

use std::collections::BTreeMap;

use api_types::WorkloadRef;
use async_trait::async_trait;
use error_stack::Report;
use k8s_openapi::api::core::v1::Container;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::PodSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::DeleteParams;
use kube::api::PostParams;
use kube::Api;
use kube::Client;
use tracing::debug;
use tracing::info;
use uuid::Uuid;

use super::BackendError;
use super::WorkloadBackend;

const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
const MANAGED_BY_VALUE: &str = "scalepool-operator";

/// Workload backend that runs each compute unit as a Pod.
pub struct KubePodBackend {
    pods: Api<Pod>,
    namespace: String,
}

impl KubePodBackend {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            pods: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
        }
    }

    fn build_pod(&self, name: &str, image: &str) -> Pod {
        let labels: BTreeMap<String, String> = [(
            MANAGED_BY_LABEL.to_string(),
            MANAGED_BY_VALUE.to_string(),
        )]
        .into();

        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "main".to_string(),
                    image: Some(image.to_string()),
                    image_pull_policy: Some("IfNotPresent".to_string()),
                    command: Some(vec!["sleep".to_string(), "3600".to_string()]),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: None,
        }
    }
}

#[async_trait]
impl WorkloadBackend for KubePodBackend {
    async fn create(&self, image: &str) -> Result<WorkloadRef, Report<BackendError>> {
        let name = Uuid::new_v4().to_string();
        let pod = self.build_pod(&name, image);

        info!(pod = %name, image, "Creating workload pod");
        self.pods
            .create(&PostParams::default(), &pod)
            .await
            .map_err(|err| {
                Report::new(BackendError::CreateFailed {
                    image: image.to_string(),
                    message: format!("{err}"),
                })
            })?;

        Ok(WorkloadRef::new(self.namespace.clone(), name))
    }

    async fn delete(&self, workload: &WorkloadRef) -> Result<(), Report<BackendError>> {
        info!(pod = %workload, "Deleting workload pod");
        match self
            .pods
            .delete(&workload.name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => {
                // Already gone, which is what we wanted.
                debug!(pod = %workload, "Workload pod was already absent");
                Ok(())
            }
            Err(err) => Err(Report::new(BackendError::DeleteFailed {
                workload: workload.clone(),
                message: format!("{err}"),
            })),
        }
    }
}
