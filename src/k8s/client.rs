use crate::k8s::catalog::CatalogSources;
use crate::k8s::watcher::{KubeListWatch, WatchedResource};
use crate::{KubedoxError, Result};
use k8s_openapi::NamespaceResourceScope;
use kube::{Api, Client};
use std::sync::Arc;
use tracing::{debug, info};

pub struct K8sClient {
    client: Client,
}

impl K8sClient {
    pub async fn try_default() -> Result<Self> {
        debug!("Initializing Kubernetes client");

        let client = Client::try_default().await.map_err(|e| {
            KubedoxError::KubernetesError(format!("Failed to create K8s client: {}", e))
        })?;

        info!("Successfully connected to Kubernetes cluster");

        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: Option<&str>) -> Api<K>
    where
        K: WatchedResource + kube::Resource<Scope = NamespaceResourceScope>,
    {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    /// List/watch sources for every kind the catalog mirrors, scoped to
    /// `namespace` or cluster-wide
    pub fn catalog_sources(&self, namespace: Option<&str>) -> CatalogSources {
        CatalogSources {
            services: Arc::new(KubeListWatch::new(self.api(namespace))),
            endpoints: Arc::new(KubeListWatch::new(self.api(namespace))),
            deployments: Arc::new(KubeListWatch::new(self.api(namespace))),
            pods: Arc::new(KubeListWatch::new(self.api(namespace))),
        }
    }
}
