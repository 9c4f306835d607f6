use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Endpoints, Pod, Service};
use kube::ResourceExt;
use std::sync::Arc;

/// Namespace whose objects are never handed to business handlers
pub const NAMESPACE_SYSTEM: &str = "kube-system";

/// A watched cluster object travelling through the work queue
#[derive(Debug, Clone)]
pub enum ClusterObject {
    Service(Arc<Service>),
    Endpoints(Arc<Endpoints>),
    Deployment(Arc<Deployment>),
    Pod(Arc<Pod>),
}

impl ClusterObject {
    pub fn kind(&self) -> &'static str {
        match self {
            ClusterObject::Service(_) => "Service",
            ClusterObject::Endpoints(_) => "Endpoints",
            ClusterObject::Deployment(_) => "Deployment",
            ClusterObject::Pod(_) => "Pod",
        }
    }

    /// `namespace/name` key of the wrapped object
    pub fn key(&self) -> String {
        match self {
            ClusterObject::Service(o) => object_key(o.as_ref()),
            ClusterObject::Endpoints(o) => object_key(o.as_ref()),
            ClusterObject::Deployment(o) => object_key(o.as_ref()),
            ClusterObject::Pod(o) => object_key(o.as_ref()),
        }
    }

    pub fn namespace(&self) -> Option<String> {
        match self {
            ClusterObject::Service(o) => o.namespace(),
            ClusterObject::Endpoints(o) => o.namespace(),
            ClusterObject::Deployment(o) => o.namespace(),
            ClusterObject::Pod(o) => o.namespace(),
        }
    }
}

/// Store key for a namespaced object: `namespace/name`, or just `name` for
/// cluster-scoped objects
pub fn object_key<K: ResourceExt>(obj: &K) -> String {
    key_for(&obj.name_any(), obj.namespace().as_deref())
}

pub fn key_for(name: &str, namespace: Option<&str>) -> String {
    match namespace {
        Some(ns) if !ns.is_empty() => format!("{}/{}", ns, name),
        _ => name.to_string(),
    }
}
